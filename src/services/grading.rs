// src/services/grading.rs

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::AppError,
    exam::{
        scoring::{WeightedGrade, normalize, round2, validate_manual_score, weighted_average},
        session::{SessionEvent, transition},
    },
    models::{
        assignment::{ASSIGNMENT_COLUMNS, Assignment},
        grade::{GradeAnswerRequest, GradedScoreRow, StudentAverage, SubjectAverage},
        question::Question,
    },
    services::attempts::{fetch_answers, fetch_assignment_for_update},
    utils::html::clean_optional,
};

/// Checks a grading payload against the assessment's questions.
pub fn check_grades(grades: &[GradeAnswerRequest], questions: &[Question]) -> Result<(), AppError> {
    let points: HashMap<i64, f64> = questions.iter().map(|q| (q.id, q.points)).collect();
    let mut seen = HashSet::new();

    for grade in grades {
        if !seen.insert(grade.question_id) {
            return Err(AppError::BadRequest(format!(
                "question {} graded twice",
                grade.question_id
            )));
        }
        let max = points.get(&grade.question_id).ok_or_else(|| {
            AppError::BadRequest(format!(
                "question {} is not part of this assessment",
                grade.question_id
            ))
        })?;
        validate_manual_score(grade.question_id, grade.score, *max)?;
    }
    Ok(())
}

/// Writes per-question scores and feedback, then stamps the attempt as graded
/// with the summed score. Regrading a graded attempt overwrites it.
pub async fn apply_grades(
    pool: &PgPool,
    assignment_id: i64,
    questions: &[Question],
    grades: &[GradeAnswerRequest],
    teacher_notes: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Assignment, AppError> {
    let mut tx = pool.begin().await?;
    let locked = fetch_assignment_for_update(&mut tx, assignment_id).await?;
    transition(locked.status(), SessionEvent::Grade)?;

    for grade in grades {
        let score_row: Option<i64> = sqlx::query_scalar(
            "SELECT MIN(id) FROM answers WHERE assignment_id = $1 AND question_id = $2",
        )
        .bind(assignment_id)
        .bind(grade.question_id)
        .fetch_one(&mut *tx)
        .await?;

        match score_row {
            Some(answer_id) => {
                sqlx::query(
                    "UPDATE answers SET score = $1, feedback = $2, updated_at = $3 WHERE id = $4",
                )
                .bind(grade.score)
                .bind(clean_optional(grade.feedback.as_deref()))
                .bind(now)
                .bind(answer_id)
                .execute(&mut *tx)
                .await?;
            }
            None => {
                // Unanswered question: keep the grade on an empty answer row.
                sqlx::query(
                    r#"
                    INSERT INTO answers (assignment_id, question_id, score, feedback)
                    VALUES ($1, $2, $3, $4)
                    "#,
                )
                .bind(assignment_id)
                .bind(grade.question_id)
                .bind(grade.score)
                .bind(clean_optional(grade.feedback.as_deref()))
                .execute(&mut *tx)
                .await?;
            }
        }
    }

    let answers = fetch_answers(&mut *tx, assignment_id).await?;
    let mut first_rows: HashMap<i64, (i64, Option<f64>)> = HashMap::new();
    for answer in &answers {
        first_rows
            .entry(answer.question_id)
            .and_modify(|row| {
                if answer.id < row.0 {
                    *row = (answer.id, answer.score);
                }
            })
            .or_insert((answer.id, answer.score));
    }

    for question in questions {
        if question.kind()?.is_auto_gradable() {
            continue;
        }
        if let Some((_, None)) = first_rows.get(&question.id) {
            return Err(AppError::BadRequest(format!(
                "question {} still needs a score",
                question.id
            )));
        }
    }

    let total: f64 = questions
        .iter()
        .filter_map(|q| first_rows.get(&q.id).and_then(|(_, score)| *score))
        .sum();

    let sql = format!(
        r#"
        UPDATE assessment_assignments
        SET score = $2, graded_at = $3, teacher_notes = COALESCE($4, teacher_notes)
        WHERE id = $1
        RETURNING {}
        "#,
        ASSIGNMENT_COLUMNS
    );
    let graded = sqlx::query_as::<_, Assignment>(&sql)
        .bind(assignment_id)
        .bind(total)
        .bind(now)
        .bind(clean_optional(teacher_notes))
        .fetch_one(&mut *tx)
        .await?;

    tx.commit().await?;

    tracing::info!(
        assignment_id,
        score = total,
        regrade = locked.graded_at.is_some(),
        "Attempt graded"
    );

    Ok(graded)
}

/// Loads one row per assignment for the given class or student.
pub async fn load_graded_rows(
    pool: &PgPool,
    class_id: Option<i64>,
    student_id: Option<i64>,
) -> Result<Vec<GradedScoreRow>, AppError> {
    let rows = sqlx::query_as::<_, GradedScoreRow>(
        r#"
        SELECT aa.student_id, u.username, cs.class_id, s.id AS subject_id, s.name AS subject_name,
               a.id AS assessment_id, a.coefficient,
               CASE WHEN aa.graded_at IS NOT NULL THEN aa.score END AS score,
               COALESCE((SELECT SUM(q.points) FROM questions q WHERE q.assessment_id = a.id), 0)
                   AS max_points
        FROM assessment_assignments aa
        JOIN assessments a ON a.id = aa.assessment_id
        JOIN class_subjects cs ON cs.id = a.class_subject_id
        JOIN subjects s ON s.id = cs.subject_id
        JOIN users u ON u.id = aa.student_id
        WHERE ($1::BIGINT IS NULL OR cs.class_id = $1)
          AND ($2::BIGINT IS NULL OR aa.student_id = $2)
          AND cs.deleted_at IS NULL
        ORDER BY cs.class_id, aa.student_id, s.id, a.id
        "#,
    )
    .bind(class_id)
    .bind(student_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

fn weighted(rows: &[&GradedScoreRow]) -> (Option<f64>, usize) {
    let grades: Vec<WeightedGrade> = rows
        .iter()
        .map(|row| WeightedGrade {
            coefficient: row.coefficient,
            normalized: row.score.and_then(|s| normalize(s, row.max_points)),
        })
        .collect();
    let graded = grades.iter().filter(|g| g.normalized.is_some()).count();
    (weighted_average(&grades).map(round2), graded)
}

/// Groups rows per class and student, then per subject, into weighted averages.
/// Ungraded assignments are listed but do not count.
pub fn aggregate_averages(rows: &[GradedScoreRow]) -> Vec<StudentAverage> {
    let mut order: Vec<(i64, i64)> = Vec::new();
    let mut by_student: HashMap<(i64, i64), Vec<&GradedScoreRow>> = HashMap::new();
    for row in rows {
        let key = (row.class_id, row.student_id);
        by_student
            .entry(key)
            .or_insert_with(|| {
                order.push(key);
                Vec::new()
            })
            .push(row);
    }

    order
        .into_iter()
        .map(|key| {
            let student_rows = &by_student[&key];
            let (average, graded_count) = weighted(student_rows);

            let mut subject_order: Vec<i64> = Vec::new();
            let mut by_subject: HashMap<i64, Vec<&GradedScoreRow>> = HashMap::new();
            for &row in student_rows.iter() {
                by_subject
                    .entry(row.subject_id)
                    .or_insert_with(|| {
                        subject_order.push(row.subject_id);
                        Vec::new()
                    })
                    .push(row);
            }

            let subjects = subject_order
                .into_iter()
                .map(|subject_id| {
                    let subject_rows = &by_subject[&subject_id];
                    let (average, graded_count) = weighted(subject_rows);
                    SubjectAverage {
                        subject_id,
                        subject_name: subject_rows[0].subject_name.clone(),
                        average,
                        graded_count,
                    }
                })
                .collect();

            StudentAverage {
                student_id: key.1,
                username: student_rows[0].username.clone(),
                class_id: key.0,
                average,
                graded_count,
                subjects,
            }
        })
        .collect()
}

/// Plain mean of the students' averages; students without a grade are skipped.
pub fn class_average(students: &[StudentAverage]) -> Option<f64> {
    let averages: Vec<f64> = students.iter().filter_map(|s| s.average).collect();
    if averages.is_empty() {
        return None;
    }
    Some(round2(averages.iter().sum::<f64>() / averages.len() as f64))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(student_id: i64, subject_id: i64, coefficient: f64, score: Option<f64>) -> GradedScoreRow {
        GradedScoreRow {
            student_id,
            username: format!("student{}", student_id),
            class_id: 1,
            subject_id,
            subject_name: format!("Subject {}", subject_id),
            assessment_id: subject_id * 100 + student_id,
            coefficient,
            score,
            max_points: 10.0,
        }
    }

    #[test]
    fn test_weighted_average_per_student_and_subject() {
        let rows = vec![
            // 8/10 -> 16/20 with coefficient 2, 5/10 -> 10/20 with coefficient 1
            row(1, 1, 2.0, Some(8.0)),
            row(1, 2, 1.0, Some(5.0)),
            // not graded yet
            row(1, 2, 3.0, None),
            row(2, 1, 1.0, None),
        ];

        let students = aggregate_averages(&rows);
        assert_eq!(students.len(), 2);

        let first = &students[0];
        assert_eq!(first.student_id, 1);
        assert_eq!(first.graded_count, 2);
        assert_eq!(first.average, Some(14.0));
        assert_eq!(first.subjects.len(), 2);
        assert_eq!(first.subjects[1].average, Some(10.0));
        assert_eq!(first.subjects[1].graded_count, 1);

        let second = &students[1];
        assert_eq!(second.average, None);
        assert_eq!(second.graded_count, 0);

        assert_eq!(class_average(&students), Some(14.0));
    }

    #[test]
    fn test_zero_coefficient_is_ignored() {
        let rows = vec![row(1, 1, 0.0, Some(2.0)), row(1, 1, 1.0, Some(9.0))];
        let students = aggregate_averages(&rows);
        assert_eq!(students[0].average, Some(18.0));
    }

    fn question(id: i64, points: f64) -> Question {
        Question {
            id,
            assessment_id: 1,
            content: "Explain".to_string(),
            question_type: "text".to_string(),
            points,
            order_index: 0,
        }
    }

    fn grade(question_id: i64, score: f64) -> GradeAnswerRequest {
        GradeAnswerRequest {
            question_id,
            score,
            feedback: None,
        }
    }

    #[test]
    fn test_check_grades() {
        let questions = vec![question(1, 5.0), question(2, 3.0)];

        assert!(check_grades(&[grade(1, 5.0), grade(2, 0.0)], &questions).is_ok());
        assert!(check_grades(&[grade(1, 5.5)], &questions).is_err());
        assert!(check_grades(&[grade(2, -1.0)], &questions).is_err());
        assert!(check_grades(&[grade(3, 1.0)], &questions).is_err());
        assert!(check_grades(&[grade(1, 1.0), grade(1, 2.0)], &questions).is_err());
    }
}
