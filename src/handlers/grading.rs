// src/handlers/grading.rs

use std::collections::HashMap;

use axum::{
    Json,
    extract::{Path, State},
    response::IntoResponse,
};
use chrono::Utc;
use sqlx::{FromRow, PgPool};
use validator::Validate;

use crate::{
    error::AppError,
    exam::{
        scoring::{ScoreSummary, normalize, round2, total_points},
        session::AttemptStatus,
    },
    handlers::assessments::load_owned_assessment,
    models::{
        grade::{
            AssessmentStats, ClassAverages, GradeRequest, GradeResponse, GradingSheet,
            SubmissionListItem, SubmissionRow,
        },
        question::QuestionWithChoices,
    },
    services::{
        attempts::{fetch_answers, fetch_assignment, fetch_choices, fetch_questions},
        grading::{aggregate_averages, apply_grades, check_grades, class_average, load_graded_rows},
    },
    utils::jwt::AuthUser,
};

/// Lists every attempt of an assessment with its status and raw score.
pub async fn list_submissions(
    State(pool): State<PgPool>,
    user: AuthUser,
    Path(assessment_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    load_owned_assessment(&pool, assessment_id, &user).await?;

    let rows = sqlx::query_as::<_, SubmissionRow>(
        r#"
        SELECT aa.id AS assignment_id, aa.student_id, u.username, aa.started_at,
               aa.submitted_at, aa.graded_at, aa.score, aa.forced_submission,
               aa.security_violation, aa.violation_count
        FROM assessment_assignments aa
        JOIN users u ON u.id = aa.student_id
        WHERE aa.assessment_id = $1
        ORDER BY u.username
        "#,
    )
    .bind(assessment_id)
    .fetch_all(&pool)
    .await?;

    let items: Vec<SubmissionListItem> = rows
        .into_iter()
        .map(|row| SubmissionListItem {
            status: AttemptStatus::from_timestamps(
                row.started_at,
                row.submitted_at,
                row.graded_at,
            ),
            row,
        })
        .collect();

    Ok(Json(items))
}

#[derive(Debug, FromRow)]
struct AttemptCounts {
    assigned: i64,
    started: i64,
    submitted: i64,
    graded: i64,
    forced: i64,
}

/// Completion counts and the /20 distribution of graded attempts.
pub async fn assessment_stats(
    State(pool): State<PgPool>,
    user: AuthUser,
    Path(assessment_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    load_owned_assessment(&pool, assessment_id, &user).await?;

    let counts = sqlx::query_as::<_, AttemptCounts>(
        r#"
        SELECT
            COUNT(*) AS assigned,
            COUNT(*) FILTER (WHERE started_at IS NOT NULL) AS started,
            COUNT(*) FILTER (WHERE submitted_at IS NOT NULL) AS submitted,
            COUNT(*) FILTER (WHERE graded_at IS NOT NULL) AS graded,
            COUNT(*) FILTER (WHERE forced_submission) AS forced
        FROM assessment_assignments
        WHERE assessment_id = $1
        "#,
    )
    .bind(assessment_id)
    .fetch_one(&pool)
    .await?;

    let scores: Vec<f64> = sqlx::query_scalar(
        r#"
        SELECT score FROM assessment_assignments
        WHERE assessment_id = $1 AND graded_at IS NOT NULL AND score IS NOT NULL
        "#,
    )
    .bind(assessment_id)
    .fetch_all(&pool)
    .await?;

    let questions = fetch_questions(&pool, assessment_id).await?;
    let max_points = total_points(&questions);
    let normalized: Vec<f64> = scores
        .into_iter()
        .filter_map(|s| normalize(s, max_points))
        .collect();

    Ok(Json(AssessmentStats {
        assessment_id,
        max_points,
        assigned: counts.assigned,
        started: counts.started,
        submitted: counts.submitted,
        graded: counts.graded,
        forced: counts.forced,
        normalized: ScoreSummary::from_scores(&normalized),
    }))
}

/// Loads an attempt for grading with the answer key and stored answers.
pub async fn get_grading_sheet(
    State(pool): State<PgPool>,
    user: AuthUser,
    Path(assignment_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let assignment = fetch_assignment(&pool, assignment_id).await?;
    let assessment = load_owned_assessment(&pool, assignment.assessment_id, &user).await?;

    let student_username: String =
        sqlx::query_scalar("SELECT username FROM users WHERE id = $1")
            .bind(assignment.student_id)
            .fetch_one(&pool)
            .await?;

    let questions = fetch_questions(&pool, assessment.id).await?;
    let choices = fetch_choices(&pool, assessment.id).await?;
    let answers = fetch_answers(&pool, assignment_id).await?;
    let max_points = total_points(&questions);

    let mut by_question: HashMap<i64, Vec<_>> = HashMap::new();
    for choice in choices {
        by_question.entry(choice.question_id).or_default().push(choice);
    }

    Ok(Json(GradingSheet {
        status: assignment.status(),
        assignment,
        student_username,
        max_points,
        questions: questions
            .into_iter()
            .map(|question| QuestionWithChoices {
                choices: by_question.remove(&question.id).unwrap_or_default(),
                question,
            })
            .collect(),
        answers,
    }))
}

/// Stores per-question scores and feedback and marks the attempt graded.
pub async fn grade_attempt(
    State(pool): State<PgPool>,
    user: AuthUser,
    Path(assignment_id): Path<i64>,
    Json(payload): Json<GradeRequest>,
) -> Result<impl IntoResponse, AppError> {
    payload.validate()?;

    let assignment = fetch_assignment(&pool, assignment_id).await?;
    let assessment = load_owned_assessment(&pool, assignment.assessment_id, &user).await?;

    let questions = fetch_questions(&pool, assessment.id).await?;
    check_grades(&payload.answers, &questions)?;

    let graded = apply_grades(
        &pool,
        assignment_id,
        &questions,
        &payload.answers,
        payload.teacher_notes.as_deref(),
        Utc::now(),
    )
    .await?;

    let score = graded.score.unwrap_or_default();
    let max_points = total_points(&questions);

    Ok(Json(GradeResponse {
        assignment_id,
        score,
        max_points,
        normalized: normalize(score, max_points).map(round2),
        graded_at: graded.graded_at.unwrap_or_else(Utc::now),
    }))
}

/// Weighted averages of every student of a class.
/// Open to admins and to teachers with an active subject in the class.
pub async fn class_averages(
    State(pool): State<PgPool>,
    user: AuthUser,
    Path(class_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let class_exists: bool =
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM classes WHERE id = $1)")
            .bind(class_id)
            .fetch_one(&pool)
            .await?;
    if !class_exists {
        return Err(AppError::NotFound("Class not found".to_string()));
    }

    if !user.is_admin() {
        let teaches: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM class_subjects
                WHERE class_id = $1 AND teacher_id = $2
                  AND valid_to IS NULL AND deleted_at IS NULL
            )
            "#,
        )
        .bind(class_id)
        .bind(user.id)
        .fetch_one(&pool)
        .await?;
        if !teaches {
            return Err(AppError::Forbidden(
                "You do not teach this class".to_string(),
            ));
        }
    }

    let rows = load_graded_rows(&pool, Some(class_id), None).await?;
    let students = aggregate_averages(&rows);

    Ok(Json(ClassAverages {
        class_id,
        class_average: class_average(&students),
        students,
    }))
}

/// The caller's own averages, one entry per class.
pub async fn my_averages(
    State(pool): State<PgPool>,
    user: AuthUser,
) -> Result<impl IntoResponse, AppError> {
    let rows = load_graded_rows(&pool, None, Some(user.id)).await?;
    Ok(Json(aggregate_averages(&rows)))
}
