// src/exam/scoring.rs

//! Question scoring and grade aggregation.
//!
//! Raw scores are summed per attempt, normalized to the /20 scale against the
//! assessment's maximum points, and combined per student with a
//! coefficient-weighted mean: `Σ(c_a * n_a) / Σ(c_a)` over graded assessments.

use std::{
    collections::{HashMap, HashSet},
    fmt,
};

use serde::Serialize;

use crate::{
    config::GRADE_SCALE,
    error::AppError,
    models::{
        assignment::Answer,
        question::{Choice, Question, QuestionType},
    },
};

#[derive(Debug, PartialEq)]
pub enum GradeError {
    Negative { question_id: i64 },
    AbovePoints { question_id: i64, points: f64 },
    NotANumber { question_id: i64 },
}

impl fmt::Display for GradeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GradeError::Negative { question_id } => {
                write!(f, "Score for question {} cannot be negative", question_id)
            }
            GradeError::AbovePoints {
                question_id,
                points,
            } => write!(
                f,
                "Score for question {} cannot exceed {} points",
                question_id, points
            ),
            GradeError::NotANumber { question_id } => {
                write!(f, "Score for question {} is not a number", question_id)
            }
        }
    }
}

impl From<GradeError> for AppError {
    fn from(err: GradeError) -> Self {
        AppError::BadRequest(err.to_string())
    }
}

/// Scores an objective question.
///
/// Returns `None` for question types that need a teacher.
/// Multiple-choice questions are all-or-nothing.
pub fn auto_score(
    kind: QuestionType,
    points: f64,
    selected: &[i64],
    correct: &[i64],
) -> Option<f64> {
    let selected: HashSet<i64> = selected.iter().copied().collect();
    let correct: HashSet<i64> = correct.iter().copied().collect();

    let is_right = match kind {
        QuestionType::OneChoice | QuestionType::Boolean => {
            selected.len() == 1 && selected.is_subset(&correct)
        }
        QuestionType::Multiple => !selected.is_empty() && selected == correct,
        QuestionType::Text | QuestionType::File => return None,
    };

    Some(if is_right { points } else { 0.0 })
}

/// Sums per-question scores; ungraded questions count as zero.
pub fn raw_score<I>(scores: I) -> f64
where
    I: IntoIterator<Item = Option<f64>>,
{
    scores.into_iter().flatten().sum()
}

/// Brings a raw score onto the /20 scale.
pub fn normalize(raw: f64, max_points: f64) -> Option<f64> {
    if max_points <= 0.0 || !raw.is_finite() {
        return None;
    }
    Some(raw / max_points * GRADE_SCALE)
}

/// Rejects a manual score outside `[0, points]`.
pub fn validate_manual_score(question_id: i64, score: f64, points: f64) -> Result<(), GradeError> {
    if score.is_nan() {
        return Err(GradeError::NotANumber { question_id });
    }
    if score < 0.0 {
        return Err(GradeError::Negative { question_id });
    }
    if score > points {
        return Err(GradeError::AbovePoints {
            question_id,
            points,
        });
    }
    Ok(())
}

/// One assessment's contribution to an average.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedGrade {
    pub coefficient: f64,
    /// `None` while the attempt is not graded.
    pub normalized: Option<f64>,
}

/// Coefficient-weighted mean over graded entries with a positive coefficient.
pub fn weighted_average<'a, I>(grades: I) -> Option<f64>
where
    I: IntoIterator<Item = &'a WeightedGrade>,
{
    let mut weighted_sum = 0.0_f64;
    let mut weight_total = 0.0_f64;

    for grade in grades {
        let Some(normalized) = grade.normalized else {
            continue;
        };
        if grade.coefficient <= 0.0 {
            continue;
        }
        weighted_sum += grade.coefficient * normalized;
        weight_total += grade.coefficient;
    }

    if weight_total > 0.0 {
        Some(weighted_sum / weight_total)
    } else {
        None
    }
}

/// Score of one question within an attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct LineScore {
    pub question_id: i64,
    /// Row that carries the question's score (the first stored answer row).
    pub answer_id: Option<i64>,
    pub score: Option<f64>,
}

/// Objective scoring of a whole attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct SheetScore {
    pub lines: Vec<LineScore>,
    pub raw: f64,
    pub max_points: f64,
    /// At least one text or file question still needs a teacher.
    pub pending_manual: bool,
}

/// Auto-scores every objective question of an attempt from its stored answers.
///
/// Unanswered objective questions score zero and carry no answer row.
pub fn score_sheet(
    questions: &[Question],
    choices: &[Choice],
    answers: &[Answer],
) -> Result<SheetScore, AppError> {
    let mut correct: HashMap<i64, Vec<i64>> = HashMap::new();
    for choice in choices.iter().filter(|c| c.is_correct) {
        correct.entry(choice.question_id).or_default().push(choice.id);
    }

    let mut selected: HashMap<i64, Vec<i64>> = HashMap::new();
    let mut first_row: HashMap<i64, i64> = HashMap::new();
    for answer in answers {
        if let Some(choice_id) = answer.choice_id {
            selected.entry(answer.question_id).or_default().push(choice_id);
        }
        first_row
            .entry(answer.question_id)
            .and_modify(|id| *id = (*id).min(answer.id))
            .or_insert(answer.id);
    }

    let mut lines = Vec::with_capacity(questions.len());
    let mut pending_manual = false;
    for question in questions {
        let kind = question.kind()?;
        let answer_id = first_row.get(&question.id).copied();

        let score = if kind.is_auto_gradable() {
            auto_score(
                kind,
                question.points,
                selected.get(&question.id).map(Vec::as_slice).unwrap_or(&[]),
                correct.get(&question.id).map(Vec::as_slice).unwrap_or(&[]),
            )
        } else {
            pending_manual = true;
            None
        };

        lines.push(LineScore {
            question_id: question.id,
            answer_id,
            score,
        });
    }

    Ok(SheetScore {
        raw: raw_score(lines.iter().map(|l| l.score)),
        max_points: total_points(questions),
        lines,
        pending_manual,
    })
}

/// An assessment is worth the sum of its question points.
pub fn total_points(questions: &[Question]) -> f64 {
    questions.iter().map(|q| q.points).sum()
}

/// Rounds to two decimals for display.
pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Basic distribution of a set of scores.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScoreSummary {
    pub count: usize,
    pub mean: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl ScoreSummary {
    pub fn from_scores(scores: &[f64]) -> Self {
        if scores.is_empty() {
            return Self::default();
        }

        let sum: f64 = scores.iter().sum();
        let min = scores.iter().copied().fold(f64::INFINITY, f64::min);
        let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        ScoreSummary {
            count: scores.len(),
            mean: Some(round2(sum / scores.len() as f64)),
            min: Some(round2(min)),
            max: Some(round2(max)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_choice_scoring() {
        assert_eq!(auto_score(QuestionType::OneChoice, 2.0, &[7], &[7]), Some(2.0));
        assert_eq!(auto_score(QuestionType::OneChoice, 2.0, &[8], &[7]), Some(0.0));
        assert_eq!(auto_score(QuestionType::OneChoice, 2.0, &[], &[7]), Some(0.0));
        // Selecting every choice must not game the question.
        assert_eq!(
            auto_score(QuestionType::Boolean, 1.0, &[7, 8], &[7]),
            Some(0.0)
        );
    }

    #[test]
    fn test_multiple_is_all_or_nothing() {
        let correct = [1, 3];
        assert_eq!(
            auto_score(QuestionType::Multiple, 4.0, &[3, 1], &correct),
            Some(4.0)
        );
        assert_eq!(
            auto_score(QuestionType::Multiple, 4.0, &[1], &correct),
            Some(0.0)
        );
        assert_eq!(
            auto_score(QuestionType::Multiple, 4.0, &[1, 2, 3], &correct),
            Some(0.0)
        );
    }

    #[test]
    fn test_open_questions_need_a_teacher() {
        assert_eq!(auto_score(QuestionType::Text, 5.0, &[], &[]), None);
        assert_eq!(auto_score(QuestionType::File, 5.0, &[], &[]), None);
    }

    #[test]
    fn test_raw_score_ignores_ungraded() {
        assert_eq!(raw_score([Some(2.0), None, Some(1.5)]), 3.5);
        assert_eq!(raw_score(Vec::<Option<f64>>::new()), 0.0);
    }

    #[test]
    fn test_normalize_to_twenty() {
        assert_eq!(normalize(15.0, 30.0), Some(10.0));
        assert_eq!(normalize(8.0, 8.0), Some(20.0));
        assert_eq!(normalize(0.0, 0.0), None);
    }

    #[test]
    fn test_weighted_average_uses_coefficients() {
        let grades = [
            WeightedGrade {
                coefficient: 2.0,
                normalized: Some(16.0),
            },
            WeightedGrade {
                coefficient: 1.0,
                normalized: Some(10.0),
            },
        ];
        assert_eq!(weighted_average(&grades), Some(14.0));
    }

    #[test]
    fn test_weighted_average_skips_ungraded_and_zero_weight() {
        let grades = [
            WeightedGrade {
                coefficient: 3.0,
                normalized: None,
            },
            WeightedGrade {
                coefficient: 0.0,
                normalized: Some(2.0),
            },
            WeightedGrade {
                coefficient: 1.0,
                normalized: Some(12.0),
            },
        ];
        assert_eq!(weighted_average(&grades), Some(12.0));
        assert_eq!(weighted_average(&grades[..2]), None);
    }

    #[test]
    fn test_manual_score_bounds() {
        assert!(validate_manual_score(1, 0.0, 4.0).is_ok());
        assert!(validate_manual_score(1, 4.0, 4.0).is_ok());
        assert_eq!(
            validate_manual_score(1, -0.5, 4.0),
            Err(GradeError::Negative { question_id: 1 })
        );
        assert_eq!(
            validate_manual_score(2, 4.5, 4.0),
            Err(GradeError::AbovePoints {
                question_id: 2,
                points: 4.0
            })
        );
        assert!(validate_manual_score(3, f64::NAN, 4.0).is_err());
    }

    fn question(id: i64, kind: &str, points: f64) -> Question {
        Question {
            id,
            assessment_id: 1,
            content: String::new(),
            question_type: kind.to_string(),
            points,
            order_index: 0,
        }
    }

    fn choice(id: i64, question_id: i64, is_correct: bool) -> Choice {
        Choice {
            id,
            question_id,
            content: String::new(),
            is_correct,
            order_index: 0,
        }
    }

    fn answer(id: i64, question_id: i64, choice_id: Option<i64>) -> Answer {
        Answer {
            id,
            assignment_id: 1,
            question_id,
            choice_id,
            answer_text: choice_id.map_or(Some("essay".to_string()), |_| None),
            file_path: None,
            score: None,
            feedback: None,
        }
    }

    #[test]
    fn test_score_sheet() {
        let questions = vec![
            question(1, "one_choice", 2.0),
            question(2, "multiple", 3.0),
            question(3, "boolean", 1.0),
            question(4, "text", 4.0),
        ];
        let choices = vec![
            choice(10, 1, false),
            choice(11, 1, true),
            choice(20, 2, true),
            choice(21, 2, true),
            choice(22, 2, false),
            choice(30, 3, true),
            choice(31, 3, false),
        ];
        // Question 3 left blank.
        let answers = vec![
            answer(100, 1, Some(11)),
            answer(102, 2, Some(21)),
            answer(101, 2, Some(20)),
            answer(103, 4, None),
        ];

        let sheet = score_sheet(&questions, &choices, &answers).unwrap();
        assert_eq!(sheet.max_points, 10.0);
        assert_eq!(sheet.raw, 5.0);
        assert!(sheet.pending_manual);
        assert_eq!(
            sheet.lines,
            vec![
                LineScore {
                    question_id: 1,
                    answer_id: Some(100),
                    score: Some(2.0)
                },
                LineScore {
                    question_id: 2,
                    answer_id: Some(101),
                    score: Some(3.0)
                },
                LineScore {
                    question_id: 3,
                    answer_id: None,
                    score: Some(0.0)
                },
                LineScore {
                    question_id: 4,
                    answer_id: Some(103),
                    score: None
                },
            ]
        );
    }

    #[test]
    fn test_score_summary() {
        let summary = ScoreSummary::from_scores(&[10.0, 15.0, 12.5]);
        assert_eq!(summary.count, 3);
        assert_eq!(summary.mean, Some(12.5));
        assert_eq!(summary.min, Some(10.0));
        assert_eq!(summary.max, Some(15.0));
        assert_eq!(ScoreSummary::from_scores(&[]), ScoreSummary::default());
    }
}
