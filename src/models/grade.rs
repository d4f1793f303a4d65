// src/models/grade.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use validator::Validate;

use crate::{
    exam::{scoring::ScoreSummary, session::AttemptStatus},
    models::{
        assignment::{Answer, Assignment},
        question::QuestionWithChoices,
    },
};

/// DTO for a teacher grading one attempt.
#[derive(Debug, Deserialize, Validate)]
pub struct GradeRequest {
    #[validate(length(max = 500))]
    #[validate(nested)]
    pub answers: Vec<GradeAnswerRequest>,
    #[validate(length(max = 5000))]
    pub teacher_notes: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct GradeAnswerRequest {
    pub question_id: i64,
    pub score: f64,
    #[validate(length(max = 5000))]
    pub feedback: Option<String>,
}

/// Everything a teacher needs to grade an attempt.
#[derive(Debug, Serialize)]
pub struct GradingSheet {
    pub assignment: Assignment,
    pub status: AttemptStatus,
    pub student_username: String,
    pub max_points: f64,
    pub questions: Vec<QuestionWithChoices>,
    pub answers: Vec<Answer>,
}

#[derive(Debug, Serialize)]
pub struct GradeResponse {
    pub assignment_id: i64,
    pub score: f64,
    pub max_points: f64,
    pub normalized: Option<f64>,
    pub graded_at: DateTime<Utc>,
}

/// Row of the submissions list for one assessment.
#[derive(Debug, Serialize, FromRow)]
pub struct SubmissionRow {
    pub assignment_id: i64,
    pub student_id: i64,
    pub username: String,
    pub started_at: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub graded_at: Option<DateTime<Utc>>,
    pub score: Option<f64>,
    pub forced_submission: bool,
    pub security_violation: Option<String>,
    pub violation_count: i32,
}

#[derive(Debug, Serialize)]
pub struct SubmissionListItem {
    #[serde(flatten)]
    pub row: SubmissionRow,
    pub status: AttemptStatus,
}

#[derive(Debug, Serialize)]
pub struct AssessmentStats {
    pub assessment_id: i64,
    pub max_points: f64,
    pub assigned: i64,
    pub started: i64,
    pub submitted: i64,
    pub graded: i64,
    pub forced: i64,
    /// Distribution of graded scores on the /20 scale.
    pub normalized: ScoreSummary,
}

/// One graded assessment of one student, as loaded for aggregation.
#[derive(Debug, Clone, FromRow)]
pub struct GradedScoreRow {
    pub student_id: i64,
    pub username: String,
    pub class_id: i64,
    pub subject_id: i64,
    pub subject_name: String,
    pub assessment_id: i64,
    pub coefficient: f64,
    pub score: Option<f64>,
    pub max_points: f64,
}

#[derive(Debug, Serialize)]
pub struct SubjectAverage {
    pub subject_id: i64,
    pub subject_name: String,
    pub average: Option<f64>,
    pub graded_count: usize,
}

#[derive(Debug, Serialize)]
pub struct StudentAverage {
    pub student_id: i64,
    pub username: String,
    pub class_id: i64,
    pub average: Option<f64>,
    pub graded_count: usize,
    pub subjects: Vec<SubjectAverage>,
}

#[derive(Debug, Serialize)]
pub struct ClassAverages {
    pub class_id: i64,
    pub class_average: Option<f64>,
    pub students: Vec<StudentAverage>,
}
