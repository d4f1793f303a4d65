// src/models/assignment.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use validator::Validate;

use crate::{
    exam::{autosave::AnswerDraft, session::AttemptStatus, violation::ViolationKind},
    models::question::PublicQuestion,
};

/// Represents the 'assessment_assignments' table in the database.
/// One row per student and assessment; it holds the attempt lifecycle.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Assignment {
    pub id: i64,
    pub assessment_id: i64,
    pub student_id: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub graded_at: Option<DateTime<Utc>>,
    pub score: Option<f64>,

    /// Set when the server ended the attempt (deadline or violation).
    pub forced_submission: bool,
    pub security_violation: Option<String>,
    pub violation_count: i32,
    pub teacher_notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Assignment {
    pub fn status(&self) -> AttemptStatus {
        AttemptStatus::from_timestamps(self.started_at, self.submitted_at, self.graded_at)
    }
}

pub const ASSIGNMENT_COLUMNS: &str = "id, assessment_id, student_id, started_at, submitted_at, \
     graded_at, score, forced_submission, security_violation, violation_count, teacher_notes, \
     created_at";

/// Represents the 'answers' table in the database.
/// Multiple-choice answers are stored as one row per selected choice.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Answer {
    pub id: i64,
    pub assignment_id: i64,
    pub question_id: i64,
    pub choice_id: Option<i64>,
    pub answer_text: Option<String>,
    pub file_path: Option<String>,
    pub score: Option<f64>,
    pub feedback: Option<String>,
}

/// Row for a student's list of assigned assessments.
#[derive(Debug, Serialize, FromRow)]
pub struct StudentAssignmentRow {
    pub id: i64,
    pub assessment_id: i64,
    pub title: String,
    pub delivery_mode: String,
    pub duration_minutes: Option<i32>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub due_date: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub graded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct StudentAssignmentItem {
    #[serde(flatten)]
    pub row: StudentAssignmentRow,
    pub status: AttemptStatus,
    pub deadline: Option<DateTime<Utc>>,
}

/// Payload returned when an attempt is started or resumed.
#[derive(Debug, Serialize)]
pub struct AttemptSession {
    pub assignment_id: i64,
    pub assessment_id: i64,
    pub title: String,
    pub delivery_mode: String,
    pub status: AttemptStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
    pub remaining_seconds: Option<i64>,
    pub questions: Vec<PublicQuestion>,
    pub saved_answers: Vec<AnswerDraft>,
}

#[derive(Debug, Serialize)]
pub struct TimerResponse {
    pub status: AttemptStatus,
    pub deadline: Option<DateTime<Utc>>,
    pub remaining_seconds: Option<i64>,
    pub server_time: DateTime<Utc>,
}

/// DTO for autosave.
#[derive(Debug, Deserialize, Validate)]
pub struct SaveAnswersRequest {
    #[validate(length(max = 500))]
    #[validate(nested)]
    pub answers: Vec<AnswerDraft>,
}

/// DTO for final submission. Any answers still held by the client are flushed with it.
#[derive(Debug, Default, Deserialize, Validate)]
pub struct SubmitAttemptRequest {
    #[serde(default)]
    #[validate(length(max = 500))]
    #[validate(nested)]
    pub answers: Vec<AnswerDraft>,
}

/// DTO for a client-side security signal.
#[derive(Debug, Deserialize, Validate)]
pub struct ViolationReport {
    pub kind: ViolationKind,
    #[validate(length(max = 500))]
    pub details: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ViolationResponse {
    pub violation_count: i32,
    pub terminated: bool,
}

#[derive(Debug, Serialize)]
pub struct SubmissionResponse {
    pub assignment_id: i64,
    pub submitted_at: Option<DateTime<Utc>>,
    pub forced_submission: bool,
    pub auto_score: Option<f64>,
    pub max_points: f64,
    pub pending_manual_grading: bool,
}

/// Per-question line of a student's graded result.
#[derive(Debug, Serialize)]
pub struct ResultLine {
    pub question_id: i64,
    pub points: f64,
    pub score: Option<f64>,
    pub feedback: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AttemptResult {
    pub assignment_id: i64,
    pub score: Option<f64>,
    pub max_points: f64,
    pub normalized: Option<f64>,
    pub teacher_notes: Option<String>,
    pub lines: Vec<ResultLine>,
}
