// src/models/assessment.rs

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use validator::Validate;

use crate::{
    config::DEFAULT_COEFFICIENT,
    error::AppError,
    models::question::{CreateQuestionRequest, QuestionWithChoices},
};

/// Supervised attempts are timed and monitored; homework is untimed and allows uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    Supervised,
    Homework,
}

impl DeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMode::Supervised => "supervised",
            DeliveryMode::Homework => "homework",
        }
    }
}

impl FromStr for DeliveryMode {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "supervised" => Ok(DeliveryMode::Supervised),
            "homework" => Ok(DeliveryMode::Homework),
            other => Err(AppError::InternalServerError(format!(
                "Unknown delivery mode '{}' in database",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssessmentType {
    Exam,
    Quiz,
    Homework,
    Project,
    Practical,
}

impl AssessmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssessmentType::Exam => "exam",
            AssessmentType::Quiz => "quiz",
            AssessmentType::Homework => "homework",
            AssessmentType::Project => "project",
            AssessmentType::Practical => "practical",
        }
    }
}

/// Represents the 'assessments' table in the database.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Assessment {
    pub id: i64,
    pub class_subject_id: i64,
    pub teacher_id: i64,
    pub title: String,
    pub description: Option<String>,

    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub assessment_type: String,

    pub delivery_mode: String,

    /// Weight of this assessment in a student's average.
    pub coefficient: f64,

    pub duration_minutes: Option<i32>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub due_date: Option<DateTime<Utc>>,
    pub is_published: bool,
    pub shuffle_questions: bool,
    pub show_results: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Assessment {
    pub fn mode(&self) -> Result<DeliveryMode, AppError> {
        self.delivery_mode.parse()
    }
}

/// Columns selected whenever an `Assessment` row is loaded.
pub const ASSESSMENT_COLUMNS: &str = "id, class_subject_id, teacher_id, title, description, type, \
     delivery_mode, coefficient, duration_minutes, scheduled_at, due_date, is_published, \
     shuffle_questions, show_results, created_at, updated_at";

/// Row for the teacher's assessment list.
#[derive(Debug, Serialize, FromRow)]
pub struct AssessmentSummary {
    pub id: i64,
    pub class_subject_id: i64,
    pub title: String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub assessment_type: String,
    pub delivery_mode: String,
    pub coefficient: f64,
    pub duration_minutes: Option<i32>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub due_date: Option<DateTime<Utc>>,
    pub is_published: bool,
    pub total_points: f64,
    pub question_count: i64,
    pub assigned_count: i64,
}

/// Full teacher view of an assessment.
#[derive(Debug, Serialize)]
pub struct AssessmentDetail {
    #[serde(flatten)]
    pub assessment: Assessment,
    pub total_points: f64,
    pub questions: Vec<QuestionWithChoices>,
}

fn default_coefficient() -> f64 {
    DEFAULT_COEFFICIENT
}

fn default_true() -> bool {
    true
}

/// DTO for creating an assessment together with its questions.
#[derive(Debug, Deserialize, Validate)]
pub struct CreateAssessmentRequest {
    pub class_subject_id: i64,
    #[validate(length(min = 1, max = 200))]
    pub title: String,
    #[validate(length(max = 5000))]
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub assessment_type: AssessmentType,
    pub delivery_mode: DeliveryMode,
    #[serde(default = "default_coefficient")]
    #[validate(range(min = 0.0, max = 100.0))]
    pub coefficient: f64,
    #[validate(range(min = 1, max = 1440))]
    pub duration_minutes: Option<i32>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_published: bool,
    #[serde(default)]
    pub shuffle_questions: bool,
    #[serde(default = "default_true")]
    pub show_results: bool,
    #[validate(length(min = 1, max = 200))]
    #[validate(nested)]
    pub questions: Vec<CreateQuestionRequest>,
}

impl CreateAssessmentRequest {
    /// Cross-field rules the derive cannot express.
    pub fn check_consistency(&self) -> Result<(), String> {
        if self.delivery_mode == DeliveryMode::Supervised && self.duration_minutes.is_none() {
            return Err("supervised assessments need a duration".to_string());
        }
        if let (Some(start), Some(due)) = (self.scheduled_at, self.due_date) {
            if due <= start {
                return Err("due_date must be after scheduled_at".to_string());
            }
        }
        for (idx, question) in self.questions.iter().enumerate() {
            question
                .check_choices()
                .map_err(|e| format!("question {}: {}", idx + 1, e))?;
        }
        Ok(())
    }
}

/// DTO for updating assessment metadata. Fields are optional.
#[derive(Debug, Deserialize, Validate)]
pub struct UpdateAssessmentRequest {
    #[validate(length(min = 1, max = 200))]
    pub title: Option<String>,
    #[validate(length(max = 5000))]
    pub description: Option<String>,
    #[validate(range(min = 0.0, max = 100.0))]
    pub coefficient: Option<f64>,
    #[validate(range(min = 1, max = 1440))]
    pub duration_minutes: Option<i32>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub due_date: Option<DateTime<Utc>>,
    pub is_published: Option<bool>,
    pub show_results: Option<bool>,
}

impl UpdateAssessmentRequest {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.coefficient.is_none()
            && self.duration_minutes.is_none()
            && self.scheduled_at.is_none()
            && self.due_date.is_none()
            && self.is_published.is_none()
            && self.show_results.is_none()
    }

    /// Changes that would move the deadline of attempts already running.
    pub fn touches_timing(&self) -> bool {
        self.duration_minutes.is_some() || self.scheduled_at.is_some() || self.due_date.is_some()
    }
}

/// DTO for assigning an assessment to its class or to a legacy group.
#[derive(Debug, Default, Deserialize)]
pub struct AssignRequest {
    pub group_id: Option<i64>,
}
