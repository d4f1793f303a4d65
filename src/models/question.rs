// src/models/question.rs

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;
use validator::Validate;

use crate::error::AppError;

/// How a question is answered and whether it can be scored automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    /// Several choices may be correct; all of them must be selected.
    Multiple,
    OneChoice,
    /// True/false, stored as two choices.
    Boolean,
    Text,
    File,
}

impl QuestionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionType::Multiple => "multiple",
            QuestionType::OneChoice => "one_choice",
            QuestionType::Boolean => "boolean",
            QuestionType::Text => "text",
            QuestionType::File => "file",
        }
    }

    pub fn has_choices(&self) -> bool {
        matches!(
            self,
            QuestionType::Multiple | QuestionType::OneChoice | QuestionType::Boolean
        )
    }

    /// Text and file answers need a teacher.
    pub fn is_auto_gradable(&self) -> bool {
        self.has_choices()
    }
}

impl FromStr for QuestionType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "multiple" => Ok(QuestionType::Multiple),
            "one_choice" => Ok(QuestionType::OneChoice),
            "boolean" => Ok(QuestionType::Boolean),
            "text" => Ok(QuestionType::Text),
            "file" => Ok(QuestionType::File),
            other => Err(AppError::InternalServerError(format!(
                "Unknown question type '{}' in database",
                other
            ))),
        }
    }
}

/// Represents the 'questions' table in the database.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Question {
    pub id: i64,
    pub assessment_id: i64,

    /// The text content of the question (sanitized HTML).
    pub content: String,

    /// Mapped from the database column 'type' since `type` is a reserved keyword in Rust.
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub question_type: String,

    pub points: f64,
    pub order_index: i32,
}

impl Question {
    pub fn kind(&self) -> Result<QuestionType, AppError> {
        self.question_type.parse()
    }
}

/// Represents the 'choices' table in the database.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Choice {
    pub id: i64,
    pub question_id: i64,
    pub content: String,
    pub is_correct: bool,
    pub order_index: i32,
}

/// DTO for sending a question to a student (excludes correct flags).
#[derive(Debug, Serialize)]
pub struct PublicQuestion {
    pub id: i64,
    #[serde(rename = "type")]
    pub question_type: String,
    pub content: String,
    pub points: f64,
    pub choices: Vec<PublicChoice>,
}

#[derive(Debug, Serialize)]
pub struct PublicChoice {
    pub id: i64,
    pub content: String,
}

impl PublicQuestion {
    /// Pairs a question with its choices, dropping the answer key.
    pub fn from_parts(question: Question, choices: &[Choice]) -> Self {
        PublicQuestion {
            id: question.id,
            question_type: question.question_type,
            content: question.content,
            points: question.points,
            choices: choices
                .iter()
                .filter(|c| c.question_id == question.id)
                .map(|c| PublicChoice {
                    id: c.id,
                    content: c.content.clone(),
                })
                .collect(),
        }
    }
}

/// Teacher view of a question, answer key included.
#[derive(Debug, Serialize)]
pub struct QuestionWithChoices {
    #[serde(flatten)]
    pub question: Question,
    pub choices: Vec<Choice>,
}

/// DTO for creating a new question inside an assessment.
#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct CreateQuestionRequest {
    #[serde(rename = "type")]
    pub question_type: QuestionType,
    #[validate(length(min = 1, max = 5000))]
    pub content: String,
    #[validate(range(min = 0.0, max = 1000.0))]
    pub points: f64,
    #[serde(default)]
    #[validate(nested)]
    pub choices: Vec<CreateChoiceRequest>,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct CreateChoiceRequest {
    #[validate(length(min = 1, max = 1000))]
    pub content: String,
    #[serde(default)]
    pub is_correct: bool,
}

impl CreateQuestionRequest {
    /// Checks that the answer key matches the question type.
    pub fn check_choices(&self) -> Result<(), String> {
        let correct = self.choices.iter().filter(|c| c.is_correct).count();

        match self.question_type {
            QuestionType::Text | QuestionType::File => {
                if !self.choices.is_empty() {
                    return Err(format!(
                        "{} questions cannot have choices",
                        self.question_type.as_str()
                    ));
                }
            }
            QuestionType::Boolean => {
                if self.choices.len() != 2 || correct != 1 {
                    return Err(
                        "boolean questions need exactly two choices, one of them correct"
                            .to_string(),
                    );
                }
            }
            QuestionType::OneChoice => {
                if self.choices.len() < 2 || correct != 1 {
                    return Err(
                        "one_choice questions need at least two choices and exactly one correct"
                            .to_string(),
                    );
                }
            }
            QuestionType::Multiple => {
                if self.choices.len() < 2 || correct == 0 {
                    return Err(
                        "multiple questions need at least two choices and one correct".to_string(),
                    );
                }
            }
        }
        Ok(())
    }
}
