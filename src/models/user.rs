// src/models/user.rs

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use validator::Validate;

use crate::error::AppError;

/// Represents the 'users' table in the database.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct User {
    pub id: i64,

    /// Unique username.
    pub username: String,

    /// Argon2 password hash.
    /// Skipped during serialization to prevent leaking sensitive data.
    #[serde(skip)]
    pub password: String,

    /// User role: 'admin', 'teacher' or 'student'.
    pub role: String,

    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Account roles. Stored as lowercase text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Teacher,
    Student,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Teacher => "teacher",
            Role::Student => "student",
        }
    }

    /// Teachers and admins may author and grade assessments.
    pub fn can_teach(&self) -> bool {
        matches!(self, Role::Admin | Role::Teacher)
    }
}

impl FromStr for Role {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "teacher" => Ok(Role::Teacher),
            "student" => Ok(Role::Student),
            other => Err(AppError::AuthError(format!("Unknown role '{}'", other))),
        }
    }
}

/// DTO for user login.
#[derive(Debug, Deserialize, Validate)]
pub struct LoginRequest {
    #[validate(length(min = 1, max = 50))]
    pub username: String,
    #[validate(length(min = 1, max = 128))]
    pub password: String,
}

/// DTO for an admin creating a teacher or student account.
#[derive(Debug, Deserialize, Validate)]
pub struct CreateUserRequest {
    #[validate(length(
        min = 3,
        max = 50,
        message = "Username length must be between 3 and 50 characters."
    ))]
    pub username: String,
    #[validate(length(
        min = 4,
        max = 128,
        message = "Password length must be between 4 and 128 characters."
    ))]
    pub password: String,
    pub role: Role,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trips_through_text() {
        for role in [Role::Admin, Role::Teacher, Role::Student] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert!("principal".parse::<Role>().is_err());
    }

    #[test]
    fn test_only_staff_can_teach() {
        assert!(Role::Admin.can_teach());
        assert!(Role::Teacher.can_teach());
        assert!(!Role::Student.can_teach());
    }

    #[test]
    fn test_create_user_rejects_short_username() {
        let req: CreateUserRequest = serde_json::from_value(serde_json::json!({
            "username": "yo",
            "password": "password123",
            "role": "student"
        }))
        .unwrap();
        assert!(req.validate().is_err());
    }
}
