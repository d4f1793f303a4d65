// src/handlers/admin.rs

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use sqlx::PgPool;
use validator::Validate;

use crate::{error::AppError, models::user::CreateUserRequest, utils::hash::hash_password};

/// Creates a teacher, student or admin account.
/// Admin only.
pub async fn create_user(
    State(pool): State<PgPool>,
    Json(payload): Json<CreateUserRequest>,
) -> Result<impl IntoResponse, AppError> {
    payload.validate()?;

    let hashed_password = hash_password(&payload.password)?;

    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO users (username, password, role)
        VALUES ($1, $2, $3)
        RETURNING id
        "#,
    )
    .bind(&payload.username)
    .bind(hashed_password)
    .bind(payload.role.as_str())
    .fetch_one(&pool)
    .await
    .map_err(|e| {
        if e.to_string().contains("unique constraint") || e.to_string().contains("23505") {
            AppError::Conflict(format!("Username '{}' already exists", payload.username))
        } else {
            tracing::error!("Failed to create user: {:?}", e);
            AppError::InternalServerError(e.to_string())
        }
    })?;

    tracing::info!(user_id = id, role = payload.role.as_str(), "User created");

    Ok((StatusCode::CREATED, Json(serde_json::json!({"id": id}))))
}
