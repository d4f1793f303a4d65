// src/handlers/assessments.rs

use std::collections::HashMap;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use sqlx::{PgPool, Postgres, QueryBuilder};
use validator::Validate;

use crate::{
    error::AppError,
    exam::scoring::total_points,
    models::{
        assessment::{
            Assessment, AssessmentDetail, AssessmentSummary, AssignRequest,
            CreateAssessmentRequest, UpdateAssessmentRequest,
        },
        question::QuestionWithChoices,
    },
    services::attempts::{fetch_assessment, fetch_choices, fetch_questions},
    utils::{
        html::{clean_html, clean_optional},
        jwt::AuthUser,
    },
};

/// Loads an assessment the caller is allowed to manage.
/// Teachers see only their own assessments; admins see all.
pub async fn load_owned_assessment(
    pool: &PgPool,
    id: i64,
    user: &AuthUser,
) -> Result<Assessment, AppError> {
    let assessment = fetch_assessment(pool, id).await?;
    if assessment.teacher_id != user.id && !user.is_admin() {
        return Err(AppError::Forbidden(
            "You do not manage this assessment".to_string(),
        ));
    }
    Ok(assessment)
}

async fn has_started_attempts(pool: &PgPool, assessment_id: i64) -> Result<bool, AppError> {
    let started: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM assessment_assignments WHERE assessment_id = $1 AND started_at IS NOT NULL)",
    )
    .bind(assessment_id)
    .fetch_one(pool)
    .await?;
    Ok(started)
}

/// Creates an assessment with its questions and choices in one transaction.
///
/// The class-subject must be active. Teachers may only author for the
/// class-subjects they teach; the assessment always belongs to that teacher.
pub async fn create_assessment(
    State(pool): State<PgPool>,
    user: AuthUser,
    Json(payload): Json<CreateAssessmentRequest>,
) -> Result<impl IntoResponse, AppError> {
    payload.validate()?;
    payload.check_consistency().map_err(AppError::BadRequest)?;

    let owner: i64 = sqlx::query_scalar(
        r#"
        SELECT teacher_id FROM class_subjects
        WHERE id = $1 AND deleted_at IS NULL AND valid_to IS NULL
        "#,
    )
    .bind(payload.class_subject_id)
    .fetch_optional(&pool)
    .await?
    .ok_or(AppError::NotFound("Class subject not found".to_string()))?;

    if owner != user.id && !user.is_admin() {
        return Err(AppError::Forbidden(
            "You do not teach this class subject".to_string(),
        ));
    }

    let mut tx = pool.begin().await?;

    let assessment_id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO assessments
        (class_subject_id, teacher_id, title, description, type, delivery_mode, coefficient,
         duration_minutes, scheduled_at, due_date, is_published, shuffle_questions, show_results)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        RETURNING id
        "#,
    )
    .bind(payload.class_subject_id)
    .bind(owner)
    .bind(&payload.title)
    .bind(clean_optional(payload.description.as_deref()))
    .bind(payload.assessment_type.as_str())
    .bind(payload.delivery_mode.as_str())
    .bind(payload.coefficient)
    .bind(payload.duration_minutes)
    .bind(payload.scheduled_at)
    .bind(payload.due_date)
    .bind(payload.is_published)
    .bind(payload.shuffle_questions)
    .bind(payload.show_results)
    .fetch_one(&mut *tx)
    .await?;

    for (idx, question) in payload.questions.iter().enumerate() {
        let question_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO questions (assessment_id, content, type, points, order_index)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(assessment_id)
        .bind(clean_html(&question.content))
        .bind(question.question_type.as_str())
        .bind(question.points)
        .bind(idx as i32)
        .fetch_one(&mut *tx)
        .await?;

        if question.choices.is_empty() {
            continue;
        }

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO choices (question_id, content, is_correct, order_index) ",
        );
        builder.push_values(question.choices.iter().enumerate(), |mut row, (pos, choice)| {
            row.push_bind(question_id)
                .push_bind(clean_html(&choice.content))
                .push_bind(choice.is_correct)
                .push_bind(pos as i32);
        });
        builder.build().execute(&mut *tx).await?;
    }

    tx.commit().await?;

    tracing::info!(
        assessment_id,
        teacher_id = owner,
        questions = payload.questions.len(),
        "Assessment created"
    );

    Ok((StatusCode::CREATED, Json(serde_json::json!({ "id": assessment_id }))))
}

/// Query parameters for listing assessments.
#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub class_subject_id: Option<i64>,
}

/// Lists the caller's assessments (all of them for admins) with point totals.
pub async fn list_assessments(
    State(pool): State<PgPool>,
    user: AuthUser,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, AppError> {
    let teacher_filter = if user.is_admin() { None } else { Some(user.id) };

    let assessments = sqlx::query_as::<_, AssessmentSummary>(
        r#"
        SELECT
            a.id, a.class_subject_id, a.title, a.type, a.delivery_mode, a.coefficient,
            a.duration_minutes, a.scheduled_at, a.due_date, a.is_published,
            COALESCE((SELECT SUM(q.points) FROM questions q WHERE q.assessment_id = a.id), 0)
                AS total_points,
            (SELECT COUNT(*) FROM questions q WHERE q.assessment_id = a.id) AS question_count,
            (SELECT COUNT(*) FROM assessment_assignments aa WHERE aa.assessment_id = a.id)
                AS assigned_count
        FROM assessments a
        WHERE ($1::BIGINT IS NULL OR a.teacher_id = $1)
          AND ($2::BIGINT IS NULL OR a.class_subject_id = $2)
        ORDER BY a.created_at DESC
        "#,
    )
    .bind(teacher_filter)
    .bind(params.class_subject_id)
    .fetch_all(&pool)
    .await
    .map_err(|e| {
        tracing::error!("Failed to list assessments: {:?}", e);
        AppError::InternalServerError(e.to_string())
    })?;

    Ok(Json(assessments))
}

/// Retrieves an assessment with its questions and answer key.
pub async fn get_assessment(
    State(pool): State<PgPool>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let assessment = load_owned_assessment(&pool, id, &user).await?;
    let questions = fetch_questions(&pool, id).await?;
    let choices = fetch_choices(&pool, id).await?;

    let mut by_question: HashMap<i64, Vec<_>> = HashMap::new();
    for choice in choices {
        by_question.entry(choice.question_id).or_default().push(choice);
    }

    let total_points = total_points(&questions);
    let questions = questions
        .into_iter()
        .map(|question| QuestionWithChoices {
            choices: by_question.remove(&question.id).unwrap_or_default(),
            question,
        })
        .collect();

    Ok(Json(AssessmentDetail {
        assessment,
        total_points,
        questions,
    }))
}

/// Updates assessment metadata.
///
/// Timing fields are frozen once any student has started an attempt, so
/// running deadlines never move.
pub async fn update_assessment(
    State(pool): State<PgPool>,
    user: AuthUser,
    Path(id): Path<i64>,
    Json(payload): Json<UpdateAssessmentRequest>,
) -> Result<impl IntoResponse, AppError> {
    payload.validate()?;
    let current = load_owned_assessment(&pool, id, &user).await?;

    if payload.is_empty() {
        return Ok(StatusCode::OK);
    }

    if payload.touches_timing() && has_started_attempts(&pool, id).await? {
        return Err(AppError::Conflict(
            "Timing cannot change once attempts have started".to_string(),
        ));
    }

    let scheduled_at = payload.scheduled_at.or(current.scheduled_at);
    let due_date = payload.due_date.or(current.due_date);
    if let (Some(start), Some(due)) = (scheduled_at, due_date) {
        if due <= start {
            return Err(AppError::BadRequest(
                "due_date must be after scheduled_at".to_string(),
            ));
        }
    }

    let mut builder: QueryBuilder<Postgres> =
        QueryBuilder::new("UPDATE assessments SET updated_at = NOW()");

    if let Some(title) = payload.title {
        builder.push(", title = ");
        builder.push_bind(title);
    }

    if let Some(description) = payload.description {
        builder.push(", description = ");
        builder.push_bind(clean_html(&description));
    }

    if let Some(coefficient) = payload.coefficient {
        builder.push(", coefficient = ");
        builder.push_bind(coefficient);
    }

    if let Some(duration) = payload.duration_minutes {
        builder.push(", duration_minutes = ");
        builder.push_bind(duration);
    }

    if let Some(scheduled_at) = payload.scheduled_at {
        builder.push(", scheduled_at = ");
        builder.push_bind(scheduled_at);
    }

    if let Some(due_date) = payload.due_date {
        builder.push(", due_date = ");
        builder.push_bind(due_date);
    }

    if let Some(is_published) = payload.is_published {
        builder.push(", is_published = ");
        builder.push_bind(is_published);
    }

    if let Some(show_results) = payload.show_results {
        builder.push(", show_results = ");
        builder.push_bind(show_results);
    }

    builder.push(" WHERE id = ");
    builder.push_bind(id);

    builder.build().execute(&pool).await.map_err(|e| {
        tracing::error!("Failed to update assessment: {:?}", e);
        AppError::InternalServerError(e.to_string())
    })?;

    Ok(StatusCode::OK)
}

/// Deletes an assessment that nobody has started yet.
pub async fn delete_assessment(
    State(pool): State<PgPool>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    load_owned_assessment(&pool, id, &user).await?;

    if has_started_attempts(&pool, id).await? {
        return Err(AppError::Conflict(
            "Assessment already has attempts".to_string(),
        ));
    }

    sqlx::query("DELETE FROM assessments WHERE id = $1")
        .bind(id)
        .execute(&pool)
        .await
        .map_err(|e| {
            tracing::error!("Failed to delete assessment: {:?}", e);
            AppError::InternalServerError(e.to_string())
        })?;

    tracing::info!(assessment_id = id, "Assessment deleted");

    Ok(StatusCode::NO_CONTENT)
}

/// Assigns the assessment to every active student of its class, or to the
/// members of a group. Existing assignments are kept; all inserts share one
/// transaction.
pub async fn assign_assessment(
    State(pool): State<PgPool>,
    user: AuthUser,
    Path(id): Path<i64>,
    Json(payload): Json<AssignRequest>,
) -> Result<impl IntoResponse, AppError> {
    let assessment = load_owned_assessment(&pool, id, &user).await?;

    let mut tx = pool.begin().await?;

    let students: Vec<i64> = match payload.group_id {
        Some(group_id) => {
            sqlx::query_scalar(
                "SELECT student_id FROM group_members WHERE group_id = $1 ORDER BY student_id",
            )
            .bind(group_id)
            .fetch_all(&mut *tx)
            .await?
        }
        None => {
            sqlx::query_scalar(
                r#"
                SELECT e.student_id
                FROM enrollments e
                JOIN class_subjects cs ON cs.class_id = e.class_id
                WHERE cs.id = $1 AND e.status = 'active'
                ORDER BY e.student_id
                "#,
            )
            .bind(assessment.class_subject_id)
            .fetch_all(&mut *tx)
            .await?
        }
    };

    if students.is_empty() {
        return Err(AppError::BadRequest(
            "No students to assign".to_string(),
        ));
    }

    let mut created = 0_u64;
    for &student_id in &students {
        let result = sqlx::query(
            r#"
            INSERT INTO assessment_assignments (assessment_id, student_id)
            VALUES ($1, $2)
            ON CONFLICT (assessment_id, student_id) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(student_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            tracing::error!(assessment_id = id, student_id, "Failed to assign: {:?}", e);
            AppError::InternalServerError(e.to_string())
        })?;
        created += result.rows_affected();
    }

    tx.commit().await?;

    tracing::info!(assessment_id = id, created, total = students.len(), "Assessment assigned");

    Ok(Json(serde_json::json!({
        "assigned": created,
        "students": students.len(),
    })))
}
