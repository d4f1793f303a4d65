// src/handlers/attempts.rs

use std::{collections::HashMap, time::Instant};

use axum::{
    Json,
    extract::{Path, State},
    response::IntoResponse,
};
use chrono::Utc;
use validator::Validate;

use crate::{
    error::AppError,
    exam::{
        autosave::{check_drafts, merge_saved},
        scoring::{normalize, round2, total_points},
        session::{
            AttemptStatus, SessionError, SessionEvent, Timing, check_can_write, remaining_seconds,
            transition,
        },
    },
    models::{
        assessment::DeliveryMode,
        assignment::{
            ASSIGNMENT_COLUMNS, Answer, Assignment, AttemptResult, AttemptSession, ResultLine,
            SaveAnswersRequest, StudentAssignmentItem, StudentAssignmentRow, SubmissionResponse,
            SubmitAttemptRequest, TimerResponse, ViolationReport, ViolationResponse,
        },
        question::{PublicQuestion, Question},
    },
    services::attempts::{
        FinalizedAttempt, SubmissionReason, deadline_of, expire_if_due, fetch_answers,
        fetch_choices, fetch_questions, finalize_attempt, load_student_attempt, record_violation,
    },
    state::AppState,
    utils::jwt::AuthUser,
};

/// Lists the caller's assigned assessments with their status and deadline.
pub async fn list_my_attempts(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<impl IntoResponse, AppError> {
    let rows = sqlx::query_as::<_, StudentAssignmentRow>(
        r#"
        SELECT aa.id, aa.assessment_id, a.title, a.delivery_mode, a.duration_minutes,
               a.scheduled_at, a.due_date, aa.started_at, aa.submitted_at, aa.graded_at
        FROM assessment_assignments aa
        JOIN assessments a ON a.id = aa.assessment_id
        WHERE aa.student_id = $1 AND a.is_published = TRUE
        ORDER BY a.due_date NULLS LAST, aa.id
        "#,
    )
    .bind(user.id)
    .fetch_all(&state.pool)
    .await?;

    let mut items = Vec::with_capacity(rows.len());
    for row in rows {
        let timing = Timing {
            mode: row.delivery_mode.parse()?,
            is_published: true,
            duration_minutes: row.duration_minutes,
            scheduled_at: row.scheduled_at,
            due_date: row.due_date,
        };
        let status = AttemptStatus::from_timestamps(row.started_at, row.submitted_at, row.graded_at);
        let deadline = match row.started_at {
            Some(started_at) => timing.deadline(started_at),
            None => row.due_date,
        };
        items.push(StudentAssignmentItem {
            row,
            status,
            deadline,
        });
    }

    Ok(Json(items))
}

/// Presentation order of the questions of one attempt.
/// Stable for the attempt so a resumed session sees the same order.
fn shuffle_key(assignment_id: i64, question_id: i64) -> u64 {
    let mut z = (((assignment_id as u64) << 32) ^ question_id as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Starts an attempt, or resumes the one already running.
///
/// The first call stamps `started_at`; later calls return the same deadline.
pub async fn start_attempt(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let now = Utc::now();
    let (assignment, assessment) = load_student_attempt(&state.pool, id, user.id).await?;
    let timing = Timing::of(&assessment)?;

    if expire_if_due(&state, &assignment, &timing, now).await?.is_some() {
        return Err(SessionError::TimeExpired.into());
    }

    timing.check_can_start(assignment.status(), now)?;

    let assignment = if assignment.status() == AttemptStatus::NotStarted {
        let sql = format!(
            r#"
            UPDATE assessment_assignments
            SET started_at = COALESCE(started_at, $2)
            WHERE id = $1
            RETURNING {}
            "#,
            ASSIGNMENT_COLUMNS
        );
        let started = sqlx::query_as::<_, Assignment>(&sql)
            .bind(id)
            .bind(now)
            .fetch_one(&state.pool)
            .await?;
        tracing::info!(
            assignment_id = id,
            student_id = user.id,
            mode = %assessment.delivery_mode,
            "Attempt started"
        );
        started
    } else {
        assignment
    };

    let deadline = deadline_of(&assignment, &timing);

    let mut questions = fetch_questions(&state.pool, assessment.id).await?;
    if assessment.shuffle_questions {
        questions.sort_by_key(|q| shuffle_key(id, q.id));
    }
    let choices = fetch_choices(&state.pool, assessment.id).await?;
    let stored = fetch_answers(&state.pool, id).await?;
    let saved_answers = merge_saved(&stored, state.autosave.peek(id));

    Ok(Json(AttemptSession {
        assignment_id: id,
        assessment_id: assessment.id,
        title: assessment.title,
        delivery_mode: assessment.delivery_mode,
        status: assignment.status(),
        started_at: assignment.started_at,
        deadline,
        remaining_seconds: remaining_seconds(deadline, now),
        questions: questions
            .into_iter()
            .map(|q| PublicQuestion::from_parts(q, &choices))
            .collect(),
        saved_answers,
    }))
}

/// Server-side clock for the exam client. Expired attempts are closed on read.
pub async fn get_timer(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let now = Utc::now();
    let (assignment, assessment) = load_student_attempt(&state.pool, id, user.id).await?;
    let timing = Timing::of(&assessment)?;

    let assignment = match expire_if_due(&state, &assignment, &timing, now).await? {
        Some(done) => done.assignment,
        None => assignment,
    };

    let deadline = deadline_of(&assignment, &timing);
    let remaining = match assignment.status() {
        AttemptStatus::InProgress => remaining_seconds(deadline, now),
        _ => None,
    };

    Ok(Json(TimerResponse {
        status: assignment.status(),
        deadline,
        remaining_seconds: remaining,
        server_time: now,
    }))
}

/// Stages answers in the autosave buffer; the background flusher persists them.
pub async fn save_answers(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i64>,
    Json(payload): Json<SaveAnswersRequest>,
) -> Result<impl IntoResponse, AppError> {
    payload.validate()?;

    let now = Utc::now();
    let (assignment, assessment) = load_student_attempt(&state.pool, id, user.id).await?;
    let timing = Timing::of(&assessment)?;

    if expire_if_due(&state, &assignment, &timing, now).await?.is_some() {
        return Err(SessionError::TimeExpired.into());
    }

    let deadline = deadline_of(&assignment, &timing);
    check_can_write(assignment.status(), deadline, now)?;

    let questions = fetch_questions(&state.pool, assessment.id).await?;
    let choices = fetch_choices(&state.pool, assessment.id).await?;
    check_drafts(&payload.answers, &questions, &choices).map_err(AppError::BadRequest)?;

    let staged = payload.answers.len();
    state.autosave.stage(id, payload.answers, Instant::now());

    tracing::debug!(assignment_id = id, staged, "Answers staged");

    Ok(Json(serde_json::json!({
        "staged": staged,
        "deadline": deadline,
        "remaining_seconds": remaining_seconds(deadline, now),
    })))
}

/// Records a client-side security signal.
///
/// Homework attempts are not monitored: the report is acknowledged and ignored.
pub async fn report_violation(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i64>,
    Json(payload): Json<ViolationReport>,
) -> Result<impl IntoResponse, AppError> {
    payload.validate()?;

    let now = Utc::now();
    let (assignment, assessment) = load_student_attempt(&state.pool, id, user.id).await?;
    let timing = Timing::of(&assessment)?;

    if timing.mode == DeliveryMode::Homework {
        tracing::debug!(
            assignment_id = id,
            kind = payload.kind.as_str(),
            "Ignoring violation on homework"
        );
        return Ok(Json(ViolationResponse {
            violation_count: assignment.violation_count,
            terminated: false,
        }));
    }

    if expire_if_due(&state, &assignment, &timing, now).await?.is_some() {
        return Err(SessionError::TimeExpired.into());
    }

    let response = record_violation(
        &state,
        &assignment,
        payload.kind,
        payload.details.as_deref(),
        now,
    )
    .await?;

    Ok(Json(response))
}

fn submission_response(done: FinalizedAttempt) -> SubmissionResponse {
    SubmissionResponse {
        assignment_id: done.assignment.id,
        submitted_at: done.assignment.submitted_at,
        forced_submission: done.assignment.forced_submission,
        auto_score: Some(round2(done.sheet.raw)),
        max_points: done.sheet.max_points,
        pending_manual_grading: done.sheet.pending_manual,
    }
}

/// Final submission.
///
/// Answers sent with the request are merged over the buffer, then everything
/// is persisted and objective questions are scored. A submission past the
/// grace window closes the attempt as forced and drops the late answers.
pub async fn submit_attempt(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i64>,
    Json(payload): Json<SubmitAttemptRequest>,
) -> Result<impl IntoResponse, AppError> {
    payload.validate()?;

    let now = Utc::now();
    let (assignment, assessment) = load_student_attempt(&state.pool, id, user.id).await?;
    let timing = Timing::of(&assessment)?;

    if let Some(done) = expire_if_due(&state, &assignment, &timing, now).await? {
        tracing::warn!(
            assignment_id = id,
            dropped = payload.answers.len(),
            "Submission arrived after the grace window"
        );
        return Ok(Json(submission_response(done)));
    }

    transition(assignment.status(), SessionEvent::Submit)?;

    let questions = fetch_questions(&state.pool, assessment.id).await?;
    let choices = fetch_choices(&state.pool, assessment.id).await?;
    check_drafts(&payload.answers, &questions, &choices).map_err(AppError::BadRequest)?;

    let done = finalize_attempt(&state, id, SubmissionReason::Student, payload.answers, now).await?;

    Ok(Json(submission_response(done)))
}

fn result_lines(questions: &[Question], answers: &[Answer]) -> Vec<ResultLine> {
    let mut scored: HashMap<i64, &Answer> = HashMap::new();
    for answer in answers {
        scored
            .entry(answer.question_id)
            .and_modify(|current| {
                if answer.id < current.id {
                    *current = answer;
                }
            })
            .or_insert(answer);
    }

    questions
        .iter()
        .map(|q| {
            let row = scored.get(&q.id);
            ResultLine {
                question_id: q.id,
                points: q.points,
                score: row.and_then(|a| a.score),
                feedback: row.and_then(|a| a.feedback.clone()),
            }
        })
        .collect()
}

/// The graded result of an attempt, when the assessment releases results.
pub async fn get_result(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let (assignment, assessment) = load_student_attempt(&state.pool, id, user.id).await?;

    if !assessment.show_results {
        return Err(AppError::Forbidden(
            "Results are not released for this assessment".to_string(),
        ));
    }
    if assignment.status() != AttemptStatus::Graded {
        return Err(AppError::Conflict("Attempt has not been graded yet".to_string()));
    }

    let questions = fetch_questions(&state.pool, assessment.id).await?;
    let answers = fetch_answers(&state.pool, id).await?;
    let max_points = total_points(&questions);

    Ok(Json(AttemptResult {
        assignment_id: id,
        score: assignment.score,
        max_points,
        normalized: assignment
            .score
            .and_then(|s| normalize(s, max_points))
            .map(round2),
        teacher_notes: assignment.teacher_notes,
        lines: result_lines(&questions, &answers),
    }))
}
