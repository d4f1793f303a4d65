// src/services/attempts.rs

//! Database side of the attempt lifecycle, shared by the HTTP handlers and the
//! background tasks.

use std::time::Instant;

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgConnection, PgExecutor, PgPool, Postgres, QueryBuilder};

use crate::{
    error::AppError,
    exam::{
        autosave::{AnswerDraft, AutosaveBuffer, StagedBatch},
        scoring::{SheetScore, score_sheet},
        session::{AttemptStatus, SessionEvent, Timing, is_expired, transition},
        violation::{ViolationKind, ViolationPolicy},
    },
    models::{
        assessment::{ASSESSMENT_COLUMNS, Assessment},
        assignment::{ASSIGNMENT_COLUMNS, Answer, Assignment, ViolationResponse},
        question::{Choice, Question},
    },
    state::AppState,
};

/// Why an attempt is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionReason {
    Student,
    /// Deadline and grace window elapsed.
    Expired,
    Violation(ViolationKind),
}

impl SubmissionReason {
    fn is_forced(&self) -> bool {
        !matches!(self, SubmissionReason::Student)
    }
}

#[derive(Debug)]
pub struct FinalizedAttempt {
    pub assignment: Assignment,
    pub sheet: SheetScore,
}

pub async fn fetch_assessment<'e, E>(executor: E, id: i64) -> Result<Assessment, AppError>
where
    E: PgExecutor<'e>,
{
    let sql = format!("SELECT {} FROM assessments WHERE id = $1", ASSESSMENT_COLUMNS);
    sqlx::query_as::<_, Assessment>(&sql)
        .bind(id)
        .fetch_optional(executor)
        .await?
        .ok_or(AppError::NotFound("Assessment not found".to_string()))
}

pub async fn fetch_assignment<'e, E>(executor: E, id: i64) -> Result<Assignment, AppError>
where
    E: PgExecutor<'e>,
{
    let sql = format!(
        "SELECT {} FROM assessment_assignments WHERE id = $1",
        ASSIGNMENT_COLUMNS
    );
    sqlx::query_as::<_, Assignment>(&sql)
        .bind(id)
        .fetch_optional(executor)
        .await?
        .ok_or(AppError::NotFound("Attempt not found".to_string()))
}

/// Locks the assignment row for the rest of the transaction.
pub(crate) async fn fetch_assignment_for_update(
    conn: &mut PgConnection,
    id: i64,
) -> Result<Assignment, AppError> {
    let sql = format!(
        "SELECT {} FROM assessment_assignments WHERE id = $1 FOR UPDATE",
        ASSIGNMENT_COLUMNS
    );
    sqlx::query_as::<_, Assignment>(&sql)
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or(AppError::NotFound("Attempt not found".to_string()))
}

pub async fn fetch_questions<'e, E>(executor: E, assessment_id: i64) -> Result<Vec<Question>, AppError>
where
    E: PgExecutor<'e>,
{
    let questions = sqlx::query_as::<_, Question>(
        r#"
        SELECT id, assessment_id, content, type, points, order_index
        FROM questions
        WHERE assessment_id = $1
        ORDER BY order_index, id
        "#,
    )
    .bind(assessment_id)
    .fetch_all(executor)
    .await?;

    Ok(questions)
}

pub async fn fetch_choices<'e, E>(executor: E, assessment_id: i64) -> Result<Vec<Choice>, AppError>
where
    E: PgExecutor<'e>,
{
    let choices = sqlx::query_as::<_, Choice>(
        r#"
        SELECT c.id, c.question_id, c.content, c.is_correct, c.order_index
        FROM choices c
        JOIN questions q ON q.id = c.question_id
        WHERE q.assessment_id = $1
        ORDER BY c.question_id, c.order_index, c.id
        "#,
    )
    .bind(assessment_id)
    .fetch_all(executor)
    .await?;

    Ok(choices)
}

pub async fn fetch_answers<'e, E>(executor: E, assignment_id: i64) -> Result<Vec<Answer>, AppError>
where
    E: PgExecutor<'e>,
{
    let answers = sqlx::query_as::<_, Answer>(
        r#"
        SELECT id, assignment_id, question_id, choice_id, answer_text, file_path, score, feedback
        FROM answers
        WHERE assignment_id = $1
        ORDER BY question_id, id
        "#,
    )
    .bind(assignment_id)
    .fetch_all(executor)
    .await?;

    Ok(answers)
}

/// Loads an attempt owned by `student_id` together with its assessment.
/// Attempts of other students are reported as missing.
pub async fn load_student_attempt(
    pool: &PgPool,
    assignment_id: i64,
    student_id: i64,
) -> Result<(Assignment, Assessment), AppError> {
    let assignment = fetch_assignment(pool, assignment_id).await?;
    if assignment.student_id != student_id {
        return Err(AppError::NotFound("Attempt not found".to_string()));
    }
    let assessment = fetch_assessment(pool, assignment.assessment_id).await?;
    Ok((assignment, assessment))
}

/// Deadline of a started attempt.
pub fn deadline_of(assignment: &Assignment, timing: &Timing) -> Option<DateTime<Utc>> {
    assignment.started_at.and_then(|s| timing.deadline(s))
}

/// Replaces the stored answers of each drafted question.
async fn persist_drafts(
    conn: &mut PgConnection,
    assignment_id: i64,
    drafts: &[AnswerDraft],
) -> Result<(), AppError> {
    for draft in drafts {
        sqlx::query("DELETE FROM answers WHERE assignment_id = $1 AND question_id = $2")
            .bind(assignment_id)
            .bind(draft.question_id)
            .execute(&mut *conn)
            .await?;

        if draft.is_blank() {
            continue;
        }

        if draft.choice_ids.is_empty() {
            sqlx::query(
                r#"
                INSERT INTO answers (assignment_id, question_id, answer_text, file_path)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(assignment_id)
            .bind(draft.question_id)
            .bind(&draft.answer_text)
            .bind(&draft.file_path)
            .execute(&mut *conn)
            .await?;
        } else {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new("INSERT INTO answers (assignment_id, question_id, choice_id) ");
            builder.push_values(&draft.choice_ids, |mut row, choice_id| {
                row.push_bind(assignment_id)
                    .push_bind(draft.question_id)
                    .push_bind(*choice_id);
            });
            builder.build().execute(&mut *conn).await?;
        }
    }
    Ok(())
}

/// Persists whatever the buffer holds for one attempt.
///
/// Drafts that arrive after the attempt was submitted are dropped. On a
/// database failure the drafts go back into the buffer for the next tick.
pub async fn flush_attempt(
    pool: &PgPool,
    buffer: &AutosaveBuffer,
    assignment_id: i64,
) -> Result<usize, AppError> {
    let lock = buffer.flush_lock(assignment_id);
    let _guard = lock.lock().await;

    let Some(batch) = buffer.take_batch(assignment_id) else {
        return Ok(0);
    };

    let result = persist_batch(pool, assignment_id, &batch.drafts).await;

    if let Err(AppError::InternalServerError(_)) = &result {
        buffer.restage(assignment_id, batch, Instant::now());
    }
    result
}

/// Writes one batch of drafts if the attempt is still running.
pub async fn persist_batch(
    pool: &PgPool,
    assignment_id: i64,
    drafts: &[AnswerDraft],
) -> Result<usize, AppError> {
    let mut tx = pool.begin().await?;
    let assignment = fetch_assignment_for_update(&mut tx, assignment_id).await?;
    if assignment.status() != AttemptStatus::InProgress {
        tracing::warn!(
            assignment_id,
            dropped = drafts.len(),
            "Discarding autosave for a closed attempt"
        );
        return Ok(0);
    }
    persist_drafts(&mut tx, assignment_id, drafts).await?;
    tx.commit().await?;
    Ok(drafts.len())
}

/// Closes an attempt: flushes staged answers, auto-scores objective questions
/// and stamps the submission.
pub async fn finalize_attempt(
    state: &AppState,
    assignment_id: i64,
    reason: SubmissionReason,
    final_drafts: Vec<AnswerDraft>,
    now: DateTime<Utc>,
) -> Result<FinalizedAttempt, AppError> {
    let buffer = &state.autosave;
    let lock = buffer.flush_lock(assignment_id);
    let _guard = lock.lock().await;

    let staged_at = Instant::now();
    buffer.stage(assignment_id, final_drafts, staged_at);
    let batch = buffer.take_batch(assignment_id).unwrap_or(StagedBatch {
        drafts: Vec::new(),
        first_staged: staged_at,
    });
    let drafts = &batch.drafts;

    let result = async {
        let mut tx = state.pool.begin().await?;
        let assignment = fetch_assignment_for_update(&mut tx, assignment_id).await?;
        transition(assignment.status(), SessionEvent::Submit)?;

        persist_drafts(&mut tx, assignment_id, drafts).await?;

        let questions = fetch_questions(&mut *tx, assignment.assessment_id).await?;
        let choices = fetch_choices(&mut *tx, assignment.assessment_id).await?;
        let answers = fetch_answers(&mut *tx, assignment_id).await?;
        let sheet = score_sheet(&questions, &choices, &answers)?;

        for line in &sheet.lines {
            if let (Some(answer_id), Some(score)) = (line.answer_id, line.score) {
                sqlx::query("UPDATE answers SET score = $1, updated_at = $2 WHERE id = $3")
                    .bind(score)
                    .bind(now)
                    .bind(answer_id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        let violation = match reason {
            SubmissionReason::Violation(kind) => Some(kind.as_str()),
            _ => None,
        };

        let sql = format!(
            r#"
            UPDATE assessment_assignments
            SET submitted_at = $2,
                score = $3,
                forced_submission = $4,
                security_violation = $5
            WHERE id = $1
            RETURNING {}
            "#,
            ASSIGNMENT_COLUMNS
        );
        let updated = sqlx::query_as::<_, Assignment>(&sql)
            .bind(assignment_id)
            .bind(now)
            .bind(sheet.raw)
            .bind(reason.is_forced())
            .bind(violation)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok::<FinalizedAttempt, AppError>(FinalizedAttempt {
            assignment: updated,
            sheet,
        })
    }
    .await;

    match &result {
        Ok(done) => {
            buffer.forget(assignment_id);
            tracing::info!(
                assignment_id,
                reason = ?reason,
                auto_score = done.sheet.raw,
                max_points = done.sheet.max_points,
                "Attempt submitted"
            );
        }
        Err(AppError::InternalServerError(_)) => {
            buffer.restage(assignment_id, batch, Instant::now());
        }
        Err(_) => {}
    }
    result
}

/// Auto-submits an in-progress attempt whose deadline and grace have passed.
///
/// Returns `None` when the attempt is still running or was closed concurrently.
pub async fn expire_if_due(
    state: &AppState,
    assignment: &Assignment,
    timing: &Timing,
    now: DateTime<Utc>,
) -> Result<Option<FinalizedAttempt>, AppError> {
    if assignment.status() != AttemptStatus::InProgress {
        return Ok(None);
    }
    let deadline = deadline_of(assignment, timing);
    if !is_expired(deadline, now, state.config.submission_grace) {
        return Ok(None);
    }

    match finalize_attempt(state, assignment.id, SubmissionReason::Expired, Vec::new(), now).await {
        Ok(done) => Ok(Some(done)),
        Err(AppError::Conflict(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

#[derive(Debug, FromRow)]
struct RunningAttempt {
    id: i64,
    started_at: DateTime<Utc>,
    delivery_mode: String,
    is_published: bool,
    duration_minutes: Option<i32>,
    scheduled_at: Option<DateTime<Utc>>,
    due_date: Option<DateTime<Utc>>,
}

/// Finds every running attempt past its deadline and submits it.
pub async fn sweep_expired(state: &AppState, now: DateTime<Utc>) -> Result<usize, AppError> {
    let running = sqlx::query_as::<_, RunningAttempt>(
        r#"
        SELECT aa.id, aa.started_at, a.delivery_mode, a.is_published,
               a.duration_minutes, a.scheduled_at, a.due_date
        FROM assessment_assignments aa
        JOIN assessments a ON a.id = aa.assessment_id
        WHERE aa.started_at IS NOT NULL AND aa.submitted_at IS NULL
        "#,
    )
    .fetch_all(&state.pool)
    .await?;

    let mut expired = 0;
    for attempt in running {
        let timing = Timing {
            mode: attempt.delivery_mode.parse()?,
            is_published: attempt.is_published,
            duration_minutes: attempt.duration_minutes,
            scheduled_at: attempt.scheduled_at,
            due_date: attempt.due_date,
        };
        let deadline = timing.deadline(attempt.started_at);
        if !is_expired(deadline, now, state.config.submission_grace) {
            continue;
        }

        match finalize_attempt(state, attempt.id, SubmissionReason::Expired, Vec::new(), now).await
        {
            Ok(_) => expired += 1,
            Err(AppError::Conflict(_)) => {}
            Err(e) => {
                tracing::error!(assignment_id = attempt.id, "Failed to expire attempt: {}", e);
            }
        }
    }

    Ok(expired)
}

/// Counts a security violation and terminates the attempt when the policy says so.
pub async fn record_violation(
    state: &AppState,
    assignment: &Assignment,
    kind: ViolationKind,
    details: Option<&str>,
    now: DateTime<Utc>,
) -> Result<ViolationResponse, AppError> {
    let policy = ViolationPolicy::new(state.config.violation_tolerance);

    let mut tx = state.pool.begin().await?;
    let locked = fetch_assignment_for_update(&mut tx, assignment.id).await?;
    if locked.status() != AttemptStatus::InProgress {
        return Err(AppError::Conflict(
            "Attempt is not in progress".to_string(),
        ));
    }

    let outcome = policy.evaluate(locked.violation_count, kind);
    sqlx::query(
        r#"
        UPDATE assessment_assignments
        SET violation_count = $2
        WHERE id = $1
        "#,
    )
    .bind(assignment.id)
    .bind(outcome.count)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    tracing::warn!(
        assignment_id = assignment.id,
        student_id = assignment.student_id,
        kind = kind.as_str(),
        count = outcome.count,
        details = details.unwrap_or(""),
        "Security violation reported"
    );

    let mut terminated = false;
    if outcome.terminate {
        match finalize_attempt(
            state,
            assignment.id,
            SubmissionReason::Violation(kind),
            Vec::new(),
            now,
        )
        .await
        {
            Ok(_) => {
                terminated = true;
                tracing::warn!(assignment_id = assignment.id, "Attempt terminated after violation");
            }
            // Submitted by the student in the meantime
            Err(AppError::Conflict(_)) => {}
            Err(e) => return Err(e),
        }
    }

    Ok(ViolationResponse {
        violation_count: outcome.count,
        terminated,
    })
}
