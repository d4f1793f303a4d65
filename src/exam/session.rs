// src/exam/session.rs

//! Attempt lifecycle and deadline arithmetic.
//!
//! The server is the only clock that matters: clients receive a deadline and
//! the server time, and every write is checked against the deadline here.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::{
    error::AppError,
    models::assessment::{Assessment, DeliveryMode},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    NotStarted,
    InProgress,
    Submitted,
    Graded,
}

impl AttemptStatus {
    pub fn from_timestamps(
        started_at: Option<DateTime<Utc>>,
        submitted_at: Option<DateTime<Utc>>,
        graded_at: Option<DateTime<Utc>>,
    ) -> Self {
        match (started_at, submitted_at, graded_at) {
            (_, _, Some(_)) => AttemptStatus::Graded,
            (_, Some(_), None) => AttemptStatus::Submitted,
            (Some(_), None, None) => AttemptStatus::InProgress,
            (None, None, None) => AttemptStatus::NotStarted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Start,
    Submit,
    Grade,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SessionError {
    NotPublished,
    NotYetOpen(DateTime<Utc>),
    PastDue,
    NotStarted,
    AlreadySubmitted,
    NotSubmitted,
    TimeExpired,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::NotPublished => write!(f, "Assessment is not available yet"),
            SessionError::NotYetOpen(at) => write!(f, "Assessment opens at {}", at.to_rfc3339()),
            SessionError::PastDue => write!(f, "Assessment is past its due date"),
            SessionError::NotStarted => write!(f, "Attempt has not been started"),
            SessionError::AlreadySubmitted => write!(f, "Attempt has already been submitted"),
            SessionError::NotSubmitted => write!(f, "Attempt has not been submitted"),
            SessionError::TimeExpired => write!(f, "Time is up for this attempt"),
        }
    }
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotPublished
            | SessionError::NotYetOpen(_)
            | SessionError::PastDue => AppError::Forbidden(err.to_string()),
            SessionError::NotStarted
            | SessionError::AlreadySubmitted
            | SessionError::NotSubmitted
            | SessionError::TimeExpired => AppError::Conflict(err.to_string()),
        }
    }
}

/// Applies an event to the attempt state machine.
pub fn transition(from: AttemptStatus, event: SessionEvent) -> Result<AttemptStatus, SessionError> {
    use AttemptStatus::*;

    match (from, event) {
        (NotStarted, SessionEvent::Start) => Ok(InProgress),
        // Resuming keeps the original start time.
        (InProgress, SessionEvent::Start) => Ok(InProgress),
        (InProgress, SessionEvent::Submit) => Ok(Submitted),
        (Submitted | Graded, SessionEvent::Grade) => Ok(Graded),

        (NotStarted, SessionEvent::Submit) => Err(SessionError::NotStarted),
        (NotStarted | InProgress, SessionEvent::Grade) => Err(SessionError::NotSubmitted),
        (Submitted | Graded, SessionEvent::Start | SessionEvent::Submit) => {
            Err(SessionError::AlreadySubmitted)
        }
    }
}

/// The timing fields of an assessment that drive its attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timing {
    pub mode: DeliveryMode,
    pub is_published: bool,
    pub duration_minutes: Option<i32>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub due_date: Option<DateTime<Utc>>,
}

impl Timing {
    pub fn of(assessment: &Assessment) -> Result<Self, AppError> {
        Ok(Timing {
            mode: assessment.mode()?,
            is_published: assessment.is_published,
            duration_minutes: assessment.duration_minutes,
            scheduled_at: assessment.scheduled_at,
            due_date: assessment.due_date,
        })
    }

    /// Deadline of an attempt started at `started_at`.
    ///
    /// Supervised attempts get their duration, cut short by the due date.
    /// Homework runs until the due date; `None` means untimed.
    pub fn deadline(&self, started_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let by_duration = match self.mode {
            DeliveryMode::Supervised => self
                .duration_minutes
                .map(|m| started_at + Duration::minutes(i64::from(m))),
            DeliveryMode::Homework => None,
        };

        match (by_duration, self.due_date) {
            (Some(d), Some(due)) => Some(d.min(due)),
            (Some(d), None) => Some(d),
            (None, due) => due,
        }
    }

    /// Checks the opening window before an attempt is started or resumed.
    pub fn check_can_start(
        &self,
        status: AttemptStatus,
        now: DateTime<Utc>,
    ) -> Result<AttemptStatus, SessionError> {
        if !self.is_published {
            return Err(SessionError::NotPublished);
        }
        let next = transition(status, SessionEvent::Start)?;
        if status == AttemptStatus::NotStarted {
            if let Some(opens) = self.scheduled_at {
                if now < opens {
                    return Err(SessionError::NotYetOpen(opens));
                }
            }
            if let Some(due) = self.due_date {
                if now >= due {
                    return Err(SessionError::PastDue);
                }
            }
        }
        Ok(next)
    }
}

/// Seconds left until `deadline`, clamped at zero. `None` for untimed attempts.
pub fn remaining_seconds(deadline: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<i64> {
    deadline.map(|d| (d - now).num_seconds().max(0))
}

/// True once the deadline and the grace window have both passed.
/// A submission arriving inside the grace window still counts as on time.
pub fn is_expired(deadline: Option<DateTime<Utc>>, now: DateTime<Utc>, grace: Duration) -> bool {
    match deadline {
        Some(d) => now > d + grace,
        None => false,
    }
}

/// Answers may only be written while the attempt runs and the deadline holds.
pub fn check_can_write(
    status: AttemptStatus,
    deadline: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<(), SessionError> {
    match status {
        AttemptStatus::NotStarted => return Err(SessionError::NotStarted),
        AttemptStatus::Submitted | AttemptStatus::Graded => {
            return Err(SessionError::AlreadySubmitted);
        }
        AttemptStatus::InProgress => {}
    }
    match deadline {
        Some(d) if now > d => Err(SessionError::TimeExpired),
        _ => Ok(()),
    }
}
