// src/exam/autosave.rs

//! In-memory staging of answers between autosave requests and the database.
//!
//! Students' clients post their answers every few seconds. Each post is merged
//! into a per-attempt buffer (latest answer per question wins) and a background
//! task persists a buffer once it has been idle for the debounce interval, or
//! once it has been held for the maximum delay. Submission takes the buffer
//! directly so nothing staged is lost.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use validator::Validate;

use crate::models::{
    assignment::Answer,
    question::{Choice, Question, QuestionType},
};

/// One question's answer as sent by the exam client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct AnswerDraft {
    pub question_id: i64,
    #[serde(default)]
    #[validate(length(max = 50))]
    pub choice_ids: Vec<i64>,
    #[validate(length(max = 20000))]
    pub answer_text: Option<String>,
    #[validate(length(max = 1000))]
    pub file_path: Option<String>,
}

impl AnswerDraft {
    /// A draft with no content clears the stored answer.
    pub fn is_blank(&self) -> bool {
        self.choice_ids.is_empty()
            && self.answer_text.as_deref().is_none_or(str::is_empty)
            && self.file_path.as_deref().is_none_or(str::is_empty)
    }
}

#[derive(Debug)]
struct PendingAnswers {
    drafts: HashMap<i64, AnswerDraft>,
    first_staged: Instant,
    last_staged: Instant,
}

impl PendingAnswers {
    fn is_due(&self, now: Instant, debounce: Duration, max_delay: Duration) -> bool {
        now.saturating_duration_since(self.last_staged) >= debounce
            || now.saturating_duration_since(self.first_staged) >= max_delay
    }

    fn into_batch(self) -> StagedBatch {
        let mut drafts: Vec<AnswerDraft> = self.drafts.into_values().collect();
        drafts.sort_by_key(|d| d.question_id);
        StagedBatch {
            drafts,
            first_staged: self.first_staged,
        }
    }
}

/// Drafts taken out of the buffer for one flush.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedBatch {
    pub drafts: Vec<AnswerDraft>,
    pub first_staged: Instant,
}

/// Shared buffer of staged answers keyed by assignment id.
#[derive(Debug, Default)]
pub struct AutosaveBuffer {
    pending: DashMap<i64, PendingAnswers>,
    flush_locks: DashMap<i64, Arc<Mutex<()>>>,
}

impl AutosaveBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges drafts into the attempt's buffer.
    pub fn stage(&self, assignment_id: i64, drafts: Vec<AnswerDraft>, now: Instant) {
        if drafts.is_empty() {
            return;
        }

        let mut entry = self
            .pending
            .entry(assignment_id)
            .or_insert_with(|| PendingAnswers {
                drafts: HashMap::new(),
                first_staged: now,
                last_staged: now,
            });

        for draft in drafts {
            entry.drafts.insert(draft.question_id, draft);
        }
        entry.last_staged = now;
    }

    /// Staged drafts of one attempt, without removing them.
    pub fn peek(&self, assignment_id: i64) -> Vec<AnswerDraft> {
        let mut drafts: Vec<AnswerDraft> = self
            .pending
            .get(&assignment_id)
            .map(|p| p.drafts.values().cloned().collect())
            .unwrap_or_default();
        drafts.sort_by_key(|d| d.question_id);
        drafts
    }

    /// Removes and returns one attempt's drafts.
    pub fn take(&self, assignment_id: i64) -> Option<Vec<AnswerDraft>> {
        self.take_batch(assignment_id).map(|batch| batch.drafts)
    }

    /// Like `take`, keeping the time the oldest draft was staged.
    pub fn take_batch(&self, assignment_id: i64) -> Option<StagedBatch> {
        self.pending
            .remove(&assignment_id)
            .map(|(_, pending)| pending.into_batch())
    }

    /// Puts back a batch whose flush failed.
    ///
    /// Drafts staged while the flush was running are newer and stay; the batch
    /// only fills in the questions they do not cover. The max-delay clock keeps
    /// running from the batch's original staging time.
    pub fn restage(&self, assignment_id: i64, batch: StagedBatch, now: Instant) {
        if batch.drafts.is_empty() {
            return;
        }

        let mut entry = self
            .pending
            .entry(assignment_id)
            .or_insert_with(|| PendingAnswers {
                drafts: HashMap::new(),
                first_staged: batch.first_staged,
                last_staged: now,
            });

        for draft in batch.drafts {
            entry.drafts.entry(draft.question_id).or_insert(draft);
        }
        entry.first_staged = entry.first_staged.min(batch.first_staged);
    }

    /// Assignment ids whose buffers should be persisted now.
    pub fn due_ids(&self, now: Instant, debounce: Duration, max_delay: Duration) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .pending
            .iter()
            .filter(|entry| entry.value().is_due(now, debounce, max_delay))
            .map(|entry| *entry.key())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Empties the buffer, typically at shutdown.
    pub fn drain(&self) -> Vec<(i64, Vec<AnswerDraft>)> {
        let ids: Vec<i64> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut out: Vec<(i64, Vec<AnswerDraft>)> = ids
            .into_iter()
            .filter_map(|id| self.take(id).map(|drafts| (id, drafts)))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Serializes flushes and submission of one attempt.
    pub fn flush_lock(&self, assignment_id: i64) -> Arc<Mutex<()>> {
        self.flush_locks
            .entry(assignment_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drops the bookkeeping of a finished attempt.
    pub fn forget(&self, assignment_id: i64) {
        self.pending.remove(&assignment_id);
        self.flush_locks.remove(&assignment_id);
    }
}

/// Checks drafts against the questions and choices of the attempt's assessment.
pub fn check_drafts(
    drafts: &[AnswerDraft],
    questions: &[Question],
    choices: &[Choice],
) -> Result<(), String> {
    let kinds: HashMap<i64, QuestionType> = questions
        .iter()
        .filter_map(|q| q.kind().ok().map(|k| (q.id, k)))
        .collect();
    let choice_owner: HashMap<i64, i64> = choices.iter().map(|c| (c.id, c.question_id)).collect();

    let mut seen = HashSet::new();
    for draft in drafts {
        if !seen.insert(draft.question_id) {
            return Err(format!("question {} answered twice", draft.question_id));
        }

        let kind = kinds
            .get(&draft.question_id)
            .ok_or_else(|| format!("question {} is not part of this assessment", draft.question_id))?;

        if kind.has_choices() {
            if draft.answer_text.is_some() || draft.file_path.is_some() {
                return Err(format!(
                    "question {} only accepts choices",
                    draft.question_id
                ));
            }
            for choice_id in &draft.choice_ids {
                if choice_owner.get(choice_id) != Some(&draft.question_id) {
                    return Err(format!(
                        "choice {} does not belong to question {}",
                        choice_id, draft.question_id
                    ));
                }
            }
            let distinct: HashSet<&i64> = draft.choice_ids.iter().collect();
            if distinct.len() != draft.choice_ids.len() {
                return Err(format!(
                    "question {} lists a choice twice",
                    draft.question_id
                ));
            }
            if *kind != QuestionType::Multiple && draft.choice_ids.len() > 1 {
                return Err(format!(
                    "question {} accepts a single choice",
                    draft.question_id
                ));
            }
        } else {
            if !draft.choice_ids.is_empty() {
                return Err(format!(
                    "question {} does not accept choices",
                    draft.question_id
                ));
            }
            if *kind == QuestionType::Text && draft.file_path.is_some() {
                return Err(format!(
                    "question {} expects a text answer",
                    draft.question_id
                ));
            }
        }
    }
    Ok(())
}

/// Rebuilds the drafts of a resumed attempt: stored answers first, staged
/// drafts on top.
pub fn merge_saved(stored: &[Answer], staged: Vec<AnswerDraft>) -> Vec<AnswerDraft> {
    let mut merged: HashMap<i64, AnswerDraft> = HashMap::new();
    for answer in stored {
        let draft = merged
            .entry(answer.question_id)
            .or_insert_with(|| AnswerDraft {
                question_id: answer.question_id,
                choice_ids: Vec::new(),
                answer_text: None,
                file_path: None,
            });
        if let Some(choice_id) = answer.choice_id {
            draft.choice_ids.push(choice_id);
        }
        if answer.answer_text.is_some() {
            draft.answer_text = answer.answer_text.clone();
        }
        if answer.file_path.is_some() {
            draft.file_path = answer.file_path.clone();
        }
    }
    for draft in staged {
        merged.insert(draft.question_id, draft);
    }

    let mut drafts: Vec<AnswerDraft> = merged.into_values().collect();
    drafts.sort_by_key(|d| d.question_id);
    drafts
}
