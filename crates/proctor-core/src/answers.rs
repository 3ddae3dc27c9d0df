//! Answer store: the single owner of an attempt's mutable document.
//!
//! Every write to a question goes through here, so the rules about what may
//! change when are checked in one place. Writes are targeted at a single
//! question and recorded in a revisioned dirty set that the sync layer
//! drains.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::error::{EngineError, Result};
use crate::model::{
    AnswerPayload, Attempt, AttemptStatus, OverallStats, QuestionAttempt, QuestionKey,
    QuestionKind, SectionStatus,
};
use crate::traits::{QuestionUpdate, SectionUpdate};

/// Changes not yet acknowledged by the persistence boundary, with the
/// revision at which each was last touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingChanges {
    pub questions: Vec<(QuestionKey, u64)>,
    pub sections: Vec<(usize, u64)>,
}

impl PendingChanges {
    pub fn is_empty(&self) -> bool {
        self.questions.is_empty() && self.sections.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct AnswerStore {
    attempt: Attempt,
    revision: u64,
    dirty_questions: BTreeMap<QuestionKey, u64>,
    dirty_sections: BTreeMap<usize, u64>,
}

impl AnswerStore {
    pub fn new(attempt: Attempt) -> Self {
        Self {
            attempt,
            revision: 0,
            dirty_questions: BTreeMap::new(),
            dirty_sections: BTreeMap::new(),
        }
    }

    pub fn attempt(&self) -> &Attempt {
        &self.attempt
    }

    pub fn into_attempt(self) -> Attempt {
        self.attempt
    }

    pub fn question(&self, key: QuestionKey) -> Option<&QuestionAttempt> {
        self.attempt.question(key)
    }

    // -----------------------------------------------------------------------
    // Question mutators
    // -----------------------------------------------------------------------

    /// Select one option of a single-select question, replacing any prior one.
    pub fn set_selection(&mut self, key: QuestionKey, option_index: u32) -> Result<()> {
        let question = self.writable(key)?;
        if question.kind() != QuestionKind::SingleSelect {
            return Err(EngineError::invalid(format!(
                "cannot select an option on {} question {key}",
                question.kind()
            )));
        }
        if let Some(count) = question.option_count {
            if option_index >= count {
                return Err(EngineError::invalid(format!(
                    "option {option_index} out of range for {key} ({count} options)"
                )));
            }
        }
        question.answer = AnswerPayload::SingleSelect {
            selected_option_index: Some(option_index),
        };
        self.touch_question(key);
        Ok(())
    }

    /// Replace the text of a free-text or essay question.
    pub fn set_text(&mut self, key: QuestionKey, value: impl Into<String>) -> Result<()> {
        let question = self.writable(key)?;
        let value = value.into();
        question.answer = match question.kind() {
            QuestionKind::FreeText => AnswerPayload::FreeText { text: value },
            QuestionKind::Essay => AnswerPayload::Essay { text: value },
            QuestionKind::SingleSelect => {
                return Err(EngineError::invalid(format!(
                    "cannot set text on single_select question {key}"
                )))
            }
        };
        self.touch_question(key);
        Ok(())
    }

    /// Apply a tagged payload, dispatching to the setter for its kind.
    pub fn set_answer(&mut self, key: QuestionKey, payload: AnswerPayload) -> Result<()> {
        let expected = self.writable(key)?.kind();
        if payload.kind() != expected {
            return Err(EngineError::invalid(format!(
                "{} answer does not fit {expected} question {key}",
                payload.kind()
            )));
        }
        match payload {
            AnswerPayload::SingleSelect {
                selected_option_index: Some(index),
            } => self.set_selection(key, index),
            AnswerPayload::SingleSelect {
                selected_option_index: None,
            } => self.clear_answer(key),
            AnswerPayload::FreeText { text } | AnswerPayload::Essay { text } => {
                self.set_text(key, text)
            }
        }
    }

    /// Reset the answer to empty for the question's kind.
    pub fn clear_answer(&mut self, key: QuestionKey) -> Result<()> {
        let question = self.writable(key)?;
        question.answer = AnswerPayload::empty(question.kind());
        self.touch_question(key);
        Ok(())
    }

    /// Returns the new flag value.
    pub fn toggle_marked_for_review(&mut self, key: QuestionKey) -> Result<bool> {
        let question = self.writable(key)?;
        question.marked_for_review = !question.marked_for_review;
        let marked = question.marked_for_review;
        self.touch_question(key);
        Ok(marked)
    }

    /// Add one second to the question and to the attempt total.
    pub fn record_tick(&mut self, key: QuestionKey) -> Result<()> {
        let question = self.writable(key)?;
        question.time_spent_seconds += 1;
        self.attempt.total_time_used_seconds += 1;
        self.touch_question(key);
        Ok(())
    }

    fn writable(&mut self, key: QuestionKey) -> Result<&mut QuestionAttempt> {
        if self.attempt.status != AttemptStatus::InProgress {
            return Err(EngineError::stale(format!(
                "attempt {} is {}",
                self.attempt.id, self.attempt.status
            )));
        }
        let section = self
            .attempt
            .sections
            .get_mut(key.section_index)
            .ok_or_else(|| EngineError::invalid(format!("no section at {key}")))?;
        if section.status != SectionStatus::InProgress {
            return Err(EngineError::stale(format!(
                "section {} ({}) is {}",
                key.section_index, section.name, section.status
            )));
        }
        section
            .questions
            .get_mut(key.question_index)
            .ok_or_else(|| EngineError::invalid(format!("no question at {key}")))
    }

    // -----------------------------------------------------------------------
    // Lifecycle writes, driven by the state machine
    // -----------------------------------------------------------------------

    pub(crate) fn set_status(&mut self, status: AttemptStatus) {
        self.attempt.status = status;
        self.revision += 1;
    }

    pub(crate) fn set_cursor(&mut self, cursor: Option<QuestionKey>) {
        self.attempt.cursor = cursor;
    }

    /// Mark a section in progress; `started_at` is only ever set once.
    pub(crate) fn begin_section(&mut self, index: usize, now: DateTime<Utc>) {
        if let Some(section) = self.attempt.sections.get_mut(index) {
            section.status = SectionStatus::InProgress;
            section.started_at.get_or_insert(now);
            self.touch_section(index);
        }
    }

    /// Mark a section completed; `ended_at` is only ever set once.
    pub(crate) fn complete_section(&mut self, index: usize, now: DateTime<Utc>) {
        if let Some(section) = self.attempt.sections.get_mut(index) {
            section.status = SectionStatus::Completed;
            section.ended_at.get_or_insert(now);
            self.touch_section(index);
        }
    }

    /// Written once. Returns `false` if stats were already present.
    pub(crate) fn set_overall_stats(&mut self, stats: OverallStats) -> bool {
        if self.attempt.overall_stats.is_some() {
            return false;
        }
        self.attempt.overall_stats = Some(stats);
        true
    }

    // -----------------------------------------------------------------------
    // Dirty tracking
    // -----------------------------------------------------------------------

    fn touch_question(&mut self, key: QuestionKey) {
        self.revision += 1;
        self.dirty_questions.insert(key, self.revision);
    }

    fn touch_section(&mut self, index: usize) {
        self.revision += 1;
        self.dirty_sections.insert(index, self.revision);
    }

    pub fn has_pending(&self) -> bool {
        !self.dirty_questions.is_empty() || !self.dirty_sections.is_empty()
    }

    pub fn pending(&self) -> PendingChanges {
        PendingChanges {
            questions: self
                .dirty_questions
                .iter()
                .map(|(k, r)| (*k, *r))
                .collect(),
            sections: self
                .dirty_sections
                .iter()
                .map(|(i, r)| (*i, *r))
                .collect(),
        }
    }

    /// Clear the entries of `flushed` that have not been touched since.
    pub fn acknowledge(&mut self, flushed: &PendingChanges) {
        for (key, revision) in &flushed.questions {
            if self.dirty_questions.get(key) == Some(revision) {
                self.dirty_questions.remove(key);
            }
        }
        for (index, revision) in &flushed.sections {
            if self.dirty_sections.get(index) == Some(revision) {
                self.dirty_sections.remove(index);
            }
        }
    }

    pub fn question_update(&self, key: QuestionKey) -> Option<QuestionUpdate> {
        self.attempt.question(key).map(|q| QuestionUpdate {
            section_index: key.section_index,
            question_index: key.question_index,
            answer: q.answer.clone(),
            is_answered: q.is_answered(),
            marked_for_review: q.marked_for_review,
            time_spent_seconds: q.time_spent_seconds,
        })
    }

    pub fn section_update(&self, index: usize) -> Option<SectionUpdate> {
        self.attempt.sections.get(index).map(|s| SectionUpdate {
            section_index: index,
            status: s.status,
            started_at: s.started_at,
            ended_at: s.ended_at,
        })
    }

    /// Every question of the attempt, in order, as the finalized answer set.
    pub fn all_question_updates(&self) -> Vec<QuestionUpdate> {
        self.attempt
            .sections
            .iter()
            .enumerate()
            .flat_map(|(si, section)| {
                (0..section.questions.len()).map(move |qi| QuestionKey::new(si, qi))
            })
            .filter_map(|key| self.question_update(key))
            .collect()
    }
}
