//! The attempt state machine.
//!
//! Owns the answer store, one timer per section, the clock gate, and the
//! section/question cursors. Every method runs synchronously against
//! in-memory state and records what the outside world has to do next
//! (flush, submit) as [`EngineEvent`]s, which the session drains.
//!
//! Lifecycle: `NotStarted -> InProgress -> {Completed | Cancelled | Expired}`.
//! Sections are entered strictly in template order and never re-entered.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::answers::AnswerStore;
use crate::clock::{Clock, Tick};
use crate::error::{EngineError, Result};
use crate::model::{
    AnswerPayload, Attempt, AttemptStatus, OverallStats, QuestionKey, SectionStatus,
};
use crate::timer::{SectionTimer, TimerSignal};
use crate::traits::{FlushReason, SubmitRequest, SubmitTrigger};

/// How a section came to an end. Only affects audit and telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndTrigger {
    Manual,
    TimeExpired,
    Submit,
    Cancel,
    /// The section had no questions and was skipped on entry.
    Empty,
}

impl fmt::Display for EndTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndTrigger::Manual => write!(f, "manual"),
            EndTrigger::TimeExpired => write!(f, "time-expired"),
            EndTrigger::Submit => write!(f, "submit"),
            EndTrigger::Cancel => write!(f, "cancel"),
            EndTrigger::Empty => write!(f, "empty"),
        }
    }
}

/// Follow-up work produced by a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    SectionStarted { index: usize },
    SectionEnded { index: usize, trigger: EndTrigger },
    FlushRequested(FlushReason),
    SubmissionRequested(SubmitTrigger),
    ClockDrift { gap_secs: u64 },
}

/// Result of feeding one tick to the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// One second was attributed to the active question.
    Counted { remaining_seconds: u64 },
    /// The active section's time ran out on this tick.
    Expired { section_index: usize },
    /// The clock is paused or stopped.
    Dropped,
    /// Nothing to attribute the tick to.
    Ignored,
}

/// One cell of the question palette.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaletteEntry {
    pub order: u32,
    pub answered: bool,
    pub marked: bool,
    pub current: bool,
}

pub struct AttemptStateMachine {
    store: AnswerStore,
    timers: Vec<SectionTimer>,
    clock: Clock,
    active_section: Option<usize>,
    active_question: usize,
    pending_submission: Option<SubmitTrigger>,
    events: Vec<EngineEvent>,
}

impl AttemptStateMachine {
    /// Build a machine around a fresh or persisted attempt.
    ///
    /// An in-progress attempt is resumed on the spot: timers are derived from
    /// the persisted question times, and a section whose time had already run
    /// out expires immediately.
    pub fn from_attempt(attempt: Attempt) -> Result<Self> {
        let in_progress = attempt
            .sections
            .iter()
            .filter(|s| s.status == SectionStatus::InProgress)
            .count();
        if in_progress > 1 {
            return Err(EngineError::invalid(format!(
                "attempt {} has {in_progress} sections in progress",
                attempt.id
            )));
        }

        let timers = attempt
            .sections
            .iter()
            .map(|s| SectionTimer::new(s.duration_seconds, s.time_used_seconds()))
            .collect();
        let status = attempt.status;
        let has_stats = attempt.overall_stats.is_some();

        let mut machine = Self {
            store: AnswerStore::new(attempt),
            timers,
            clock: Clock::new(),
            active_section: None,
            active_question: 0,
            pending_submission: None,
            events: Vec::new(),
        };

        match status {
            AttemptStatus::NotStarted => {}
            AttemptStatus::InProgress => machine.resume_in_progress(),
            AttemptStatus::Expired if !has_stats => {
                machine.clock.stop();
                machine.pending_submission = Some(SubmitTrigger::AutoTimeout);
            }
            _ => machine.clock.stop(),
        }
        Ok(machine)
    }

    /// Start a not-started attempt at its first section.
    pub fn begin(&mut self) -> Result<()> {
        if self.status() != AttemptStatus::NotStarted {
            return Err(EngineError::stale(format!(
                "attempt {} is already {}",
                self.attempt().id,
                self.status()
            )));
        }
        info!(attempt = %self.attempt().id, "attempt started");
        self.store.set_status(AttemptStatus::InProgress);
        self.clock.start();
        if self.timers.is_empty() {
            self.request_submission(SubmitTrigger::Manual);
        } else {
            self.start_section(0, 0);
        }
        Ok(())
    }

    fn resume_in_progress(&mut self) {
        self.clock.start();
        let attempt = self.store.attempt();
        if let Some(index) = attempt.active_section_index() {
            let question = attempt
                .cursor
                .filter(|c| c.section_index == index)
                .map(|c| c.question_index)
                .filter(|&q| q < attempt.sections[index].questions.len())
                .unwrap_or(0);
            info!(attempt = %attempt.id, section = index, "resuming section");
            self.start_section(index, question);
        } else if let Some(next) = attempt
            .sections
            .iter()
            .position(|s| s.status == SectionStatus::NotStarted)
        {
            self.start_section(next, 0);
        } else {
            // Every section ended but the attempt was never finalized.
            let ran_out = attempt
                .sections
                .last()
                .is_some_and(|s| s.remaining_seconds() == 0);
            self.request_submission(if ran_out {
                SubmitTrigger::AutoTimeout
            } else {
                SubmitTrigger::Manual
            });
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn attempt(&self) -> &Attempt {
        self.store.attempt()
    }

    pub fn into_attempt(self) -> Attempt {
        self.store.into_attempt()
    }

    pub fn status(&self) -> AttemptStatus {
        self.store.attempt().status
    }

    pub fn store(&self) -> &AnswerStore {
        &self.store
    }

    pub(crate) fn store_mut(&mut self) -> &mut AnswerStore {
        &mut self.store
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn active_section(&self) -> Option<usize> {
        self.active_section
    }

    pub fn active_question(&self) -> Option<usize> {
        self.active_section.map(|_| self.active_question)
    }

    pub fn current_key(&self) -> Option<QuestionKey> {
        self.active_section
            .map(|s| QuestionKey::new(s, self.active_question))
    }

    pub fn timer(&self, section_index: usize) -> Option<&SectionTimer> {
        self.timers.get(section_index)
    }

    /// Remaining time of the active section.
    pub fn remaining_seconds(&self) -> Option<u64> {
        self.active_section
            .and_then(|s| self.timers.get(s))
            .map(SectionTimer::remaining_seconds)
    }

    pub fn pending_submission(&self) -> Option<SubmitTrigger> {
        self.pending_submission
    }

    pub fn drain_events(&mut self) -> Vec<EngineEvent> {
        std::mem::take(&mut self.events)
    }

    /// Answered/marked/current status for the active section's questions.
    pub fn palette(&self) -> Vec<PaletteEntry> {
        let Some(section) = self
            .active_section
            .and_then(|s| self.attempt().sections.get(s))
        else {
            return Vec::new();
        };
        section
            .questions
            .iter()
            .enumerate()
            .map(|(i, q)| PaletteEntry {
                order: q.order,
                answered: q.is_answered(),
                marked: q.marked_for_review,
                current: i == self.active_question,
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Intents
    // -----------------------------------------------------------------------

    fn require_active(&self) -> Result<QuestionKey> {
        if self.status() != AttemptStatus::InProgress {
            return Err(EngineError::stale(format!(
                "attempt {} is {}",
                self.attempt().id,
                self.status()
            )));
        }
        self.current_key()
            .ok_or_else(|| EngineError::stale("no section is in progress"))
    }

    /// Set the active question's answer. Cursors do not move.
    pub fn answer(&mut self, payload: AnswerPayload) -> Result<()> {
        let key = self.require_active()?;
        self.store.set_answer(key, payload)
    }

    pub fn select_option(&mut self, option_index: u32) -> Result<()> {
        let key = self.require_active()?;
        self.store.set_selection(key, option_index)
    }

    pub fn set_text(&mut self, text: impl Into<String>) -> Result<()> {
        let key = self.require_active()?;
        self.store.set_text(key, text)
    }

    pub fn clear_answer(&mut self) -> Result<()> {
        let key = self.require_active()?;
        self.store.clear_answer(key)
    }

    /// Returns the new marked-for-review flag.
    pub fn toggle_review(&mut self) -> Result<bool> {
        let key = self.require_active()?;
        self.store.toggle_marked_for_review(key)
    }

    /// Move within the current section. Moving to the current index is a no-op.
    pub fn navigate(&mut self, target_question_index: usize) -> Result<()> {
        let key = self.require_active()?;
        let len = self.attempt().sections[key.section_index].questions.len();
        if target_question_index >= len {
            return Err(EngineError::invalid(format!(
                "question {target_question_index} is outside section {} (0..{len})",
                key.section_index
            )));
        }
        if target_question_index == key.question_index {
            return Ok(());
        }
        self.events
            .push(EngineEvent::FlushRequested(FlushReason::Navigation));
        self.active_question = target_question_index;
        self.store.set_cursor(self.current_key());
        Ok(())
    }

    /// End the active section. Irrevocable, so the caller must confirm.
    pub fn end_section(&mut self, confirmed: bool) -> Result<()> {
        self.require_active()?;
        if !confirmed {
            return Err(EngineError::invalid(
                "ending a section is irrevocable and must be confirmed",
            ));
        }
        self.end_active_section(EndTrigger::Manual);
        Ok(())
    }

    /// Fired when the active timer runs out. Ignored if nothing is running.
    pub fn time_expired(&mut self) {
        if self.status() != AttemptStatus::InProgress || self.active_section.is_none() {
            debug!("time expiry with no active section ignored");
            return;
        }
        self.end_active_section(EndTrigger::TimeExpired);
    }

    /// End the active section, close the sections not yet started, and
    /// request finalization.
    ///
    /// With a submission already pending (an earlier one failed), this asks
    /// for it to be driven again.
    pub fn submit(&mut self) -> Result<()> {
        match (self.status(), self.pending_submission) {
            (AttemptStatus::InProgress, _) | (AttemptStatus::Expired, Some(_)) => {}
            (status, _) => {
                return Err(EngineError::stale(format!(
                    "attempt {} is {status}",
                    self.attempt().id
                )))
            }
        }
        if let Some(trigger) = self.pending_submission {
            let queued = self
                .events
                .iter()
                .any(|e| matches!(e, EngineEvent::SubmissionRequested(_)));
            if !queued {
                info!(attempt = %self.attempt().id, %trigger, "submission requested again");
                self.events.push(EngineEvent::SubmissionRequested(trigger));
            }
            return Ok(());
        }
        if self.active_section.is_some() {
            self.end_active_section(EndTrigger::Submit);
        }
        // A reload must not reopen a section after the learner submitted.
        let now = Utc::now();
        let unstarted: Vec<usize> = self
            .attempt()
            .sections
            .iter()
            .enumerate()
            .filter(|(_, s)| s.status == SectionStatus::NotStarted)
            .map(|(i, _)| i)
            .collect();
        if !unstarted.is_empty() {
            for index in unstarted {
                self.timers[index].stop();
                self.store.complete_section(index, now);
            }
            self.events
                .push(EngineEvent::FlushRequested(FlushReason::SectionEnd));
        }
        self.request_submission(SubmitTrigger::Manual);
        Ok(())
    }

    /// Abandon the attempt without grading.
    pub fn cancel(&mut self) -> Result<()> {
        if self.status().is_terminal() {
            return Err(EngineError::stale(format!(
                "attempt {} is {}",
                self.attempt().id,
                self.status()
            )));
        }
        if self.active_section.is_some() {
            self.end_active_section(EndTrigger::Cancel);
        }
        self.stop_clock();
        self.pending_submission = None;
        self.store.set_status(AttemptStatus::Cancelled);
        self.events
            .push(EngineEvent::FlushRequested(FlushReason::Manual));
        info!(attempt = %self.attempt().id, "attempt cancelled");
        Ok(())
    }

    /// Pause or resume the active section's timer and the clock together.
    /// Returns `true` if now running.
    pub fn toggle_pause(&mut self) -> Result<bool> {
        let key = self.require_active()?;
        let running = self.timers[key.section_index].toggle();
        if running {
            self.clock.resume();
        } else {
            self.clock.pause();
        }
        Ok(running)
    }

    /// Attribute one tick to the active question.
    ///
    /// Ticks never fail: against a frozen attempt or ended section they are
    /// ignored.
    pub fn tick(&mut self, tick: Tick) -> TickOutcome {
        if self.status() != AttemptStatus::InProgress {
            return TickOutcome::Ignored;
        }
        if let Tick::Drift { gap_secs } = tick {
            self.reconcile_after_drift(gap_secs);
        }
        if !self.clock.admit() {
            return TickOutcome::Dropped;
        }
        let Some(key) = self.current_key() else {
            return TickOutcome::Ignored;
        };
        if !self.timers[key.section_index].is_running() {
            return TickOutcome::Ignored;
        }
        if self.store.record_tick(key).is_err() {
            return TickOutcome::Ignored;
        }
        match self.timers[key.section_index].tick() {
            TimerSignal::Expired => {
                self.time_expired();
                TickOutcome::Expired {
                    section_index: key.section_index,
                }
            }
            _ => TickOutcome::Counted {
                remaining_seconds: self.timers[key.section_index].remaining_seconds(),
            },
        }
    }

    /// The gap is never credited; remaining time is re-derived from the
    /// recorded question times.
    fn reconcile_after_drift(&mut self, gap_secs: u64) {
        warn!(
            attempt = %self.attempt().id,
            gap_secs, "clock drift detected, clamping to recorded time"
        );
        if let Some(index) = self.active_section {
            let used = self.attempt().sections[index].time_used_seconds();
            self.timers[index].reconcile(used);
        }
        self.events.push(EngineEvent::ClockDrift { gap_secs });
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    fn start_section(&mut self, index: usize, question_index: usize) {
        self.store.begin_section(index, Utc::now());
        let section = &self.attempt().sections[index];
        let timer = SectionTimer::new(section.duration_seconds, section.time_used_seconds());
        info!(
            attempt = %self.attempt().id,
            section = index,
            name = %section.name,
            remaining = timer.remaining_seconds(),
            "section started"
        );
        self.timers[index] = timer;
        self.active_section = Some(index);
        self.active_question = question_index;
        self.store.set_cursor(self.current_key());
        self.clock.resume();
        self.events.push(EngineEvent::SectionStarted { index });
        self.events
            .push(EngineEvent::FlushRequested(FlushReason::SectionStart));

        if self.attempt().sections[index].questions.is_empty() {
            info!(section = index, "section has no questions, skipping");
            self.end_active_section(EndTrigger::Empty);
        } else if self.timers[index].start() == TimerSignal::Expired {
            info!(section = index, "section has no time left, expiring");
            self.time_expired();
        }
    }

    fn end_active_section(&mut self, trigger: EndTrigger) {
        let Some(index) = self.active_section.take() else {
            return;
        };
        self.timers[index].stop();
        self.store.complete_section(index, Utc::now());
        self.store.set_cursor(None);
        info!(
            attempt = %self.attempt().id,
            section = index,
            %trigger,
            "section ended"
        );
        self.events
            .push(EngineEvent::SectionEnded { index, trigger });
        self.events
            .push(EngineEvent::FlushRequested(FlushReason::SectionEnd));

        match trigger {
            EndTrigger::Submit | EndTrigger::Cancel => {}
            EndTrigger::Manual | EndTrigger::TimeExpired | EndTrigger::Empty => {
                let next = index + 1;
                if next < self.timers.len() {
                    self.start_section(next, 0);
                } else if trigger == EndTrigger::TimeExpired {
                    self.request_submission(SubmitTrigger::AutoTimeout);
                } else {
                    self.request_submission(SubmitTrigger::Manual);
                }
            }
        }
    }

    fn request_submission(&mut self, trigger: SubmitTrigger) {
        if self.pending_submission.is_some() {
            return;
        }
        info!(attempt = %self.attempt().id, %trigger, "submission requested");
        self.pending_submission = Some(trigger);
        self.events.push(EngineEvent::SubmissionRequested(trigger));
    }

    // -----------------------------------------------------------------------
    // Submission support
    // -----------------------------------------------------------------------

    /// Stop the clock and every timer.
    pub fn stop_clock(&mut self) {
        self.clock.stop();
        for timer in &mut self.timers {
            timer.stop();
        }
    }

    /// The finalized answer set for the grading boundary.
    pub fn submit_request(&self, trigger: SubmitTrigger) -> SubmitRequest {
        SubmitRequest {
            attempt_id: self.attempt().id.clone(),
            trigger,
            total_time_used_seconds: self.attempt().total_time_used_seconds,
            answers: self.store.all_question_updates(),
        }
    }

    /// Record a successful grading. Allowed from in-progress and expired.
    pub fn complete(&mut self, stats: OverallStats) -> Result<()> {
        match self.status() {
            AttemptStatus::InProgress | AttemptStatus::Expired => {}
            other => {
                return Err(EngineError::stale(format!(
                    "attempt {} is {other}",
                    self.attempt().id
                )))
            }
        }
        self.active_section = None;
        self.pending_submission = None;
        self.store.set_overall_stats(stats);
        self.store.set_status(AttemptStatus::Completed);
        info!(attempt = %self.attempt().id, "attempt completed");
        Ok(())
    }

    /// Record a failed grading. A timed-out attempt becomes `Expired`;
    /// either way the submission stays pending and can be retried.
    pub fn submission_failed(&mut self, trigger: SubmitTrigger) {
        if trigger == SubmitTrigger::AutoTimeout && self.status() == AttemptStatus::InProgress {
            self.store.set_status(AttemptStatus::Expired);
        }
        self.pending_submission.get_or_insert(trigger);
        warn!(
            attempt = %self.attempt().id,
            status = %self.status(),
            "submission failed, answers kept for retry"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{QuestionKind, QuestionSpec, SectionSpec, TestTemplate};

    fn template(durations: &[u64], per_section: usize) -> TestTemplate {
        TestTemplate {
            id: "tmpl".into(),
            name: "Template".into(),
            family: Some("gre".into()),
            sections: durations
                .iter()
                .enumerate()
                .map(|(si, &d)| SectionSpec {
                    name: format!("Section {}", si + 1),
                    duration_seconds: d,
                    questions: (0..per_section)
                        .map(|qi| QuestionSpec {
                            id: format!("s{si}q{qi}"),
                            kind: if qi == per_section - 1 {
                                QuestionKind::Essay
                            } else {
                                QuestionKind::SingleSelect
                            },
                            options: Some(4),
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    fn started(durations: &[u64], per_section: usize) -> AttemptStateMachine {
        let attempt = Attempt::from_template("a1", "u1", &template(durations, per_section));
        let mut machine = AttemptStateMachine::from_attempt(attempt).unwrap();
        machine.begin().unwrap();
        machine.drain_events();
        machine
    }

    fn in_progress_count(machine: &AttemptStateMachine) -> usize {
        machine
            .attempt()
            .sections
            .iter()
            .filter(|s| s.status == SectionStatus::InProgress)
            .count()
    }

    #[test]
    fn begin_starts_first_section() {
        let attempt = Attempt::from_template("a1", "u1", &template(&[60, 60], 2));
        let mut machine = AttemptStateMachine::from_attempt(attempt).unwrap();
        assert_eq!(machine.status(), AttemptStatus::NotStarted);
        assert_eq!(machine.tick(Tick::Second), TickOutcome::Ignored);

        machine.begin().unwrap();
        assert_eq!(machine.status(), AttemptStatus::InProgress);
        assert_eq!(machine.active_section(), Some(0));
        assert_eq!(machine.remaining_seconds(), Some(60));
        assert!(machine.attempt().sections[0].started_at.is_some());
        assert_eq!(
            machine.drain_events(),
            vec![
                EngineEvent::SectionStarted { index: 0 },
                EngineEvent::FlushRequested(FlushReason::SectionStart),
            ]
        );
        assert!(machine.begin().is_err());
    }

    #[test]
    fn end_section_advances_with_full_budget() {
        let mut machine = started(&[1800, 1800, 1800], 3);
        machine.select_option(1).unwrap();
        machine.navigate(1).unwrap();
        machine.select_option(2).unwrap();
        machine.navigate(2).unwrap();
        machine.set_text("answer").unwrap();
        for _ in 0..10 {
            machine.tick(Tick::Second);
        }

        machine.end_section(true).unwrap();

        let sections = &machine.attempt().sections;
        assert_eq!(sections[0].status, SectionStatus::Completed);
        assert!(sections[0].ended_at.is_some());
        assert_eq!(sections[1].status, SectionStatus::InProgress);
        assert_eq!(sections[2].status, SectionStatus::NotStarted);
        assert_eq!(machine.remaining_seconds(), Some(1800));
        assert_eq!(machine.active_question(), Some(0));
        assert_eq!(in_progress_count(&machine), 1);
    }

    #[test]
    fn end_section_requires_confirmation() {
        let mut machine = started(&[60, 60], 2);
        let err = machine.end_section(false).unwrap_err();
        assert!(matches!(err, EngineError::InvalidOperation(_)));
        assert_eq!(machine.active_section(), Some(0));
    }

    #[test]
    fn end_of_last_section_requests_submission() {
        let mut machine = started(&[60], 2);
        machine.end_section(true).unwrap();
        assert_eq!(machine.pending_submission(), Some(SubmitTrigger::Manual));
        let events = machine.drain_events();
        assert!(events.contains(&EngineEvent::SubmissionRequested(SubmitTrigger::Manual)));
        assert_eq!(machine.status(), AttemptStatus::InProgress);
        assert!(machine.select_option(0).is_err());
    }

    #[test]
    fn expiry_fires_once_and_requests_auto_submission() {
        let mut machine = started(&[5], 2);
        let mut expired = 0;
        for _ in 0..8 {
            if let TickOutcome::Expired { .. } = machine.tick(Tick::Second) {
                expired += 1;
            }
        }
        assert_eq!(expired, 1);
        let requests: Vec<_> = machine
            .drain_events()
            .into_iter()
            .filter(|e| matches!(e, EngineEvent::SubmissionRequested(_)))
            .collect();
        assert_eq!(
            requests,
            vec![EngineEvent::SubmissionRequested(SubmitTrigger::AutoTimeout)]
        );
        assert_eq!(machine.attempt().sections[0].time_used_seconds(), 5);
        assert_eq!(machine.attempt().total_time_used_seconds, 5);
    }

    #[test]
    fn expiry_advances_to_next_section() {
        let mut machine = started(&[2, 30], 2);
        machine.tick(Tick::Second);
        assert_eq!(
            machine.tick(Tick::Second),
            TickOutcome::Expired { section_index: 0 }
        );
        assert_eq!(machine.active_section(), Some(1));
        assert_eq!(machine.remaining_seconds(), Some(30));
        assert!(machine.pending_submission().is_none());
    }

    #[test]
    fn ticks_accrue_only_to_current_question() {
        let mut machine = started(&[60], 3);
        machine.tick(Tick::Second);
        machine.tick(Tick::Second);
        machine.navigate(2).unwrap();
        machine.tick(Tick::Second);

        let questions = &machine.attempt().sections[0].questions;
        assert_eq!(questions[0].time_spent_seconds, 2);
        assert_eq!(questions[1].time_spent_seconds, 0);
        assert_eq!(questions[2].time_spent_seconds, 1);
        assert_eq!(machine.remaining_seconds(), Some(57));
    }

    #[test]
    fn navigate_to_same_index_is_noop() {
        let mut machine = started(&[60], 3);
        machine.navigate(0).unwrap();
        assert!(machine.drain_events().is_empty());
        machine.navigate(1).unwrap();
        assert_eq!(
            machine.drain_events(),
            vec![EngineEvent::FlushRequested(FlushReason::Navigation)]
        );
        assert_eq!(machine.attempt().cursor, Some(QuestionKey::new(0, 1)));
    }

    #[test]
    fn navigate_out_of_range_is_invalid() {
        let mut machine = started(&[60], 3);
        assert!(matches!(
            machine.navigate(3),
            Err(EngineError::InvalidOperation(_))
        ));
        assert_eq!(machine.active_question(), Some(0));
    }

    #[test]
    fn ended_section_cannot_be_revisited() {
        let mut machine = started(&[60, 60], 2);
        machine.select_option(3).unwrap();
        machine.end_section(true).unwrap();
        machine.select_option(0).unwrap();

        let first = &machine.attempt().sections[0].questions[0];
        assert_eq!(
            first.answer,
            AnswerPayload::SingleSelect {
                selected_option_index: Some(3)
            }
        );
        assert_eq!(machine.current_key(), Some(QuestionKey::new(1, 0)));
    }

    #[test]
    fn pause_drops_ticks() {
        let mut machine = started(&[60], 2);
        assert!(!machine.toggle_pause().unwrap());
        assert_eq!(machine.tick(Tick::Second), TickOutcome::Dropped);
        assert_eq!(machine.remaining_seconds(), Some(60));
        assert!(machine.toggle_pause().unwrap());
        assert_eq!(
            machine.tick(Tick::Second),
            TickOutcome::Counted {
                remaining_seconds: 59
            }
        );
    }

    #[test]
    fn drift_is_clamped_not_credited() {
        let mut machine = started(&[60], 2);
        machine.tick(Tick::Second);
        let outcome = machine.tick(Tick::Drift { gap_secs: 600 });
        assert_eq!(
            outcome,
            TickOutcome::Counted {
                remaining_seconds: 58
            }
        );
        assert!(machine
            .drain_events()
            .contains(&EngineEvent::ClockDrift { gap_secs: 600 }));
    }

    fn submission_requests(machine: &mut AttemptStateMachine) -> Vec<SubmitTrigger> {
        machine
            .drain_events()
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::SubmissionRequested(trigger) => Some(trigger),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn submit_mid_attempt_closes_every_section() {
        let mut machine = started(&[60, 60, 60], 2);
        machine.submit().unwrap();
        machine.submit().unwrap();
        let sections = &machine.attempt().sections;
        assert!(sections
            .iter()
            .all(|s| s.status == SectionStatus::Completed && s.ended_at.is_some()));
        assert!(sections[1].started_at.is_none());
        assert_eq!(machine.active_section(), None);
        assert!(machine.store().has_pending());
        assert_eq!(submission_requests(&mut machine), vec![SubmitTrigger::Manual]);
    }

    #[test]
    fn submit_again_re_requests_pending_submission() {
        let mut machine = started(&[60, 60], 2);
        machine.submit().unwrap();
        assert_eq!(submission_requests(&mut machine), vec![SubmitTrigger::Manual]);

        // Grading failed once; a second submit drives it again.
        machine.submission_failed(SubmitTrigger::Manual);
        machine.submit().unwrap();
        assert_eq!(submission_requests(&mut machine), vec![SubmitTrigger::Manual]);
    }

    #[test]
    fn submit_on_expired_attempt_keeps_auto_trigger() {
        let mut machine = started(&[1], 1);
        machine.tick(Tick::Second);
        machine.drain_events();
        machine.stop_clock();
        machine.submission_failed(SubmitTrigger::AutoTimeout);
        assert_eq!(machine.status(), AttemptStatus::Expired);

        machine.submit().unwrap();
        assert_eq!(
            submission_requests(&mut machine),
            vec![SubmitTrigger::AutoTimeout]
        );
    }

    #[test]
    fn resume_after_submit_requests_submission_again() {
        let mut machine = started(&[60, 60], 2);
        machine.select_option(1).unwrap();
        machine.submit().unwrap();
        let persisted = machine.into_attempt();

        let mut machine = AttemptStateMachine::from_attempt(persisted).unwrap();
        assert_eq!(machine.active_section(), None);
        assert_eq!(machine.pending_submission(), Some(SubmitTrigger::Manual));
        assert_eq!(submission_requests(&mut machine), vec![SubmitTrigger::Manual]);
    }

    #[test]
    fn empty_section_is_skipped_on_entry() {
        let mut tmpl = template(&[3, 30], 2);
        tmpl.sections[0].questions.clear();
        let attempt = Attempt::from_template("a1", "u1", &tmpl);
        let mut machine = AttemptStateMachine::from_attempt(attempt).unwrap();
        machine.begin().unwrap();

        assert_eq!(
            machine.attempt().sections[0].status,
            SectionStatus::Completed
        );
        assert_eq!(machine.active_section(), Some(1));
        assert!(machine.drain_events().contains(&EngineEvent::SectionEnded {
            index: 0,
            trigger: EndTrigger::Empty
        }));
        assert_eq!(
            machine.tick(Tick::Second),
            TickOutcome::Counted {
                remaining_seconds: 29
            }
        );
    }

    #[test]
    fn only_empty_sections_request_submission() {
        let mut tmpl = template(&[3], 1);
        tmpl.sections[0].questions.clear();
        let attempt = Attempt::from_template("a1", "u1", &tmpl);
        let mut machine = AttemptStateMachine::from_attempt(attempt).unwrap();
        machine.begin().unwrap();

        assert_eq!(machine.active_section(), None);
        assert_eq!(machine.pending_submission(), Some(SubmitTrigger::Manual));
        assert_eq!(machine.tick(Tick::Second), TickOutcome::Ignored);
    }

    #[test]
    fn complete_freezes_attempt() {
        let mut machine = started(&[60], 2);
        machine.submit().unwrap();
        machine.stop_clock();
        let stats = OverallStats {
            correct: 1,
            incorrect: 0,
            skipped: 1,
            raw_score: 1.0,
            band_score: None,
        };
        machine.complete(stats.clone()).unwrap();
        assert_eq!(machine.status(), AttemptStatus::Completed);

        assert!(matches!(
            machine.answer(AnswerPayload::SingleSelect {
                selected_option_index: Some(0)
            }),
            Err(EngineError::StaleAttemptState { .. })
        ));
        assert_eq!(machine.tick(Tick::Second), TickOutcome::Ignored);
        assert_eq!(machine.attempt().overall_stats, Some(stats));
        assert!(machine.cancel().is_err());
        assert!(machine.submit().is_err());
    }

    #[test]
    fn failed_auto_submission_expires() {
        let mut machine = started(&[1], 1);
        machine.tick(Tick::Second);
        machine.stop_clock();
        machine.submission_failed(SubmitTrigger::AutoTimeout);
        assert_eq!(machine.status(), AttemptStatus::Expired);
        assert_eq!(
            machine.pending_submission(),
            Some(SubmitTrigger::AutoTimeout)
        );
        assert!(machine.set_text("late").is_err());
    }

    #[test]
    fn resume_derives_remaining_from_question_times() {
        let mut attempt = Attempt::from_template("a1", "u1", &template(&[600, 600], 3));
        attempt.status = AttemptStatus::InProgress;
        attempt.sections[0].status = SectionStatus::Completed;
        attempt.sections[1].status = SectionStatus::InProgress;
        attempt.sections[1].questions[0].time_spent_seconds = 100;
        attempt.sections[1].questions[2].time_spent_seconds = 50;
        attempt.cursor = Some(QuestionKey::new(1, 2));

        let machine = AttemptStateMachine::from_attempt(attempt).unwrap();
        assert_eq!(machine.active_section(), Some(1));
        assert_eq!(machine.active_question(), Some(2));
        assert_eq!(machine.remaining_seconds(), Some(450));
    }

    #[test]
    fn resume_of_exhausted_section_expires_immediately() {
        let mut attempt = Attempt::from_template("a1", "u1", &template(&[100], 2));
        attempt.status = AttemptStatus::InProgress;
        attempt.sections[0].status = SectionStatus::InProgress;
        attempt.sections[0].questions[0].time_spent_seconds = 100;

        let mut machine = AttemptStateMachine::from_attempt(attempt).unwrap();
        assert_eq!(machine.active_section(), None);
        assert_eq!(
            machine.attempt().sections[0].status,
            SectionStatus::Completed
        );
        assert_eq!(
            machine.pending_submission(),
            Some(SubmitTrigger::AutoTimeout)
        );
        assert!(machine
            .drain_events()
            .contains(&EngineEvent::SectionEnded {
                index: 0,
                trigger: EndTrigger::TimeExpired
            }));
    }

    #[test]
    fn resume_rejects_two_active_sections() {
        let mut attempt = Attempt::from_template("a1", "u1", &template(&[100, 100], 2));
        attempt.status = AttemptStatus::InProgress;
        attempt.sections[0].status = SectionStatus::InProgress;
        attempt.sections[1].status = SectionStatus::InProgress;
        assert!(AttemptStateMachine::from_attempt(attempt).is_err());
    }

    #[test]
    fn palette_reflects_active_section() {
        let mut machine = started(&[60], 3);
        machine.select_option(0).unwrap();
        machine.navigate(1).unwrap();
        machine.toggle_review().unwrap();

        let palette = machine.palette();
        assert_eq!(palette.len(), 3);
        assert!(palette[0].answered && !palette[0].current);
        assert!(palette[1].marked && palette[1].current && !palette[1].answered);
        assert!(!palette[2].answered && !palette[2].marked);
    }

    #[test]
    fn cancel_freezes_without_grading() {
        let mut machine = started(&[60, 60], 2);
        machine.cancel().unwrap();
        assert_eq!(machine.status(), AttemptStatus::Cancelled);
        assert_eq!(
            machine.attempt().sections[0].status,
            SectionStatus::Completed
        );
        assert!(machine.pending_submission().is_none());
        assert!(machine.submit().is_err());
    }
}
