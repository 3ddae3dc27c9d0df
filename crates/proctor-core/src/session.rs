//! Async attempt session.
//!
//! Wraps the synchronous state machine with the two boundaries: every intent
//! is applied to in-memory state first, then the events it produced are
//! drained in order (flushes coalesced, submission last).
//!
//! Failures of background flushes (section start/end, navigation, periodic) are
//! reported to the observer and left for the next flush to retry. Manual
//! flushes and submissions return their errors to the caller.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{BoxStream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::clock::Tick;
use crate::error::{EngineError, Result};
use crate::machine::{AttemptStateMachine, EndTrigger, EngineEvent, PaletteEntry, TickOutcome};
use crate::model::{AnswerPayload, Attempt, AttemptStatus, OverallStats};
use crate::submission::SubmissionCoordinator;
use crate::sync::{ProgressSync, RetryPolicy};
use crate::traits::{AttemptStore, FlushReason, Grader, SaveAck};

/// Configuration for an attempt session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Flush after this many counted ticks.
    pub flush_interval_ticks: u64,
    /// Tick period of the interval tick source.
    pub tick_period: Duration,
    /// Gap between ticks above which a tick is reported as drift.
    pub drift_threshold: Duration,
    /// Retries for background flushes and grading.
    pub retry: RetryPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            flush_interval_ticks: 15,
            tick_period: Duration::from_secs(1),
            drift_threshold: Duration::from_secs(3),
            retry: RetryPolicy::default(),
        }
    }
}

/// Progress callbacks for a session.
pub trait SessionObserver: Send + Sync {
    fn on_section_started(&self, index: usize, name: &str, remaining_seconds: u64);
    fn on_section_ended(&self, index: usize, trigger: EndTrigger);
    fn on_flush(&self, reason: FlushReason, ack: &SaveAck);
    fn on_flush_error(&self, reason: FlushReason, error: &EngineError);
    /// A tick arrived after a gap; `drift` is [`EngineError::ClockDrift`].
    fn on_drift(&self, drift: &EngineError);
    fn on_submitted(&self, stats: &OverallStats);
    fn on_submission_error(&self, error: &EngineError);
}

/// No-op observer.
pub struct NoopObserver;

impl SessionObserver for NoopObserver {
    fn on_section_started(&self, _: usize, _: &str, _: u64) {}
    fn on_section_ended(&self, _: usize, _: EndTrigger) {}
    fn on_flush(&self, _: FlushReason, _: &SaveAck) {}
    fn on_flush_error(&self, _: FlushReason, _: &EngineError) {}
    fn on_drift(&self, _: &EngineError) {}
    fn on_submitted(&self, _: &OverallStats) {}
    fn on_submission_error(&self, _: &EngineError) {}
}

/// A learner intent, as delivered over a channel to [`AttemptSession::run`].
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    Answer(AnswerPayload),
    SelectOption(u32),
    SetText(String),
    ClearAnswer,
    ToggleReview,
    Navigate(usize),
    EndSection { confirmed: bool },
    TogglePause,
    Flush,
    Submit,
    RetrySubmission,
    Cancel,
}

pub struct AttemptSession {
    machine: AttemptStateMachine,
    sync: ProgressSync,
    submission: SubmissionCoordinator,
    config: SessionConfig,
    observer: Arc<dyn SessionObserver>,
    ticks_since_flush: u64,
}

impl AttemptSession {
    /// Create or resume the learner's attempt for a template and start it.
    pub async fn start(
        store: Arc<dyn AttemptStore>,
        grader: Arc<dyn Grader>,
        template_id: &str,
        config: SessionConfig,
        observer: Arc<dyn SessionObserver>,
    ) -> Result<Self> {
        let mut sync = ProgressSync::new(store, config.retry.clone());
        let attempt = sync.start_or_resume(template_id).await?;
        Self::open(attempt, sync, grader, config, observer).await
    }

    /// Reopen an existing attempt by id.
    pub async fn resume(
        store: Arc<dyn AttemptStore>,
        grader: Arc<dyn Grader>,
        attempt_id: &str,
        config: SessionConfig,
        observer: Arc<dyn SessionObserver>,
    ) -> Result<Self> {
        let mut sync = ProgressSync::new(store, config.retry.clone());
        let attempt = sync.load_attempt(attempt_id).await?;
        Self::open(attempt, sync, grader, config, observer).await
    }

    async fn open(
        attempt: Attempt,
        sync: ProgressSync,
        grader: Arc<dyn Grader>,
        config: SessionConfig,
        observer: Arc<dyn SessionObserver>,
    ) -> Result<Self> {
        info!(
            attempt = %attempt.id,
            status = %attempt.status,
            backend = sync.store().name(),
            "opening attempt"
        );
        let mut machine = AttemptStateMachine::from_attempt(attempt)?;
        if machine.status() == AttemptStatus::NotStarted {
            machine.begin()?;
        }
        let submission = SubmissionCoordinator::new(grader, config.retry.clone());
        let mut session = Self {
            machine,
            sync,
            submission,
            config,
            observer,
            ticks_since_flush: 0,
        };
        // Resuming may have ended a section on the spot; a failed auto
        // submission here is retried through `retry_submission`.
        if let Err(e) = session.process_events().await {
            warn!("submission on resume failed: {e}");
        }
        Ok(session)
    }

    pub fn machine(&self) -> &AttemptStateMachine {
        &self.machine
    }

    pub fn attempt(&self) -> &Attempt {
        self.machine.attempt()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn palette(&self) -> Vec<PaletteEntry> {
        self.machine.palette()
    }

    pub fn into_attempt(self) -> Attempt {
        self.machine.into_attempt()
    }

    // -----------------------------------------------------------------------
    // Intents
    // -----------------------------------------------------------------------

    pub async fn answer(&mut self, payload: AnswerPayload) -> Result<()> {
        self.machine.answer(payload)?;
        self.process_events().await
    }

    pub async fn select_option(&mut self, option_index: u32) -> Result<()> {
        self.machine.select_option(option_index)?;
        self.process_events().await
    }

    pub async fn set_text(&mut self, text: impl Into<String>) -> Result<()> {
        self.machine.set_text(text)?;
        self.process_events().await
    }

    pub async fn clear_answer(&mut self) -> Result<()> {
        self.machine.clear_answer()?;
        self.process_events().await
    }

    pub async fn toggle_review(&mut self) -> Result<bool> {
        let marked = self.machine.toggle_review()?;
        self.process_events().await?;
        Ok(marked)
    }

    pub async fn navigate(&mut self, question_index: usize) -> Result<()> {
        self.machine.navigate(question_index)?;
        self.process_events().await
    }

    pub async fn end_section(&mut self, confirmed: bool) -> Result<()> {
        self.machine.end_section(confirmed)?;
        self.process_events().await
    }

    pub async fn toggle_pause(&mut self) -> Result<bool> {
        let running = self.machine.toggle_pause()?;
        self.process_events().await?;
        Ok(running)
    }

    /// Manual save. Errors are returned to the caller.
    pub async fn flush(&mut self) -> Result<Option<SaveAck>> {
        let ack = self.sync.flush(&mut self.machine, FlushReason::Manual).await?;
        if let Some(ack) = &ack {
            self.observer.on_flush(FlushReason::Manual, ack);
        }
        self.ticks_since_flush = 0;
        Ok(ack)
    }

    pub async fn submit(&mut self) -> Result<()> {
        self.machine.submit()?;
        self.process_events().await
    }

    /// Retry a submission that failed earlier (attempt in progress or expired).
    pub async fn retry_submission(&mut self) -> Result<()> {
        if self.machine.pending_submission().is_none() {
            return Err(EngineError::invalid("no submission is pending"));
        }
        self.finalize().await
    }

    pub async fn cancel(&mut self) -> Result<()> {
        self.machine.cancel()?;
        self.process_events().await
    }

    /// Feed one tick. Never fails; background errors go to the observer.
    pub async fn tick(&mut self, tick: Tick) -> TickOutcome {
        let outcome = self.machine.tick(tick);
        if matches!(
            outcome,
            TickOutcome::Counted { .. } | TickOutcome::Expired { .. }
        ) {
            self.ticks_since_flush += 1;
        }
        let mut periodic = false;
        if self.ticks_since_flush >= self.config.flush_interval_ticks {
            periodic = true;
            self.ticks_since_flush = 0;
        }
        if let Err(e) = self.process_events().await {
            debug!("tick-driven submission failed: {e}");
        }
        if periodic && self.machine.status() == AttemptStatus::InProgress {
            self.background_flush(FlushReason::Periodic).await;
        }
        outcome
    }

    /// Apply one intent.
    pub async fn apply(&mut self, intent: Intent) -> Result<()> {
        match intent {
            Intent::Answer(payload) => self.answer(payload).await,
            Intent::SelectOption(index) => self.select_option(index).await,
            Intent::SetText(text) => self.set_text(text).await,
            Intent::ClearAnswer => self.clear_answer().await,
            Intent::ToggleReview => self.toggle_review().await.map(|_| ()),
            Intent::Navigate(index) => self.navigate(index).await,
            Intent::EndSection { confirmed } => self.end_section(confirmed).await,
            Intent::TogglePause => self.toggle_pause().await.map(|_| ()),
            Intent::Flush => self.flush().await.map(|_| ()),
            Intent::Submit => self.submit().await,
            Intent::RetrySubmission => self.retry_submission().await,
            Intent::Cancel => self.cancel().await,
        }
    }

    /// Drive the session from an intent channel and a tick stream until the
    /// attempt is finalized or both inputs are exhausted.
    ///
    /// Intents take priority over ticks that are ready at the same time.
    pub async fn run(
        mut self,
        mut intents: mpsc::Receiver<Intent>,
        mut ticks: BoxStream<'static, Tick>,
    ) -> Result<Attempt> {
        let mut intents_open = true;
        let mut ticks_open = true;
        while (intents_open || ticks_open) && !self.machine.status().is_terminal() {
            tokio::select! {
                biased;
                intent = intents.recv(), if intents_open => match intent {
                    Some(intent) => {
                        if let Err(e) = self.apply(intent.clone()).await {
                            warn!(?intent, "intent rejected: {e}");
                        }
                    }
                    None => intents_open = false,
                },
                tick = ticks.next(), if ticks_open => match tick {
                    Some(tick) => {
                        self.tick(tick).await;
                    }
                    None => ticks_open = false,
                },
            }
        }
        if !self.machine.status().is_terminal() {
            self.background_flush(FlushReason::Manual).await;
        }
        Ok(self.into_attempt())
    }

    // -----------------------------------------------------------------------
    // Event processing
    // -----------------------------------------------------------------------

    async fn process_events(&mut self) -> Result<()> {
        let events = self.machine.drain_events();
        let mut flush_reason = None;
        let mut submit = false;

        for event in events {
            match event {
                EngineEvent::SectionStarted { index } => {
                    let name = self.machine.attempt().sections[index].name.clone();
                    let remaining = self.machine.timer(index).map_or(0, |t| t.remaining_seconds());
                    self.observer.on_section_started(index, &name, remaining);
                }
                EngineEvent::SectionEnded { index, trigger } => {
                    self.observer.on_section_ended(index, trigger);
                }
                EngineEvent::FlushRequested(reason) => {
                    // Section-end wins when several flushes coalesce.
                    flush_reason = match (flush_reason, reason) {
                        (Some(FlushReason::SectionEnd), _) => Some(FlushReason::SectionEnd),
                        _ => Some(reason),
                    };
                }
                EngineEvent::ClockDrift { gap_secs } => {
                    self.observer.on_drift(&EngineError::ClockDrift { gap_secs });
                }
                EngineEvent::SubmissionRequested(_) => submit = true,
            }
        }

        if submit {
            // The coordinator flushes before grading.
            return self.finalize().await;
        }
        if let Some(reason) = flush_reason {
            self.background_flush(reason).await;
        }
        Ok(())
    }

    async fn background_flush(&mut self, reason: FlushReason) {
        match self.sync.flush(&mut self.machine, reason).await {
            Ok(Some(ack)) => {
                self.ticks_since_flush = 0;
                self.observer.on_flush(reason, &ack);
            }
            Ok(None) => {}
            Err(e) => self.observer.on_flush_error(reason, &e),
        }
    }

    async fn finalize(&mut self) -> Result<()> {
        match self
            .submission
            .finalize(&mut self.machine, &mut self.sync)
            .await
        {
            Ok(Some(stats)) => {
                self.observer.on_submitted(&stats);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                self.observer.on_submission_error(&e);
                Err(e)
            }
        }
    }
}
