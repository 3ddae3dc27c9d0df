//! Progress sync: turns the answer store's dirty set into sequenced batches
//! for the persistence boundary.
//!
//! Flushes never overlap: `flush` takes `&mut self`, and the session awaits
//! each one before handling the next intent. A failed flush keeps the dirty
//! set intact so the next flush resends it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{BackendError, EngineError, Result};
use crate::machine::AttemptStateMachine;
use crate::model::{Attempt, AttemptStatus, QuestionKey};
use crate::traits::{AttemptStore, FlushReason, ProgressBatch, SaveAck};

/// Retry behaviour for boundary calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first try.
    pub max_retries: u32,
    /// Delay before the first retry; doubled on each retry.
    pub retry_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// No retries, for manual paths that report straight back to the learner.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Run `op` until it succeeds, fails permanently, or retries run out.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut delay = self.retry_delay;
        let mut last_error = None;
        for retry in 0..=self.max_retries {
            if retry > 0 {
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(self.max_delay);
            }
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if let Some(ms) = e
                        .downcast_ref::<BackendError>()
                        .and_then(BackendError::retry_after_ms)
                    {
                        delay = Duration::from_millis(ms).min(self.max_delay);
                    }
                    let err = EngineError::from_boundary(e);
                    if !err.is_retryable() {
                        return Err(err);
                    }
                    warn!(retry, "{what} failed: {err}");
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| EngineError::PersistenceFailure {
            message: format!("{what} failed"),
            retryable: true,
        }))
    }
}

/// Batches the dirty set and hands it to an [`AttemptStore`].
pub struct ProgressSync {
    store: Arc<dyn AttemptStore>,
    policy: RetryPolicy,
    next_sequence: u64,
    last_sent: Option<(AttemptStatus, Option<QuestionKey>)>,
    failed_flushes: u32,
}

impl ProgressSync {
    pub fn new(store: Arc<dyn AttemptStore>, policy: RetryPolicy) -> Self {
        Self {
            store,
            policy,
            next_sequence: 1,
            last_sent: None,
            failed_flushes: 0,
        }
    }

    pub fn store(&self) -> &Arc<dyn AttemptStore> {
        &self.store
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Flushes that gave up since the last successful one.
    pub fn failed_flushes(&self) -> u32 {
        self.failed_flushes
    }

    /// Load (or create) the learner's attempt. Later batches continue the
    /// attempt's persisted sequence.
    pub async fn start_or_resume(&mut self, template_id: &str) -> Result<Attempt> {
        let store = Arc::clone(&self.store);
        let attempt = self
            .policy
            .run("start attempt", || store.start_or_resume_attempt(template_id))
            .await?;
        self.next_sequence = attempt.progress_sequence + 1;
        Ok(attempt)
    }

    pub async fn load_attempt(&mut self, attempt_id: &str) -> Result<Attempt> {
        let store = Arc::clone(&self.store);
        let attempt = self
            .policy
            .run("load attempt", || store.load_attempt_detail(attempt_id))
            .await?;
        self.next_sequence = attempt.progress_sequence + 1;
        Ok(attempt)
    }

    /// Send everything not yet acknowledged.
    ///
    /// Returns `Ok(None)` when there was nothing to send. Manual flushes are
    /// always sent so the learner gets a definite answer.
    pub async fn flush(
        &mut self,
        machine: &mut AttemptStateMachine,
        reason: FlushReason,
    ) -> Result<Option<SaveAck>> {
        let attempt = machine.attempt();
        let header = (attempt.status, attempt.cursor);
        if reason != FlushReason::Manual
            && !machine.store().has_pending()
            && self.last_sent == Some(header)
        {
            return Ok(None);
        }

        let answers = machine.store();
        let pending = answers.pending();
        let batch = ProgressBatch {
            attempt_id: attempt.id.clone(),
            sequence: self.next_sequence,
            reason,
            status: attempt.status,
            cursor: attempt.cursor,
            total_time_used_seconds: attempt.total_time_used_seconds,
            questions: pending
                .questions
                .iter()
                .filter_map(|(key, _)| answers.question_update(*key))
                .collect(),
            sections: pending
                .sections
                .iter()
                .filter_map(|(index, _)| answers.section_update(*index))
                .collect(),
        };
        self.next_sequence += 1;

        debug!(
            attempt = %batch.attempt_id,
            sequence = batch.sequence,
            %reason,
            questions = batch.questions.len(),
            sections = batch.sections.len(),
            "flushing progress"
        );

        let store = Arc::clone(&self.store);
        let result = self
            .policy
            .run("save progress", || store.save_progress(&batch))
            .await;

        match result {
            Ok(ack) => {
                if !ack.applied {
                    warn!(
                        sequence = ack.sequence,
                        %reason,
                        "batch discarded by store as stale, not resent"
                    );
                }
                machine.store_mut().acknowledge(&pending);
                self.last_sent = Some(header);
                self.failed_flushes = 0;
                Ok(Some(ack))
            }
            Err(e) => {
                self.failed_flushes += 1;
                warn!(
                    sequence = batch.sequence,
                    %reason,
                    "flush failed, changes kept for the next flush: {e}"
                );
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::clock::Tick;
    use crate::model::{QuestionKind, QuestionSpec, SectionSpec, TestTemplate};

    /// Store that fails the first `fail_first` saves and records the rest.
    struct RecordingStore {
        fail_first: AtomicU32,
        permanent: bool,
        applied: AtomicBool,
        calls: AtomicU32,
        batches: Mutex<Vec<ProgressBatch>>,
    }

    impl RecordingStore {
        fn new(fail_first: u32, permanent: bool) -> Self {
            Self {
                fail_first: AtomicU32::new(fail_first),
                permanent,
                applied: AtomicBool::new(true),
                calls: AtomicU32::new(0),
                batches: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AttemptStore for RecordingStore {
        fn name(&self) -> &str {
            "recording"
        }

        async fn start_or_resume_attempt(&self, template_id: &str) -> anyhow::Result<Attempt> {
            Err(BackendError::NotFound(template_id.to_string()).into())
        }

        async fn load_attempt_detail(&self, attempt_id: &str) -> anyhow::Result<Attempt> {
            Err(BackendError::NotFound(attempt_id.to_string()).into())
        }

        async fn save_progress(&self, batch: &ProgressBatch) -> anyhow::Result<SaveAck> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(if self.permanent {
                    BackendError::Conflict("attempt finalized".into()).into()
                } else {
                    BackendError::NetworkError("connection reset".into()).into()
                });
            }
            self.batches.lock().unwrap().push(batch.clone());
            Ok(SaveAck {
                sequence: batch.sequence,
                applied: self.applied.load(Ordering::SeqCst),
            })
        }
    }

    fn machine() -> AttemptStateMachine {
        let template = TestTemplate {
            id: "t".into(),
            name: "T".into(),
            family: None,
            sections: vec![SectionSpec {
                name: "Quant".into(),
                duration_seconds: 120,
                questions: (0..3)
                    .map(|i| QuestionSpec {
                        id: format!("q{i}"),
                        kind: QuestionKind::SingleSelect,
                        options: Some(4),
                    })
                    .collect(),
            }],
        };
        let mut machine =
            AttemptStateMachine::from_attempt(Attempt::from_template("a1", "u1", &template))
                .unwrap();
        machine.begin().unwrap();
        machine
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            retry_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn flush_sends_only_dirty_questions() {
        let store = Arc::new(RecordingStore::new(0, false));
        let mut sync = ProgressSync::new(store.clone(), fast_policy(0));
        let mut machine = machine();

        sync.flush(&mut machine, FlushReason::Manual).await.unwrap();
        machine.navigate(2).unwrap();
        machine.select_option(1).unwrap();
        sync.flush(&mut machine, FlushReason::Navigation)
            .await
            .unwrap();

        let batches = store.batches.lock().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].sequence, 1);
        assert_eq!(batches[0].sections.len(), 1);
        assert_eq!(batches[1].sequence, 2);
        assert!(batches[1].sections.is_empty());
        assert_eq!(batches[1].questions.len(), 1);
        assert_eq!(batches[1].questions[0].key(), QuestionKey::new(0, 2));
        assert_eq!(batches[1].cursor, Some(QuestionKey::new(0, 2)));
        assert!(!machine.store().has_pending());
    }

    #[tokio::test]
    async fn discarded_batch_is_acknowledged_not_resent() {
        let store = Arc::new(RecordingStore::new(0, false));
        store.applied.store(false, Ordering::SeqCst);
        let mut sync = ProgressSync::new(store.clone(), fast_policy(0));
        let mut machine = machine();
        machine.select_option(2).unwrap();

        let ack = sync
            .flush(&mut machine, FlushReason::Navigation)
            .await
            .unwrap()
            .unwrap();
        assert!(!ack.applied);
        assert_eq!(ack.sequence, 1);
        assert!(!machine.store().has_pending());

        // Nothing is queued again for the next background flush.
        let next = sync.flush(&mut machine, FlushReason::Periodic).await.unwrap();
        assert!(next.is_none());
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn periodic_flush_skips_when_clean() {
        let store = Arc::new(RecordingStore::new(0, false));
        let mut sync = ProgressSync::new(store.clone(), fast_policy(0));
        let mut machine = machine();

        sync.flush(&mut machine, FlushReason::Periodic).await.unwrap();
        let ack = sync.flush(&mut machine, FlushReason::Periodic).await.unwrap();
        assert!(ack.is_none());
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);

        machine.tick(Tick::Second);
        let ack = sync.flush(&mut machine, FlushReason::Periodic).await.unwrap();
        assert_eq!(ack.map(|a| a.sequence), Some(2));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let store = Arc::new(RecordingStore::new(2, false));
        let mut sync = ProgressSync::new(store.clone(), fast_policy(3));
        let mut machine = machine();
        machine.select_option(3).unwrap();

        let ack = sync
            .flush(&mut machine, FlushReason::Manual)
            .await
            .unwrap()
            .unwrap();
        assert!(ack.applied);
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
        assert_eq!(sync.failed_flushes(), 0);
    }

    #[tokio::test]
    async fn failed_flush_keeps_changes_for_next_flush() {
        let store = Arc::new(RecordingStore::new(1, false));
        let mut sync = ProgressSync::new(store.clone(), fast_policy(0));
        let mut machine = machine();
        machine.select_option(2).unwrap();

        let err = sync
            .flush(&mut machine, FlushReason::Navigation)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(sync.failed_flushes(), 1);
        assert!(machine.store().has_pending());

        sync.flush(&mut machine, FlushReason::Periodic).await.unwrap();
        let batches = store.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].sequence, 2);
        assert!(batches[0]
            .questions
            .iter()
            .any(|q| q.key() == QuestionKey::new(0, 0) && q.is_answered));
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let store = Arc::new(RecordingStore::new(5, true));
        let mut sync = ProgressSync::new(store.clone(), fast_policy(3));
        let mut machine = machine();

        let err = sync
            .flush(&mut machine, FlushReason::Manual)
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn load_maps_not_found() {
        let store = Arc::new(RecordingStore::new(0, false));
        let mut sync = ProgressSync::new(store, fast_policy(2));
        let err = sync.load_attempt("missing").await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }
}
