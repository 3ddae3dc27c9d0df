//! In-memory backend.
//!
//! Serves attempts for a set of loaded templates, grades single-select
//! questions against the template's answer keys, and can persist its state
//! to a JSON file between runs. Failure injection and call counters make it
//! the backend of choice for tests and scripted replays.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use proctor_core::model::{
    AnswerPayload, Attempt, AttemptStatus, OverallStats, QuestionContent,
};
use proctor_core::parser::TemplateBundle;
use proctor_core::traits::{
    AttemptStore, Grader, ProgressBatch, QuestionBank, SaveAck, SubmitRequest, SubmitResponse,
};

use crate::error::BackendError;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredAttempt {
    attempt: Attempt,
    last_sequence: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MemoryState {
    attempts: BTreeMap<String, StoredAttempt>,
}

/// Backend keeping attempts in process memory.
pub struct MemoryBackend {
    user_id: String,
    templates: HashMap<String, TemplateBundle>,
    state: Mutex<MemoryState>,
    state_file: Option<PathBuf>,
    fail_saves: AtomicU32,
    fail_submits: AtomicU32,
    save_calls: AtomicU32,
    submit_calls: AtomicU32,
    last_batch: Mutex<Option<ProgressBatch>>,
}

impl MemoryBackend {
    pub fn new(user_id: &str, templates: Vec<TemplateBundle>) -> Self {
        Self {
            user_id: user_id.to_string(),
            templates: templates
                .into_iter()
                .map(|b| (b.template.id.clone(), b))
                .collect(),
            state: Mutex::new(MemoryState::default()),
            state_file: None,
            fail_saves: AtomicU32::new(0),
            fail_submits: AtomicU32::new(0),
            save_calls: AtomicU32::new(0),
            submit_calls: AtomicU32::new(0),
            last_batch: Mutex::new(None),
        }
    }

    /// Load previous state from `path` if it exists, and write back to it
    /// after every change.
    pub fn with_state_file(mut self, path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read state file: {}", path.display()))?;
            let state: MemoryState = serde_json::from_str(&content)
                .with_context(|| format!("failed to parse state file: {}", path.display()))?;
            self.state = Mutex::new(state);
        }
        self.state_file = Some(path.to_path_buf());
        Ok(self)
    }

    pub fn add_template(&mut self, bundle: TemplateBundle) {
        self.templates.insert(bundle.template.id.clone(), bundle);
    }

    /// Seed an attempt directly, e.g. to test resume.
    pub fn insert_attempt(&self, attempt: Attempt) {
        let mut state = self.lock_state();
        state.attempts.insert(
            attempt.id.clone(),
            StoredAttempt {
                last_sequence: attempt.progress_sequence,
                attempt,
            },
        );
    }

    /// The stored copy of an attempt, without joined content.
    pub fn snapshot(&self, attempt_id: &str) -> Option<Attempt> {
        self.lock_state()
            .attempts
            .get(attempt_id)
            .map(|s| s.attempt.clone())
    }

    pub fn attempt_ids(&self) -> Vec<String> {
        self.lock_state().attempts.keys().cloned().collect()
    }

    /// Make the next `n` saves fail with a network error.
    pub fn fail_next_saves(&self, n: u32) {
        self.fail_saves.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` submissions fail with a network error.
    pub fn fail_next_submits(&self, n: u32) {
        self.fail_submits.store(n, Ordering::SeqCst);
    }

    pub fn save_calls(&self) -> u32 {
        self.save_calls.load(Ordering::SeqCst)
    }

    pub fn submit_calls(&self) -> u32 {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn last_batch(&self) -> Option<ProgressBatch> {
        self.last_batch
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn persist(&self, state: &MemoryState) -> Result<()> {
        let Some(path) = &self.state_file else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(state).context("failed to serialize state")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)
            .with_context(|| format!("failed to write state to {}", path.display()))?;
        Ok(())
    }

    fn content(&self, template_id: &str, question_id: &str) -> Option<&QuestionContent> {
        self.templates
            .get(template_id)
            .and_then(|b| b.question(question_id))
    }

    /// Join question content into a copy of the attempt, without answer keys.
    fn with_content(&self, mut attempt: Attempt) -> Attempt {
        for section in &mut attempt.sections {
            for question in &mut section.questions {
                if let Some(content) = self.content(&attempt.template_id, &question.question_id) {
                    let mut content = content.clone();
                    content.answer_key = None;
                    question.content = Some(content);
                }
            }
        }
        attempt
    }

    fn grade(&self, attempt: &Attempt) -> OverallStats {
        let mut stats = OverallStats {
            correct: 0,
            incorrect: 0,
            skipped: 0,
            raw_score: 0.0,
            band_score: None,
        };
        for question in attempt.sections.iter().flat_map(|s| &s.questions) {
            if !question.is_answered() {
                stats.skipped += 1;
                continue;
            }
            // Only single-select answers can be scored against a key.
            if let AnswerPayload::SingleSelect {
                selected_option_index: Some(selected),
            } = question.answer
            {
                let key = self
                    .content(&attempt.template_id, &question.question_id)
                    .and_then(|c| c.answer_key);
                if key == Some(selected) {
                    stats.correct += 1;
                } else {
                    stats.incorrect += 1;
                }
            }
        }
        stats.raw_score = f64::from(stats.correct);
        stats
    }
}

#[async_trait]
impl AttemptStore for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn start_or_resume_attempt(&self, template_id: &str) -> Result<Attempt> {
        let bundle = self
            .templates
            .get(template_id)
            .ok_or_else(|| BackendError::NotFound(format!("template {template_id}")))?;

        let mut state = self.lock_state();
        let open = state.attempts.values().find(|s| {
            s.attempt.template_id == template_id
                && s.attempt.user_id == self.user_id
                && !s.attempt.status.is_terminal()
        });
        if let Some(stored) = open {
            debug!(attempt = %stored.attempt.id, "resuming open attempt");
            return Ok(self.with_content(stored.attempt.clone()));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let attempt = Attempt::from_template(&id, &self.user_id, &bundle.template);
        state.attempts.insert(
            id.clone(),
            StoredAttempt {
                attempt: attempt.clone(),
                last_sequence: 0,
            },
        );
        self.persist(&state)?;
        debug!(attempt = %id, template = template_id, "created attempt");
        Ok(self.with_content(attempt))
    }

    async fn load_attempt_detail(&self, attempt_id: &str) -> Result<Attempt> {
        let attempt = self
            .snapshot(attempt_id)
            .ok_or_else(|| BackendError::NotFound(format!("attempt {attempt_id}")))?;
        Ok(self.with_content(attempt))
    }

    async fn save_progress(&self, batch: &ProgressBatch) -> Result<SaveAck> {
        self.save_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.fail_saves) {
            return Err(BackendError::NetworkError("injected save failure".into()).into());
        }
        *self.last_batch.lock().unwrap_or_else(|e| e.into_inner()) = Some(batch.clone());

        let mut state = self.lock_state();
        let stored = state
            .attempts
            .get_mut(&batch.attempt_id)
            .ok_or_else(|| BackendError::NotFound(format!("attempt {}", batch.attempt_id)))?;

        if batch.sequence <= stored.last_sequence {
            debug!(
                sequence = batch.sequence,
                last = stored.last_sequence,
                "discarding superseded batch"
            );
            return Ok(SaveAck {
                sequence: batch.sequence,
                applied: false,
            });
        }
        if stored.attempt.status.is_terminal() {
            if !batch.questions.is_empty() {
                return Err(BackendError::Conflict(format!(
                    "attempt {} is {}",
                    batch.attempt_id, stored.attempt.status
                ))
                .into());
            }
            stored.last_sequence = batch.sequence;
            return Ok(SaveAck {
                sequence: batch.sequence,
                applied: false,
            });
        }

        let attempt = &mut stored.attempt;
        attempt.progress_sequence = batch.sequence;
        attempt.status = batch.status;
        attempt.cursor = batch.cursor;
        attempt.total_time_used_seconds = batch.total_time_used_seconds;
        for update in &batch.sections {
            if let Some(section) = attempt.sections.get_mut(update.section_index) {
                section.status = update.status;
                section.started_at = update.started_at;
                section.ended_at = update.ended_at;
            }
        }
        for update in &batch.questions {
            if let Some(question) = attempt
                .sections
                .get_mut(update.section_index)
                .and_then(|s| s.questions.get_mut(update.question_index))
            {
                question.answer = update.answer.clone();
                question.marked_for_review = update.marked_for_review;
                question.time_spent_seconds = update.time_spent_seconds;
            }
        }
        stored.last_sequence = batch.sequence;
        self.persist(&state)?;

        Ok(SaveAck {
            sequence: batch.sequence,
            applied: true,
        })
    }
}

#[async_trait]
impl Grader for MemoryBackend {
    async fn submit_attempt(&self, request: &SubmitRequest) -> Result<SubmitResponse> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.fail_submits) {
            return Err(BackendError::NetworkError("injected submit failure".into()).into());
        }

        let mut state = self.lock_state();
        let stored = state
            .attempts
            .get_mut(&request.attempt_id)
            .ok_or_else(|| BackendError::NotFound(format!("attempt {}", request.attempt_id)))?;
        if stored.attempt.status == AttemptStatus::Completed {
            return Err(BackendError::Conflict(format!(
                "attempt {} already graded",
                request.attempt_id
            ))
            .into());
        }

        for update in &request.answers {
            if let Some(question) = stored
                .attempt
                .sections
                .get_mut(update.section_index)
                .and_then(|s| s.questions.get_mut(update.question_index))
            {
                question.answer = update.answer.clone();
                question.marked_for_review = update.marked_for_review;
                question.time_spent_seconds = update.time_spent_seconds;
            }
        }
        stored.attempt.total_time_used_seconds = request.total_time_used_seconds;

        let stats = self.grade(&stored.attempt);
        stored.attempt.status = AttemptStatus::Completed;
        stored.attempt.overall_stats = Some(stats.clone());
        self.persist(&state)?;

        Ok(SubmitResponse {
            status: AttemptStatus::Completed,
            overall_stats: stats,
        })
    }
}

#[async_trait]
impl QuestionBank for MemoryBackend {
    async fn fetch_question(&self, question_id: &str) -> Result<QuestionContent> {
        self.templates
            .values()
            .find_map(|b| b.question(question_id))
            .map(|c| {
                let mut c = c.clone();
                c.answer_key = None;
                c
            })
            .ok_or_else(|| BackendError::NotFound(format!("question {question_id}")).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proctor_core::model::{QuestionKey, SectionStatus};
    use proctor_core::parser::parse_template_str;
    use proctor_core::traits::{FlushReason, QuestionUpdate, SubmitTrigger};

    const TEMPLATE: &str = r#"
[template]
id = "mini"
name = "Mini"

[[sections]]
name = "Quant"
duration_secs = 60

[[sections.questions]]
id = "q1"
prompt = "2 + 2"
options = ["3", "4", "5"]
answer = 1

[[sections.questions]]
id = "q2"
prompt = "3 * 3"
options = ["6", "9"]
answer = 1

[[sections.questions]]
id = "q3"
kind = "essay"
prompt = "Explain."
"#;

    fn backend() -> MemoryBackend {
        let bundle = parse_template_str(TEMPLATE, Path::new("mini.toml")).unwrap();
        MemoryBackend::new("learner", vec![bundle])
    }

    fn select(question_index: usize, option: u32) -> QuestionUpdate {
        QuestionUpdate {
            section_index: 0,
            question_index,
            answer: AnswerPayload::SingleSelect {
                selected_option_index: Some(option),
            },
            is_answered: true,
            marked_for_review: false,
            time_spent_seconds: 5,
        }
    }

    fn batch(attempt_id: &str, sequence: u64, questions: Vec<QuestionUpdate>) -> ProgressBatch {
        ProgressBatch {
            attempt_id: attempt_id.into(),
            sequence,
            reason: FlushReason::Periodic,
            status: AttemptStatus::InProgress,
            cursor: Some(QuestionKey::new(0, 0)),
            total_time_used_seconds: 5,
            questions,
            sections: vec![],
        }
    }

    #[tokio::test]
    async fn start_joins_content_without_keys() {
        let backend = backend();
        let attempt = backend.start_or_resume_attempt("mini").await.unwrap();
        assert_eq!(attempt.user_id, "learner");
        let content = attempt.sections[0].questions[0].content.as_ref().unwrap();
        assert_eq!(content.prompt, "2 + 2");
        assert!(content.answer_key.is_none());

        let again = backend.start_or_resume_attempt("mini").await.unwrap();
        assert_eq!(again.id, attempt.id);
        assert!(backend.start_or_resume_attempt("other").await.is_err());
    }

    #[tokio::test]
    async fn stale_batches_are_discarded() {
        let backend = backend();
        let id = backend.start_or_resume_attempt("mini").await.unwrap().id;

        let ack = backend.save_progress(&batch(&id, 2, vec![select(0, 1)])).await.unwrap();
        assert!(ack.applied);
        let ack = backend.save_progress(&batch(&id, 1, vec![select(0, 0)])).await.unwrap();
        assert!(!ack.applied);

        let stored = backend.snapshot(&id).unwrap();
        assert_eq!(
            stored.sections[0].questions[0].answer,
            AnswerPayload::SingleSelect {
                selected_option_index: Some(1)
            }
        );
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let backend = backend();
        let id = backend.start_or_resume_attempt("mini").await.unwrap().id;
        backend.fail_next_saves(1);

        let err = backend.save_progress(&batch(&id, 1, vec![])).await.unwrap_err();
        assert!(!err.downcast_ref::<BackendError>().unwrap().is_permanent());
        assert!(backend.save_progress(&batch(&id, 1, vec![])).await.is_ok());
        assert_eq!(backend.save_calls(), 2);
    }

    #[tokio::test]
    async fn grading_uses_answer_keys() {
        let backend = backend();
        let id = backend.start_or_resume_attempt("mini").await.unwrap().id;

        let response = backend
            .submit_attempt(&SubmitRequest {
                attempt_id: id.clone(),
                trigger: SubmitTrigger::Manual,
                total_time_used_seconds: 10,
                answers: vec![select(0, 1), select(1, 0)],
            })
            .await
            .unwrap();
        assert_eq!(response.overall_stats.correct, 1);
        assert_eq!(response.overall_stats.incorrect, 1);
        assert_eq!(response.overall_stats.skipped, 1);
        assert_eq!(response.overall_stats.raw_score, 1.0);

        let stored = backend.snapshot(&id).unwrap();
        assert_eq!(stored.status, AttemptStatus::Completed);

        let err = backend
            .submit_attempt(&SubmitRequest {
                attempt_id: id,
                trigger: SubmitTrigger::Manual,
                total_time_used_seconds: 10,
                answers: vec![],
            })
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<BackendError>().unwrap().is_permanent());
        assert_eq!(backend.submit_calls(), 2);
    }

    #[tokio::test]
    async fn state_file_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let first = backend().with_state_file(&path).unwrap();
        let id = first.start_or_resume_attempt("mini").await.unwrap().id;
        let mut b = batch(&id, 1, vec![select(1, 1)]);
        b.sections = vec![proctor_core::traits::SectionUpdate {
            section_index: 0,
            status: SectionStatus::InProgress,
            started_at: None,
            ended_at: None,
        }];
        first.save_progress(&b).await.unwrap();
        drop(first);

        let second = backend().with_state_file(&path).unwrap();
        let attempt = second.load_attempt_detail(&id).await.unwrap();
        assert_eq!(attempt.sections[0].status, SectionStatus::InProgress);
        assert!(attempt.sections[0].questions[1].is_answered());
        // Sequence survives too.
        let ack = second.save_progress(&batch(&id, 1, vec![])).await.unwrap();
        assert!(!ack.applied);
    }

    #[tokio::test]
    async fn question_bank_lookup() {
        let backend = backend();
        let content = backend.fetch_question("q2").await.unwrap();
        assert_eq!(content.options, vec!["6", "9"]);
        assert!(content.answer_key.is_none());
        assert!(backend.fetch_question("zzz").await.is_err());
    }
}
