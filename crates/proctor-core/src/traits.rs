//! Boundary trait definitions: persistence, grading, and the question bank.
//!
//! These async traits are implemented by the `proctor-backends` crate. The
//! engine never talks to storage or graders except through them.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{
    AnswerPayload, Attempt, AttemptStatus, OverallStats, QuestionContent, QuestionKey,
    SectionStatus,
};

// ---------------------------------------------------------------------------
// Persistence boundary
// ---------------------------------------------------------------------------

/// Storage/API layer that owns the persisted attempt document.
#[async_trait]
pub trait AttemptStore: Send + Sync {
    /// Human-readable backend name (e.g. "http").
    fn name(&self) -> &str;

    /// Create an attempt for the template, or return the learner's open one.
    async fn start_or_resume_attempt(&self, template_id: &str) -> anyhow::Result<Attempt>;

    /// Load a fully populated attempt, with question content joined in.
    async fn load_attempt_detail(&self, attempt_id: &str) -> anyhow::Result<Attempt>;

    /// Apply a batch of partial updates. Batches older than the last applied
    /// sequence are discarded and acknowledged with `applied = false`.
    async fn save_progress(&self, batch: &ProgressBatch) -> anyhow::Result<SaveAck>;
}

/// Why a flush happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlushReason {
    Manual,
    Navigation,
    Periodic,
    SectionStart,
    SectionEnd,
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlushReason::Manual => write!(f, "manual"),
            FlushReason::Navigation => write!(f, "navigation"),
            FlushReason::Periodic => write!(f, "periodic"),
            FlushReason::SectionStart => write!(f, "section-start"),
            FlushReason::SectionEnd => write!(f, "section-end"),
        }
    }
}

/// Partial update for one question, addressed by `(section, question)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionUpdate {
    pub section_index: usize,
    pub question_index: usize,
    pub answer: AnswerPayload,
    pub is_answered: bool,
    pub marked_for_review: bool,
    pub time_spent_seconds: u64,
}

impl QuestionUpdate {
    pub fn key(&self) -> QuestionKey {
        QuestionKey::new(self.section_index, self.question_index)
    }
}

/// Lifecycle update for one section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionUpdate {
    pub section_index: usize,
    pub status: SectionStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

/// Everything one flush hands to the persistence boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressBatch {
    pub attempt_id: String,
    /// Strictly increasing per attempt.
    pub sequence: u64,
    pub reason: FlushReason,
    pub status: AttemptStatus,
    pub cursor: Option<QuestionKey>,
    pub total_time_used_seconds: u64,
    #[serde(default)]
    pub questions: Vec<QuestionUpdate>,
    #[serde(default)]
    pub sections: Vec<SectionUpdate>,
}

/// Acknowledgement of a `save_progress` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveAck {
    pub sequence: u64,
    pub applied: bool,
}

// ---------------------------------------------------------------------------
// Grading boundary
// ---------------------------------------------------------------------------

/// What started a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubmitTrigger {
    Manual,
    AutoTimeout,
}

impl fmt::Display for SubmitTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitTrigger::Manual => write!(f, "manual"),
            SubmitTrigger::AutoTimeout => write!(f, "auto-timeout"),
        }
    }
}

/// The finalized answer set handed off for grading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub attempt_id: String,
    pub trigger: SubmitTrigger,
    pub total_time_used_seconds: u64,
    pub answers: Vec<QuestionUpdate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub status: AttemptStatus,
    pub overall_stats: OverallStats,
}

/// Server-side grading, invoked only by the submission coordinator.
#[async_trait]
pub trait Grader: Send + Sync {
    async fn submit_attempt(&self, request: &SubmitRequest) -> anyhow::Result<SubmitResponse>;
}

// ---------------------------------------------------------------------------
// Question bank
// ---------------------------------------------------------------------------

/// Read-only question content lookup.
#[async_trait]
pub trait QuestionBank: Send + Sync {
    async fn fetch_question(&self, question_id: &str) -> anyhow::Result<QuestionContent>;
}
