//! Core data model types for proctor.
//!
//! An [`Attempt`] exclusively owns its [`SectionState`]s, which own their
//! [`QuestionAttempt`]s. Question content lives in an external question bank
//! and is only ever joined in read-only.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Question kinds and answers
// ---------------------------------------------------------------------------

/// The kind of a question, which fixes the shape of its answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionKind {
    SingleSelect,
    FreeText,
    Essay,
}

impl fmt::Display for QuestionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuestionKind::SingleSelect => write!(f, "single_select"),
            QuestionKind::FreeText => write!(f, "free_text"),
            QuestionKind::Essay => write!(f, "essay"),
        }
    }
}

impl FromStr for QuestionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "single_select" | "mcq" => Ok(QuestionKind::SingleSelect),
            "free_text" | "text" => Ok(QuestionKind::FreeText),
            "essay" => Ok(QuestionKind::Essay),
            other => Err(format!("unknown question kind: {other}")),
        }
    }
}

/// Answer payload, tagged by question kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnswerPayload {
    SingleSelect {
        #[serde(default)]
        selected_option_index: Option<u32>,
    },
    FreeText {
        #[serde(default)]
        text: String,
    },
    Essay {
        #[serde(default)]
        text: String,
    },
}

impl AnswerPayload {
    /// The empty answer for a question of the given kind.
    pub fn empty(kind: QuestionKind) -> Self {
        match kind {
            QuestionKind::SingleSelect => AnswerPayload::SingleSelect {
                selected_option_index: None,
            },
            QuestionKind::FreeText => AnswerPayload::FreeText {
                text: String::new(),
            },
            QuestionKind::Essay => AnswerPayload::Essay {
                text: String::new(),
            },
        }
    }

    pub fn kind(&self) -> QuestionKind {
        match self {
            AnswerPayload::SingleSelect { .. } => QuestionKind::SingleSelect,
            AnswerPayload::FreeText { .. } => QuestionKind::FreeText,
            AnswerPayload::Essay { .. } => QuestionKind::Essay,
        }
    }

    /// A selection is present, or the trimmed text is non-empty.
    pub fn is_answered(&self) -> bool {
        match self {
            AnswerPayload::SingleSelect {
                selected_option_index,
            } => selected_option_index.is_some(),
            AnswerPayload::FreeText { text } | AnswerPayload::Essay { text } => {
                !text.trim().is_empty()
            }
        }
    }
}

/// One question's in-attempt state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionAttempt {
    /// Question bank id.
    pub question_id: String,
    /// 1-based position within the section.
    pub order: u32,
    /// Current answer; its variant is the question kind.
    pub answer: AnswerPayload,
    #[serde(default)]
    pub marked_for_review: bool,
    #[serde(default)]
    pub time_spent_seconds: u64,
    /// Number of options for single-select questions, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub option_count: Option<u32>,
    /// Read-only content joined in from the question bank.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<QuestionContent>,
}

impl QuestionAttempt {
    pub fn new(question_id: impl Into<String>, order: u32, kind: QuestionKind) -> Self {
        Self {
            question_id: question_id.into(),
            order,
            answer: AnswerPayload::empty(kind),
            marked_for_review: false,
            time_spent_seconds: 0,
            option_count: None,
            content: None,
        }
    }

    pub fn kind(&self) -> QuestionKind {
        self.answer.kind()
    }

    pub fn is_answered(&self) -> bool {
        self.answer.is_answered()
    }
}

/// Immutable question content supplied by the question bank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionContent {
    pub id: String,
    pub kind: QuestionKind,
    pub prompt: String,
    #[serde(default)]
    pub stimulus: Option<String>,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub difficulty: Option<String>,
    /// Correct option for single-select questions. Only graders read this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_key: Option<u32>,
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionStatus {
    NotStarted,
    InProgress,
    Completed,
}

impl fmt::Display for SectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SectionStatus::NotStarted => write!(f, "not_started"),
            SectionStatus::InProgress => write!(f, "in_progress"),
            SectionStatus::Completed => write!(f, "completed"),
        }
    }
}

/// A timed, ordered block of questions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionState {
    pub name: String,
    pub duration_seconds: u64,
    pub status: SectionStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub questions: Vec<QuestionAttempt>,
}

impl SectionState {
    /// Sum of `time_spent_seconds` across the section's questions.
    pub fn time_used_seconds(&self) -> u64 {
        self.questions.iter().map(|q| q.time_spent_seconds).sum()
    }

    pub fn remaining_seconds(&self) -> u64 {
        self.duration_seconds
            .saturating_sub(self.time_used_seconds())
    }

    pub fn answered_count(&self) -> usize {
        self.questions.iter().filter(|q| q.is_answered()).count()
    }

    pub fn marked_count(&self) -> usize {
        self.questions.iter().filter(|q| q.marked_for_review).count()
    }
}

// ---------------------------------------------------------------------------
// Attempts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    NotStarted,
    InProgress,
    Completed,
    Cancelled,
    Expired,
}

impl AttemptStatus {
    /// Completed, cancelled, and expired attempts are frozen.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AttemptStatus::Completed | AttemptStatus::Cancelled | AttemptStatus::Expired
        )
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptStatus::NotStarted => write!(f, "not_started"),
            AttemptStatus::InProgress => write!(f, "in_progress"),
            AttemptStatus::Completed => write!(f, "completed"),
            AttemptStatus::Cancelled => write!(f, "cancelled"),
            AttemptStatus::Expired => write!(f, "expired"),
        }
    }
}

impl FromStr for AttemptStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "not_started" => Ok(AttemptStatus::NotStarted),
            "in_progress" => Ok(AttemptStatus::InProgress),
            "completed" => Ok(AttemptStatus::Completed),
            "cancelled" | "canceled" => Ok(AttemptStatus::Cancelled),
            "expired" => Ok(AttemptStatus::Expired),
            other => Err(format!("unknown attempt status: {other}")),
        }
    }
}

/// Grading output. Written once, after completion, from the grading boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverallStats {
    pub correct: u32,
    pub incorrect: u32,
    pub skipped: u32,
    pub raw_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub band_score: Option<f64>,
}

/// Position of a question inside an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QuestionKey {
    pub section_index: usize,
    pub question_index: usize,
}

impl QuestionKey {
    pub fn new(section_index: usize, question_index: usize) -> Self {
        Self {
            section_index,
            question_index,
        }
    }
}

impl fmt::Display for QuestionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}/q{}", self.section_index, self.question_index)
    }
}

/// One learner's run through one test template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    /// Opaque attempt id assigned by the persistence boundary.
    pub id: String,
    pub user_id: String,
    pub template_id: String,
    pub status: AttemptStatus,
    pub sections: Vec<SectionState>,
    #[serde(default)]
    pub total_time_used_seconds: u64,
    #[serde(default)]
    pub overall_stats: Option<OverallStats>,
    /// Last persisted cursor, used to restore the active question on resume.
    #[serde(default)]
    pub cursor: Option<QuestionKey>,
    /// Sequence number of the last progress batch the store applied.
    #[serde(default)]
    pub progress_sequence: u64,
}

impl Attempt {
    /// Build a fresh, not-started attempt from a template.
    pub fn from_template(
        id: impl Into<String>,
        user_id: impl Into<String>,
        template: &TestTemplate,
    ) -> Self {
        let sections = template
            .sections
            .iter()
            .map(|spec| SectionState {
                name: spec.name.clone(),
                duration_seconds: spec.duration_seconds,
                status: SectionStatus::NotStarted,
                started_at: None,
                ended_at: None,
                questions: spec
                    .questions
                    .iter()
                    .enumerate()
                    .map(|(i, q)| {
                        let mut attempt = QuestionAttempt::new(&q.id, i as u32 + 1, q.kind);
                        attempt.option_count = q.options;
                        attempt
                    })
                    .collect(),
            })
            .collect();

        Self {
            id: id.into(),
            user_id: user_id.into(),
            template_id: template.id.clone(),
            status: AttemptStatus::NotStarted,
            sections,
            total_time_used_seconds: 0,
            overall_stats: None,
            cursor: None,
            progress_sequence: 0,
        }
    }

    pub fn question(&self, key: QuestionKey) -> Option<&QuestionAttempt> {
        self.sections
            .get(key.section_index)
            .and_then(|s| s.questions.get(key.question_index))
    }

    /// Index of the section currently in progress, if any.
    pub fn active_section_index(&self) -> Option<usize> {
        self.sections
            .iter()
            .position(|s| s.status == SectionStatus::InProgress)
    }

    pub fn question_count(&self) -> usize {
        self.sections.iter().map(|s| s.questions.len()).sum()
    }
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

/// A reference to a bank question inside a template section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionSpec {
    pub id: String,
    pub kind: QuestionKind,
    /// Option count for single-select questions.
    #[serde(default)]
    pub options: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionSpec {
    pub name: String,
    pub duration_seconds: u64,
    #[serde(default)]
    pub questions: Vec<QuestionSpec>,
}

/// An ordered list of timed sections. Exam family is a presentation label only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestTemplate {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub family: Option<String>,
    #[serde(default)]
    pub sections: Vec<SectionSpec>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> TestTemplate {
        TestTemplate {
            id: "t1".into(),
            name: "Template".into(),
            family: None,
            sections: vec![SectionSpec {
                name: "Quant".into(),
                duration_seconds: 60,
                questions: vec![
                    QuestionSpec {
                        id: "q1".into(),
                        kind: QuestionKind::SingleSelect,
                        options: Some(4),
                    },
                    QuestionSpec {
                        id: "q2".into(),
                        kind: QuestionKind::Essay,
                        options: None,
                    },
                ],
            }],
        }
    }

    #[test]
    fn kind_display_and_parse() {
        assert_eq!(QuestionKind::SingleSelect.to_string(), "single_select");
        assert_eq!(
            "free-text".parse::<QuestionKind>().unwrap(),
            QuestionKind::FreeText
        );
        assert_eq!("MCQ".parse::<QuestionKind>().unwrap(), QuestionKind::SingleSelect);
        assert!("matching".parse::<QuestionKind>().is_err());
    }

    #[test]
    fn answered_is_derived_from_content() {
        let mut answer = AnswerPayload::empty(QuestionKind::Essay);
        assert!(!answer.is_answered());
        answer = AnswerPayload::Essay {
            text: "   \n".into(),
        };
        assert!(!answer.is_answered());
        answer = AnswerPayload::Essay { text: "ok".into() };
        assert!(answer.is_answered());

        let mcq = AnswerPayload::SingleSelect {
            selected_option_index: Some(0),
        };
        assert!(mcq.is_answered());
    }

    #[test]
    fn answer_payload_is_tagged() {
        let json = serde_json::to_value(AnswerPayload::SingleSelect {
            selected_option_index: Some(2),
        })
        .unwrap();
        assert_eq!(json["kind"], "single_select");
        assert_eq!(json["selected_option_index"], 2);

        let parsed: AnswerPayload =
            serde_json::from_str(r#"{"kind":"free_text","text":"hi"}"#).unwrap();
        assert_eq!(parsed.kind(), QuestionKind::FreeText);
    }

    #[test]
    fn attempt_from_template() {
        let attempt = Attempt::from_template("a1", "u1", &template());
        assert_eq!(attempt.status, AttemptStatus::NotStarted);
        assert_eq!(attempt.sections.len(), 1);
        let section = &attempt.sections[0];
        assert_eq!(section.status, SectionStatus::NotStarted);
        assert_eq!(section.questions[0].order, 1);
        assert_eq!(section.questions[1].order, 2);
        assert_eq!(section.questions[0].option_count, Some(4));
        assert_eq!(section.questions[1].kind(), QuestionKind::Essay);
        assert_eq!(attempt.active_section_index(), None);
    }

    #[test]
    fn section_remaining_floors_at_zero() {
        let mut attempt = Attempt::from_template("a1", "u1", &template());
        attempt.sections[0].questions[0].time_spent_seconds = 50;
        attempt.sections[0].questions[1].time_spent_seconds = 30;
        assert_eq!(attempt.sections[0].time_used_seconds(), 80);
        assert_eq!(attempt.sections[0].remaining_seconds(), 0);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!AttemptStatus::InProgress.is_terminal());
        assert!(!AttemptStatus::NotStarted.is_terminal());
        assert!(AttemptStatus::Completed.is_terminal());
        assert!(AttemptStatus::Cancelled.is_terminal());
        assert!(AttemptStatus::Expired.is_terminal());
        assert_eq!(
            "canceled".parse::<AttemptStatus>().unwrap(),
            AttemptStatus::Cancelled
        );
    }
}
