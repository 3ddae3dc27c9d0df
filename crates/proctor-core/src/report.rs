//! Attempt summaries with JSON persistence.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{Attempt, AttemptStatus, OverallStats, SectionStatus};

/// A point-in-time summary of an attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptSummary {
    /// Unique summary identifier.
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub attempt_id: String,
    pub template_id: String,
    pub status: AttemptStatus,
    pub sections: Vec<SectionSummary>,
    pub total_time_used_seconds: u64,
    #[serde(default)]
    pub overall_stats: Option<OverallStats>,
}

/// Per-section counts and timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionSummary {
    pub name: String,
    pub status: SectionStatus,
    pub duration_seconds: u64,
    pub time_used_seconds: u64,
    pub remaining_seconds: u64,
    pub questions: usize,
    pub answered: usize,
    pub marked: usize,
}

impl AttemptSummary {
    pub fn from_attempt(attempt: &Attempt) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            attempt_id: attempt.id.clone(),
            template_id: attempt.template_id.clone(),
            status: attempt.status,
            sections: attempt
                .sections
                .iter()
                .map(|s| SectionSummary {
                    name: s.name.clone(),
                    status: s.status,
                    duration_seconds: s.duration_seconds,
                    time_used_seconds: s.time_used_seconds(),
                    remaining_seconds: s.remaining_seconds(),
                    questions: s.questions.len(),
                    answered: s.answered_count(),
                    marked: s.marked_count(),
                })
                .collect(),
            total_time_used_seconds: attempt.total_time_used_seconds,
            overall_stats: attempt.overall_stats.clone(),
        }
    }

    pub fn answered(&self) -> usize {
        self.sections.iter().map(|s| s.answered).sum()
    }

    pub fn question_count(&self) -> usize {
        self.sections.iter().map(|s| s.questions).sum()
    }

    /// Save the summary as JSON to a file.
    pub fn save_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("failed to serialize summary")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)
            .with_context(|| format!("failed to write summary to {}", path.display()))?;
        Ok(())
    }

    /// Load a summary from a JSON file.
    pub fn load_json(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read summary from {}", path.display()))?;
        let summary: AttemptSummary =
            serde_json::from_str(&content).context("failed to parse summary JSON")?;
        Ok(summary)
    }

    /// Format the summary as markdown.
    pub fn to_markdown(&self) -> String {
        let mut md = String::new();

        md.push_str(&format!(
            "**Attempt {}** ({}): {}/{} answered, {}s used\n\n",
            self.attempt_id,
            self.status,
            self.answered(),
            self.question_count(),
            self.total_time_used_seconds
        ));

        md.push_str("| Section | Status | Answered | Marked | Used | Remaining |\n");
        md.push_str("|---------|--------|----------|--------|------|-----------|\n");
        for s in &self.sections {
            md.push_str(&format!(
                "| {} | {} | {}/{} | {} | {}s | {}s |\n",
                s.name,
                s.status,
                s.answered,
                s.questions,
                s.marked,
                s.time_used_seconds,
                s.remaining_seconds
            ));
        }

        if let Some(stats) = &self.overall_stats {
            md.push_str(&format!(
                "\n**Score:** {} correct, {} incorrect, {} skipped (raw {:.1})\n",
                stats.correct, stats.incorrect, stats.skipped, stats.raw_score
            ));
        }

        md
    }
}
