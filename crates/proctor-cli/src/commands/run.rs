//! The `proctor run` command: replay a scripted attempt.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use proctor_backends::MemoryBackend;
use proctor_core::clock::Tick;
use proctor_core::error::EngineError;
use proctor_core::machine::EndTrigger;
use proctor_core::model::{AttemptStatus, OverallStats};
use proctor_core::parser;
use proctor_core::report::AttemptSummary;
use proctor_core::session::{AttemptSession, Intent, SessionConfig, SessionObserver};
use proctor_core::sync::RetryPolicy;
use proctor_core::traits::{FlushReason, SaveAck};

#[derive(Debug, Deserialize)]
struct Script {
    #[serde(default)]
    settings: ScriptSettings,
    #[serde(default)]
    steps: Vec<Step>,
}

#[derive(Debug, Default, Deserialize)]
struct ScriptSettings {
    #[serde(default)]
    flush_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum Step {
    Select {
        option: u32,
    },
    Text {
        text: String,
    },
    Clear,
    Review,
    Navigate {
        question: usize,
    },
    EndSection {
        #[serde(default = "default_true")]
        confirm: bool,
    },
    Tick {
        #[serde(default = "default_seconds")]
        seconds: u64,
    },
    Drift {
        gap_secs: u64,
    },
    Pause,
    Flush,
    Submit,
    RetrySubmit,
    Cancel,
    FailSaves {
        count: u32,
    },
    FailSubmits {
        count: u32,
    },
}

fn default_true() -> bool {
    true
}

fn default_seconds() -> u64 {
    1
}

impl Step {
    fn into_intent(self) -> Option<Intent> {
        Some(match self {
            Step::Select { option } => Intent::SelectOption(option),
            Step::Text { text } => Intent::SetText(text),
            Step::Clear => Intent::ClearAnswer,
            Step::Review => Intent::ToggleReview,
            Step::Navigate { question } => Intent::Navigate(question),
            Step::EndSection { confirm } => Intent::EndSection { confirmed: confirm },
            Step::Pause => Intent::TogglePause,
            Step::Flush => Intent::Flush,
            Step::Submit => Intent::Submit,
            Step::RetrySubmit => Intent::RetrySubmission,
            Step::Cancel => Intent::Cancel,
            Step::Tick { .. }
            | Step::Drift { .. }
            | Step::FailSaves { .. }
            | Step::FailSubmits { .. } => return None,
        })
    }
}

/// Console observer.
struct ConsoleObserver;

impl SessionObserver for ConsoleObserver {
    fn on_section_started(&self, index: usize, name: &str, remaining_seconds: u64) {
        eprintln!("  Section {}: {name} started ({remaining_seconds}s left)", index + 1);
    }

    fn on_section_ended(&self, index: usize, trigger: EndTrigger) {
        eprintln!("  Section {} ended ({trigger})", index + 1);
    }

    fn on_flush(&self, reason: FlushReason, ack: &SaveAck) {
        eprintln!(
            "  Saved #{} ({reason}){}",
            ack.sequence,
            if ack.applied { "" } else { " [discarded]" }
        );
    }

    fn on_flush_error(&self, reason: FlushReason, error: &EngineError) {
        eprintln!("  Save failed ({reason}), will retry: {error}");
    }

    fn on_drift(&self, drift: &EngineError) {
        eprintln!("  Ignored: {drift}");
    }

    fn on_submitted(&self, stats: &OverallStats) {
        eprintln!(
            "  Submitted: {} correct, {} incorrect, {} skipped",
            stats.correct, stats.incorrect, stats.skipped
        );
    }

    fn on_submission_error(&self, error: &EngineError) {
        eprintln!("  Submission failed: {error}");
    }
}

fn load_script(path: &Path) -> Result<Script> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read script: {}", path.display()))?;
    let script: Script = toml::from_str(&content)
        .with_context(|| format!("failed to parse script: {}", path.display()))?;
    tracing::debug!(steps = script.steps.len(), "loaded script {}", path.display());
    Ok(script)
}

pub async fn execute(
    template_path: PathBuf,
    script_path: PathBuf,
    output: Option<PathBuf>,
    state_file: Option<PathBuf>,
    user: String,
) -> Result<()> {
    let bundle = parser::parse_template(&template_path)?;
    let script = load_script(&script_path)?;
    let template_id = bundle.template.id.clone();
    let template_name = bundle.template.name.clone();

    let mut backend = MemoryBackend::new(&user, vec![bundle]);
    if let Some(path) = &state_file {
        backend = backend.with_state_file(path)?;
    }
    let backend = Arc::new(backend);

    // Replays are deterministic: no wall-clock waits between retries.
    let config = SessionConfig {
        flush_interval_ticks: script.settings.flush_interval_secs.unwrap_or(15).max(1),
        retry: RetryPolicy::none(),
        tick_period: Duration::from_secs(1),
        ..SessionConfig::default()
    };

    eprintln!(
        "proctor v{}: replaying {} steps against {template_name}",
        env!("CARGO_PKG_VERSION"),
        script.steps.len()
    );
    eprintln!();

    let mut session = AttemptSession::start(
        backend.clone(),
        backend.clone(),
        &template_id,
        config,
        Arc::new(ConsoleObserver),
    )
    .await?;

    let mut rejected = 0usize;
    for (i, step) in script.steps.into_iter().enumerate() {
        let label = format!("{step:?}");
        match step {
            Step::Tick { seconds } => {
                for _ in 0..seconds {
                    session.tick(Tick::Second).await;
                }
            }
            Step::Drift { gap_secs } => {
                session.tick(Tick::Drift { gap_secs }).await;
            }
            Step::FailSaves { count } => backend.fail_next_saves(count),
            Step::FailSubmits { count } => backend.fail_next_submits(count),
            other => {
                if let Some(intent) = other.into_intent() {
                    if let Err(e) = session.apply(intent).await {
                        rejected += 1;
                        eprintln!("  Step {} {label} rejected: {e}", i + 1);
                    }
                }
            }
        }
    }

    if session.attempt().status == AttemptStatus::InProgress {
        if let Err(e) = session.flush().await {
            eprintln!("  Final save failed: {e}");
        }
    }

    let summary = AttemptSummary::from_attempt(session.attempt());
    print_summary(&summary);
    println!(
        "Attempt {} is {} ({} save calls, {} submit calls, {} rejected steps)",
        summary.attempt_id,
        summary.status,
        backend.save_calls(),
        backend.submit_calls(),
        rejected
    );

    if let Some(path) = output {
        summary.save_json(&path)?;
        eprintln!("Summary saved to: {}", path.display());
    }

    Ok(())
}

pub(crate) fn print_summary(summary: &AttemptSummary) {
    use comfy_table::{Cell, Table};

    let mut table = Table::new();
    table.set_header(vec![
        "Section",
        "Status",
        "Answered",
        "Marked",
        "Used",
        "Remaining",
    ]);

    for s in &summary.sections {
        table.add_row(vec![
            Cell::new(&s.name),
            Cell::new(s.status),
            Cell::new(format!("{}/{}", s.answered, s.questions)),
            Cell::new(s.marked),
            Cell::new(format!("{}s", s.time_used_seconds)),
            Cell::new(format!("{}s", s.remaining_seconds)),
        ]);
    }

    println!("{table}");
    if let Some(stats) = &summary.overall_stats {
        println!(
            "Score: {} correct, {} incorrect, {} skipped (raw {:.1})",
            stats.correct, stats.incorrect, stats.skipped, stats.raw_score
        );
    }
}
