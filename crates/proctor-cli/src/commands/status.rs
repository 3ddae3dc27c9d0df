//! The `proctor status` command.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;

use proctor_backends::{create_backend, load_config_from, MemoryBackend};
use proctor_core::report::AttemptSummary;
use proctor_core::traits::AttemptStore;

use super::run::print_summary;

pub async fn execute(
    attempt_id: String,
    state_file: Option<PathBuf>,
    format: String,
    config: Option<PathBuf>,
) -> Result<()> {
    let store: Arc<dyn AttemptStore> = match &state_file {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!("state file not found: {}", path.display());
            }
            Arc::new(MemoryBackend::new("local", Vec::new()).with_state_file(path)?)
        }
        None => {
            let config = load_config_from(config.as_deref())?;
            create_backend(&config.backend)?.store
        }
    };

    tracing::debug!(backend = store.name(), attempt = %attempt_id, "loading attempt");
    let attempt = store.load_attempt_detail(&attempt_id).await?;
    let summary = AttemptSummary::from_attempt(&attempt);

    match format.as_str() {
        "json" => println!("{}", serde_json::to_string_pretty(&summary)?),
        "table" => {
            println!(
                "Attempt {} ({}) is {}",
                summary.attempt_id, summary.template_id, summary.status
            );
            if let Some(cursor) = attempt.cursor {
                println!("Current question: {cursor}");
            }
            print_summary(&summary);
        }
        other => anyhow::bail!("unknown format: {other} (expected table or json)"),
    }

    Ok(())
}
