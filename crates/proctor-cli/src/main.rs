//! proctor CLI: the user-facing command-line interface.

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "proctor", version, about = "Timed multi-section exam attempt engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a scripted attempt against an in-memory backend
    Run {
        /// Path to the .toml test template
        #[arg(long)]
        template: PathBuf,

        /// Path to the .toml intent script
        #[arg(long)]
        script: PathBuf,

        /// Write the attempt summary as JSON to this file
        #[arg(long)]
        output: Option<PathBuf>,

        /// Persist backend state to this JSON file
        #[arg(long)]
        state_file: Option<PathBuf>,

        /// Learner id recorded on the attempt
        #[arg(long, default_value = "local")]
        user: String,
    },

    /// Show the persisted state of an attempt
    Status {
        /// Attempt id
        #[arg(long)]
        attempt_id: String,

        /// Read from an in-memory backend state file instead of the configured backend
        #[arg(long)]
        state_file: Option<PathBuf>,

        /// Output format: table, json
        #[arg(long, default_value = "table")]
        format: String,

        /// Config file path
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Validate test template TOML files
    Validate {
        /// Path to template file or directory
        #[arg(long)]
        template: PathBuf,
    },

    /// Create starter config, template, and script
    Init,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("proctor=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            template,
            script,
            output,
            state_file,
            user,
        } => commands::run::execute(template, script, output, state_file, user).await,
        Commands::Status {
            attempt_id,
            state_file,
            format,
            config,
        } => commands::status::execute(attempt_id, state_file, format, config).await,
        Commands::Validate { template } => commands::validate::execute(template),
        Commands::Init => commands::init::execute(),
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}
