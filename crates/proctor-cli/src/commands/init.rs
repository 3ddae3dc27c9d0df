//! The `proctor init` command.

use std::path::Path;

use anyhow::Result;

pub fn execute() -> Result<()> {
    write_once(Path::new("proctor.toml"), SAMPLE_CONFIG)?;

    std::fs::create_dir_all("templates")?;
    write_once(Path::new("templates/example.toml"), EXAMPLE_TEMPLATE)?;

    std::fs::create_dir_all("scripts")?;
    write_once(Path::new("scripts/example.toml"), EXAMPLE_SCRIPT)?;

    println!("\nNext steps:");
    println!("  1. Edit proctor.toml to point at your attempt API, or keep the memory backend");
    println!("  2. Run: proctor validate --template templates/example.toml");
    println!(
        "  3. Run: proctor run --template templates/example.toml --script scripts/example.toml"
    );

    Ok(())
}

fn write_once(path: &Path, content: &str) -> Result<()> {
    if path.exists() {
        println!("{} already exists, skipping.", path.display());
    } else {
        std::fs::write(path, content)?;
        println!("Created {}", path.display());
    }
    Ok(())
}

const SAMPLE_CONFIG: &str = r#"# proctor configuration

[backend]
type = "memory"
user_id = "local"
templates_dir = "./templates"
state_file = "./.proctor/state.json"

# [backend]
# type = "http"
# base_url = "https://exams.example.com/api"
# api_token = "${PROCTOR_API_TOKEN}"
# timeout_secs = 30

[session]
flush_interval_secs = 15
max_retries = 3
retry_delay_ms = 500
drift_threshold_secs = 3
"#;

const EXAMPLE_TEMPLATE: &str = r#"[template]
id = "example"
name = "Example Practice Test"
family = "gre"

[[sections]]
name = "Quantitative Reasoning"
duration_secs = 120

[[sections.questions]]
id = "ex-q1"
kind = "single_select"
prompt = "What is 12 * 12?"
options = ["124", "144", "132", "154"]
answer = 1

[[sections.questions]]
id = "ex-q2"
kind = "free_text"
prompt = "Write 0.25 as a fraction in lowest terms."

[[sections]]
name = "Analytical Writing"
duration_secs = 300

[[sections.questions]]
id = "ex-w1"
kind = "essay"
prompt = "Should governments fund basic research? Discuss."
"#;

const EXAMPLE_SCRIPT: &str = r#"# Each step is applied in order. `tick` advances the clock one second at a time.

[[steps]]
action = "select"
option = 1

[[steps]]
action = "tick"
seconds = 20

[[steps]]
action = "navigate"
question = 1

[[steps]]
action = "text"
text = "1/4"

[[steps]]
action = "end_section"

[[steps]]
action = "text"
text = "Basic research pays off over decades."

[[steps]]
action = "tick"
seconds = 45

[[steps]]
action = "submit"
"#;
