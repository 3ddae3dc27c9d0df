//! The `proctor validate` command.

use std::path::PathBuf;

use anyhow::Result;

use proctor_core::parser;

pub fn execute(template_path: PathBuf) -> Result<()> {
    let bundles = if template_path.is_dir() {
        parser::load_template_directory(&template_path)?
    } else {
        vec![parser::parse_template(&template_path)?]
    };

    let mut total_warnings = 0;

    for bundle in &bundles {
        let template = &bundle.template;
        let total_secs: u64 = template.sections.iter().map(|s| s.duration_seconds).sum();
        println!(
            "Template: {} ({} sections, {} questions, {} min)",
            template.name,
            template.sections.len(),
            bundle.questions.len(),
            total_secs / 60
        );

        let warnings = parser::validate_template(bundle);
        for w in &warnings {
            let prefix = w
                .question_id
                .as_ref()
                .map(|id| format!("  [{id}]"))
                .unwrap_or_else(|| "  ".to_string());
            println!("{prefix} WARNING: {}", w.message);
        }
        total_warnings += warnings.len();
    }

    if total_warnings == 0 {
        println!("All templates valid.");
    } else {
        println!("\n{total_warnings} warning(s) found.");
    }

    Ok(())
}
