//! TOML test template parser.
//!
//! A template file declares the template header, its timed sections, and the
//! questions of each section, including the content the question bank
//! serves for them.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::model::{QuestionContent, QuestionKind, QuestionSpec, SectionSpec, TestTemplate};

/// Intermediate TOML structure for parsing template files.
#[derive(Debug, Deserialize)]
struct TomlTemplateFile {
    template: TomlTemplateHeader,
    #[serde(default)]
    sections: Vec<TomlSection>,
}

#[derive(Debug, Deserialize)]
struct TomlTemplateHeader {
    id: String,
    name: String,
    #[serde(default)]
    family: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TomlSection {
    name: String,
    duration_secs: u64,
    #[serde(default)]
    questions: Vec<TomlQuestion>,
}

#[derive(Debug, Deserialize)]
struct TomlQuestion {
    id: String,
    #[serde(default = "default_kind")]
    kind: String,
    #[serde(default)]
    prompt: String,
    #[serde(default)]
    stimulus: Option<String>,
    #[serde(default)]
    options: Vec<String>,
    #[serde(default)]
    answer: Option<u32>,
    #[serde(default)]
    difficulty: Option<String>,
}

fn default_kind() -> String {
    "single_select".to_string()
}

/// A parsed template together with the content of its questions.
#[derive(Debug, Clone)]
pub struct TemplateBundle {
    pub template: TestTemplate,
    pub questions: Vec<QuestionContent>,
}

impl TemplateBundle {
    pub fn question(&self, id: &str) -> Option<&QuestionContent> {
        self.questions.iter().find(|q| q.id == id)
    }
}

/// Parse a single TOML template file.
pub fn parse_template(path: &Path) -> Result<TemplateBundle> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read template file: {}", path.display()))?;

    parse_template_str(&content, path)
}

/// Parse a TOML string into a template bundle.
pub fn parse_template_str(content: &str, source_path: &Path) -> Result<TemplateBundle> {
    let parsed: TomlTemplateFile = toml::from_str(content)
        .with_context(|| format!("failed to parse TOML: {}", source_path.display()))?;

    let mut questions = Vec::new();
    let sections = parsed
        .sections
        .into_iter()
        .map(|s| {
            let specs = s
                .questions
                .into_iter()
                .map(|q| {
                    let kind: QuestionKind =
                        q.kind.parse().map_err(|e: String| anyhow::anyhow!("{}", e))?;
                    let options = (kind == QuestionKind::SingleSelect)
                        .then_some(q.options.len() as u32);
                    questions.push(QuestionContent {
                        id: q.id.clone(),
                        kind,
                        prompt: q.prompt,
                        stimulus: q.stimulus,
                        options: q.options,
                        difficulty: q.difficulty,
                        answer_key: q.answer,
                    });
                    Ok(QuestionSpec {
                        id: q.id,
                        kind,
                        options,
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            Ok(SectionSpec {
                name: s.name,
                duration_seconds: s.duration_secs,
                questions: specs,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(TemplateBundle {
        template: TestTemplate {
            id: parsed.template.id,
            name: parsed.template.name,
            family: parsed.template.family,
            sections,
        },
        questions,
    })
}

/// Recursively load all `.toml` template files from a directory.
pub fn load_template_directory(dir: &Path) -> Result<Vec<TemplateBundle>> {
    let mut bundles = Vec::new();

    if !dir.is_dir() {
        anyhow::bail!("not a directory: {}", dir.display());
    }

    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("failed to read directory: {}", dir.display()))?
    {
        let entry = entry?;
        let path = entry.path();

        if path.is_dir() {
            bundles.extend(load_template_directory(&path)?);
        } else if path.extension().is_some_and(|ext| ext == "toml") {
            match parse_template(&path) {
                Ok(bundle) => bundles.push(bundle),
                Err(e) => {
                    tracing::warn!("skipping {}: {}", path.display(), e);
                }
            }
        }
    }

    Ok(bundles)
}

/// A warning from template validation.
#[derive(Debug, Clone)]
pub struct ValidationWarning {
    /// The question ID (if applicable).
    pub question_id: Option<String>,
    pub message: String,
}

/// Validate a template for common authoring mistakes.
pub fn validate_template(bundle: &TemplateBundle) -> Vec<ValidationWarning> {
    let mut warnings = Vec::new();
    let template = &bundle.template;

    if template.sections.is_empty() {
        warnings.push(ValidationWarning {
            question_id: None,
            message: "template has no sections".into(),
        });
    }

    for section in &template.sections {
        if section.duration_seconds == 0 {
            warnings.push(ValidationWarning {
                question_id: None,
                message: format!("section '{}' has a zero duration", section.name),
            });
        }
        if section.questions.is_empty() {
            warnings.push(ValidationWarning {
                question_id: None,
                message: format!("section '{}' has no questions", section.name),
            });
        }
    }

    let mut seen_ids = HashSet::new();
    for question in &bundle.questions {
        if !seen_ids.insert(&question.id) {
            warnings.push(ValidationWarning {
                question_id: Some(question.id.clone()),
                message: format!("duplicate question ID: {}", question.id),
            });
        }
    }

    for question in &bundle.questions {
        if question.kind != QuestionKind::SingleSelect {
            continue;
        }
        if question.options.len() < 2 {
            warnings.push(ValidationWarning {
                question_id: Some(question.id.clone()),
                message: "single-select question has fewer than 2 options".into(),
            });
        }
        match question.answer_key {
            Some(key) if key as usize >= question.options.len() => {
                warnings.push(ValidationWarning {
                    question_id: Some(question.id.clone()),
                    message: format!("answer {key} is not one of the options"),
                });
            }
            None => warnings.push(ValidationWarning {
                question_id: Some(question.id.clone()),
                message: "no answer key, question will be graded as incorrect".into(),
            }),
            _ => {}
        }
    }

    warnings
}
