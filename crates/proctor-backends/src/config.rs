//! Backend configuration and factory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use proctor_core::parser::load_template_directory;
use proctor_core::session::SessionConfig;
use proctor_core::sync::RetryPolicy;
use proctor_core::traits::{AttemptStore, Grader, QuestionBank};

use crate::http::{HttpBackend, DEFAULT_TIMEOUT_SECS};
use crate::memory::MemoryBackend;

/// Which backend to talk to.
///
/// Note: Custom Debug impl masks the API token to prevent accidental exposure in logs.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    Http {
        base_url: String,
        #[serde(default)]
        api_token: Option<String>,
        #[serde(default = "default_timeout")]
        timeout_secs: u64,
    },
    Memory {
        #[serde(default = "default_user")]
        user_id: String,
        /// Directory of TOML templates served by the backend.
        #[serde(default = "default_templates_dir")]
        templates_dir: PathBuf,
        /// JSON file the backend persists attempts to.
        #[serde(default)]
        state_file: Option<PathBuf>,
    },
}

impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendConfig::Http {
                base_url,
                api_token,
                timeout_secs,
            } => f
                .debug_struct("Http")
                .field("base_url", base_url)
                .field("api_token", &api_token.as_ref().map(|_| "***"))
                .field("timeout_secs", timeout_secs)
                .finish(),
            BackendConfig::Memory {
                user_id,
                templates_dir,
                state_file,
            } => f
                .debug_struct("Memory")
                .field("user_id", user_id)
                .field("templates_dir", templates_dir)
                .field("state_file", state_file)
                .finish(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Memory {
            user_id: default_user(),
            templates_dir: default_templates_dir(),
            state_file: None,
        }
    }
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}
fn default_user() -> String {
    "local".to_string()
}
fn default_templates_dir() -> PathBuf {
    PathBuf::from("./templates")
}

/// Session timing and retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Flush after this many counted seconds.
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
    /// Max retries on backend errors.
    #[serde(default = "default_retries")]
    pub max_retries: u32,
    /// Delay before the first retry in milliseconds; doubled per retry.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
    /// Gap between ticks that counts as clock drift.
    #[serde(default = "default_drift_threshold")]
    pub drift_threshold_secs: u64,
}

fn default_flush_interval() -> u64 {
    15
}
fn default_retries() -> u32 {
    3
}
fn default_retry_delay() -> u64 {
    500
}
fn default_drift_threshold() -> u64 {
    3
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            flush_interval_secs: default_flush_interval(),
            max_retries: default_retries(),
            retry_delay_ms: default_retry_delay(),
            drift_threshold_secs: default_drift_threshold(),
        }
    }
}

impl SessionSettings {
    pub fn to_session_config(&self) -> SessionConfig {
        SessionConfig {
            flush_interval_ticks: self.flush_interval_secs.max(1),
            tick_period: Duration::from_secs(1),
            drift_threshold: Duration::from_secs(self.drift_threshold_secs),
            retry: RetryPolicy {
                max_retries: self.max_retries,
                retry_delay: Duration::from_millis(self.retry_delay_ms),
                max_delay: Duration::from_secs(30),
            },
        }
    }
}

/// Top-level proctor configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProctorConfig {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub session: SessionSettings,
}

/// Resolve environment variable references like `${VAR_NAME}` in a string.
fn resolve_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    while let Some(start) = result.find("${") {
        if let Some(end) = result[start..].find('}') {
            let var_name = &result[start + 2..start + end];
            let value = std::env::var(var_name).unwrap_or_default();
            result = format!(
                "{}{}{}",
                &result[..start],
                value,
                &result[start + end + 1..]
            );
        } else {
            break;
        }
    }
    result
}

fn resolve_backend_config(config: &BackendConfig) -> BackendConfig {
    match config {
        BackendConfig::Http {
            base_url,
            api_token,
            timeout_secs,
        } => BackendConfig::Http {
            base_url: resolve_env_vars(base_url),
            api_token: api_token.as_ref().map(|t| resolve_env_vars(t)),
            timeout_secs: *timeout_secs,
        },
        BackendConfig::Memory {
            user_id,
            templates_dir,
            state_file,
        } => BackendConfig::Memory {
            user_id: resolve_env_vars(user_id),
            templates_dir: templates_dir.clone(),
            state_file: state_file.clone(),
        },
    }
}

/// Load configuration from well-known paths.
///
/// Search order:
/// 1. `proctor.toml` in the current directory
/// 2. `~/.config/proctor/config.toml`
///
/// Environment variable override: `PROCTOR_API_TOKEN`.
pub fn load_config() -> Result<ProctorConfig> {
    load_config_from(None)
}

/// Load config from an explicit path, or search the default locations.
pub fn load_config_from(path: Option<&Path>) -> Result<ProctorConfig> {
    let config_path = if let Some(p) = path {
        if p.exists() {
            Some(p.to_path_buf())
        } else {
            anyhow::bail!("config file not found: {}", p.display());
        }
    } else {
        let local = PathBuf::from("proctor.toml");
        if local.exists() {
            Some(local)
        } else {
            dirs_path()
                .map(|home| home.join("config.toml"))
                .filter(|global| global.exists())
        }
    };

    let mut config = match config_path {
        Some(path) => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config: {}", path.display()))?;
            parse_config_str(&content)
                .with_context(|| format!("failed to parse config: {}", path.display()))?
        }
        None => ProctorConfig::default(),
    };

    config.backend = resolve_backend_config(&config.backend);

    if let Ok(token) = std::env::var("PROCTOR_API_TOKEN") {
        if let BackendConfig::Http { api_token, .. } = &mut config.backend {
            *api_token = Some(token);
        }
    }

    Ok(config)
}

pub fn parse_config_str(content: &str) -> Result<ProctorConfig> {
    Ok(toml::from_str::<ProctorConfig>(content)?)
}

fn dirs_path() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(|h| PathBuf::from(h).join(".config").join("proctor"))
}

/// The three boundaries, backed by one backend instance.
#[derive(Clone)]
pub struct Backend {
    pub store: Arc<dyn AttemptStore>,
    pub grader: Arc<dyn Grader>,
    pub questions: Arc<dyn QuestionBank>,
}

impl Backend {
    fn from_shared<B>(backend: Arc<B>) -> Self
    where
        B: AttemptStore + Grader + QuestionBank + 'static,
    {
        Self {
            store: backend.clone(),
            grader: backend.clone(),
            questions: backend,
        }
    }
}

/// Create a backend from its configuration.
pub fn create_backend(config: &BackendConfig) -> Result<Backend> {
    match config {
        BackendConfig::Http {
            base_url,
            api_token,
            timeout_secs,
        } => {
            let backend = HttpBackend::new(base_url, api_token.clone(), *timeout_secs)?;
            Ok(Backend::from_shared(Arc::new(backend)))
        }
        BackendConfig::Memory {
            user_id,
            templates_dir,
            state_file,
        } => {
            let templates = if templates_dir.is_dir() {
                load_template_directory(templates_dir)?
            } else {
                tracing::warn!(
                    "templates directory {} not found, serving no templates",
                    templates_dir.display()
                );
                Vec::new()
            };
            let mut backend = MemoryBackend::new(user_id, templates);
            if let Some(path) = state_file {
                backend = backend.with_state_file(path)?;
            }
            Ok(Backend::from_shared(Arc::new(backend)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_env_vars_basic() {
        std::env::set_var("_PROCTOR_TEST_VAR", "hello");
        assert_eq!(resolve_env_vars("${_PROCTOR_TEST_VAR}"), "hello");
        assert_eq!(
            resolve_env_vars("prefix_${_PROCTOR_TEST_VAR}_suffix"),
            "prefix_hello_suffix"
        );
        std::env::remove_var("_PROCTOR_TEST_VAR");
    }

    #[test]
    fn default_config() {
        let config = ProctorConfig::default();
        assert!(matches!(config.backend, BackendConfig::Memory { .. }));
        assert_eq!(config.session.flush_interval_secs, 15);
        assert_eq!(config.session.max_retries, 3);

        let session = config.session.to_session_config();
        assert_eq!(session.flush_interval_ticks, 15);
        assert_eq!(session.retry.retry_delay, Duration::from_millis(500));
    }

    #[test]
    fn parse_http_backend() {
        let toml_str = r#"
[backend]
type = "http"
base_url = "https://exams.example.com/api"
api_token = "secret-token"

[session]
flush_interval_secs = 30
"#;
        let config = parse_config_str(toml_str).unwrap();
        assert!(matches!(
            &config.backend,
            BackendConfig::Http { timeout_secs: 30, .. }
        ));
        assert_eq!(config.session.flush_interval_secs, 30);
        assert_eq!(config.session.retry_delay_ms, 500);

        let debug = format!("{:?}", config.backend);
        assert!(debug.contains("***"));
        assert!(!debug.contains("secret-token"));
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let err = load_config_from(Some(Path::new("/nonexistent/proctor.toml"))).unwrap_err();
        assert!(err.to_string().contains("config file not found"));
    }

    #[test]
    fn load_from_file_resolves_vars() {
        std::env::set_var("_PROCTOR_TEST_URL", "http://localhost:8080");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proctor.toml");
        std::fs::write(
            &path,
            "[backend]\ntype = \"http\"\nbase_url = \"${_PROCTOR_TEST_URL}/v1\"\n",
        )
        .unwrap();

        let config = load_config_from(Some(&path)).unwrap();
        match config.backend {
            BackendConfig::Http { base_url, .. } => {
                assert_eq!(base_url, "http://localhost:8080/v1")
            }
            other => panic!("unexpected backend: {other:?}"),
        }
        std::env::remove_var("_PROCTOR_TEST_URL");
    }

    #[test]
    fn memory_backend_from_templates_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("t.toml"),
            "[template]\nid = \"t\"\nname = \"T\"\n\n[[sections]]\nname = \"S\"\nduration_secs = 10\n",
        )
        .unwrap();
        let backend = create_backend(&BackendConfig::Memory {
            user_id: "me".into(),
            templates_dir: dir.path().to_path_buf(),
            state_file: None,
        })
        .unwrap();
        assert_eq!(backend.store.name(), "memory");
    }
}
