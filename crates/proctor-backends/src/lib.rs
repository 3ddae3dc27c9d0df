//! proctor-backends: Persistence, grading, and question bank backends.
//!
//! Implements the `AttemptStore`, `Grader`, and `QuestionBank` traits over an
//! HTTP attempt API and over process memory, and builds either from config.

pub mod config;
pub mod error;
pub mod http;
pub mod memory;

pub use config::{
    create_backend, load_config, load_config_from, Backend, BackendConfig, ProctorConfig,
};
pub use error::BackendError;
pub use http::HttpBackend;
pub use memory::MemoryBackend;
