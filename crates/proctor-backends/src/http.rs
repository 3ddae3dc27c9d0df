//! HTTP backend for the attempt API.
//!
//! Routes:
//! - `POST  /attempts` start or resume for a template
//! - `GET   /attempts/{id}` full attempt detail
//! - `PATCH /attempts/{id}/progress` apply a progress batch
//! - `POST  /attempts/{id}/submit` finalize and grade
//! - `GET   /questions/{id}` question content

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::instrument;

use proctor_core::model::{Attempt, QuestionContent};
use proctor_core::traits::{
    AttemptStore, Grader, ProgressBatch, QuestionBank, SaveAck, SubmitRequest, SubmitResponse,
};

use crate::error::{self, BackendError};

pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Client for a remote attempt API.
pub struct HttpBackend {
    base_url: String,
    api_token: Option<String>,
    timeout_secs: u64,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct StartAttemptBody<'a> {
    template_id: &'a str,
}

impl HttpBackend {
    pub fn new(base_url: &str, api_token: Option<String>, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token: api_token.filter(|t| !t.is_empty()),
            timeout_secs,
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: reqwest::Method, route: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .request(method, format!("{}{}", self.base_url, route))
            .header("content-type", "application/json");
        if let Some(token) = &self.api_token {
            req = req.header("Authorization", format!("Bearer {token}"));
        }
        req
    }

    async fn execute<T: DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> Result<T> {
        let response = req
            .send()
            .await
            .map_err(|e| error::from_transport(e, &self.base_url, self.timeout_secs))?;

        let status = response.status().as_u16();
        if status >= 400 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = response.text().await.unwrap_or_default();
            return Err(error::from_status(status, retry_after.as_deref(), body).into());
        }

        let parsed = response.json().await.map_err(|e| BackendError::ApiError {
            status: 0,
            message: format!("failed to parse response: {e}"),
        })?;
        Ok(parsed)
    }
}

#[async_trait]
impl AttemptStore for HttpBackend {
    fn name(&self) -> &str {
        "http"
    }

    #[instrument(skip(self))]
    async fn start_or_resume_attempt(&self, template_id: &str) -> Result<Attempt> {
        let req = self
            .request(reqwest::Method::POST, "/attempts")
            .json(&StartAttemptBody { template_id });
        self.execute(req).await
    }

    #[instrument(skip(self))]
    async fn load_attempt_detail(&self, attempt_id: &str) -> Result<Attempt> {
        let req = self.request(reqwest::Method::GET, &format!("/attempts/{attempt_id}"));
        self.execute(req).await
    }

    #[instrument(skip(self, batch), fields(attempt = %batch.attempt_id, sequence = batch.sequence))]
    async fn save_progress(&self, batch: &ProgressBatch) -> Result<SaveAck> {
        let req = self
            .request(
                reqwest::Method::PATCH,
                &format!("/attempts/{}/progress", batch.attempt_id),
            )
            .json(batch);
        self.execute(req).await
    }
}

#[async_trait]
impl Grader for HttpBackend {
    #[instrument(skip(self, request), fields(attempt = %request.attempt_id, trigger = %request.trigger))]
    async fn submit_attempt(&self, request: &SubmitRequest) -> Result<SubmitResponse> {
        let req = self
            .request(
                reqwest::Method::POST,
                &format!("/attempts/{}/submit", request.attempt_id),
            )
            .json(request);
        self.execute(req).await
    }
}

#[async_trait]
impl QuestionBank for HttpBackend {
    #[instrument(skip(self))]
    async fn fetch_question(&self, question_id: &str) -> Result<QuestionContent> {
        let req = self.request(reqwest::Method::GET, &format!("/questions/{question_id}"));
        self.execute(req).await
    }
}
