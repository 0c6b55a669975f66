//! Inference host client.
//!
//! [`InferenceBackend`] is the seam between the pipeline and the model host.
//! [`OllamaClient`] speaks the Ollama `/api/generate` protocol; tests swap in
//! scripted backends. Callers own timeouts (`tokio::time::timeout`) so every
//! backend gets the same deadline handling.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from the inference host.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("inference transport error: {0}")]
    Transport(String),

    #[error("inference host returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("inference call timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("undecodable inference response: {0}")]
    Decode(String),
}

/// Sampling options forwarded to the host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerateOptions {
    pub temperature: f32,
    pub num_ctx: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_predict: Option<u32>,
}

/// Body of a non-streaming `/api/generate` call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerateRequest {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub prompt: String,
    pub stream: bool,
    /// `"json"` to force a JSON answer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    pub keep_alive: serde_json::Value,
    pub options: GenerateOptions,
}

impl GenerateRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system: None,
            prompt: prompt.into(),
            stream: false,
            format: None,
            keep_alive: serde_json::Value::from("5m"),
            options: GenerateOptions {
                temperature: 0.7,
                num_ctx: 16_000,
                num_predict: None,
            },
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn json_format(mut self) -> Self {
        self.format = Some("json".into());
        self
    }

    pub fn with_keep_alive(mut self, hint: &str) -> Self {
        self.keep_alive = keep_alive_value(hint);
        self
    }

    pub fn with_options(mut self, options: GenerateOptions) -> Self {
        self.options = options;
        self
    }
}

/// Numeric keep-alive hints are sent as seconds, anything else as a duration string.
pub fn keep_alive_value(hint: &str) -> serde_json::Value {
    match hint.trim().parse::<i64>() {
        Ok(secs) => serde_json::Value::from(secs),
        Err(_) => serde_json::Value::from(hint.trim()),
    }
}

/// Non-streaming generate response.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GenerateResponse {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub response: String,
    /// Tokens generated.
    #[serde(default)]
    pub eval_count: u64,
    #[serde(default)]
    pub done: bool,
}

/// Model host operations used by the runtime.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse, InferenceError>;

    /// Ask the host to drop `model` from memory.
    async fn unload(&self, model: &str) -> Result<(), InferenceError>;

    /// Models the host currently reports as loaded.
    async fn loaded_models(&self) -> Result<Vec<String>, InferenceError>;

    /// Connectivity probe.
    async fn ping(&self) -> Result<(), InferenceError>;
}

#[derive(Deserialize)]
struct PsResponse {
    #[serde(default)]
    models: Vec<PsModel>,
}

#[derive(Deserialize)]
struct PsModel {
    name: String,
}

/// Ollama HTTP client.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    base_url: String,
    http: reqwest::Client,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

fn transport(e: reqwest::Error) -> InferenceError {
    if e.is_timeout() {
        InferenceError::Timeout { seconds: 0 }
    } else {
        InferenceError::Transport(e.to_string())
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, InferenceError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(InferenceError::Status {
        status: status.as_u16(),
        body: body.chars().take(500).collect(),
    })
}

#[async_trait]
impl InferenceBackend for OllamaClient {
    async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse, InferenceError> {
        let resp = self
            .http
            .post(self.url("/api/generate"))
            .json(request)
            .send()
            .await
            .map_err(transport)?;
        let resp = check_status(resp).await?;
        resp.json::<GenerateResponse>()
            .await
            .map_err(|e| InferenceError::Decode(e.to_string()))
    }

    async fn unload(&self, model: &str) -> Result<(), InferenceError> {
        let body = serde_json::json!({
            "model": model,
            "prompt": "",
            "keep_alive": 0,
        });
        let resp = self
            .http
            .post(self.url("/api/generate"))
            .json(&body)
            .send()
            .await
            .map_err(transport)?;
        check_status(resp).await?;
        Ok(())
    }

    async fn loaded_models(&self) -> Result<Vec<String>, InferenceError> {
        let resp = self
            .http
            .get(self.url("/api/ps"))
            .send()
            .await
            .map_err(transport)?;
        let resp = check_status(resp).await?;
        let ps: PsResponse = resp
            .json()
            .await
            .map_err(|e| InferenceError::Decode(e.to_string()))?;
        Ok(ps.models.into_iter().map(|m| m.name).collect())
    }

    async fn ping(&self) -> Result<(), InferenceError> {
        let resp = self
            .http
            .get(&self.base_url)
            .send()
            .await
            .map_err(transport)?;
        check_status(resp).await?;
        Ok(())
    }
}
