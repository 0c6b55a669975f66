//! Role invocation: resolve a role to its executor, make it resident, call it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use coordination::router::Role;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{ExecutorSpec, SwarmConfig};
use crate::inference::{GenerateOptions, GenerateRequest, InferenceBackend, InferenceError};
use crate::prompts::preamble_for;
use crate::residency::{ContextSnapshot, ResidencyError, ResidencyManager};

#[derive(Debug, Error)]
pub enum RoleError {
    #[error("no executor configured for role {0}")]
    NoExecutor(Role),

    #[error(transparent)]
    Residency(#[from] ResidencyError),

    #[error("{role} call failed: {source}")]
    Inference {
        role: Role,
        #[source]
        source: InferenceError,
    },

    #[error("{role} timed out after {seconds}s")]
    Timeout { role: Role, seconds: u64 },
}

/// One role invocation's answer.
#[derive(Debug, Clone, Serialize)]
pub struct RoleReply {
    pub role: Role,
    /// Executor id that produced the answer.
    pub model: String,
    /// Executor display name.
    pub agent: String,
    pub text: String,
    pub tokens: u64,
    pub latency_ms: u64,
    /// Host memory used after the call minus before, floored at zero.
    pub memory_delta_gb: f64,
}

/// Per-call sampling overrides.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// Anything that can answer as a role.
#[async_trait]
pub trait RoleExecutor: Send + Sync {
    async fn invoke(
        &self,
        role: Role,
        prompt: &str,
        snapshot: &ContextSnapshot,
    ) -> Result<RoleReply, RoleError> {
        self.invoke_with(role, prompt, snapshot, CallOptions::default())
            .await
    }

    async fn invoke_with(
        &self,
        role: Role,
        prompt: &str,
        snapshot: &ContextSnapshot,
        options: CallOptions,
    ) -> Result<RoleReply, RoleError>;
}

/// Default temperature per role.
fn role_temperature(role: Role) -> f32 {
    match role {
        Role::Reviewer | Role::Tester => 0.2,
        Role::Architect | Role::Documenter => 0.5,
        _ => 0.7,
    }
}

/// Role executor backed by the inference host and the residency manager.
pub struct InferenceRoles {
    backend: Arc<dyn InferenceBackend>,
    residency: Arc<ResidencyManager>,
    timeout: Duration,
}

impl InferenceRoles {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        residency: Arc<ResidencyManager>,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            residency,
            timeout,
        }
    }

    pub fn from_config(
        config: &SwarmConfig,
        backend: Arc<dyn InferenceBackend>,
        residency: Arc<ResidencyManager>,
    ) -> Self {
        Self::new(backend, residency, config.role_timeout)
    }

    fn executor_for(&self, role: Role) -> Result<ExecutorSpec, RoleError> {
        self.residency
            .catalog()
            .for_role(role)
            .cloned()
            .ok_or(RoleError::NoExecutor(role))
    }
}

#[async_trait]
impl RoleExecutor for InferenceRoles {
    async fn invoke_with(
        &self,
        role: Role,
        prompt: &str,
        snapshot: &ContextSnapshot,
        options: CallOptions,
    ) -> Result<RoleReply, RoleError> {
        let spec = self.executor_for(role)?;
        let started = Instant::now();
        let memory_before = self.residency.memory();

        let lease = self.residency.prepare(&spec.id, snapshot).await?;
        debug!(role = %role, executor = %spec.id, swapped = lease.swapped(), "Invoking role");

        let request = GenerateRequest::new(&spec.id, prompt)
            .with_system(preamble_for(role))
            .with_keep_alive(&spec.keep_alive)
            .with_options(GenerateOptions {
                temperature: options.temperature.unwrap_or_else(|| role_temperature(role)),
                num_ctx: spec.context_length,
                num_predict: options.max_tokens,
            });

        let response = match tokio::time::timeout(self.timeout, self.backend.generate(&request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(source)) => return Err(RoleError::Inference { role, source }),
            Err(_) => {
                return Err(RoleError::Timeout {
                    role,
                    seconds: self.timeout.as_secs(),
                })
            }
        };
        drop(lease);

        let memory_after = self.residency.memory();
        let latency_ms = started.elapsed().as_millis() as u64;
        info!(
            role = %role,
            agent = %spec.name,
            latency_ms,
            tokens = response.eval_count,
            "Role answered"
        );

        Ok(RoleReply {
            role,
            model: spec.id,
            agent: spec.name,
            text: response.response,
            tokens: response.eval_count,
            latency_ms,
            memory_delta_gb: (memory_after.used_gb - memory_before.used_gb).max(0.0),
        })
    }
}
