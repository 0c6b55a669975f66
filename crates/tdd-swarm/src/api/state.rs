use std::sync::Arc;

use coordination::escalation::EscalationTracker;
use coordination::task::FingerprintStrategy;

use crate::config::SwarmConfig;
use crate::gateway::{SecurityGate, TaskClassifier};
use crate::inference::InferenceBackend;
use crate::residency::{MemoryProbe, ResidencyManager};
use crate::roles::{InferenceRoles, RoleExecutor};

/// Shared handles for every request. Cloned per handler.
#[derive(Clone)]
pub struct AppState {
    pub classifier: Arc<dyn TaskClassifier>,
    pub roles: Arc<dyn RoleExecutor>,
    pub residency: Arc<ResidencyManager>,
    pub escalation: Arc<EscalationTracker>,
    pub backend: Arc<dyn InferenceBackend>,
    pub fingerprint: FingerprintStrategy,
}

impl AppState {
    pub fn new(
        classifier: Arc<dyn TaskClassifier>,
        roles: Arc<dyn RoleExecutor>,
        residency: Arc<ResidencyManager>,
        escalation: Arc<EscalationTracker>,
        backend: Arc<dyn InferenceBackend>,
    ) -> Self {
        Self {
            classifier,
            roles,
            residency,
            escalation,
            backend,
            fingerprint: FingerprintStrategy::default(),
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: FingerprintStrategy) -> Self {
        self.fingerprint = fingerprint;
        self
    }

    /// Wire the inference-backed gate, residency manager and role executor.
    pub fn from_config(
        config: &SwarmConfig,
        backend: Arc<dyn InferenceBackend>,
        memory: Arc<dyn MemoryProbe>,
    ) -> anyhow::Result<Self> {
        let classifier = Arc::new(SecurityGate::from_config(config, backend.clone())?);
        let residency = Arc::new(ResidencyManager::from_config(config, backend.clone(), memory));
        let roles = Arc::new(InferenceRoles::from_config(config, backend.clone(), residency.clone()));
        let escalation = Arc::new(EscalationTracker::new(config.escalation_threshold));

        Ok(Self::new(classifier, roles, residency, escalation, backend).with_fingerprint(config.fingerprint))
    }

    pub fn fingerprint_of(&self, prompt: &str, reference: Option<&str>) -> String {
        self.fingerprint.fingerprint(prompt, reference)
    }
}
