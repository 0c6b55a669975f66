//! Runtime configuration.
//!
//! Values come from `SWARM_*` environment variables with built-in defaults.
//! The executor catalog can be replaced by a TOML file named in
//! `SWARM_EXECUTORS_FILE`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use coordination::router::Role;
use coordination::task::FingerprintStrategy;
use serde::{Deserialize, Serialize};

/// Whether an executor may be evicted to make room for another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResidencyPolicy {
    /// Never evicted (the classifier's own model).
    AlwaysResident,
    /// Loaded when needed, evicted under memory pressure.
    SwapOnDemand,
}

impl std::fmt::Display for ResidencyPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlwaysResident => write!(f, "always-resident"),
            Self::SwapOnDemand => write!(f, "swap-on-demand"),
        }
    }
}

/// A configured inference executor (one model on the inference host).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorSpec {
    /// Model identifier on the inference host.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Roles served by this executor.
    #[serde(default)]
    pub roles: Vec<Role>,
    /// Whether this executor answers classification requests.
    #[serde(default)]
    pub classifier: bool,
    pub memory_gb: f64,
    pub residency: ResidencyPolicy,
    /// Loading this executor evicts every other swap-on-demand executor.
    #[serde(default)]
    pub exclusive: bool,
    /// Keep-alive hint forwarded to the inference host.
    pub keep_alive: String,
    pub context_length: u32,
    #[serde(default)]
    pub description: String,
}

impl ExecutorSpec {
    pub fn is_always_resident(&self) -> bool {
        self.residency == ResidencyPolicy::AlwaysResident
    }
}

/// The set of executors the runtime may route to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorCatalog {
    #[serde(rename = "executor")]
    pub executors: Vec<ExecutorSpec>,
}

impl Default for ExecutorCatalog {
    fn default() -> Self {
        Self {
            executors: vec![
                ExecutorSpec {
                    id: "qwen2.5:7b".into(),
                    name: "Router".into(),
                    roles: vec![Role::Documenter],
                    classifier: true,
                    memory_gb: 4.7,
                    residency: ResidencyPolicy::AlwaysResident,
                    exclusive: false,
                    keep_alive: "-1".into(),
                    context_length: 32_000,
                    description: "Task classification, input guardrail, summaries and documentation"
                        .into(),
                },
                ExecutorSpec {
                    id: "qwen3-coder-next:q4_K_M".into(),
                    name: "Architect".into(),
                    roles: vec![Role::Architect],
                    classifier: false,
                    memory_gb: 51.0,
                    residency: ResidencyPolicy::SwapOnDemand,
                    exclusive: true,
                    keep_alive: "0".into(),
                    context_length: 256_000,
                    description: "Requirement analysis, architecture and large refactoring plans"
                        .into(),
                },
                ExecutorSpec {
                    id: "qwen3-coder:30b".into(),
                    name: "Coder".into(),
                    roles: vec![Role::Coder],
                    classifier: false,
                    memory_gb: 18.0,
                    residency: ResidencyPolicy::SwapOnDemand,
                    exclusive: false,
                    keep_alive: "2h".into(),
                    context_length: 32_000,
                    description: "Feature implementation and logic fixes".into(),
                },
                ExecutorSpec {
                    id: "qwen3:14b".into(),
                    name: "Reviewer".into(),
                    roles: vec![Role::Reviewer, Role::Tester],
                    classifier: false,
                    memory_gb: 9.3,
                    residency: ResidencyPolicy::SwapOnDemand,
                    exclusive: false,
                    keep_alive: "30m".into(),
                    context_length: 32_000,
                    description: "Code review, output guardrail and test authoring".into(),
                },
            ],
        }
    }
}

impl ExecutorCatalog {
    /// Load a catalog from a TOML file of `[[executor]]` tables.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).context(format!("Failed to read {}", path.display()))?;
        let catalog: ExecutorCatalog =
            toml::from_str(&content).context("Failed to parse executor catalog TOML")?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Exactly one classifier, unique ids, and an executor for the coder role.
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for exec in &self.executors {
            if !ids.insert(exec.id.as_str()) {
                bail!("duplicate executor id '{}'", exec.id);
            }
            if !(exec.memory_gb.is_finite() && exec.memory_gb > 0.0) {
                bail!("executor '{}' has invalid memory_gb", exec.id);
            }
        }
        match self.executors.iter().filter(|e| e.classifier).count() {
            1 => {}
            n => bail!("executor catalog needs exactly one classifier, found {n}"),
        }
        if !self.executors.iter().any(|e| e.roles.contains(&Role::Coder)) {
            bail!("executor catalog has no executor for the coder role");
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&ExecutorSpec> {
        self.executors.iter().find(|e| e.id == id)
    }

    /// The classifier executor.
    pub fn classifier(&self) -> Option<&ExecutorSpec> {
        self.executors.iter().find(|e| e.classifier)
    }

    /// Executor serving `role`, falling back to the coder's executor.
    pub fn for_role(&self, role: Role) -> Option<&ExecutorSpec> {
        self.executors
            .iter()
            .find(|e| e.roles.contains(&role))
            .or_else(|| self.executors.iter().find(|e| e.roles.contains(&Role::Coder)))
    }
}

/// Docker sandbox settings.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Use the container when available; `false` always runs locally.
    pub enabled: bool,
    pub image: String,
    pub container_name: String,
    /// Mount point of the project root inside the container.
    pub workdir: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: bool_from_env("SWARM_SANDBOX", true),
            image: std::env::var("SWARM_SANDBOX_IMAGE")
                .unwrap_or_else(|_| "python:3.11-slim".into()),
            container_name: std::env::var("SWARM_SANDBOX_NAME")
                .unwrap_or_else(|_| "tdd-swarm-sandbox".into()),
            workdir: "/app".into(),
        }
    }
}

/// Top-level swarm configuration.
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    /// Ollama-compatible inference host.
    pub inference_url: String,
    /// HTTP API bind address.
    pub bind_addr: String,
    /// Directory artifacts are written under.
    pub project_root: PathBuf,
    /// Where context snapshots are persisted before swaps.
    pub snapshot_dir: PathBuf,
    /// Optional markdown learning log appended after successful runs.
    pub learning_log: Option<PathBuf>,
    /// Memory available to executors on the inference host.
    pub memory_budget_gb: f64,
    /// Headroom kept free when sizing swaps.
    pub safety_margin_gb: f64,
    pub classifier_timeout: Duration,
    pub role_timeout: Duration,
    pub test_timeout: Duration,
    pub unload_timeout: Duration,
    pub max_tdd_retries: u32,
    pub max_review_retries: u32,
    pub escalation_threshold: u32,
    /// Consult the design role when escalation is recommended mid-loop.
    pub escalate_on_advice: bool,
    pub fingerprint: FingerprintStrategy,
    pub test_command: String,
    pub sandbox: SandboxConfig,
    pub executors: ExecutorCatalog,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            inference_url: std::env::var("SWARM_INFERENCE_URL")
                .unwrap_or_else(|_| "http://localhost:11434".into()),
            bind_addr: std::env::var("SWARM_BIND").unwrap_or_else(|_| "0.0.0.0:8000".into()),
            project_root: std::env::var("SWARM_PROJECT_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("dev_repo")),
            snapshot_dir: std::env::var("SWARM_SNAPSHOT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("shared")),
            learning_log: std::env::var("SWARM_LEARNING_LOG").ok().map(PathBuf::from),
            memory_budget_gb: f64_from_env("SWARM_MEMORY_BUDGET_GB", 64.0),
            safety_margin_gb: f64_from_env("SWARM_SAFETY_MARGIN_GB", 3.0),
            classifier_timeout: timeout_from_env("SWARM_CLASSIFIER_TIMEOUT_SECS", 120),
            role_timeout: timeout_from_env("SWARM_ROLE_TIMEOUT_SECS", 600),
            test_timeout: timeout_from_env("SWARM_TEST_TIMEOUT_SECS", 30),
            unload_timeout: timeout_from_env("SWARM_UNLOAD_TIMEOUT_SECS", 30),
            max_tdd_retries: u32_from_env("SWARM_MAX_TDD_RETRIES", 5),
            max_review_retries: u32_from_env("SWARM_MAX_REVIEW_RETRIES", 2),
            escalation_threshold: u32_from_env("SWARM_ESCALATION_THRESHOLD", 2),
            escalate_on_advice: bool_from_env("SWARM_ESCALATE_ON_ADVICE", false),
            fingerprint: std::env::var("SWARM_FINGERPRINT")
                .ok()
                .and_then(|v| FingerprintStrategy::parse(&v))
                .unwrap_or_default(),
            test_command: std::env::var("SWARM_TEST_COMMAND")
                .unwrap_or_else(|_| "pytest -v".into()),
            sandbox: SandboxConfig::default(),
            executors: ExecutorCatalog::default(),
        }
    }
}

impl SwarmConfig {
    /// Defaults plus environment, plus the executor catalog file if one is named.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("SWARM_EXECUTORS_FILE") {
            config.executors = ExecutorCatalog::from_file(Path::new(&path))?;
        }
        config.executors.validate()?;
        Ok(config)
    }
}

fn timeout_from_env(var: &str, default_secs: u64) -> Duration {
    let secs = std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default_secs);
    Duration::from_secs(secs)
}

fn u32_from_env(var: &str, default: u32) -> u32 {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

fn f64_from_env(var: &str, default: f64) -> f64 {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v >= 0.0)
        .unwrap_or(default)
}

fn bool_from_env(var: &str, default: bool) -> bool {
    std::env::var(var)
        .ok()
        .map(|v| {
            matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}

/// Check if the inference host is reachable.
pub async fn check_endpoint(url: &str) -> bool {
    match reqwest::Client::new()
        .get(url)
        .timeout(Duration::from_secs(5))
        .send()
        .await
    {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_catalog_is_valid() {
        let catalog = ExecutorCatalog::default();
        catalog.validate().unwrap();
        assert_eq!(catalog.classifier().unwrap().id, "qwen2.5:7b");
        assert_eq!(catalog.for_role(Role::Architect).unwrap().id, "qwen3-coder-next:q4_K_M");
        assert_eq!(catalog.for_role(Role::Tester).unwrap().id, "qwen3:14b");
        assert_eq!(catalog.for_role(Role::Documenter).unwrap().id, "qwen2.5:7b");
    }

    #[test]
    fn test_unmapped_role_falls_back_to_coder() {
        let catalog = ExecutorCatalog::default();
        assert_eq!(catalog.for_role(Role::Frontier).unwrap().id, "qwen3-coder:30b");
    }

    #[test]
    fn test_catalog_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("executors.toml");
        std::fs::write(
            &path,
            r#"
[[executor]]
id = "small"
name = "Router"
classifier = true
roles = ["documenter"]
memory_gb = 2.0
residency = "always-resident"
keep_alive = "-1"
context_length = 8000

[[executor]]
id = "coder"
name = "Coder"
roles = ["coder", "reviewer"]
memory_gb = 8.0
residency = "swap-on-demand"
keep_alive = "1h"
context_length = 16000
description = "all-rounder"
"#,
        )
        .unwrap();

        let catalog = ExecutorCatalog::from_file(&path).unwrap();
        assert_eq!(catalog.executors.len(), 2);
        assert!(catalog.get("small").unwrap().is_always_resident());
        assert_eq!(catalog.for_role(Role::Reviewer).unwrap().id, "coder");
        assert!(!catalog.get("coder").unwrap().exclusive);
    }

    #[test]
    fn test_catalog_rejects_two_classifiers() {
        let mut catalog = ExecutorCatalog::default();
        catalog.executors[1].classifier = true;
        assert!(catalog.validate().is_err());
    }

    #[test]
    fn test_catalog_rejects_duplicate_ids() {
        let mut catalog = ExecutorCatalog::default();
        catalog.executors[2].id = catalog.executors[3].id.clone();
        assert!(catalog.validate().is_err());
    }

    #[test]
    fn test_residency_display() {
        assert_eq!(ResidencyPolicy::AlwaysResident.to_string(), "always-resident");
        assert_eq!(ResidencyPolicy::SwapOnDemand.to_string(), "swap-on-demand");
    }
}
