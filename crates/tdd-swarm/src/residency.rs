//! Resource orchestrator: which executors are resident on the inference host.
//!
//! The registry is shared by every task in the process. Two locks guard it,
//! always taken in this order:
//!
//! 1. `swap_gate` (`RwLock<()>`): every in-flight invocation holds a read
//!    lease for as long as it uses its executor; a swap takes the write side,
//!    so nothing is evicted while another task is mid-call.
//! 2. `registry` (`Mutex`): short critical sections for read-modify-write of
//!    the resident set. Never held across an unload.
//!
//! Eviction is best-effort: entries leave the registry before the host is
//! asked to unload them, and unload failures are only logged.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedRwLockReadGuard, RwLock};
use tracing::{debug, info, warn};

use crate::config::{ExecutorCatalog, ExecutorSpec, ResidencyPolicy, SwarmConfig};
use crate::inference::InferenceBackend;

/// File name of the persisted context snapshot.
pub const SNAPSHOT_FILE: &str = "temp_context.json";

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Error)]
pub enum ResidencyError {
    #[error("unknown executor '{0}'")]
    UnknownExecutor(String),
}

/// Host memory figures in GB.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub total_gb: f64,
    pub used_gb: f64,
    pub available_gb: f64,
    pub percent_used: f64,
}

impl MemorySnapshot {
    pub fn from_bytes(total: u64, used: u64, available: u64) -> Self {
        let total_gb = total as f64 / BYTES_PER_GB;
        let used_gb = used as f64 / BYTES_PER_GB;
        Self {
            total_gb,
            used_gb,
            available_gb: available as f64 / BYTES_PER_GB,
            percent_used: if total == 0 {
                0.0
            } else {
                used as f64 / total as f64 * 100.0
            },
        }
    }
}

/// Source of host memory figures.
pub trait MemoryProbe: Send + Sync {
    fn snapshot(&self) -> MemorySnapshot;
}

/// Probe backed by `sysinfo`.
pub struct SystemMemoryProbe {
    system: std::sync::Mutex<sysinfo::System>,
}

impl Default for SystemMemoryProbe {
    fn default() -> Self {
        Self {
            system: std::sync::Mutex::new(sysinfo::System::new()),
        }
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn snapshot(&self) -> MemorySnapshot {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_memory();
        MemorySnapshot::from_bytes(
            system.total_memory(),
            system.used_memory(),
            system.available_memory(),
        )
    }
}

/// Probe that always reports the same figures.
pub struct FixedMemoryProbe(pub MemorySnapshot);

impl MemoryProbe for FixedMemoryProbe {
    fn snapshot(&self) -> MemorySnapshot {
        self.0
    }
}

/// Working state persisted before a swap so a task can be resumed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub timestamp: Option<DateTime<Utc>>,
    pub last_requirement: String,
    pub working_files: Vec<String>,
    pub last_error: Option<String>,
}

impl ContextSnapshot {
    pub fn new(requirement: impl Into<String>) -> Self {
        Self {
            timestamp: None,
            last_requirement: requirement.into(),
            working_files: Vec::new(),
            last_error: None,
        }
    }
}

/// A resident executor as reported by health endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct ResidentExecutor {
    pub id: String,
    pub name: String,
    pub memory_gb: f64,
    pub residency: ResidencyPolicy,
    pub last_used: DateTime<Utc>,
}

impl ResidentExecutor {
    fn from_spec(spec: &ExecutorSpec) -> Self {
        Self {
            id: spec.id.clone(),
            name: spec.name.clone(),
            memory_gb: spec.memory_gb,
            residency: spec.residency,
            last_used: Utc::now(),
        }
    }
}

/// Permission to use an executor. Evictions wait until every lease is dropped.
pub struct ExecutorLease {
    spec: ExecutorSpec,
    swapped: bool,
    low_memory: bool,
    _guard: OwnedRwLockReadGuard<()>,
}

impl ExecutorLease {
    pub fn spec(&self) -> &ExecutorSpec {
        &self.spec
    }

    /// Whether preparing this lease evicted other executors.
    pub fn swapped(&self) -> bool {
        self.swapped
    }

    /// Whether the post-swap memory check found less headroom than wanted.
    pub fn low_memory(&self) -> bool {
        self.low_memory
    }
}

/// Tracks resident executors against a memory budget.
pub struct ResidencyManager {
    backend: Arc<dyn InferenceBackend>,
    catalog: ExecutorCatalog,
    registry: Mutex<HashMap<String, ResidentExecutor>>,
    swap_gate: Arc<RwLock<()>>,
    memory: Arc<dyn MemoryProbe>,
    budget_gb: f64,
    margin_gb: f64,
    snapshot_dir: PathBuf,
    unload_timeout: Duration,
}

impl ResidencyManager {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        catalog: ExecutorCatalog,
        memory: Arc<dyn MemoryProbe>,
        budget_gb: f64,
        margin_gb: f64,
        snapshot_dir: impl Into<PathBuf>,
    ) -> Self {
        let registry = catalog
            .executors
            .iter()
            .filter(|e| e.is_always_resident())
            .map(|e| (e.id.clone(), ResidentExecutor::from_spec(e)))
            .collect();

        Self {
            backend,
            catalog,
            registry: Mutex::new(registry),
            swap_gate: Arc::new(RwLock::new(())),
            memory,
            budget_gb,
            margin_gb,
            snapshot_dir: snapshot_dir.into(),
            unload_timeout: Duration::from_secs(30),
        }
    }

    pub fn from_config(
        config: &SwarmConfig,
        backend: Arc<dyn InferenceBackend>,
        memory: Arc<dyn MemoryProbe>,
    ) -> Self {
        Self::new(
            backend,
            config.executors.clone(),
            memory,
            config.memory_budget_gb,
            config.safety_margin_gb,
            config.snapshot_dir.clone(),
        )
        .with_unload_timeout(config.unload_timeout)
    }

    pub fn with_unload_timeout(mut self, timeout: Duration) -> Self {
        self.unload_timeout = timeout;
        self
    }

    pub fn catalog(&self) -> &ExecutorCatalog {
        &self.catalog
    }

    pub fn memory(&self) -> MemorySnapshot {
        self.memory.snapshot()
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.snapshot_dir.join(SNAPSHOT_FILE)
    }

    /// Executors currently marked resident, sorted by id.
    pub async fn resident(&self) -> Vec<ResidentExecutor> {
        let registry = self.registry.lock().await;
        let mut list: Vec<_> = registry.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub async fn is_resident(&self, executor_id: &str) -> bool {
        self.registry.lock().await.contains_key(executor_id)
    }

    /// Executors to evict before `target` can load, or empty when it fits.
    fn victims(&self, registry: &HashMap<String, ResidentExecutor>, target: &ExecutorSpec) -> Vec<String> {
        if target.is_always_resident() {
            return Vec::new();
        }

        let others = || {
            registry
                .values()
                .filter(|r| r.id != target.id && r.residency == ResidencyPolicy::SwapOnDemand)
        };
        let is_exclusive = |id: &str| self.catalog.get(id).is_some_and(|s| s.exclusive);

        if target.exclusive {
            return others().map(|r| r.id.clone()).collect();
        }

        let mut victims: Vec<String> = others()
            .filter(|r| is_exclusive(&r.id))
            .map(|r| r.id.clone())
            .collect();

        if !registry.contains_key(&target.id) {
            let remaining: f64 = registry
                .values()
                .filter(|r| !victims.contains(&r.id))
                .map(|r| r.memory_gb)
                .sum();
            if remaining + target.memory_gb > self.budget_gb - self.margin_gb {
                victims = others().map(|r| r.id.clone()).collect();
            }
        }

        victims
    }

    /// Make `executor_id` resident and return a lease for using it.
    ///
    /// A no-op (apart from refreshing `last_used`) when the executor already
    /// fits. Otherwise the snapshot is persisted, conflicting swap-on-demand
    /// executors are evicted and the target is marked resident.
    pub async fn prepare(
        &self,
        executor_id: &str,
        snapshot: &ContextSnapshot,
    ) -> Result<ExecutorLease, ResidencyError> {
        let spec = self
            .catalog
            .get(executor_id)
            .cloned()
            .ok_or_else(|| ResidencyError::UnknownExecutor(executor_id.to_string()))?;

        // Fast path under a shared lease.
        let read = self.swap_gate.clone().read_owned().await;
        {
            let mut registry = self.registry.lock().await;
            if self.victims(&registry, &spec).is_empty() {
                let newly_loaded = !registry.contains_key(&spec.id);
                registry
                    .entry(spec.id.clone())
                    .and_modify(|r| r.last_used = Utc::now())
                    .or_insert_with(|| ResidentExecutor::from_spec(&spec));
                drop(registry);

                let low_memory = newly_loaded && self.check_headroom(&spec);
                debug!(executor = %spec.id, newly_loaded, "Executor ready");
                return Ok(ExecutorLease {
                    spec,
                    swapped: false,
                    low_memory,
                    _guard: read,
                });
            }
        }
        drop(read);

        // Swap path: wait for every in-flight lease to finish.
        let write = self.swap_gate.clone().write_owned().await;
        let victims = {
            let mut registry = self.registry.lock().await;
            let victims = self.victims(&registry, &spec);
            for id in &victims {
                registry.remove(id);
            }
            registry
                .entry(spec.id.clone())
                .and_modify(|r| r.last_used = Utc::now())
                .or_insert_with(|| ResidentExecutor::from_spec(&spec));
            victims
        };

        if !victims.is_empty() {
            if let Err(e) = self.persist_snapshot(snapshot).await {
                warn!(error = %e, path = %self.snapshot_path().display(), "Failed to persist context snapshot");
            }
            for id in &victims {
                self.unload_best_effort(id).await;
            }
            info!(executor = %spec.id, evicted = ?victims, "Swapped executors");
        }

        let low_memory = self.check_headroom(&spec);
        Ok(ExecutorLease {
            spec,
            swapped: !victims.is_empty(),
            low_memory,
            _guard: write.downgrade(),
        })
    }

    /// Evict one executor. Always-resident executors are left alone.
    ///
    /// Returns whether the executor was marked resident beforehand.
    pub async fn unload(&self, executor_id: &str) -> bool {
        if self
            .catalog
            .get(executor_id)
            .is_some_and(ExecutorSpec::is_always_resident)
        {
            warn!(executor = executor_id, "Refusing to unload an always-resident executor");
            return false;
        }

        let _write = self.swap_gate.write().await;
        let was_resident = self.registry.lock().await.remove(executor_id).is_some();
        self.unload_best_effort(executor_id).await;
        was_resident
    }

    async fn unload_best_effort(&self, executor_id: &str) {
        match tokio::time::timeout(self.unload_timeout, self.backend.unload(executor_id)).await {
            Ok(Ok(())) => info!(executor = executor_id, "Unloaded executor"),
            Ok(Err(e)) => warn!(executor = executor_id, error = %e, "Unload failed, continuing"),
            Err(_) => warn!(executor = executor_id, "Unload timed out, continuing"),
        }
    }

    /// Advisory post-condition. Returns true when memory looks short.
    fn check_headroom(&self, spec: &ExecutorSpec) -> bool {
        let memory = self.memory.snapshot();
        let wanted = spec.memory_gb + self.margin_gb;
        if memory.available_gb < wanted {
            warn!(
                executor = %spec.id,
                available_gb = format!("{:.1}", memory.available_gb),
                wanted_gb = format!("{:.1}", wanted),
                "Low memory after preparing executor"
            );
            true
        } else {
            false
        }
    }

    async fn persist_snapshot(&self, snapshot: &ContextSnapshot) -> std::io::Result<PathBuf> {
        write_snapshot(&self.snapshot_dir, snapshot).await
    }
}

/// Write `snapshot` (stamped now) to `<dir>/temp_context.json`.
pub async fn write_snapshot(dir: &Path, snapshot: &ContextSnapshot) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let mut stamped = snapshot.clone();
    stamped.timestamp = Some(Utc::now());
    let json = serde_json::to_string_pretty(&stamped).map_err(std::io::Error::other)?;
    let path = dir.join(SNAPSHOT_FILE);
    tokio::fs::write(&path, json).await?;
    debug!(path = %path.display(), "Persisted context snapshot");
    Ok(path)
}
