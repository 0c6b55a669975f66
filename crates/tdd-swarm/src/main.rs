use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use coordination::artifacts::ArtifactWriter;
use coordination::escalation::EscalationTracker;
use coordination::git_manager::GitManager;
use coordination::shell_safety::CommandPolicy;
use coordination::task::Task;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tdd_swarm::api::{create_router, AppState};
use tdd_swarm::config::{check_endpoint, SwarmConfig};
use tdd_swarm::gateway::SecurityGate;
use tdd_swarm::inference::{InferenceBackend, OllamaClient};
use tdd_swarm::learning::LearningLog;
use tdd_swarm::orchestrator::{Pipeline, PipelineSettings, RunStatus};
use tdd_swarm::residency::{MemoryProbe, ResidencyManager, SystemMemoryProbe};
use tdd_swarm::roles::InferenceRoles;
use tdd_swarm::sandbox::{CommandRunner, LocalRunner, SandboxContainer};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Inference host URL (overrides SWARM_INFERENCE_URL)
    #[arg(long, global = true)]
    inference_url: Option<String>,

    /// Project root artifacts are written to (overrides SWARM_PROJECT_ROOT)
    #[arg(long, global = true)]
    project_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the routing HTTP API
    Serve {
        /// Bind address (overrides SWARM_BIND)
        #[arg(long)]
        bind: Option<String>,
    },
    /// Run one requirement through the TDD pipeline
    Run {
        requirement: String,

        /// Untrusted reference document passed through the security gate
        #[arg(long)]
        reference: Option<PathBuf>,

        /// Run tests as a local process instead of the docker sandbox
        #[arg(long, default_value_t = false)]
        no_sandbox: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = SwarmConfig::from_env()?;
    if let Some(url) = args.inference_url {
        config.inference_url = url;
    }
    if let Some(root) = args.project_root {
        config.project_root = root;
    }

    if !check_endpoint(&config.inference_url).await {
        warn!(url = %config.inference_url, "Inference host not reachable, classification will fall back");
    }

    let backend: Arc<dyn InferenceBackend> = Arc::new(OllamaClient::new(&config.inference_url));
    let memory: Arc<dyn MemoryProbe> = Arc::new(SystemMemoryProbe::default());

    match args.command {
        Command::Serve { bind } => {
            if let Some(bind) = bind {
                config.bind_addr = bind;
            }
            serve(&config, backend, memory).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Run {
            requirement,
            reference,
            no_sandbox,
        } => {
            let reference = match reference {
                Some(path) => Some(
                    std::fs::read_to_string(&path)
                        .with_context(|| format!("Failed to read reference {}", path.display()))?,
                ),
                None => None,
            };
            if no_sandbox {
                config.sandbox.enabled = false;
            }
            let status = run(&config, backend, memory, requirement, reference).await?;
            Ok(if status == RunStatus::Done {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

async fn serve(
    config: &SwarmConfig,
    backend: Arc<dyn InferenceBackend>,
    memory: Arc<dyn MemoryProbe>,
) -> Result<()> {
    let state = AppState::from_config(config, backend, memory)?;
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    info!(
        addr = %config.bind_addr,
        inference = %config.inference_url,
        executors = config.executors.executors.len(),
        "Routing API listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await
        .context("API server failed")
}

async fn run(
    config: &SwarmConfig,
    backend: Arc<dyn InferenceBackend>,
    memory: Arc<dyn MemoryProbe>,
    requirement: String,
    reference: Option<String>,
) -> Result<RunStatus> {
    std::fs::create_dir_all(&config.project_root)
        .with_context(|| format!("Failed to create {}", config.project_root.display()))?;
    let git = GitManager::new(&config.project_root);
    git.ensure_repository()?;
    let writer = ArtifactWriter::new(&config.project_root)?;

    let classifier = Arc::new(SecurityGate::from_config(config, backend.clone())?);
    let residency = Arc::new(ResidencyManager::from_config(config, backend.clone(), memory));
    let roles = Arc::new(InferenceRoles::from_config(config, backend, residency));

    let policy = CommandPolicy::default();
    let container = if config.sandbox.enabled && SandboxContainer::docker_available().await {
        let container = SandboxContainer::new(config.sandbox.clone(), &config.project_root);
        match container.start().await {
            Ok(()) => Some(container),
            Err(e) => {
                warn!(error = %e, "Sandbox unavailable, tests run locally");
                None
            }
        }
    } else {
        None
    };
    let runner: Arc<dyn CommandRunner> = match &container {
        Some(container) => Arc::new(container.runner(policy)),
        None => Arc::new(LocalRunner::new(&config.project_root, policy)),
    };
    info!(runner = %runner.describe(), "Test runner ready");

    let mut pipeline = Pipeline::new(
        classifier,
        roles,
        runner,
        Arc::new(git),
        Arc::new(EscalationTracker::new(config.escalation_threshold)),
        writer,
        PipelineSettings::from_config(config),
    );
    if let Some(path) = &config.learning_log {
        pipeline = pipeline.with_learning_log(LearningLog::new(path));
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling task");
            on_signal.cancel();
        }
    });

    let task = Task::new(requirement, reference, config.fingerprint);
    let result = pipeline.run(&task, &cancel).await;

    if let Some(container) = &container {
        container.stop().await;
    }
    let report = result?;

    info!(
        status = %report.status,
        attempts = report.implement_attempts,
        test_runs = report.test_runs,
        path = %report.path,
        "Task finished"
    );
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(report.status)
}
