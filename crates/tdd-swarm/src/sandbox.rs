//! Command execution for the TEST stage.
//!
//! Commands are tokenized with `shlex`, checked against the
//! [`CommandPolicy`] allow-list and spawned without a shell. [`DockerRunner`]
//! executes inside a long-lived, network-less container with the project root
//! mounted; [`LocalRunner`] runs on the host and is the fallback when Docker is
//! unavailable.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use coordination::shell_safety::{sanitize_identifier, CommandPolicy};
use coordination::CoordinationError;
use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::SandboxConfig;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("cannot parse command line: {0}")]
    Parse(String),

    #[error(transparent)]
    Policy(#[from] CoordinationError),

    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("docker: {0}")]
    Docker(String),
}

/// Result of one command execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecOutcome {
    /// `None` when the process was killed or timed out.
    pub exit_code: Option<i32>,
    /// stdout followed by stderr.
    pub output: String,
    pub timed_out: bool,
}

/// pytest's exit code when it collected no tests.
pub const NO_TESTS_COLLECTED: i32 = 5;

impl ExecOutcome {
    pub fn passed(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    pub fn no_tests_collected(&self) -> bool {
        self.exit_code == Some(NO_TESTS_COLLECTED)
    }

    fn timed_out(timeout: Duration) -> Self {
        Self {
            exit_code: None,
            output: format!("command timed out after {}s", timeout.as_secs()),
            timed_out: true,
        }
    }
}

/// Anything that can run a test command against the project.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &str, timeout: Duration) -> Result<ExecOutcome, ExecError>;

    /// Short label for logs and reports.
    fn describe(&self) -> String;
}

/// Tokenize and policy-check a command line.
pub fn parse_command(command: &str, policy: &CommandPolicy) -> Result<Vec<String>, ExecError> {
    let argv = shlex::split(command)
        .ok_or_else(|| ExecError::Parse(format!("unbalanced quoting in `{command}`")))?;
    policy.check(&argv)?;
    Ok(argv)
}

fn combine_output(stdout: &[u8], stderr: &[u8]) -> String {
    let stdout = String::from_utf8_lossy(stdout);
    let stderr = String::from_utf8_lossy(stderr);
    if stderr.trim().is_empty() {
        stdout.into_owned()
    } else {
        format!("{stdout}{stderr}")
    }
}

/// Spawn `argv`, wait up to `timeout`, kill on expiry.
async fn spawn_with_timeout(
    mut cmd: Command,
    program: &str,
    timeout: Duration,
) -> Result<ExecOutcome, ExecError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|source| ExecError::Spawn {
        program: program.to_string(),
        source,
    })?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(out)) => Ok(ExecOutcome {
            exit_code: out.status.code(),
            output: combine_output(&out.stdout, &out.stderr),
            timed_out: false,
        }),
        Ok(Err(source)) => Err(ExecError::Spawn {
            program: program.to_string(),
            source,
        }),
        Err(_) => {
            warn!(program, timeout_secs = timeout.as_secs(), "Command timed out");
            Ok(ExecOutcome::timed_out(timeout))
        }
    }
}

/// Runs commands on the host inside the project root.
#[derive(Debug, Clone)]
pub struct LocalRunner {
    workdir: PathBuf,
    policy: CommandPolicy,
}

impl LocalRunner {
    pub fn new(workdir: impl Into<PathBuf>, policy: CommandPolicy) -> Self {
        Self {
            workdir: workdir.into(),
            policy,
        }
    }
}

#[async_trait]
impl CommandRunner for LocalRunner {
    async fn run(&self, command: &str, timeout: Duration) -> Result<ExecOutcome, ExecError> {
        let argv = parse_command(command, &self.policy)?;
        debug!(command, workdir = %self.workdir.display(), "Running locally");
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]).current_dir(&self.workdir);
        spawn_with_timeout(cmd, &argv[0], timeout).await
    }

    fn describe(&self) -> String {
        "local".into()
    }
}

/// Runs commands with `docker exec` in a prepared container.
#[derive(Debug, Clone)]
pub struct DockerRunner {
    docker: String,
    container: String,
    workdir: String,
    policy: CommandPolicy,
    fallback: Option<LocalRunner>,
}

impl DockerRunner {
    pub fn new(container: impl Into<String>, workdir: impl Into<String>, policy: CommandPolicy) -> Self {
        Self {
            docker: "docker".into(),
            container: container.into(),
            workdir: workdir.into(),
            policy,
            fallback: None,
        }
    }

    /// Run locally when the docker CLI cannot be spawned or the container is
    /// gone.
    pub fn with_fallback(mut self, fallback: LocalRunner) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Override the docker binary.
    pub fn with_docker_binary(mut self, docker: impl Into<String>) -> Self {
        self.docker = docker.into();
        self
    }

    /// Whether the container still reports itself running. Any inspect failure
    /// counts as gone.
    async fn container_running(&self) -> bool {
        let mut cmd = Command::new(&self.docker);
        cmd.args(["inspect", "-f", "{{.State.Running}}", &self.container]);
        match spawn_with_timeout(cmd, &self.docker, Duration::from_secs(10)).await {
            Ok(outcome) => outcome.passed() && outcome.output.trim() == "true",
            Err(_) => false,
        }
    }

    async fn run_fallback(
        &self,
        command: &str,
        timeout: Duration,
        reason: &str,
    ) -> Option<Result<ExecOutcome, ExecError>> {
        let local = self.fallback.as_ref()?;
        warn!(container = %self.container, reason, "Sandbox unavailable, running command locally");
        Some(local.run(command, timeout).await)
    }
}

/// Seconds for the in-container `timeout` wrapper, never below one.
fn inner_timeout_secs(timeout: Duration) -> u64 {
    timeout.as_secs_f64().ceil().max(1.0) as u64
}

#[async_trait]
impl CommandRunner for DockerRunner {
    async fn run(&self, command: &str, timeout: Duration) -> Result<ExecOutcome, ExecError> {
        let argv = parse_command(command, &self.policy)?;
        // Killing the local `docker exec` client leaves the process running in
        // the container, so the container enforces the deadline itself.
        let limit = inner_timeout_secs(timeout).to_string();
        let mut cmd = Command::new(&self.docker);
        cmd.arg("exec")
            .arg("-w")
            .arg(&self.workdir)
            .arg(&self.container)
            .args(["timeout", "-s", "KILL", &limit])
            .args(&argv);

        match spawn_with_timeout(cmd, &self.docker, timeout).await {
            Err(ExecError::Spawn { source, .. }) => {
                let reason = format!("docker cli: {source}");
                match self.run_fallback(command, timeout, &reason).await {
                    Some(result) => result,
                    None => Err(ExecError::Docker(source.to_string())),
                }
            }
            Ok(outcome) if !outcome.passed() && !outcome.timed_out => {
                if self.container_running().await {
                    return Ok(outcome);
                }
                let reason = format!("container not running: {}", outcome.output.trim());
                match self.run_fallback(command, timeout, &reason).await {
                    Some(result) => result,
                    None => Err(ExecError::Docker(reason)),
                }
            }
            other => other,
        }
    }

    fn describe(&self) -> String {
        format!("docker:{}", self.container)
    }
}

/// Lifecycle of the test container.
#[derive(Debug, Clone)]
pub struct SandboxContainer {
    config: SandboxConfig,
    project_root: PathBuf,
    name: String,
}

impl SandboxContainer {
    pub fn new(config: SandboxConfig, project_root: &Path) -> Self {
        let name = sanitize_identifier(&config.container_name);
        Self {
            config,
            project_root: project_root.to_path_buf(),
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the docker daemon answers.
    pub async fn docker_available() -> bool {
        let mut cmd = Command::new("docker");
        cmd.args(["version", "--format", "{{.Server.Version}}"]);
        matches!(
            spawn_with_timeout(cmd, "docker", Duration::from_secs(10)).await,
            Ok(outcome) if outcome.passed()
        )
    }

    async fn docker(&self, args: &[&str], timeout: Duration) -> Result<ExecOutcome, ExecError> {
        let mut cmd = Command::new("docker");
        cmd.args(args);
        spawn_with_timeout(cmd, "docker", timeout).await
    }

    /// Replace any stale container, start a fresh one, install pytest, then
    /// cut its network.
    pub async fn start(&self) -> Result<(), ExecError> {
        let root = self
            .project_root
            .canonicalize()
            .map_err(|e| ExecError::Docker(format!("project root: {e}")))?;
        let mount = format!("{}:{}", root.display(), self.config.workdir);

        let _ = self.docker(&["rm", "-f", &self.name], Duration::from_secs(30)).await;

        let started = self
            .docker(
                &[
                    "run", "-d", "--name", &self.name, "-v", &mount, "-w", &self.config.workdir,
                    &self.config.image, "sleep", "infinity",
                ],
                Duration::from_secs(300),
            )
            .await?;
        if !started.passed() {
            return Err(ExecError::Docker(format!(
                "container start failed: {}",
                started.output.trim()
            )));
        }

        let install = self
            .docker(
                &["exec", &self.name, "pip", "install", "--quiet", "pytest"],
                Duration::from_secs(300),
            )
            .await?;
        if !install.passed() {
            warn!(container = %self.name, output = %install.output.trim(), "pytest install failed in sandbox");
        }

        let isolated = self
            .docker(
                &["network", "disconnect", "bridge", &self.name],
                Duration::from_secs(30),
            )
            .await?;
        if !isolated.passed() {
            self.stop().await;
            return Err(ExecError::Docker(format!(
                "could not isolate container network: {}",
                isolated.output.trim()
            )));
        }

        info!(container = %self.name, image = %self.config.image, "Sandbox container ready");
        Ok(())
    }

    /// Remove the container. Failures are logged.
    pub async fn stop(&self) {
        match self.docker(&["rm", "-f", &self.name], Duration::from_secs(30)).await {
            Ok(outcome) if outcome.passed() => info!(container = %self.name, "Sandbox container removed"),
            Ok(outcome) => warn!(container = %self.name, output = %outcome.output.trim(), "Sandbox removal failed"),
            Err(e) => warn!(container = %self.name, error = %e, "Sandbox removal failed"),
        }
    }

    pub fn runner(&self, policy: CommandPolicy) -> DockerRunner {
        DockerRunner::new(self.name.clone(), self.config.workdir.clone(), policy.clone())
            .with_fallback(LocalRunner::new(self.project_root.clone(), policy))
    }
}
