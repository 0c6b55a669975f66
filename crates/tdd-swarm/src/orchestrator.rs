//! Orchestration loop: one task through design → implement → test → review →
//! commit → document.
//!
//! The loop is strictly sequential per task. Collaborators sit behind traits
//! (`TaskClassifier`, `RoleExecutor`, `CommandRunner`, `Committer`) so the
//! whole loop runs against scripted doubles in tests.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use coordination::artifacts::{extract_artifacts, ArtifactWriter};
use coordination::escalation::EscalationTracker;
use coordination::git_manager::Committer;
use coordination::router::{Difficulty, Role, RouteOutcome, RoutingDecision};
use coordination::task::Task;
use coordination::verifier::StaticPreCheck;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SwarmConfig;
use crate::gateway::TaskClassifier;
use crate::learning::{LearningEntry, LearningLog};
use crate::prompts::{
    design_prompt, document_prompt, implement_prompt, review_prompt, Feedback, ReviewVerdict,
};
use crate::residency::ContextSnapshot;
use crate::roles::{RoleError, RoleExecutor, RoleReply};
use crate::sandbox::{CommandRunner, ExecOutcome};
use crate::state_machine::{StateMachine, TransitionRecord, WorkflowStage};

/// Report file written under the project root.
pub const REPORT_FILE: &str = "REPORT.md";

/// Commit subjects carry at most this many chars of the requirement.
const COMMIT_SUMMARY_CHARS: usize = 50;

/// Loop limits and test settings.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub max_tdd_retries: u32,
    pub max_review_retries: u32,
    pub test_command: String,
    pub test_timeout: Duration,
    /// Re-run the design role when escalation is advised.
    pub escalate_on_advice: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_tdd_retries: 5,
            max_review_retries: 2,
            test_command: "pytest -v".into(),
            test_timeout: Duration::from_secs(30),
            escalate_on_advice: false,
        }
    }
}

impl PipelineSettings {
    pub fn from_config(config: &SwarmConfig) -> Self {
        Self {
            max_tdd_retries: config.max_tdd_retries.max(1),
            max_review_retries: config.max_review_retries.max(1),
            test_command: config.test_command.clone(),
            test_timeout: config.test_timeout,
            escalate_on_advice: config.escalate_on_advice,
        }
    }
}

/// Terminal status of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Done,
    TddFailed,
    Blocked,
    RequiresHuman,
    RequiresFrontier,
    Cancelled,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Done => "DONE",
            Self::TddFailed => "TDD_FAILED",
            Self::Blocked => "BLOCKED",
            Self::RequiresHuman => "REQUIRES_HUMAN",
            Self::RequiresFrontier => "REQUIRES_FRONTIER",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(label)
    }
}

/// Everything a finished run produced.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub task: Task,
    pub status: RunStatus,
    pub decision: Option<RoutingDecision>,
    /// Why the gate stopped the task, for non-proceed outcomes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate_reason: Option<String>,
    pub design: Option<String>,
    /// Implement role invocations, including failed ones.
    pub implement_attempts: u32,
    /// Times the test command actually ran.
    pub test_runs: u32,
    pub review_rounds: u32,
    pub last_test: Option<ExecOutcome>,
    pub review: Option<String>,
    /// Commit hash on success, failure text otherwise.
    pub commit: Option<String>,
    pub report_path: Option<PathBuf>,
    pub written_files: Vec<String>,
    pub transitions: Vec<TransitionRecord>,
    /// Stage path walked, `DESIGN → IMPLEMENT → ...`.
    pub path: String,
}

/// Outcome of one IMPLEMENT stage.
enum Attempt {
    /// Artifacts written; the reply text is kept for review.
    Ready { code: String },
    /// Nothing to test; feedback goes to the next attempt.
    Failed(Feedback),
}

/// Mutable state for one run.
struct RunState {
    sm: StateMachine,
    snapshot: ContextSnapshot,
    decision: Option<RoutingDecision>,
    design: Option<String>,
    implement_attempts: u32,
    test_runs: u32,
    review_rounds: u32,
    last_test: Option<ExecOutcome>,
    last_prompt: String,
    last_code: String,
    review: Option<String>,
    commit: Option<String>,
    report_path: Option<PathBuf>,
    written_files: Vec<String>,
}

impl RunState {
    fn new(task: &Task) -> Self {
        Self {
            sm: StateMachine::new(),
            snapshot: ContextSnapshot::new(task.requirement.clone()),
            decision: None,
            design: None,
            implement_attempts: 0,
            test_runs: 0,
            review_rounds: 0,
            last_test: None,
            last_prompt: String::new(),
            last_code: String::new(),
            review: None,
            commit: None,
            report_path: None,
            written_files: Vec::new(),
        }
    }

    fn finish(self, task: &Task, status: RunStatus, gate_reason: Option<String>) -> RunReport {
        RunReport {
            task: task.clone(),
            status,
            decision: self.decision,
            gate_reason,
            design: self.design,
            implement_attempts: self.implement_attempts,
            test_runs: self.test_runs,
            review_rounds: self.review_rounds,
            last_test: self.last_test,
            review: self.review,
            commit: self.commit,
            report_path: self.report_path,
            written_files: self.written_files,
            path: self.sm.path(),
            transitions: self.sm.transitions().to_vec(),
        }
    }
}

/// The TDD pipeline and its collaborators.
pub struct Pipeline {
    classifier: Arc<dyn TaskClassifier>,
    roles: Arc<dyn RoleExecutor>,
    runner: Arc<dyn CommandRunner>,
    committer: Arc<dyn Committer>,
    escalation: Arc<EscalationTracker>,
    writer: ArtifactWriter,
    precheck: StaticPreCheck,
    settings: PipelineSettings,
    learning: Option<LearningLog>,
}

impl Pipeline {
    pub fn new(
        classifier: Arc<dyn TaskClassifier>,
        roles: Arc<dyn RoleExecutor>,
        runner: Arc<dyn CommandRunner>,
        committer: Arc<dyn Committer>,
        escalation: Arc<EscalationTracker>,
        writer: ArtifactWriter,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            classifier,
            roles,
            runner,
            committer,
            escalation,
            writer,
            precheck: StaticPreCheck::default(),
            settings,
            learning: None,
        }
    }

    pub fn with_precheck(mut self, precheck: StaticPreCheck) -> Self {
        self.precheck = precheck;
        self
    }

    pub fn with_learning_log(mut self, log: LearningLog) -> Self {
        self.learning = Some(log);
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Run `fut` unless `cancel` fires first.
    async fn guarded<F: Future>(cancel: &CancellationToken, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            out = fut => Some(out),
        }
    }

    async fn invoke(
        &self,
        role: Role,
        prompt: &str,
        state: &RunState,
        cancel: &CancellationToken,
    ) -> Option<Result<RoleReply, RoleError>> {
        Self::guarded(cancel, self.roles.invoke(role, prompt, &state.snapshot)).await
    }

    /// Run one task to a terminal status.
    ///
    /// Errors only on internal invariant violations; every expected failure
    /// (role errors, failing tests, refused artifacts) is part of the report.
    pub async fn run(&self, task: &Task, cancel: &CancellationToken) -> Result<RunReport> {
        let mut state = RunState::new(task);
        info!(task_id = %task.id, fingerprint = %task.fingerprint, "Starting task");

        let prior_failures = self.escalation.failure_count(&task.fingerprint);
        let routed = Self::guarded(
            cancel,
            self.classifier
                .route(&task.requirement, task.reference.as_deref(), prior_failures),
        )
        .await;
        let Some(outcome) = routed else {
            return Ok(state.finish(task, RunStatus::Cancelled, None));
        };

        let decision = match outcome {
            RouteOutcome::Proceed { decision, .. } => decision,
            RouteOutcome::Blocked { risk_level, threats } => {
                warn!(task_id = %task.id, risk = %risk_level, ?threats, "Task blocked by security gate");
                let reason = format!("{risk_level}: {}", threats.join("; "));
                return Ok(state.finish(task, RunStatus::Blocked, Some(reason)));
            }
            RouteOutcome::RequiresHuman { reason } => {
                info!(task_id = %task.id, reason = %reason, "Task requires human review");
                return Ok(state.finish(task, RunStatus::RequiresHuman, Some(reason)));
            }
            RouteOutcome::RequiresFrontier { reason } => {
                info!(task_id = %task.id, reason = %reason, "Task requires a frontier system");
                return Ok(state.finish(task, RunStatus::RequiresFrontier, Some(reason)));
            }
        };

        let wants_design = decision.target == Role::Architect || decision.difficulty == Difficulty::High;
        state.decision = Some(decision);

        // DESIGN
        if wants_design {
            let prompt = design_prompt(&task.requirement, task.reference.as_deref());
            let reply = self.invoke(Role::Architect, &prompt, &state, cancel).await;
            match reply {
                None => return Ok(state.finish(task, RunStatus::Cancelled, None)),
                Some(Ok(reply)) => state.design = Some(reply.text),
                Some(Err(e)) => warn!(task_id = %task.id, error = %e, "Design stage failed, implementing from the requirement"),
            }
            let reason = if state.design.is_some() { "design complete" } else { "design unavailable" };
            state.sm.advance(WorkflowStage::Implement, Some(reason))?;
        } else {
            state.sm.advance(WorkflowStage::Implement, Some("design skipped"))?;
        }

        let mut feedback: Option<Feedback> = None;
        let mut tdd_failures = 0u32;

        loop {
            // IMPLEMENT
            state.implement_attempts += 1;
            state.sm.set_iteration(state.implement_attempts);
            let attempt = Self::guarded(cancel, self.implement(task, feedback.take(), &mut state)).await;
            let Some(attempt) = attempt else {
                return Ok(state.finish(task, RunStatus::Cancelled, None));
            };
            state.sm.advance(WorkflowStage::Test, None)?;

            // TEST
            let failure = match attempt {
                Attempt::Failed(fb) => Some(fb),
                Attempt::Ready { code } => {
                    state.last_code = code;
                    let Some(outcome) = Self::guarded(cancel, self.run_tests()).await else {
                        return Ok(state.finish(task, RunStatus::Cancelled, None));
                    };
                    state.test_runs += 1;
                    let passed = outcome.passed();
                    let output = outcome.output.clone();
                    state.last_test = Some(outcome);
                    (!passed).then_some(Feedback::TestFailure(output))
                }
            };

            if let Some(fb) = failure {
                tdd_failures += 1;
                state.snapshot.last_error = Some(format!("{fb:?}"));
                let advice = self.escalation.record_and_advise(&task.fingerprint);
                info!(
                    task_id = %task.id,
                    attempt = tdd_failures,
                    max = self.settings.max_tdd_retries,
                    escalated = advice.escalated,
                    recommendation = %advice.recommendation,
                    "Tests failed"
                );

                if tdd_failures >= self.settings.max_tdd_retries {
                    state.sm.advance(WorkflowStage::TddFailed, Some("retry budget exhausted"))?;
                    error!(task_id = %task.id, attempts = tdd_failures, "TDD loop failed");
                    return Ok(state.finish(task, RunStatus::TddFailed, None));
                }

                if advice.escalated && self.settings.escalate_on_advice {
                    self.consult_design(task, &fb, &mut state, cancel).await;
                }

                feedback = Some(fb);
                state.sm.advance(WorkflowStage::Implement, Some("tests failed"))?;
                continue;
            }

            self.escalation.reset(&task.fingerprint);
            state.sm.advance(WorkflowStage::Review, Some("tests passed"))?;

            // REVIEW
            let prompt = review_prompt(&task.requirement, &state.last_code);
            let reply = self.invoke(Role::Reviewer, &prompt, &state, cancel).await;
            let (verdict, review_text) = match reply {
                None => return Ok(state.finish(task, RunStatus::Cancelled, None)),
                Some(Ok(reply)) => (ReviewVerdict::parse(&reply.text), reply.text),
                Some(Err(e)) => {
                    warn!(task_id = %task.id, error = %e, "Review stage failed");
                    (ReviewVerdict::Ambiguous, format!("The review could not be completed: {e}"))
                }
            };
            state.review = Some(review_text.clone());

            if verdict == ReviewVerdict::Approved {
                state.sm.advance(WorkflowStage::Commit, Some("READY_TO_COMMIT"))?;
                break;
            }

            state.review_rounds += 1;
            if state.review_rounds >= self.settings.max_review_retries {
                warn!(task_id = %task.id, rounds = state.review_rounds, ?verdict, "Review budget exhausted, committing anyway");
                state.sm.advance(WorkflowStage::Commit, Some("review budget exhausted"))?;
                break;
            }
            info!(task_id = %task.id, round = state.review_rounds, ?verdict, "Reviewer requested changes");
            feedback = Some(Feedback::Review(review_text));
            state.sm.advance(WorkflowStage::Implement, Some("changes requested"))?;
        }

        // COMMIT
        state.commit = Some(self.commit(task).await);
        state.sm.advance(WorkflowStage::Document, None)?;

        // DOCUMENT
        let test_output = state
            .last_test
            .as_ref()
            .map(|t| t.output.clone())
            .unwrap_or_default();
        let prompt = document_prompt(
            &task.requirement,
            state.design.as_deref(),
            &test_output,
            state.review.as_deref(),
        );
        let reply = self.invoke(Role::Documenter, &prompt, &state, cancel).await;
        match reply {
            None => return Ok(state.finish(task, RunStatus::Cancelled, None)),
            Some(Ok(reply)) => {
                let path = self.writer.root().join(REPORT_FILE);
                match tokio::fs::write(&path, &reply.text).await {
                    Ok(()) => {
                        info!(path = %path.display(), "Report written");
                        state.report_path = Some(path);
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "Failed to write report"),
                }
            }
            Some(Err(e)) => warn!(task_id = %task.id, error = %e, "Documentation stage failed"),
        }
        state.sm.advance(WorkflowStage::Done, None)?;
        self.escalation.reset(&task.fingerprint);

        if let Some(log) = &self.learning {
            let entry = LearningEntry {
                timestamp: chrono::Utc::now(),
                task: task.summary(80),
                best_prompt: state.last_prompt.clone(),
                insights: vec![
                    format!("tests passed after {} implement attempt(s)", state.implement_attempts),
                    format!(
                        "design stage {}",
                        if state.design.is_some() { "used" } else { "skipped" }
                    ),
                    format!("{} review round(s) requested changes", state.review_rounds),
                ],
            };
            if let Err(e) = log.append(&entry) {
                warn!(error = %e, "Failed to update learning log");
            }
        }

        info!(task_id = %task.id, path = %state.sm.path(), "Task done");
        Ok(state.finish(task, RunStatus::Done, None))
    }

    /// IMPLEMENT: ask the coder, pre-check and write what it produced.
    async fn implement(&self, task: &Task, feedback: Option<Feedback>, state: &mut RunState) -> Attempt {
        let prompt = implement_prompt(
            &task.requirement,
            state.design.as_deref(),
            task.reference.as_deref(),
            feedback.as_ref(),
        );
        state.last_prompt = prompt.clone();

        let reply = match self.roles.invoke(Role::Coder, &prompt, &state.snapshot).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Implement stage failed");
                return Attempt::Failed(Feedback::Unavailable(e.to_string()));
            }
        };

        let artifacts = extract_artifacts(&reply.text);
        if artifacts.is_empty() {
            warn!(task_id = %task.id, "Implement reply declared no files");
            return Attempt::Failed(Feedback::NoArtifacts);
        }

        let unsafe_reports: Vec<String> = artifacts
            .iter()
            .filter_map(|a| {
                self.precheck
                    .check(&a.path, &a.content)
                    .filter(|r| !r.safe)
                    .map(|r| format!("{}:\n{}", a.path, r.summary()))
            })
            .collect();
        if !unsafe_reports.is_empty() {
            warn!(task_id = %task.id, files = unsafe_reports.len(), "Static pre-check rejected artifacts");
            return Attempt::Failed(Feedback::Rejected(unsafe_reports.join("\n\n")));
        }

        let report = self.writer.write_all(&artifacts);
        if report.has_security_violation() {
            warn!(task_id = %task.id, rejected = ?report.rejected, "Artifact path escaped the project root");
        }
        if report.written.is_empty() {
            let reasons = report
                .rejected
                .iter()
                .map(|r| format!("{}: {}", r.path, r.message))
                .collect::<Vec<_>>()
                .join("\n");
            return Attempt::Failed(Feedback::Rejected(reasons));
        }

        debug!(task_id = %task.id, files = ?report.written, "Artifacts written");
        for path in &report.written {
            if !state.written_files.contains(path) {
                state.written_files.push(path.clone());
            }
        }
        state.snapshot.working_files = state.written_files.clone();
        Attempt::Ready { code: reply.text }
    }

    /// TEST: refusals and spawn errors count as failing runs.
    async fn run_tests(&self) -> ExecOutcome {
        match self
            .runner
            .run(&self.settings.test_command, self.settings.test_timeout)
            .await
        {
            Ok(outcome) => {
                if outcome.no_tests_collected() {
                    warn!(runner = %self.runner.describe(), "No tests collected");
                }
                outcome
            }
            Err(e) => {
                error!(runner = %self.runner.describe(), error = %e, "Test command could not run");
                ExecOutcome {
                    exit_code: None,
                    output: format!("test command could not run: {e}"),
                    timed_out: false,
                }
            }
        }
    }

    /// Ask the design role again after repeated failures.
    async fn consult_design(
        &self,
        task: &Task,
        failure: &Feedback,
        state: &mut RunState,
        cancel: &CancellationToken,
    ) {
        let mut prompt = design_prompt(&task.requirement, task.reference.as_deref());
        if let Feedback::TestFailure(output) = failure {
            prompt.push_str("\n\nThe current implementation keeps failing with:\n\n");
            prompt.push_str(&coordination::router::truncate_chars(
                output,
                crate::prompts::MAX_FEEDBACK_CHARS,
            ));
        }
        match self.invoke(Role::Architect, &prompt, state, cancel).await {
            Some(Ok(reply)) => {
                info!(task_id = %task.id, "Design revised after escalation");
                state.design = Some(reply.text);
            }
            Some(Err(e)) => warn!(task_id = %task.id, error = %e, "Escalation design consult failed"),
            None => {}
        }
    }

    /// COMMIT: failures are reported, never fatal.
    async fn commit(&self, task: &Task) -> String {
        let message = format!("feat: {}", task.summary(COMMIT_SUMMARY_CHARS));
        let committer = Arc::clone(&self.committer);
        match tokio::task::spawn_blocking(move || committer.commit(&message)).await {
            Ok(Ok(hash)) => hash,
            Ok(Err(e)) => {
                warn!(task_id = %task.id, error = %e, "Commit failed");
                format!("commit failed: {e}")
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Commit task panicked");
                format!("commit failed: {e}")
            }
        }
    }
}
