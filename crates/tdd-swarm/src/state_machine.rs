//! Workflow state machine: explicit stages and legal transition guards.
//!
//! Every run starts at `Design` and terminates at `Done` or `TddFailed`. The
//! orchestration loop calls `advance()` between stages; each call validates the
//! edge and records it, so a run's path can be replayed from its report.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Stages of the TDD workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStage {
    /// Design role drafts strategy and test scenarios (may be skipped).
    Design,
    /// Implement role writes tests and code.
    Implement,
    /// Test command runs against the project root.
    Test,
    /// Review role approves or requests changes.
    Review,
    /// Project root is committed.
    Commit,
    /// Documentation role writes the report.
    Document,
    /// Success, terminal.
    Done,
    /// Retry budget exhausted, terminal.
    TddFailed,
}

impl WorkflowStage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::TddFailed)
    }
}

impl fmt::Display for WorkflowStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Design => write!(f, "DESIGN"),
            Self::Implement => write!(f, "IMPLEMENT"),
            Self::Test => write!(f, "TEST"),
            Self::Review => write!(f, "REVIEW"),
            Self::Commit => write!(f, "COMMIT"),
            Self::Document => write!(f, "DOCUMENT"),
            Self::Done => write!(f, "DONE"),
            Self::TddFailed => write!(f, "TDD_FAILED"),
        }
    }
}

/// Legal transitions:
/// ```text
/// Design → Implement
/// Implement → Test
/// Test → Review | Implement | TddFailed
/// Review → Commit | Implement
/// Commit → Document
/// Document → Done
/// ```
fn is_legal_transition(from: WorkflowStage, to: WorkflowStage) -> bool {
    use WorkflowStage::*;

    matches!(
        (from, to),
        (Design, Implement)
            | (Implement, Test)
            // green → review; red → retry or give up
            | (Test, Review)
            | (Test, Implement)
            | (Test, TddFailed)
            | (Review, Commit)
            | (Review, Implement)
            | (Commit, Document)
            | (Document, Done)
    )
}

/// A single recorded transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: WorkflowStage,
    pub to: WorkflowStage,
    /// Implement attempts made when the transition happened.
    pub iteration: u32,
    /// Milliseconds since the machine was created.
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Error returned when an illegal transition is attempted.
#[derive(Debug, Clone)]
pub struct IllegalTransition {
    pub from: WorkflowStage,
    pub to: WorkflowStage,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Illegal stage transition: {} → {}", self.from, self.to)
    }
}

impl std::error::Error for IllegalTransition {}

/// The workflow state machine for one task.
pub struct StateMachine {
    current: WorkflowStage,
    iteration: u32,
    created_at: Instant,
    transitions: Vec<TransitionRecord>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            current: WorkflowStage::Design,
            iteration: 0,
            created_at: Instant::now(),
            transitions: Vec::new(),
        }
    }

    pub fn current(&self) -> WorkflowStage {
        self.current
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn set_iteration(&mut self, iteration: u32) {
        self.iteration = iteration;
    }

    /// Move to `to` if the edge is legal, recording it.
    pub fn advance(&mut self, to: WorkflowStage, reason: Option<&str>) -> Result<(), IllegalTransition> {
        if !is_legal_transition(self.current, to) {
            return Err(IllegalTransition {
                from: self.current,
                to,
            });
        }

        tracing::debug!(
            from = %self.current,
            to = %to,
            iteration = self.iteration,
            "Stage transition"
        );

        self.transitions.push(TransitionRecord {
            from: self.current,
            to,
            iteration: self.iteration,
            elapsed_ms: self.created_at.elapsed().as_millis() as u64,
            reason: reason.map(String::from),
        });
        self.current = to;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    /// Number of times `stage` was entered.
    pub fn entries(&self, stage: WorkflowStage) -> usize {
        self.transitions.iter().filter(|t| t.to == stage).count()
    }

    /// `DESIGN → IMPLEMENT → TEST ...` path walked so far.
    pub fn path(&self) -> String {
        std::iter::once(WorkflowStage::Design)
            .chain(self.transitions.iter().map(|t| t.to))
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(" → ")
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use WorkflowStage::*;

    #[test]
    fn test_initial_state() {
        let sm = StateMachine::new();
        assert_eq!(sm.current(), Design);
        assert!(!sm.is_terminal());
        assert!(sm.transitions().is_empty());
    }

    #[test]
    fn test_happy_path() {
        let mut sm = StateMachine::new();
        for stage in [Implement, Test, Review, Commit, Document, Done] {
            sm.advance(stage, None).unwrap();
        }
        assert!(sm.is_terminal());
        assert_eq!(
            sm.path(),
            "DESIGN → IMPLEMENT → TEST → REVIEW → COMMIT → DOCUMENT → DONE"
        );
    }

    #[test]
    fn test_retry_then_give_up() {
        let mut sm = StateMachine::new();
        sm.advance(Implement, None).unwrap();
        for attempt in 1..=3 {
            sm.set_iteration(attempt);
            sm.advance(Test, None).unwrap();
            if attempt < 3 {
                sm.advance(Implement, Some("tests failed")).unwrap();
            }
        }
        sm.advance(TddFailed, Some("retry budget exhausted")).unwrap();
        assert_eq!(sm.entries(Test), 3);
        assert_eq!(sm.transitions().last().unwrap().iteration, 3);
    }

    #[test]
    fn test_review_loops_back_to_implement() {
        let mut sm = StateMachine::new();
        sm.advance(Implement, None).unwrap();
        sm.advance(Test, None).unwrap();
        sm.advance(Review, None).unwrap();
        sm.advance(Implement, Some("REQUEST_CHANGES")).unwrap();
        sm.advance(Test, None).unwrap();
        assert_eq!(sm.current(), Test);
    }

    #[test]
    fn test_commit_requires_review() {
        let mut sm = StateMachine::new();
        sm.advance(Implement, None).unwrap();
        sm.advance(Test, None).unwrap();
        let err = sm.advance(Commit, None).unwrap_err();
        assert_eq!(err.from, Test);
        assert_eq!(err.to.to_string(), "COMMIT");
        assert!(err.to_string().contains("TEST → COMMIT"));
    }

    #[test]
    fn test_no_transition_from_terminal() {
        let mut sm = StateMachine::new();
        sm.advance(Implement, None).unwrap();
        sm.advance(Test, None).unwrap();
        sm.advance(TddFailed, None).unwrap();
        assert!(sm.advance(Implement, None).is_err());
        assert!(sm.advance(Done, None).is_err());
    }

    #[test]
    fn test_stage_serde_names() {
        assert_eq!(serde_json::to_string(&TddFailed).unwrap(), "\"TDD_FAILED\"");
        let record = TransitionRecord {
            from: Test,
            to: Review,
            iteration: 1,
            elapsed_ms: 3,
            reason: Some("tests passed".into()),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["to"], "REVIEW");
        assert_eq!(json["reason"], "tests passed");
    }
}
