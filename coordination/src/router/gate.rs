//! Security gate: turns a routing decision into an explicit outcome.
//!
//! Blocked, human and frontier routes are ordinary results here, not errors,
//! so callers have to handle each of them.

use serde::{Deserialize, Serialize};

use super::decision::{RiskLevel, Role, RoutingDecision};

/// Result of gating a [`RoutingDecision`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RouteOutcome {
    /// Safe to proceed with the given role.
    Proceed { role: Role, decision: RoutingDecision },
    /// Automatic progression suspended until someone reviews the request.
    RequiresHuman { reason: String },
    /// Delegate to a higher-capability system outside this deployment.
    RequiresFrontier { reason: String },
    /// Malicious request. Terminal, never retried.
    Blocked {
        risk_level: RiskLevel,
        threats: Vec<String>,
    },
}

impl RouteOutcome {
    /// Gate a decision. Precedence: malicious, frontier, human, proceed.
    pub fn from_decision(decision: RoutingDecision) -> Self {
        if decision.security.is_malicious {
            return Self::Blocked {
                risk_level: decision.security.risk_level,
                threats: decision.security.detected_threats,
            };
        }
        if decision.needs_frontier {
            return Self::RequiresFrontier {
                reason: decision.rationale,
            };
        }
        if decision.needs_human || decision.target == Role::Human {
            return Self::RequiresHuman {
                reason: decision.rationale,
            };
        }
        Self::Proceed {
            role: decision.target,
            decision,
        }
    }

    /// Short status label for logs and reports.
    pub fn status(&self) -> &'static str {
        match self {
            Self::Proceed { .. } => "proceed",
            Self::RequiresHuman { .. } => "requires_human",
            Self::RequiresFrontier { .. } => "requires_frontier",
            Self::Blocked { .. } => "blocked",
        }
    }
}
