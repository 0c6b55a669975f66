//! Routing decisions, the security gate and the classifier template.

pub mod decision;
pub mod gate;
pub mod template;

pub use decision::{truncate_chars, Difficulty, RiskLevel, Role, RoutingDecision, SecurityAssessment};
pub use gate::RouteOutcome;
