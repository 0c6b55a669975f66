//! Escalation tracking
//!
//! Counts repeated failures per task fingerprint and advises when a costlier
//! role should take over. Advisory only: the tracker never forces the switch,
//! so the cheaper roles stay the default.

pub mod tracker;

pub use tracker::{EscalationAdvice, EscalationTracker, DEFAULT_ESCALATION_THRESHOLD};
