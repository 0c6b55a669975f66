//! Routing decision types and sanitization of classifier output.
//!
//! The classifier model answers with loosely-typed JSON. Everything it says is
//! validated here before it can influence routing: unknown roles and tiers
//! collapse to safe defaults, free text is bounded, and any decode failure
//! yields the deterministic [`RoutingDecision::fallback`].

use serde::{Deserialize, Serialize};

/// Rationale attached to the deterministic fallback decision.
pub const FALLBACK_RATIONALE: &str = "fallback — classification unavailable.";

/// Upper bound on rationale text kept from the classifier.
pub const MAX_RATIONALE_CHARS: usize = 500;

/// Upper bound on the number of threats kept from the classifier.
pub const MAX_THREATS: usize = 16;

/// Upper bound on each threat description.
pub const MAX_THREAT_CHARS: usize = 200;

/// Difficulty tier assigned by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Low,
    Medium,
    High,
}

impl Difficulty {
    /// Lenient parse. Accepts English tiers and the 상/중/하 labels the
    /// classifier prompt historically used. Unknown values map to `Low`.
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "high" | "hard" | "상" => Self::High,
            "medium" | "mid" | "중" => Self::Medium,
            _ => Self::Low,
        }
    }
}

impl std::fmt::Display for Difficulty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

/// Risk severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Lenient parse; unknown values map to `Low`.
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "critical" => Self::Critical,
            "high" => Self::High,
            "medium" => Self::Medium,
            _ => Self::Low,
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Pipeline roles a task can be routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Design / planning role.
    Architect,
    /// Default implementer.
    Coder,
    Reviewer,
    Tester,
    Documenter,
    /// Higher-capability system outside this deployment.
    Frontier,
    /// Manual review.
    Human,
}

impl Role {
    /// Every role that maps to a local executor.
    pub const LOCAL: [Role; 5] = [
        Role::Architect,
        Role::Coder,
        Role::Reviewer,
        Role::Tester,
        Role::Documenter,
    ];

    /// Case-insensitive parse of a role label. Returns `None` for unknown labels.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_uppercase().as_str() {
            "ARCHITECT" => Some(Self::Architect),
            "CODER" | "IMPLEMENTER" => Some(Self::Coder),
            "REVIEWER" => Some(Self::Reviewer),
            "TESTER" => Some(Self::Tester),
            "DOCUMENTER" => Some(Self::Documenter),
            "FRONTIER" => Some(Self::Frontier),
            "HUMAN" => Some(Self::Human),
            _ => None,
        }
    }

    /// Uppercase label used in classifier prompts and logs.
    pub fn label(self) -> &'static str {
        match self {
            Self::Architect => "ARCHITECT",
            Self::Coder => "CODER",
            Self::Reviewer => "REVIEWER",
            Self::Tester => "TESTER",
            Self::Documenter => "DOCUMENTER",
            Self::Frontier => "FRONTIER",
            Self::Human => "HUMAN",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Security half of a routing decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityAssessment {
    pub risk_level: RiskLevel,
    pub detected_threats: Vec<String>,
    pub is_malicious: bool,
}

impl Default for SecurityAssessment {
    fn default() -> Self {
        Self {
            risk_level: RiskLevel::Low,
            detected_threats: Vec::new(),
            is_malicious: false,
        }
    }
}

/// Validated routing decision.
///
/// Produced once per classification and consumed by value when gated, so a
/// decision cannot drive two transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub difficulty: Difficulty,
    pub security: SecurityAssessment,
    pub target: Role,
    pub rationale: String,
    pub needs_frontier: bool,
    pub needs_human: bool,
    pub needs_reflection: bool,
}

impl RoutingDecision {
    /// Deterministic decision used whenever classification is unavailable
    /// or its output cannot be decoded.
    pub fn fallback() -> Self {
        Self {
            difficulty: Difficulty::Low,
            security: SecurityAssessment::default(),
            target: Role::Coder,
            rationale: FALLBACK_RATIONALE.to_string(),
            needs_frontier: false,
            needs_human: false,
            needs_reflection: false,
        }
    }

    /// Whether this is the fallback decision.
    pub fn is_fallback(&self) -> bool {
        *self == Self::fallback()
    }

    /// Decode and sanitize classifier output.
    ///
    /// Returns `None` when the text is not a JSON object of the expected shape;
    /// callers substitute [`RoutingDecision::fallback`].
    pub fn from_classifier_json(text: &str) -> Option<Self> {
        let raw: RawDecision = serde_json::from_str(text.trim()).ok()?;
        Some(raw.sanitize())
    }
}

/// Classifier output as the model emits it.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawDecision {
    difficulty: String,
    security_scan: RawSecurityScan,
    next_agent: String,
    reason: String,
    use_frontier: bool,
    activate_reflection: bool,
    requires_human: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawSecurityScan {
    risk_level: String,
    detected_threats: Vec<String>,
    is_malicious: bool,
}

impl RawDecision {
    fn sanitize(self) -> RoutingDecision {
        let target = Role::parse(&self.next_agent).unwrap_or(Role::Coder);

        let detected_threats = self
            .security_scan
            .detected_threats
            .into_iter()
            .map(|t| truncate_chars(t.trim(), MAX_THREAT_CHARS))
            .filter(|t| !t.is_empty())
            .take(MAX_THREATS)
            .collect();

        RoutingDecision {
            difficulty: Difficulty::parse_lenient(&self.difficulty),
            security: SecurityAssessment {
                risk_level: RiskLevel::parse_lenient(&self.security_scan.risk_level),
                detected_threats,
                is_malicious: self.security_scan.is_malicious,
            },
            target,
            rationale: truncate_chars(self.reason.trim(), MAX_RATIONALE_CHARS),
            needs_frontier: self.use_frontier || target == Role::Frontier,
            needs_human: self.requires_human || target == Role::Human,
            needs_reflection: self.activate_reflection,
        }
    }
}

/// Truncate to at most `max` characters on a char boundary.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_is_deterministic() {
        let a = RoutingDecision::fallback();
        let b = RoutingDecision::fallback();
        assert_eq!(a, b);
        assert_eq!(a.difficulty, Difficulty::Low);
        assert_eq!(a.security.risk_level, RiskLevel::Low);
        assert!(a.security.detected_threats.is_empty());
        assert!(!a.security.is_malicious);
        assert_eq!(a.target, Role::Coder);
        assert_eq!(a.rationale, "fallback — classification unavailable.");
        assert!(a.is_fallback());
    }

    #[test]
    fn test_parse_full_decision() {
        let json = r#"{
            "difficulty": "상",
            "security_scan": {"risk_level": "HIGH", "detected_threats": ["prompt injection"], "is_malicious": false},
            "next_agent": "architect",
            "reason": "multi-module redesign",
            "requires_swap": true,
            "use_frontier": false,
            "activate_reflection": true
        }"#;
        let d = RoutingDecision::from_classifier_json(json).unwrap();
        assert_eq!(d.difficulty, Difficulty::High);
        assert_eq!(d.security.risk_level, RiskLevel::High);
        assert_eq!(d.security.detected_threats, vec!["prompt injection"]);
        assert_eq!(d.target, Role::Architect);
        assert!(d.needs_reflection);
        assert!(!d.needs_frontier);
        assert!(!d.needs_human);
    }

    #[test]
    fn test_unknown_role_defaults_to_coder() {
        let d = RoutingDecision::from_classifier_json(r#"{"next_agent": "WIZARD"}"#).unwrap();
        assert_eq!(d.target, Role::Coder);
        assert_eq!(d.difficulty, Difficulty::Low);
    }

    #[test]
    fn test_human_and_frontier_targets_set_flags() {
        let d = RoutingDecision::from_classifier_json(r#"{"next_agent": "HUMAN"}"#).unwrap();
        assert!(d.needs_human);
        let d = RoutingDecision::from_classifier_json(r#"{"next_agent": "FRONTIER"}"#).unwrap();
        assert!(d.needs_frontier);
    }

    #[test]
    fn test_malformed_json_is_none() {
        assert!(RoutingDecision::from_classifier_json("not json").is_none());
        assert!(RoutingDecision::from_classifier_json("[1, 2]").is_none());
        assert!(RoutingDecision::from_classifier_json(r#"{"difficulty": 3}"#).is_none());
    }

    #[test]
    fn test_threats_bounded() {
        let threats: Vec<String> = (0..40).map(|i| format!("threat {i}")).collect();
        let json = serde_json::json!({
            "security_scan": {"detected_threats": threats, "is_malicious": true},
            "reason": "x".repeat(2_000),
        });
        let d = RoutingDecision::from_classifier_json(&json.to_string()).unwrap();
        assert_eq!(d.security.detected_threats.len(), MAX_THREATS);
        assert_eq!(d.rationale.chars().count(), MAX_RATIONALE_CHARS);
        assert!(d.security.is_malicious);
    }

    #[test]
    fn test_truncate_chars_multibyte() {
        assert_eq!(truncate_chars("요청입니다", 2), "요청");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }
}
