//! Capability gaps: requirements discovered at runtime with no plugin to
//! serve them, tracked through the synthesis pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Synthesis lifecycle of a gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapStatus {
    Identified,
    Composing,
    Testing,
    Registered,
    Failed,
}

impl GapStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Identified => "identified",
            Self::Composing => "composing",
            Self::Testing => "testing",
            Self::Registered => "registered",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Registered | Self::Failed)
    }
}

/// One declared test case for a synthesized candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisTestCase {
    /// Input handed to `execute`
    #[serde(rename = "in")]
    pub input: serde_json::Value,
    /// Expected output, compared structurally
    #[serde(rename = "out")]
    pub expected: serde_json::Value,
    /// Per-case timeout override in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl SynthesisTestCase {
    pub fn new(input: serde_json::Value, expected: serde_json::Value) -> Self {
        Self {
            input,
            expected,
            timeout_ms: None,
        }
    }
}

/// What the synthesizer is asked to build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisRequirement {
    /// The missing capability tag
    pub capability: String,
    /// Human description of the behavior
    pub description: String,
    /// Skills/tags a template must cover
    #[serde(default)]
    pub required_skills: BTreeSet<String>,
    /// Plugin names the candidate may depend on
    #[serde(default)]
    pub allowed_dependencies: BTreeSet<String>,
    /// Capabilities that whitelist medium-severity validation findings
    #[serde(default)]
    pub allowed_capabilities: BTreeSet<String>,
    /// Declared acceptance cases
    pub test_cases: Vec<SynthesisTestCase>,
    /// Higher first
    #[serde(default)]
    pub priority: i32,
}

impl SynthesisRequirement {
    pub fn new(capability: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            capability: capability.into(),
            description: description.into(),
            required_skills: BTreeSet::new(),
            allowed_dependencies: BTreeSet::new(),
            allowed_capabilities: BTreeSet::new(),
            test_cases: Vec::new(),
            priority: 0,
        }
    }

    pub fn with_test_case(mut self, case: SynthesisTestCase) -> Self {
        self.test_cases.push(case);
        self
    }

    /// Stable signature for the cache: identical requirements
    /// short-circuit to the cached plugin.
    pub fn signature(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.capability.as_bytes());
        for skill in &self.required_skills {
            hasher.update(skill.as_bytes());
        }
        for dep in &self.allowed_dependencies {
            hasher.update(dep.as_bytes());
        }
        for case in &self.test_cases {
            hasher.update(case.input.to_string().as_bytes());
            hasher.update(case.expected.to_string().as_bytes());
        }
        hex::encode(&hasher.finalize()[..16])
    }
}

/// A discovered requirement with no registered plugin providing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityGap {
    pub id: Uuid,
    pub requirement: SynthesisRequirement,
    pub status: GapStatus,
    /// Candidate plugin once one is registered
    pub plugin_id: Option<String>,
    /// Failure detail if synthesis gave up
    pub error: Option<String>,
    pub identified_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CapabilityGap {
    pub fn new(requirement: SynthesisRequirement) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            requirement,
            status: GapStatus::Identified,
            plugin_id: None,
            error: None,
            identified_at: now,
            updated_at: now,
        }
    }

    pub fn set_status(&mut self, status: GapStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_signature_stable_and_sensitive() {
        let req = SynthesisRequirement::new("double", "double the input")
            .with_test_case(SynthesisTestCase::new(json!(1), json!(2)))
            .with_test_case(SynthesisTestCase::new(json!(2), json!(4)));

        assert_eq!(req.signature(), req.clone().signature());

        let other = req
            .clone()
            .with_test_case(SynthesisTestCase::new(json!(3), json!(6)));
        assert_ne!(req.signature(), other.signature());
    }

    #[test]
    fn test_gap_lifecycle() {
        let req = SynthesisRequirement::new("double", "double the input");
        let mut gap = CapabilityGap::new(req);
        assert_eq!(gap.status, GapStatus::Identified);
        assert!(!gap.status.is_terminal());

        gap.set_status(GapStatus::Registered);
        assert!(gap.status.is_terminal());
    }

    #[test]
    fn test_test_case_wire_names() {
        // Test cases use the wire field names "in"/"out".
        let case: SynthesisTestCase = serde_json::from_value(json!({"in": 1, "out": 2})).unwrap();
        assert_eq!(case.input, json!(1));
        assert_eq!(case.expected, json!(2));
    }
}
