//! Integration and quality-gate report types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Overall verdict of the quality gate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum GateVerdict {
    Passed,
    #[default]
    Failed,
}

impl GateVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateVerdict::Passed => "passed",
            GateVerdict::Failed => "failed",
        }
    }
}

impl std::fmt::Display for GateVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single scored finding from the quality gate or contract compliance.
///
/// Severity is kept as a free string on the wire; the fix loop buckets
/// unknown values into `error`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Violation {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub expected: String,
    #[serde(default)]
    pub actual: String,
    #[serde(default)]
    pub file_path: String,
    #[serde(default)]
    pub line: u32,
}

impl Violation {
    pub fn new(code: impl Into<String>, severity: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            severity: severity.into(),
            message: message.into(),
            ..Self::default()
        }
    }
}

/// Aggregate report of the integration phase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct IntegrationReport {
    #[serde(default)]
    pub services_deployed: u32,
    #[serde(default)]
    pub services_healthy: u32,
    #[serde(default)]
    pub contract_tests_passed: u32,
    #[serde(default)]
    pub contract_tests_total: u32,
    #[serde(default)]
    pub integration_tests_passed: u32,
    #[serde(default)]
    pub integration_tests_total: u32,
    #[serde(default)]
    pub violations: Vec<Violation>,
    #[serde(default)]
    pub overall_health: String,
}

impl IntegrationReport {
    pub fn failed() -> Self {
        Self {
            overall_health: "failed".to_string(),
            ..Self::default()
        }
    }
}

/// Findings of one quality-gate layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GateLayerReport {
    #[serde(default)]
    pub verdict: GateVerdict,
    #[serde(default)]
    pub violations: Vec<Violation>,
}

/// Full quality-gate report across all layers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct QualityGateReport {
    #[serde(default)]
    pub overall_verdict: GateVerdict,
    #[serde(default)]
    pub total_violations: u32,
    #[serde(default)]
    pub blocking_violations: u32,
    #[serde(default)]
    pub layers: BTreeMap<String, GateLayerReport>,
}

impl QualityGateReport {
    /// Flatten violations across every layer, in layer order.
    pub fn all_violations(&self) -> Vec<Violation> {
        self.layers
            .values()
            .flat_map(|layer| layer.violations.iter().cloned())
            .collect()
    }
}
