//! Builder worker result types.
//!
//! A builder is an external worker process that generates one service. It
//! reports back through `.agent-team/STATE.json` in its output directory;
//! [`BuilderResult`] mirrors that contract. Consumers must tolerate missing
//! fields, so every field carries a serde default.

use serde::{Deserialize, Serialize};

/// Health of a single builder as tracked in the pipeline snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BuilderStatus {
    #[default]
    Pending,
    Healthy,
    Failed,
}

impl BuilderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuilderStatus::Pending => "pending",
            BuilderStatus::Healthy => "healthy",
            BuilderStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for BuilderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of a single builder execution, parsed from STATE.json.
///
/// Maps the summary contract between the orchestrator and the builder
/// worker: `summary.{success,test_passed,test_total,convergence_ratio}`
/// plus the top-level `total_cost`, `health`, and `completed_phases`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BuilderResult {
    #[serde(default)]
    pub service_id: String,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub test_passed: u32,
    #[serde(default)]
    pub test_total: u32,
    #[serde(default)]
    pub convergence_ratio: f64,
    #[serde(default)]
    pub total_cost: f64,
    #[serde(default = "default_health")]
    pub health: String,
    #[serde(default)]
    pub completed_phases: Vec<String>,
    #[serde(default = "default_exit_code")]
    pub exit_code: i32,
    #[serde(default)]
    pub duration_s: f64,
    #[serde(default)]
    pub error: String,
}

fn default_health() -> String {
    "unknown".to_string()
}

fn default_exit_code() -> i32 {
    -1
}

impl Default for BuilderResult {
    fn default() -> Self {
        Self {
            service_id: String::new(),
            success: false,
            test_passed: 0,
            test_total: 0,
            convergence_ratio: 0.0,
            total_cost: 0.0,
            health: default_health(),
            completed_phases: Vec::new(),
            exit_code: default_exit_code(),
            duration_s: 0.0,
            error: String::new(),
        }
    }
}

impl BuilderResult {
    /// A failure result carrying only the service id and an error message.
    pub fn failure(service_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            error: error.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_result_defaults_tolerate_missing_fields() {
        let parsed: BuilderResult = serde_json::from_str(r#"{"service_id": "auth"}"#).unwrap();
        assert_eq!(parsed.service_id, "auth");
        assert!(!parsed.success);
        assert_eq!(parsed.total_cost, 0.0);
        assert_eq!(parsed.health, "unknown");
        assert!(parsed.completed_phases.is_empty());
        assert_eq!(parsed.exit_code, -1);
    }

    #[test]
    fn builder_result_failure_carries_error() {
        let result = BuilderResult::failure("order-service", "No STATE.json found");
        assert_eq!(result.service_id, "order-service");
        assert!(!result.success);
        assert_eq!(result.error, "No STATE.json found");
    }

    #[test]
    fn builder_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&BuilderStatus::Healthy).unwrap(),
            "\"healthy\""
        );
        let status: BuilderStatus = serde_json::from_str("\"failed\"").unwrap();
        assert_eq!(status, BuilderStatus::Failed);
    }

    #[test]
    fn builder_result_roundtrips() {
        let result = BuilderResult {
            service_id: "notify".to_string(),
            success: true,
            test_passed: 12,
            test_total: 14,
            convergence_ratio: 0.86,
            total_cost: 1.25,
            health: "healthy".to_string(),
            completed_phases: vec!["scaffold".to_string(), "implement".to_string()],
            exit_code: 0,
            duration_s: 42.0,
            error: String::new(),
        };
        let json = serde_json::to_string(&result).unwrap();
        let parsed: BuilderResult = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, result);
    }
}
