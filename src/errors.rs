//! Typed error hierarchy for the Buildsmith pipeline.
//!
//! Five named failure kinds escape a phase; everything else is recovered
//! locally (retry, fallback) and recorded on result objects. The top-level
//! loop catches `BudgetExceeded` explicitly, performs an emergency save,
//! and re-raises; any other unexpected error is wrapped into `Other`.

use thiserror::Error;

/// Errors surfaced by the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Missing external dependency, unreadable config, or invalid PRD.
    /// Fatal: the pipeline marks `failed`, persists, and exits non-zero.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The cost ledger gate fired. Resumable by raising the budget.
    #[error("Budget exceeded: ${total_cost:.2} spent, limit is ${budget_limit:.2}")]
    BudgetExceeded { total_cost: f64, budget_limit: f64 },

    /// Every builder failed.
    #[error("{0}")]
    BuilderFailure(String),

    /// No fix attempts remain and blocking violations are present.
    #[error("{0}")]
    QualityGateFailure(String),

    /// Integration setup was unrecoverable; a report is still written.
    #[error("Integration failure: {0}")]
    IntegrationFailure(String),

    /// A phase exceeded its timeout.
    #[error("Phase '{phase}' timed out after {timeout_s}s")]
    PhaseTimeout { phase: String, timeout_s: u64 },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// Whether the error leaves the snapshot in a resumable state.
    pub fn is_resumable(&self) -> bool {
        matches!(self, PipelineError::BudgetExceeded { .. })
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_exceeded_formats_amounts() {
        let err = PipelineError::BudgetExceeded {
            total_cost: 0.02,
            budget_limit: 0.01,
        };
        let msg = err.to_string();
        assert!(msg.contains("$0.02"));
        assert!(msg.contains("$0.01"));
        assert!(err.is_resumable());
    }

    #[test]
    fn configuration_error_is_not_resumable() {
        let err = PipelineError::Configuration("architect CLI not found".to_string());
        assert!(!err.is_resumable());
        assert!(err.to_string().contains("architect CLI not found"));
    }

    #[test]
    fn phase_timeout_carries_fields() {
        let err = PipelineError::PhaseTimeout {
            phase: "builders".to_string(),
            timeout_s: 1800,
        };
        match &err {
            PipelineError::PhaseTimeout { phase, timeout_s } => {
                assert_eq!(phase, "builders");
                assert_eq!(*timeout_s, 1800);
            }
            _ => panic!("Expected PhaseTimeout"),
        }
    }

    #[test]
    fn anyhow_converts_to_other() {
        let inner = anyhow::anyhow!("unexpected");
        let err: PipelineError = inner.into();
        assert!(matches!(err, PipelineError::Other(_)));
    }

    #[test]
    fn all_variants_implement_std_error() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&PipelineError::BuilderFailure("All 3 builders failed".into()));
        assert_std_error(&PipelineError::QualityGateFailure(
            "Quality gate failed after 2 fix attempts".into(),
        ));
        assert_std_error(&PipelineError::IntegrationFailure("compose up failed".into()));
    }
}
