//! Durable pipeline state: snapshot persistence, cost ledger, state
//! machine, and graceful shutdown.

pub mod cost;
pub mod machine;
pub mod shutdown;
pub mod snapshot;

pub use cost::CostLedger;
pub use machine::{GuardModel, PipelineState, StateMachine, Trigger, resume_trigger};
pub use shutdown::ShutdownSignal;
pub use snapshot::{PipelineSnapshot, SNAPSHOT_FILE, SCHEMA_VERSION};

/// Canonical phase names recorded in `completed_phases` and the cost ledger.
pub mod phases {
    pub const ARCHITECT: &str = "architect";
    pub const CONTRACT_REGISTRATION: &str = "contract_registration";
    pub const BUILDERS: &str = "builders";
    pub const INTEGRATION: &str = "integration";
    pub const QUALITY_GATE: &str = "quality_gate";
    pub const FIX_PASS: &str = "fix_pass";
}
