//! Shared domain types for the Buildsmith orchestrator.
//!
//! These types cross process and file boundaries: builder STATE.json
//! summaries, integration and quality-gate reports, the architect's
//! service map, and the knowledge-graph record shapes. They live in a
//! separate crate so the orchestrator binary and any future tooling
//! agree on the wire formats.

pub mod builder;
pub mod graph;
pub mod report;
pub mod service;

pub use builder::{BuilderResult, BuilderStatus};
pub use graph::{ContextRecord, EdgeKind, GraphBuildResult, NodeKind, NodeRecord};
pub use report::{GateLayerReport, GateVerdict, IntegrationReport, QualityGateReport, Violation};
pub use service::{ArchitectOutput, DomainEntity, DomainModel, ServiceInfo, ServiceMap};
