//! The pipeline snapshot: one JSON file, atomically replaced.
//!
//! The snapshot is an explicit schema-versioned record. Unknown keys in a
//! persisted file are ignored on read (forward compatibility); fields the
//! file lacks take their defaults. The write protocol guarantees that
//! after any crash the target path holds either the previous valid
//! snapshot or the new one, never a partial file, and no temp file
//! remains.

use anyhow::{Context, Result};
use buildsmith_models::{BuilderResult, BuilderStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use crate::config::Depth;
use crate::state::machine::PipelineState;

/// File name of the persisted snapshot inside the state directory.
pub const SNAPSHOT_FILE: &str = "PIPELINE_STATE.json";

/// Current snapshot schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// The entire durable pipeline state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineSnapshot {
    // Identity
    pub pipeline_id: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub schema_version: u32,

    // Inputs
    pub prd_path: String,
    pub config_path: String,
    pub depth: Depth,

    // Machine
    pub current_state: PipelineState,
    /// Ordered phase names; append-only within a run, each at most once.
    pub completed_phases: Vec<String>,

    // Architect retries
    pub architect_retries: u32,
    pub max_architect_retries: u32,

    // Quality loop
    pub quality_attempts: u32,
    pub max_quality_retries: u32,

    // Architect artifacts (paths used by the transition guards)
    pub service_map_path: String,
    pub domain_model_path: String,
    pub contract_registry_path: String,

    /// Per-phase artifact paths: phase -> {key: path}.
    pub phase_artifacts: BTreeMap<String, BTreeMap<String, String>>,

    // Builders
    pub builder_results: BTreeMap<String, BuilderResult>,
    pub builder_statuses: BTreeMap<String, BuilderStatus>,
    pub builder_costs: BTreeMap<String, f64>,
    pub total_builders: u32,
    pub successful_builders: u32,
    pub services_deployed: Vec<String>,

    // Integration
    pub integration_report_path: String,

    // Quality gate
    pub quality_report_path: String,
    /// Full report kept inline so resume never re-reads disk.
    pub last_quality_results: serde_json::Value,

    // Cost
    pub total_cost: f64,
    pub phase_costs: BTreeMap<String, f64>,
    pub budget_limit: Option<f64>,

    // Interrupt
    pub interrupted: bool,
    pub interrupt_reason: String,
}

impl Default for PipelineSnapshot {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            pipeline_id: uuid::Uuid::new_v4().to_string(),
            started_at: now,
            updated_at: now,
            schema_version: SCHEMA_VERSION,
            prd_path: String::new(),
            config_path: String::new(),
            depth: Depth::Standard,
            current_state: PipelineState::Init,
            completed_phases: Vec::new(),
            architect_retries: 0,
            max_architect_retries: 2,
            quality_attempts: 0,
            max_quality_retries: 2,
            service_map_path: String::new(),
            domain_model_path: String::new(),
            contract_registry_path: String::new(),
            phase_artifacts: BTreeMap::new(),
            builder_results: BTreeMap::new(),
            builder_statuses: BTreeMap::new(),
            builder_costs: BTreeMap::new(),
            total_builders: 0,
            successful_builders: 0,
            services_deployed: Vec::new(),
            integration_report_path: String::new(),
            quality_report_path: String::new(),
            last_quality_results: serde_json::Value::Null,
            total_cost: 0.0,
            phase_costs: BTreeMap::new(),
            budget_limit: None,
            interrupted: false,
            interrupt_reason: String::new(),
        }
    }
}

impl PipelineSnapshot {
    /// A fresh snapshot for a new pipeline run.
    pub fn new(prd_path: &str, config_path: &str, depth: Depth, budget_limit: Option<f64>) -> Self {
        Self {
            prd_path: prd_path.to_string(),
            config_path: config_path.to_string(),
            depth,
            budget_limit,
            ..Self::default()
        }
    }

    /// Append a phase to `completed_phases` if not already present.
    pub fn mark_phase_complete(&mut self, phase: &str) {
        if !self.completed_phases.iter().any(|p| p == phase) {
            self.completed_phases.push(phase.to_string());
        }
    }

    /// Record artifact paths for a phase.
    pub fn record_artifacts<I, K, V>(&mut self, phase: &str, entries: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map = self.phase_artifacts.entry(phase.to_string()).or_default();
        for (k, v) in entries {
            map.insert(k.into(), v.into());
        }
    }

    /// Atomically persist this snapshot into `state_dir`.
    ///
    /// Protocol: serialize first, write to a sibling `.tmp` file, flush,
    /// fsync, then rename over the target. The temp file is unlinked on
    /// any write error before the failure propagates.
    pub fn save(&mut self, state_dir: &Path) -> Result<()> {
        let cost_sum: f64 = self.phase_costs.values().sum();
        debug_assert!(
            (self.total_cost - cost_sum).abs() < 1e-6,
            "total_cost {} diverged from phase_costs sum {}",
            self.total_cost,
            cost_sum
        );

        self.updated_at = Utc::now();
        let serialized =
            serde_json::to_string_pretty(self).context("Failed to serialize pipeline snapshot")?;

        std::fs::create_dir_all(state_dir)
            .with_context(|| format!("Failed to create state dir: {}", state_dir.display()))?;

        let target = state_dir.join(SNAPSHOT_FILE);
        let tmp = state_dir.join(format!("{SNAPSHOT_FILE}.tmp"));

        let write_result = (|| -> Result<()> {
            let mut file = std::fs::File::create(&tmp)
                .with_context(|| format!("Failed to create temp file: {}", tmp.display()))?;
            file.write_all(serialized.as_bytes())
                .context("Failed to write snapshot")?;
            file.flush().context("Failed to flush snapshot")?;
            file.sync_all().context("Failed to fsync snapshot")?;
            std::fs::rename(&tmp, &target)
                .with_context(|| format!("Failed to rename snapshot into place: {}", target.display()))?;
            Ok(())
        })();

        if write_result.is_err() && tmp.exists() {
            let _ = std::fs::remove_file(&tmp);
        }
        write_result
    }

    /// Load the snapshot from `state_dir`, or `None` when absent.
    pub fn load(state_dir: &Path) -> Result<Option<Self>> {
        let target = state_dir.join(SNAPSHOT_FILE);
        if !target.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&target)
            .with_context(|| format!("Failed to read snapshot: {}", target.display()))?;
        let snapshot: PipelineSnapshot = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse snapshot: {}", target.display()))?;
        Ok(Some(snapshot))
    }

    /// Remove the state directory entirely.
    pub fn clear(state_dir: &Path) -> Result<()> {
        if state_dir.exists() {
            std::fs::remove_dir_all(state_dir)
                .with_context(|| format!("Failed to remove state dir: {}", state_dir.display()))?;
        }
        Ok(())
    }
}
