//! Per-phase cost accumulation and the budget gate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Cost record for a single pipeline phase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PhaseCost {
    pub phase_name: String,
    pub cost_usd: f64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// Tracks cumulative cost across pipeline phases.
///
/// The pipeline evaluates `check_budget` between every two phases and on
/// completion of each builder.
#[derive(Debug, Clone, Default)]
pub struct CostLedger {
    phases: BTreeMap<String, PhaseCost>,
    budget_limit: Option<f64>,
    current_phase: Option<String>,
}

impl CostLedger {
    pub fn new(budget_limit: Option<f64>) -> Self {
        Self {
            budget_limit,
            ..Self::default()
        }
    }

    pub fn budget_limit(&self) -> Option<f64> {
        self.budget_limit
    }

    pub fn set_budget_limit(&mut self, limit: Option<f64>) {
        self.budget_limit = limit;
    }

    /// Timestamp the start of a phase.
    pub fn start_phase(&mut self, phase: &str) {
        self.current_phase = Some(phase.to_string());
        self.phases
            .entry(phase.to_string())
            .or_insert_with(|| PhaseCost {
                phase_name: phase.to_string(),
                cost_usd: 0.0,
                start_time: Some(Utc::now()),
                end_time: None,
            });
    }

    /// Close the current phase, adding `cost` to it.
    pub fn end_phase(&mut self, cost: f64) {
        let now = Utc::now();
        if let Some(phase) = self.current_phase.take() {
            let entry = self.phases.entry(phase.clone()).or_insert_with(|| PhaseCost {
                phase_name: phase,
                cost_usd: 0.0,
                start_time: Some(now),
                end_time: None,
            });
            entry.cost_usd += cost;
            entry.end_time = Some(now);
        }
    }

    /// Accumulate ad-hoc cost onto a phase without timing.
    pub fn add_phase_cost(&mut self, phase: &str, delta: f64) {
        let now = Utc::now();
        let entry = self.phases.entry(phase.to_string()).or_insert_with(|| PhaseCost {
            phase_name: phase.to_string(),
            cost_usd: 0.0,
            start_time: Some(now),
            end_time: Some(now),
        });
        entry.cost_usd += delta;
    }

    /// Total cost across all phases.
    pub fn total_cost(&self) -> f64 {
        self.phases.values().map(|p| p.cost_usd).sum()
    }

    /// Mapping of phase name to cumulative cost.
    pub fn phase_costs(&self) -> BTreeMap<String, f64> {
        self.phases
            .iter()
            .map(|(name, p)| (name.clone(), p.cost_usd))
            .collect()
    }

    /// Budget check: `(true, "")` when no limit is set or within budget;
    /// `(false, message)` otherwise.
    pub fn check_budget(&self) -> (bool, String) {
        match self.budget_limit {
            None => (true, String::new()),
            Some(limit) => {
                let total = self.total_cost();
                if total > limit {
                    (
                        false,
                        format!("Budget exceeded: ${total:.2} spent, limit is ${limit:.2}"),
                    )
                } else {
                    (true, String::new())
                }
            }
        }
    }
}
