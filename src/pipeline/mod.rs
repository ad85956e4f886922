//! The top-level pipeline: state-machine-driven, budget-aware,
//! gracefully interruptible, fully resumable.
//!
//! The loop reads the current state, dispatches to the phase handler for
//! that state, re-saves the snapshot, checks the budget, and polls the
//! shutdown flag. Phase executors persist before triggering the
//! transition that records completion, so a resumed pipeline never
//! trusts a transition that is not backed by durable artifacts.

pub mod architect;
pub mod phases;
pub mod quality;

use async_trait::async_trait;
use buildsmith_models::{BuilderResult, GateVerdict, IntegrationReport, QualityGateReport};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::builder::dispatcher::BuilderDispatcher;
use crate::config::OrchestratorConfig;
use crate::errors::{PipelineError, PipelineResult};
use crate::graph::GraphRagEngine;
use crate::integrator::runtime::ContainerRuntime;
use crate::persistence::{PatternStore, RunTracker};
use crate::state::machine::{GuardModel, PipelineState, StateMachine, Trigger};
use crate::state::snapshot::PipelineSnapshot;
use crate::state::{CostLedger, ShutdownSignal};
use crate::util::sha256_hex;

pub use architect::{ArchitectAdapter, ArchitectBackend};

/// Safety bound on loop iterations per pipeline invocation.
const MAX_ITERATIONS: usize = 50;

/// The external quality gate engine, named only by its interface.
#[async_trait]
pub trait QualityEngine: Send + Sync {
    async fn run_all_layers(
        &self,
        builder_results: &BTreeMap<String, BuilderResult>,
        integration_report: &IntegrationReport,
        target_dir: &Path,
        fix_attempts: u32,
        max_fix_attempts: u32,
    ) -> PipelineResult<QualityGateReport>;
}

/// Builds a container runtime for a generated compose file.
pub type RuntimeFactory = Arc<dyn Fn(PathBuf) -> Arc<dyn ContainerRuntime> + Send + Sync>;

/// External collaborators injected into the pipeline.
pub struct Collaborators {
    pub architect: Arc<dyn ArchitectAdapter>,
    pub quality: Arc<dyn QualityEngine>,
    pub runtime_factory: RuntimeFactory,
    pub run_tracker: Option<Arc<RunTracker>>,
    pub pattern_store: Option<Arc<PatternStore>>,
    pub graph_engine: Option<Arc<GraphRagEngine>>,
}

/// Guard evaluation over the persisted snapshot.
struct Guards<'a>(&'a PipelineSnapshot);

impl GuardModel for Guards<'_> {
    fn is_configured(&self) -> bool {
        !self.0.prd_path.is_empty()
    }

    fn has_service_map(&self) -> bool {
        !self.0.service_map_path.is_empty()
    }

    fn service_map_valid(&self) -> bool {
        !self.0.service_map_path.is_empty() && Path::new(&self.0.service_map_path).exists()
    }

    fn contracts_valid(&self) -> bool {
        !self.0.contract_registry_path.is_empty()
    }

    fn has_builder_results(&self) -> bool {
        !self.0.builder_results.is_empty()
    }

    fn any_builder_passed(&self) -> bool {
        self.0.successful_builders > 0
    }

    fn has_integration_report(&self) -> bool {
        !self.0.integration_report_path.is_empty()
    }

    fn gate_passed(&self) -> bool {
        self.0
            .last_quality_results
            .get("overall_verdict")
            .and_then(serde_json::Value::as_str)
            == Some(GateVerdict::Passed.as_str())
    }

    fn fix_attempts_remaining(&self) -> bool {
        self.0.quality_attempts < self.0.max_quality_retries
    }

    fn retries_remaining(&self) -> bool {
        self.0.architect_retries < self.0.max_architect_retries
    }

    fn advisory_only(&self) -> bool {
        let results = &self.0.last_quality_results;
        if results.is_null() {
            return false;
        }
        if self.gate_passed() {
            return true;
        }
        results
            .get("blocking_violations")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(1)
            == 0
    }
}

/// The orchestration engine.
pub struct Pipeline {
    pub(crate) config: OrchestratorConfig,
    pub(crate) output_dir: PathBuf,
    pub(crate) state_dir: PathBuf,
    pub(crate) snapshot: Arc<Mutex<PipelineSnapshot>>,
    pub(crate) ledger: CostLedger,
    pub(crate) shutdown: ShutdownSignal,
    machine: StateMachine,
    pub(crate) dispatcher: BuilderDispatcher,
    pub(crate) architect: Arc<dyn ArchitectAdapter>,
    pub(crate) quality: Arc<dyn QualityEngine>,
    pub(crate) runtime_factory: RuntimeFactory,
    pub(crate) run_tracker: Option<Arc<RunTracker>>,
    pub(crate) pattern_store: Option<Arc<PatternStore>>,
    pub(crate) graph_engine: Option<Arc<GraphRagEngine>>,
}

impl Pipeline {
    /// Create a pipeline rooted at `project_dir` with injected
    /// collaborators. Call [`Pipeline::start`] or [`Pipeline::resume`]
    /// before [`Pipeline::run`].
    pub fn new(
        project_dir: &Path,
        config: OrchestratorConfig,
        collaborators: Collaborators,
    ) -> Self {
        let output_dir = if config.output_dir.is_absolute() {
            config.output_dir.clone()
        } else {
            project_dir.join(&config.output_dir)
        };
        let state_dir = config.state_dir(project_dir);
        let dispatcher = BuilderDispatcher::new(config.builder.clone(), output_dir.clone());
        Self {
            ledger: CostLedger::new(config.budget_limit),
            config,
            output_dir,
            state_dir,
            snapshot: Arc::new(Mutex::new(PipelineSnapshot::default())),
            shutdown: ShutdownSignal::new(),
            machine: StateMachine::new(PipelineState::Init),
            dispatcher,
            architect: collaborators.architect,
            quality: collaborators.quality,
            runtime_factory: collaborators.runtime_factory,
            run_tracker: collaborators.run_tracker,
            pattern_store: collaborators.pattern_store,
            graph_engine: collaborators.graph_engine,
        }
    }

    /// Begin a fresh run for `prd_path`, creating and persisting a new
    /// snapshot.
    pub fn start(&mut self, prd_path: &Path, config_path: Option<&Path>) -> PipelineResult<()> {
        let mut snapshot = PipelineSnapshot::new(
            &prd_path.to_string_lossy(),
            &config_path.map(|p| p.to_string_lossy().to_string()).unwrap_or_default(),
            self.config.builder.depth,
            self.config.budget_limit,
        );
        snapshot.max_architect_retries = self.config.architect.max_retries;
        snapshot.max_quality_retries = self.config.quality_gate.max_fix_retries;
        snapshot.save(&self.state_dir)?;
        info!("Created new pipeline {}", snapshot.pipeline_id);

        self.machine = StateMachine::new(PipelineState::Init);
        self.ledger = CostLedger::new(self.config.budget_limit);
        *self.snapshot.lock().expect("snapshot lock poisoned") = snapshot;
        Ok(())
    }

    /// Resume a previously interrupted run from the persisted snapshot.
    /// The configured budget limit overrides the persisted one, so a
    /// budget-interrupted pipeline can continue after the limit is
    /// raised.
    pub fn resume(&mut self) -> PipelineResult<()> {
        let Some(mut snapshot) = PipelineSnapshot::load(&self.state_dir)? else {
            return Err(PipelineError::Configuration(
                "No pipeline state to resume. Run without --resume first.".to_string(),
            ));
        };
        info!(
            "Resuming pipeline {} from state '{}'",
            snapshot.pipeline_id, snapshot.current_state
        );

        snapshot.interrupted = false;
        snapshot.interrupt_reason.clear();
        snapshot.budget_limit = self.config.budget_limit;

        self.machine = StateMachine::new(snapshot.current_state);
        let mut ledger = CostLedger::new(self.config.budget_limit);
        for (phase, cost) in &snapshot.phase_costs {
            ledger.add_phase_cost(phase, *cost);
        }
        self.ledger = ledger;
        *self.snapshot.lock().expect("snapshot lock poisoned") = snapshot;
        Ok(())
    }

    /// A clone of the current snapshot.
    pub fn snapshot(&self) -> PipelineSnapshot {
        self.snapshot.lock().expect("snapshot lock poisoned").clone()
    }

    /// Shared shutdown signal, for wiring external handlers or tests.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Drive the pipeline to a terminal state (or interruption).
    pub async fn run(&mut self) -> PipelineResult<PipelineSnapshot> {
        self.shutdown.install();
        self.shutdown
            .set_state(self.snapshot.clone(), self.state_dir.clone());

        let result = self.run_loop().await;

        match result {
            Ok(()) => {
                self.record_run_outcome();
                Ok(self.snapshot())
            }
            Err(PipelineError::BudgetExceeded { total_cost, budget_limit }) => {
                warn!("Budget exceeded; saving state and exiting");
                {
                    let mut snap = self.snapshot.lock().expect("snapshot lock poisoned");
                    snap.interrupted = true;
                    snap.interrupt_reason = "Budget exceeded".to_string();
                    snap.current_state = self.machine.state();
                    let _ = snap.save(&self.state_dir);
                }
                Err(PipelineError::BudgetExceeded { total_cost, budget_limit })
            }
            Err(e) => {
                // Named failures transition the machine to `failed`.
                if matches!(
                    e,
                    PipelineError::Configuration(_)
                        | PipelineError::BuilderFailure(_)
                        | PipelineError::QualityGateFailure(_)
                ) {
                    self.fire(Trigger::Fail);
                }
                {
                    let mut snap = self.snapshot.lock().expect("snapshot lock poisoned");
                    snap.current_state = self.machine.state();
                    let _ = snap.save(&self.state_dir);
                }
                self.record_run_outcome();
                Err(e)
            }
        }
    }

    async fn run_loop(&mut self) -> PipelineResult<()> {
        for _ in 0..MAX_ITERATIONS {
            let current = self.machine.state();

            if current.is_terminal() {
                info!("Pipeline reached terminal state: {current}");
                let mut snap = self.snapshot.lock().expect("snapshot lock poisoned");
                snap.current_state = current;
                snap.save(&self.state_dir)?;
                return Ok(());
            }

            if self.shutdown.should_stop() {
                warn!("Graceful shutdown requested at state '{current}'");
                let mut snap = self.snapshot.lock().expect("snapshot lock poisoned");
                snap.interrupted = true;
                snap.interrupt_reason = "Signal received".to_string();
                snap.current_state = current;
                snap.save(&self.state_dir)?;
                return Ok(());
            }

            self.dispatch(current).await?;

            let (within, _) = self.ledger.check_budget();
            if !within {
                return Err(PipelineError::BudgetExceeded {
                    total_cost: self.ledger.total_cost(),
                    budget_limit: self.ledger.budget_limit().unwrap_or_default(),
                });
            }

            let mut snap = self.snapshot.lock().expect("snapshot lock poisoned");
            snap.current_state = self.machine.state();
            snap.save(&self.state_dir)?;
        }
        Err(PipelineError::Other(anyhow::anyhow!(
            "Pipeline exceeded {MAX_ITERATIONS} iterations without reaching a terminal state"
        )))
    }

    async fn dispatch(&mut self, state: PipelineState) -> PipelineResult<()> {
        match state {
            PipelineState::Init => {
                if !self.fire(Trigger::StartArchitect) {
                    return Err(PipelineError::Configuration(
                        "PRD path is not configured".to_string(),
                    ));
                }
                self.save()?;
                self.phase_architect().await?;
                self.save()?;
                self.fire(Trigger::ArchitectDone);
                self.save()?;
                self.fire(Trigger::ApproveArchitect);
            }
            PipelineState::ArchitectRunning => {
                self.phase_architect().await?;
                self.save()?;
                self.fire(Trigger::ArchitectDone);
                self.save()?;
                self.fire(Trigger::ApproveArchitect);
            }
            PipelineState::ArchitectReview => {
                if !self.fire(Trigger::ApproveArchitect) {
                    self.fire(Trigger::Fail);
                }
            }
            PipelineState::ContractsRegistering => {
                self.phase_contract_registration().await?;
                self.save()?;
                self.fire(Trigger::ContractsRegistered);
            }
            PipelineState::BuildersRunning => {
                self.phase_builders().await?;
                self.save()?;
                self.fire(Trigger::BuildersDone);
            }
            PipelineState::BuildersComplete => {
                if !self.fire(Trigger::StartIntegration) {
                    self.fire(Trigger::Fail);
                    return Ok(());
                }
                self.save()?;
                self.phase_integration().await?;
                self.save()?;
                self.fire(Trigger::IntegrationDone);
            }
            PipelineState::Integrating => {
                self.phase_integration().await?;
                self.save()?;
                self.fire(Trigger::IntegrationDone);
            }
            PipelineState::QualityGate => {
                self.phase_quality_gate().await?;
                self.save()?;
                self.dispatch_quality_verdict()?;
            }
            PipelineState::FixPass => {
                self.phase_fix_pass().await?;
                self.save()?;
                self.fire(Trigger::FixDone);
            }
            PipelineState::Complete | PipelineState::Failed => {}
        }
        Ok(())
    }

    fn dispatch_quality_verdict(&mut self) -> PipelineResult<()> {
        let (passed, fix_remaining, advisory, attempts) = {
            let snap = self.snapshot.lock().expect("snapshot lock poisoned");
            let guards = Guards(&snap);
            (
                guards.gate_passed(),
                guards.fix_attempts_remaining(),
                guards.advisory_only(),
                snap.quality_attempts,
            )
        };

        if passed {
            self.fire(Trigger::QualityPassed);
        } else if fix_remaining {
            self.fire(Trigger::QualityNeedsFix);
        } else if advisory {
            self.fire(Trigger::SkipToComplete);
        } else {
            return Err(PipelineError::QualityGateFailure(format!(
                "Quality gate failed after {attempts} fix attempts"
            )));
        }
        Ok(())
    }

    pub(crate) fn fire(&mut self, trigger: Trigger) -> bool {
        let mut snap = self.snapshot.lock().expect("snapshot lock poisoned");
        let changed = self.machine.fire(trigger, &Guards(&snap));
        if changed {
            snap.current_state = self.machine.state();
        }
        changed
    }

    pub(crate) fn save(&self) -> PipelineResult<()> {
        self.snapshot
            .lock()
            .expect("snapshot lock poisoned")
            .save(&self.state_dir)?;
        Ok(())
    }

    /// Mirror the ledger into the snapshot.
    pub(crate) fn sync_costs(&self) {
        let mut snap = self.snapshot.lock().expect("snapshot lock poisoned");
        snap.total_cost = self.ledger.total_cost();
        snap.phase_costs = self.ledger.phase_costs();
    }

    fn record_run_outcome(&self) {
        let Some(tracker) = &self.run_tracker else { return };
        let snap = self.snapshot.lock().expect("snapshot lock poisoned");
        let verdict = match snap.current_state {
            PipelineState::Complete => "complete",
            PipelineState::Failed => "failed",
            _ => "interrupted",
        };
        let prd_hash = std::fs::read_to_string(&snap.prd_path)
            .map(|text| sha256_hex(&text))
            .unwrap_or_default();
        tracker.record_run(
            &snap.pipeline_id,
            &prd_hash,
            verdict,
            snap.total_builders,
            snap.total_cost,
        );
    }
}
