//! Pipeline state machine: eleven states, thirteen guarded transitions.
//!
//! Triggers are queued and processed single-writer. A trigger that is not
//! valid from the current state is ignored silently; a trigger whose guard
//! evaluates false is a no-op. `complete` and `failed` are terminal.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// The eleven pipeline states.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    #[default]
    Init,
    ArchitectRunning,
    ArchitectReview,
    ContractsRegistering,
    BuildersRunning,
    BuildersComplete,
    Integrating,
    QualityGate,
    FixPass,
    Complete,
    Failed,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Init => "init",
            PipelineState::ArchitectRunning => "architect_running",
            PipelineState::ArchitectReview => "architect_review",
            PipelineState::ContractsRegistering => "contracts_registering",
            PipelineState::BuildersRunning => "builders_running",
            PipelineState::BuildersComplete => "builders_complete",
            PipelineState::Integrating => "integrating",
            PipelineState::QualityGate => "quality_gate",
            PipelineState::FixPass => "fix_pass",
            PipelineState::Complete => "complete",
            PipelineState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Complete | PipelineState::Failed)
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The thirteen transition triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    StartArchitect,
    ArchitectDone,
    ApproveArchitect,
    ContractsRegistered,
    BuildersDone,
    StartIntegration,
    IntegrationDone,
    QualityPassed,
    QualityNeedsFix,
    FixDone,
    Fail,
    RetryArchitect,
    SkipToComplete,
}

/// Guard methods evaluated against the injected model.
pub trait GuardModel {
    fn is_configured(&self) -> bool;
    fn has_service_map(&self) -> bool;
    fn service_map_valid(&self) -> bool;
    fn contracts_valid(&self) -> bool;
    fn has_builder_results(&self) -> bool;
    fn any_builder_passed(&self) -> bool;
    fn has_integration_report(&self) -> bool;
    fn gate_passed(&self) -> bool;
    fn fix_attempts_remaining(&self) -> bool;
    fn fix_applied(&self) -> bool {
        true
    }
    fn retries_remaining(&self) -> bool;
    fn advisory_only(&self) -> bool;
}

type Guard = fn(&dyn GuardModel) -> bool;

struct Transition {
    trigger: Trigger,
    sources: &'static [PipelineState],
    dest: PipelineState,
    guard: Option<Guard>,
}

const NON_TERMINAL: &[PipelineState] = &[
    PipelineState::Init,
    PipelineState::ArchitectRunning,
    PipelineState::ArchitectReview,
    PipelineState::ContractsRegistering,
    PipelineState::BuildersRunning,
    PipelineState::BuildersComplete,
    PipelineState::Integrating,
    PipelineState::QualityGate,
    PipelineState::FixPass,
];

const TRANSITIONS: &[Transition] = &[
    Transition {
        trigger: Trigger::StartArchitect,
        sources: &[PipelineState::Init],
        dest: PipelineState::ArchitectRunning,
        guard: Some(|m| m.is_configured()),
    },
    Transition {
        trigger: Trigger::ArchitectDone,
        sources: &[PipelineState::ArchitectRunning],
        dest: PipelineState::ArchitectReview,
        guard: Some(|m| m.has_service_map()),
    },
    Transition {
        trigger: Trigger::ApproveArchitect,
        sources: &[PipelineState::ArchitectReview],
        dest: PipelineState::ContractsRegistering,
        guard: Some(|m| m.service_map_valid()),
    },
    Transition {
        trigger: Trigger::ContractsRegistered,
        sources: &[PipelineState::ContractsRegistering],
        dest: PipelineState::BuildersRunning,
        guard: Some(|m| m.contracts_valid()),
    },
    Transition {
        trigger: Trigger::BuildersDone,
        sources: &[PipelineState::BuildersRunning],
        dest: PipelineState::BuildersComplete,
        guard: Some(|m| m.has_builder_results()),
    },
    Transition {
        trigger: Trigger::StartIntegration,
        sources: &[PipelineState::BuildersComplete],
        dest: PipelineState::Integrating,
        guard: Some(|m| m.any_builder_passed()),
    },
    Transition {
        trigger: Trigger::IntegrationDone,
        sources: &[PipelineState::Integrating],
        dest: PipelineState::QualityGate,
        guard: Some(|m| m.has_integration_report()),
    },
    Transition {
        trigger: Trigger::QualityPassed,
        sources: &[PipelineState::QualityGate],
        dest: PipelineState::Complete,
        guard: Some(|m| m.gate_passed()),
    },
    Transition {
        trigger: Trigger::QualityNeedsFix,
        sources: &[PipelineState::QualityGate],
        dest: PipelineState::FixPass,
        guard: Some(|m| m.fix_attempts_remaining()),
    },
    Transition {
        trigger: Trigger::FixDone,
        sources: &[PipelineState::FixPass],
        dest: PipelineState::BuildersRunning,
        guard: Some(|m| m.fix_applied()),
    },
    Transition {
        trigger: Trigger::Fail,
        sources: NON_TERMINAL,
        dest: PipelineState::Failed,
        guard: None,
    },
    Transition {
        trigger: Trigger::RetryArchitect,
        sources: &[PipelineState::ArchitectRunning],
        dest: PipelineState::ArchitectRunning,
        guard: Some(|m| m.retries_remaining()),
    },
    Transition {
        trigger: Trigger::SkipToComplete,
        sources: &[PipelineState::QualityGate],
        dest: PipelineState::Complete,
        guard: Some(|m| m.advisory_only()),
    },
];

/// Resume dispatch: which trigger (if any) re-enters the pipeline from an
/// interrupted state. States mapping to `None` resume by re-running the
/// phase handler that produced them.
pub fn resume_trigger(state: PipelineState) -> Option<Trigger> {
    match state {
        PipelineState::Init => Some(Trigger::StartArchitect),
        PipelineState::BuildersComplete => Some(Trigger::StartIntegration),
        _ => None,
    }
}

/// Guard-protected, queue-based state machine.
pub struct StateMachine {
    state: PipelineState,
    queue: VecDeque<Trigger>,
    processing: bool,
}

impl StateMachine {
    pub fn new(initial: PipelineState) -> Self {
        Self {
            state: initial,
            queue: VecDeque::new(),
            processing: false,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Queue a trigger and drain the queue. Returns `true` when this
    /// trigger caused a state change.
    pub fn fire(&mut self, trigger: Trigger, model: &dyn GuardModel) -> bool {
        self.queue.push_back(trigger);
        if self.processing {
            return false;
        }
        self.processing = true;
        let mut changed = false;
        while let Some(next) = self.queue.pop_front() {
            changed |= self.apply(next, model);
        }
        self.processing = false;
        changed
    }

    fn apply(&mut self, trigger: Trigger, model: &dyn GuardModel) -> bool {
        for transition in TRANSITIONS {
            if transition.trigger != trigger {
                continue;
            }
            if !transition.sources.contains(&self.state) {
                // Invalid from the current state: ignored silently.
                continue;
            }
            if let Some(guard) = transition.guard
                && !guard(model)
            {
                return false;
            }
            self.state = transition.dest;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A guard model whose answers are all settable, for exercising the
    /// transition table in isolation.
    #[derive(Default)]
    struct StubModel {
        configured: bool,
        service_map: bool,
        map_valid: bool,
        contracts: bool,
        builder_results: bool,
        builder_passed: bool,
        integration_report: bool,
        gate: bool,
        fix_attempts: bool,
        retries: bool,
        advisory: bool,
    }

    impl StubModel {
        fn all_true() -> Self {
            Self {
                configured: true,
                service_map: true,
                map_valid: true,
                contracts: true,
                builder_results: true,
                builder_passed: true,
                integration_report: true,
                gate: true,
                fix_attempts: true,
                retries: true,
                advisory: true,
            }
        }
    }

    impl GuardModel for StubModel {
        fn is_configured(&self) -> bool {
            self.configured
        }
        fn has_service_map(&self) -> bool {
            self.service_map
        }
        fn service_map_valid(&self) -> bool {
            self.map_valid
        }
        fn contracts_valid(&self) -> bool {
            self.contracts
        }
        fn has_builder_results(&self) -> bool {
            self.builder_results
        }
        fn any_builder_passed(&self) -> bool {
            self.builder_passed
        }
        fn has_integration_report(&self) -> bool {
            self.integration_report
        }
        fn gate_passed(&self) -> bool {
            self.gate
        }
        fn fix_attempts_remaining(&self) -> bool {
            self.fix_attempts
        }
        fn retries_remaining(&self) -> bool {
            self.retries
        }
        fn advisory_only(&self) -> bool {
            self.advisory
        }
    }

    #[test]
    fn happy_path_walks_all_forward_transitions() {
        let model = StubModel::all_true();
        let mut machine = StateMachine::new(PipelineState::Init);

        let path = [
            (Trigger::StartArchitect, PipelineState::ArchitectRunning),
            (Trigger::ArchitectDone, PipelineState::ArchitectReview),
            (Trigger::ApproveArchitect, PipelineState::ContractsRegistering),
            (Trigger::ContractsRegistered, PipelineState::BuildersRunning),
            (Trigger::BuildersDone, PipelineState::BuildersComplete),
            (Trigger::StartIntegration, PipelineState::Integrating),
            (Trigger::IntegrationDone, PipelineState::QualityGate),
            (Trigger::QualityPassed, PipelineState::Complete),
        ];
        for (trigger, expected) in path {
            assert!(machine.fire(trigger, &model), "trigger {trigger:?} should fire");
            assert_eq!(machine.state(), expected);
        }
        assert!(machine.state().is_terminal());
    }

    #[test]
    fn failing_guard_is_a_noop() {
        let model = StubModel::default(); // every guard false
        let mut machine = StateMachine::new(PipelineState::Init);
        assert!(!machine.fire(Trigger::StartArchitect, &model));
        assert_eq!(machine.state(), PipelineState::Init);
    }

    #[test]
    fn invalid_trigger_from_current_state_is_ignored_silently() {
        let model = StubModel::all_true();
        let mut machine = StateMachine::new(PipelineState::Init);
        assert!(!machine.fire(Trigger::QualityPassed, &model));
        assert_eq!(machine.state(), PipelineState::Init);
    }

    #[test]
    fn fail_reaches_failed_from_any_non_terminal_state() {
        let model = StubModel::default();
        for source in NON_TERMINAL {
            let mut machine = StateMachine::new(*source);
            assert!(machine.fire(Trigger::Fail, &model), "fail from {source}");
            assert_eq!(machine.state(), PipelineState::Failed);
        }
    }

    #[test]
    fn fail_is_ignored_in_terminal_states() {
        let model = StubModel::default();
        let mut machine = StateMachine::new(PipelineState::Complete);
        assert!(!machine.fire(Trigger::Fail, &model));
        assert_eq!(machine.state(), PipelineState::Complete);
    }

    #[test]
    fn retry_architect_self_loops() {
        let model = StubModel::all_true();
        let mut machine = StateMachine::new(PipelineState::ArchitectRunning);
        assert!(machine.fire(Trigger::RetryArchitect, &model));
        assert_eq!(machine.state(), PipelineState::ArchitectRunning);
    }

    #[test]
    fn skip_to_complete_requires_advisory_only() {
        let mut model = StubModel::all_true();
        model.advisory = false;
        let mut machine = StateMachine::new(PipelineState::QualityGate);
        assert!(!machine.fire(Trigger::SkipToComplete, &model));

        model.advisory = true;
        assert!(machine.fire(Trigger::SkipToComplete, &model));
        assert_eq!(machine.state(), PipelineState::Complete);
    }

    #[test]
    fn fix_done_returns_to_builders_running() {
        let model = StubModel::all_true();
        let mut machine = StateMachine::new(PipelineState::FixPass);
        assert!(machine.fire(Trigger::FixDone, &model));
        assert_eq!(machine.state(), PipelineState::BuildersRunning);
    }

    #[test]
    fn resume_table_matches_spec() {
        assert_eq!(resume_trigger(PipelineState::Init), Some(Trigger::StartArchitect));
        assert_eq!(
            resume_trigger(PipelineState::BuildersComplete),
            Some(Trigger::StartIntegration)
        );
        assert_eq!(resume_trigger(PipelineState::ArchitectRunning), None);
        assert_eq!(resume_trigger(PipelineState::QualityGate), None);
        assert_eq!(resume_trigger(PipelineState::FixPass), None);
    }

    #[test]
    fn state_serde_uses_snake_case() {
        assert_eq!(
            serde_json::to_string(&PipelineState::BuildersRunning).unwrap(),
            "\"builders_running\""
        );
        let state: PipelineState = serde_json::from_str("\"quality_gate\"").unwrap();
        assert_eq!(state, PipelineState::QualityGate);
    }
}
