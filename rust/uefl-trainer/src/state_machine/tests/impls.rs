use crate::state_machine::{
    events::{EvaluationUpdate, ModelUpdate},
    phases::{self, PhaseState},
    StateMachine,
};
use std::sync::Arc;
use uefl_core::Model;

impl<T> StateMachine<T> {
    pub fn is_idle(&self) -> bool {
        matches!(self, StateMachine::Idle(_))
    }

    pub fn into_idle_phase_state(self) -> PhaseState<phases::Idle, T> {
        match self {
            StateMachine::Idle(state) => state,
            _ => panic!("not in idle state"),
        }
    }

    pub fn is_train(&self) -> bool {
        matches!(self, StateMachine::Train(_))
    }

    pub fn into_train_phase_state(self) -> PhaseState<phases::Train, T> {
        match self {
            StateMachine::Train(state) => state,
            _ => panic!("not in train state"),
        }
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self, StateMachine::Aggregate(_))
    }

    pub fn into_aggregate_phase_state(self) -> PhaseState<phases::Aggregate, T> {
        match self {
            StateMachine::Aggregate(state) => state,
            _ => panic!("not in aggregate state"),
        }
    }

    pub fn is_evaluate(&self) -> bool {
        matches!(self, StateMachine::Evaluate(_))
    }

    #[allow(dead_code)]
    pub fn into_evaluate_phase_state(self) -> PhaseState<phases::Evaluate, T> {
        match self {
            StateMachine::Evaluate(state) => state,
            _ => panic!("not in evaluate state"),
        }
    }

    pub fn is_extend(&self) -> bool {
        matches!(self, StateMachine::Extend(_))
    }

    pub fn into_extend_phase_state(self) -> PhaseState<phases::Extend, T> {
        match self {
            StateMachine::Extend(state) => state,
            _ => panic!("not in extend state"),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, StateMachine::Failure(_))
    }

    pub fn into_failure_phase_state(self) -> PhaseState<phases::Failure, T> {
        match self {
            StateMachine::Failure(state) => state,
            _ => panic!("not in failure state"),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(self, StateMachine::Shutdown(_))
    }

    pub fn into_shutdown_phase_state(self) -> PhaseState<phases::Shutdown, T> {
        match self {
            StateMachine::Shutdown(state) => state,
            _ => panic!("not in shutdown state"),
        }
    }
}

impl ModelUpdate {
    pub fn unwrap(self) -> Arc<Model> {
        if let ModelUpdate::New(inner) = self {
            inner
        } else {
            panic!("ModelUpdate::Invalidate");
        }
    }
}

impl EvaluationUpdate {
    pub fn unwrap(self) -> Arc<Vec<crate::silo::SiloEvaluation>> {
        if let EvaluationUpdate::New(inner) = self {
            inner
        } else {
            panic!("EvaluationUpdate::Invalidate");
        }
    }
}
