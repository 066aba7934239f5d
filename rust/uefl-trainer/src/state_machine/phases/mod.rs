//! This module provides the `PhaseStates` of the [`StateMachine`].
//!
//! [`StateMachine`]: crate::state_machine::StateMachine

mod aggregate;
mod evaluate;
mod extend;
mod failure;
mod idle;
mod phase;
mod shutdown;
mod train;

pub use self::{
    aggregate::{Aggregate, AggregateError},
    evaluate::{Evaluate, EvaluateError},
    extend::{Extend, ExtendError},
    failure::{Failure, PhaseError},
    idle::{Idle, IdleError},
    phase::{Phase, PhaseName, PhaseState, Shared, SiloTaskError},
    shutdown::Shutdown,
    train::{Train, TrainError},
};
pub(in crate::state_machine) use self::phase::run_on_silos;
