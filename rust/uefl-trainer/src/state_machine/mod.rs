//! The state machine that drives the federated training.
//!
//! # Overview
//!
//! ```text
//!            ┌──────────────────────────────────┐
//!            v                                  │ more rounds
//! [*] ──> Idle ──> Train ──> Aggregate ─────────┘
//!            ^                   │ iteration done
//!            │                   v
//!            └──── Extend <── Evaluate ──> Shutdown ──> [*]
//!                 uncertain        all certain or
//!                   silos        last distribution
//! ```
//!
//! Any phase but Shutdown moves to Failure on error. Failure retries after storage errors and
//! shuts down otherwise.
//!
//! The [`StateMachine`] runs the rounds and the iterations of the training: it broadcasts the
//! global model to the silos, lets them train locally, aggregates their models, evaluates the
//! uncertainty of every silo after an iteration and extends the codebook for the silos that need
//! it.
//!
//! Furthermore, the [`StateMachine`] publishes coordinator events, persists its state and
//! records metrics.
//!
//! The schedule of the [`StateMachine`] can be configured in the config file. See
//! [here][settings] for more details.
//!
//! # Phase states
//!
//! **Idle**
//!
//! Publishes [`PhaseName::Idle`], increments the `round id` by `1`, persists the
//! [`CoordinatorState`] and publishes the [`RoundParameters`].
//!
//! **Train**
//!
//! Publishes [`PhaseName::Train`] and lets every silo train the global model with its book
//! index on its local data.
//!
//! **Aggregate**
//!
//! Publishes [`PhaseName::Aggregate`], averages the local models weighted by the number of
//! training samples, stores and publishes the new global model. Starts the next round until the
//! iteration has run all its rounds.
//!
//! **Evaluate**
//!
//! Publishes [`PhaseName::Evaluate`], evaluates the global model on the validation data of
//! every silo and publishes the evaluations. Silos whose uncertainty exceeds the threshold get
//! an extension codebook, unless the last iteration has been reached.
//!
//! **Extend**
//!
//! Publishes [`PhaseName::Extend`], assigns the codebook of the next iteration to the uncertain
//! silos, initialises it from their local feature centroids and publishes the extended global
//! model.
//!
//! **Failure**
//!
//! Publishes [`PhaseName::Failure`] and handles [`PhaseError`]s that can occur during the
//! execution of the [`StateMachine`]. Storage errors are handled by waiting for the store and
//! retrying. Any other error shuts the [`StateMachine`] down with a failed [`Outcome`].
//!
//! **Shutdown**
//!
//! Publishes [`PhaseName::Shutdown`], persists the final [`CoordinatorState`] and the
//! [`Summary`] and publishes the [`Outcome`] of the run.
//!
//! [settings]: crate::settings
//! [`CoordinatorState`]: crate::state_machine::coordinator::CoordinatorState
//! [`RoundParameters`]: uefl_core::RoundParameters
//! [`Outcome`]: crate::state_machine::coordinator::Outcome
//! [`Summary`]: crate::state_machine::coordinator::Summary

pub mod coordinator;
pub mod events;
pub mod initializer;
pub mod phases;

#[cfg(test)]
pub(crate) mod tests;

use derive_more::From;

use self::phases::{
    Aggregate,
    Evaluate,
    Extend,
    Failure,
    Idle,
    Phase,
    PhaseName,
    PhaseState,
    Shutdown,
    Train,
};
use crate::storage::Storage;

/// The state machine with all its states.
#[derive(From)]
pub enum StateMachine<T> {
    Idle(PhaseState<Idle, T>),
    Train(PhaseState<Train, T>),
    Aggregate(PhaseState<Aggregate, T>),
    Evaluate(PhaseState<Evaluate, T>),
    Extend(PhaseState<Extend, T>),
    Failure(PhaseState<Failure, T>),
    Shutdown(PhaseState<Shutdown, T>),
}

impl<T> StateMachine<T>
where
    T: Storage,
    PhaseState<Idle, T>: Phase<T>,
    PhaseState<Train, T>: Phase<T>,
    PhaseState<Aggregate, T>: Phase<T>,
    PhaseState<Evaluate, T>: Phase<T>,
    PhaseState<Extend, T>: Phase<T>,
    PhaseState<Failure, T>: Phase<T>,
    PhaseState<Shutdown, T>: Phase<T>,
{
    /// Moves the [`StateMachine`] to the next state and consumes the current one.
    /// Returns the next state or `None` if the [`StateMachine`] reached the state [`Shutdown`].
    pub async fn next(self) -> Option<Self> {
        match self {
            StateMachine::Idle(state) => state.run_phase().await,
            StateMachine::Train(state) => state.run_phase().await,
            StateMachine::Aggregate(state) => state.run_phase().await,
            StateMachine::Evaluate(state) => state.run_phase().await,
            StateMachine::Extend(state) => state.run_phase().await,
            StateMachine::Failure(state) => state.run_phase().await,
            StateMachine::Shutdown(state) => state.run_phase().await,
        }
    }

    /// Runs the state machine until it shuts down.
    pub async fn run(mut self) -> Option<()> {
        loop {
            self = self.next().await?;
        }
    }

    /// Gets the name of the current phase.
    pub fn phase(&self) -> PhaseName {
        match self {
            StateMachine::Idle(_) => PhaseName::Idle,
            StateMachine::Train(_) => PhaseName::Train,
            StateMachine::Aggregate(_) => PhaseName::Aggregate,
            StateMachine::Evaluate(_) => PhaseName::Evaluate,
            StateMachine::Extend(_) => PhaseName::Extend,
            StateMachine::Failure(_) => PhaseName::Failure,
            StateMachine::Shutdown(_) => PhaseName::Shutdown,
        }
    }
}
