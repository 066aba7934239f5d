use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    state_machine::{
        phases::{Phase, PhaseError, PhaseName, PhaseState, Shared, Train},
        StateMachine,
    },
    storage::{Storage, StorageError},
};

/// Errors which can occur during the idle phase.
#[derive(Debug, Error)]
pub enum IdleError {
    #[error("setting the coordinator state failed: {0}")]
    SetCoordinatorState(StorageError),
}

/// The idle state.
#[derive(Debug)]
pub struct Idle;

#[async_trait]
impl<T> Phase<T> for PhaseState<Idle, T>
where
    T: Storage,
{
    const NAME: PhaseName = PhaseName::Idle;

    async fn process(&mut self) -> Result<(), PhaseError> {
        let state = &mut self.shared.state;
        state.round_params.round_id = state.round_id;
        state.round_params.iteration = state.iteration;
        info!(
            "round {} of iteration {} ({}/{})",
            state.round_id,
            state.iteration,
            state.round_in_iteration + 1,
            state.schedule.rounds_for(state.iteration),
        );

        self.shared
            .store
            .set_coordinator_state(&self.shared.state)
            .await
            .map_err(IdleError::SetCoordinatorState)?;

        Ok(())
    }

    fn broadcast(&mut self) {
        info!("broadcasting new round parameters");
        self.shared
            .events
            .broadcast_params(self.shared.state.round_params);
    }

    async fn next(self) -> Option<StateMachine<T>> {
        Some(PhaseState::<Train, _>::new(self.shared).into())
    }
}

impl<T> PhaseState<Idle, T> {
    /// Creates a new idle state.
    pub fn new(mut shared: Shared<T>) -> Self {
        // every event of the new round carries the new round id, including the phase event
        shared.set_round_id(shared.round_id() + 1);
        debug!("new round ID = {}", shared.round_id());
        Self {
            private: Idle,
            shared,
        }
    }
}
