use async_trait::async_trait;
use tracing::{info, warn};

use crate::{
    event,
    state_machine::{
        coordinator::Outcome,
        phases::{Phase, PhaseError, PhaseName, PhaseState, Shared},
        StateMachine,
    },
    storage::Storage,
};

/// The shutdown state.
#[derive(Debug)]
pub struct Shutdown {
    /// How the run ended.
    pub(in crate::state_machine) outcome: Outcome,
}

#[async_trait]
impl<T> Phase<T> for PhaseState<Shutdown, T>
where
    T: Storage,
{
    const NAME: PhaseName = PhaseName::Shutdown;

    /// Persists the final coordinator state and the summary of the run.
    ///
    /// Storage errors are only logged, as there is no phase left to retry them in.
    async fn process(&mut self) -> Result<(), PhaseError> {
        let outcome = self.private.outcome.clone();
        info!("shutting down: {}", outcome);
        event!("Shutdown", outcome.to_string());

        let state = &mut self.shared.state;
        state.completed = outcome == Outcome::Completed;
        let summary = state.summary(outcome);

        if let Err(err) = self.shared.store.set_coordinator_state(&self.shared.state).await {
            warn!("failed to store the final coordinator state: {}", err);
        }
        if let Err(err) = self.shared.store.set_summary(&summary).await {
            warn!("failed to store the summary: {}", err);
        }

        Ok(())
    }

    fn broadcast(&mut self) {
        info!("broadcasting the outcome of the run");
        self.shared
            .events
            .broadcast_outcome(self.private.outcome.clone());
    }

    async fn next(self) -> Option<StateMachine<T>> {
        None
    }
}

impl<T> PhaseState<Shutdown, T> {
    /// Creates a new shutdown state.
    pub fn new(shared: Shared<T>, outcome: Outcome) -> Self {
        Self {
            private: Shutdown { outcome },
            shared,
        }
    }
}
