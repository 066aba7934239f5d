use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    silo::LocalUpdate,
    state_machine::{
        phases::{
            run_on_silos,
            Aggregate,
            Phase,
            PhaseError,
            PhaseName,
            PhaseState,
            Shared,
            SiloTaskError,
        },
        StateMachine,
    },
    storage::Storage,
};
use uefl_core::SiloId;

/// Errors which can occur during the train phase.
#[derive(Debug, Error)]
pub enum TrainError {
    #[error("local training failed: {0}")]
    Silos(#[from] SiloTaskError),
}

/// The train state.
#[derive(Debug, Default)]
pub struct Train {
    /// The local updates of the silos.
    pub(in crate::state_machine) updates: Vec<LocalUpdate>,
}

#[async_trait]
impl<T> Phase<T> for PhaseState<Train, T>
where
    T: Storage,
{
    const NAME: PhaseName = PhaseName::Train;

    async fn process(&mut self) -> Result<(), PhaseError> {
        let federation = self.shared.federation.clone();
        let global = self.shared.model.clone();
        let registry = self.shared.state.registry.clone();
        let params = self.shared.state.round_params;
        let silos = (0..registry.num_silos()).map(SiloId).collect();

        info!("training the global model on {} silos", registry.num_silos());
        self.private.updates = run_on_silos(silos, move |silo| {
            federation.train(silo, &global, registry.book(silo), &params)
        })
        .await
        .map_err(TrainError::from)?;

        for update in &self.private.updates {
            debug!(
                "{}: {} samples, loss {:.4}, perplexity {:.2}",
                update.silo, update.samples, update.loss, update.perplexity,
            );
        }
        Ok(())
    }

    async fn next(self) -> Option<StateMachine<T>> {
        Some(PhaseState::<Aggregate, _>::new(self.shared, self.private.updates).into())
    }
}

impl<T> PhaseState<Train, T> {
    /// Creates a new train state.
    pub fn new(shared: Shared<T>) -> Self {
        Self {
            private: Train::default(),
            shared,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        silo::SiloError,
        state_machine::tests::{builder::StateMachineBuilder, utils::FakeFederation},
        storage::tests::init_store,
    };

    #[tokio::test]
    async fn integration_train_to_aggregate() {
        let (store, _dir) = init_store().await;
        let (state_machine, _events) = StateMachineBuilder::new(store)
            .with_round_id(1)
            .with_phase(Train::default())
            .build();
        assert!(state_machine.is_train());

        let state_machine = state_machine.next().await.unwrap();
        assert!(state_machine.is_aggregate());

        let PhaseState { private, .. } = state_machine.into_aggregate_phase_state();
        let silos: Vec<_> = private.updates.iter().map(|update| update.silo).collect();
        assert_eq!(silos, vec![SiloId(0), SiloId(1), SiloId(2)]);
    }

    #[tokio::test]
    async fn integration_train_failure() {
        let (store, _dir) = init_store().await;
        let (state_machine, _events) = StateMachineBuilder::new(store)
            .with_federation(FakeFederation::new(3).failing_on(SiloId(1)))
            .with_phase(Train::default())
            .build();

        let state_machine = state_machine.next().await.unwrap();
        assert!(state_machine.is_failure());

        let PhaseState { private, .. } = state_machine.into_failure_phase_state();
        assert!(matches!(
            private.error,
            PhaseError::Train(TrainError::Silos(SiloTaskError::Silo(SiloError::UnknownSilo(
                SiloId(1)
            ))))
        ));
    }
}
