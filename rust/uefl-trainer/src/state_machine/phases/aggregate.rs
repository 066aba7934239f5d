use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::{
    metric,
    metrics::Measurement,
    silo::LocalUpdate,
    state_machine::{
        events::ModelUpdate,
        phases::{Evaluate, Idle, Phase, PhaseError, PhaseName, PhaseState, Shared},
        StateMachine,
    },
    storage::{Storage, StorageError},
};
use uefl_core::{Aggregation, AggregationError, Model};

/// Errors which can occur during the aggregate phase.
#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("aggregation of the local models failed: {0}")]
    Aggregation(#[from] AggregationError),
    #[error("setting the global model failed: {0}")]
    SetGlobalModel(StorageError),
    #[error("setting the coordinator state failed: {0}")]
    SetCoordinatorState(StorageError),
}

/// The aggregate state.
#[derive(Debug)]
pub struct Aggregate {
    /// The local updates of the silos.
    pub(in crate::state_machine) updates: Vec<LocalUpdate>,
}

#[async_trait]
impl<T> Phase<T> for PhaseState<Aggregate, T>
where
    T: Storage,
{
    const NAME: PhaseName = PhaseName::Aggregate;

    async fn process(&mut self) -> Result<(), PhaseError> {
        let global = self.aggregate().map_err(AggregateError::from)?;
        let (loss, perplexity) = self.round_statistics();

        let state = &mut self.shared.state;
        info!(
            "round {} aggregated: loss {:.4}, perplexity {:.2}",
            state.round_id, loss, perplexity,
        );
        metric!(
            Measurement::RoundLoss,
            loss,
            ("round_id", state.round_id),
            ("iteration", state.iteration),
        );
        metric!(
            Measurement::RoundPerplexity,
            perplexity,
            ("round_id", state.round_id),
            ("iteration", state.iteration),
        );

        let id = self
            .shared
            .store
            .set_global_model(state.iteration, state.round_id, &global)
            .await
            .map_err(AggregateError::SetGlobalModel)?;
        info!("stored global model {}", id);
        state.latest_model_id = Some(id);
        state.round_in_iteration += 1;
        self.shared.model = Arc::new(global);

        self.shared
            .store
            .set_coordinator_state(&self.shared.state)
            .await
            .map_err(AggregateError::SetCoordinatorState)?;

        Ok(())
    }

    fn broadcast(&mut self) {
        info!("broadcasting the new global model");
        self.shared
            .events
            .broadcast_model(ModelUpdate::New(self.shared.model.clone()));
    }

    async fn next(self) -> Option<StateMachine<T>> {
        Some(if self.shared.state.is_iteration_done() {
            PhaseState::<Evaluate, _>::new(self.shared).into()
        } else {
            PhaseState::<Idle, _>::new(self.shared).into()
        })
    }
}

impl<T> PhaseState<Aggregate, T> {
    /// Creates a new aggregate state.
    pub fn new(shared: Shared<T>, updates: Vec<LocalUpdate>) -> Self {
        Self {
            private: Aggregate { updates },
            shared,
        }
    }

    /// Averages the local models weighted by the number of training samples.
    fn aggregate(&self) -> Result<Model, AggregationError> {
        let mut aggregation = Aggregation::new();
        for update in &self.private.updates {
            aggregation.try_aggregate(&update.model, update.samples as f64)?;
        }
        aggregation.average()
    }

    /// Gets the mean loss and perplexity of the silos, weighted by the number of training
    /// samples.
    fn round_statistics(&self) -> (f64, f64) {
        let total = self
            .private
            .updates
            .iter()
            .map(|update| update.samples as f64)
            .sum::<f64>();
        if total == 0. {
            return (0., 0.);
        }
        self.private
            .updates
            .iter()
            .fold((0., 0.), |(loss, perplexity), update| {
                let weight = update.samples as f64 / total;
                (
                    loss + weight * update.loss,
                    perplexity + weight * update.perplexity,
                )
            })
    }
}
