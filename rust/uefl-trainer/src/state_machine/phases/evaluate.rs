use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    metric,
    metrics::Measurement,
    state_machine::{
        coordinator::{IterationRecord, Outcome},
        events::EvaluationUpdate,
        phases::{
            run_on_silos,
            Extend,
            Phase,
            PhaseError,
            PhaseName,
            PhaseState,
            Shared,
            Shutdown,
            SiloTaskError,
        },
        StateMachine,
    },
    storage::{Storage, StorageError},
};
use uefl_core::SiloId;

/// Errors which can occur during the evaluate phase.
#[derive(Debug, Error)]
pub enum EvaluateError {
    #[error("evaluation of the global model failed: {0}")]
    Silos(#[from] SiloTaskError),
    #[error("setting the coordinator state failed: {0}")]
    SetCoordinatorState(StorageError),
}

/// The evaluate state.
#[derive(Debug, Default)]
pub struct Evaluate {
    /// The silos whose uncertainty exceeds the threshold.
    pub(in crate::state_machine) uncertain: Vec<SiloId>,
}

#[async_trait]
impl<T> Phase<T> for PhaseState<Evaluate, T>
where
    T: Storage,
{
    const NAME: PhaseName = PhaseName::Evaluate;

    async fn process(&mut self) -> Result<(), PhaseError> {
        let federation = self.shared.federation.clone();
        let global = self.shared.model.clone();
        let registry = self.shared.state.registry.clone();
        let silos = (0..registry.num_silos()).map(SiloId).collect();

        info!("evaluating the global model on {} silos", registry.num_silos());
        let evaluations = run_on_silos(silos, move |silo| {
            federation.evaluate(silo, &global, registry.book(silo))
        })
        .await
        .map_err(EvaluateError::from)?;

        let state = &mut self.shared.state;
        for evaluation in &evaluations {
            debug!(
                "{} (book {}, distribution {}): accuracy {:.4}, uncertainty {:.4}",
                evaluation.silo,
                evaluation.book,
                evaluation.distribution,
                evaluation.accuracy,
                evaluation.uncertainty,
            );
            metric!(
                Measurement::SiloAccuracy,
                evaluation.accuracy,
                ("round_id", state.round_id),
                ("iteration", state.iteration),
                ("silo", evaluation.silo.0),
            );
            metric!(
                Measurement::SiloUncertainty,
                evaluation.uncertainty,
                ("round_id", state.round_id),
                ("iteration", state.iteration),
                ("silo", evaluation.silo.0),
            );
        }

        let schedule = state.schedule;
        self.private.uncertain = evaluations
            .iter()
            .filter(|evaluation| schedule.is_uncertain(evaluation))
            .map(|evaluation| evaluation.silo)
            .collect();
        let record = IterationRecord {
            iteration: state.iteration,
            round_id: state.round_id,
            num_codebooks: state.registry.num_codebooks(),
            evaluations,
            uncertain: self.private.uncertain.clone(),
        };
        info!(
            "iteration {} evaluated: mean accuracy {:.4}, mean uncertainty {:.4}, {} uncertain silos",
            record.iteration,
            record.mean_accuracy(),
            record.mean_uncertainty(),
            record.uncertain.len(),
        );

        // a restored coordinator may evaluate the same iteration twice
        let iteration = state.iteration;
        state.history.retain(|record| record.iteration != iteration);
        state.history.push(record);

        self.shared
            .store
            .set_coordinator_state(&self.shared.state)
            .await
            .map_err(EvaluateError::SetCoordinatorState)?;

        Ok(())
    }

    fn broadcast(&mut self) {
        if let Some(record) = self.shared.state.history.last() {
            info!("broadcasting the silo evaluations");
            let evaluations = Arc::new(record.evaluations.clone());
            self.shared
                .events
                .broadcast_evaluations(EvaluationUpdate::New(evaluations));
        }
    }

    async fn next(self) -> Option<StateMachine<T>> {
        let state = &self.shared.state;
        let is_last_iteration = state.iteration + 1 >= state.schedule.num_dist;
        Some(if self.private.uncertain.is_empty() {
            info!("all silos are certain enough");
            PhaseState::<Shutdown, _>::new(self.shared, Outcome::Completed).into()
        } else if is_last_iteration {
            info!("reached the maximal number of iterations");
            PhaseState::<Shutdown, _>::new(self.shared, Outcome::Completed).into()
        } else {
            PhaseState::<Extend, _>::new(self.shared, self.private.uncertain).into()
        })
    }
}

impl<T> PhaseState<Evaluate, T> {
    /// Creates a new evaluate state.
    pub fn new(shared: Shared<T>) -> Self {
        Self {
            private: Evaluate::default(),
            shared,
        }
    }
}
