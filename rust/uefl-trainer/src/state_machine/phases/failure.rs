use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{error, info};

use crate::{
    event,
    state_machine::{
        coordinator::Outcome,
        events::EvaluationUpdate,
        phases::{
            AggregateError,
            Evaluate,
            EvaluateError,
            ExtendError,
            Idle,
            IdleError,
            Phase,
            PhaseName,
            PhaseState,
            Shared,
            Shutdown,
            TrainError,
        },
        StateMachine,
    },
    storage::Storage,
};

/// Errors which can occur during the execution of the [`StateMachine`].
#[derive(Error, Debug)]
pub enum PhaseError {
    #[error("idle phase failed: {0}")]
    Idle(#[from] IdleError),
    #[error("train phase failed: {0}")]
    Train(#[from] TrainError),
    #[error("aggregate phase failed: {0}")]
    Aggregate(#[from] AggregateError),
    #[error("evaluate phase failed: {0}")]
    Evaluate(#[from] EvaluateError),
    #[error("extend phase failed: {0}")]
    Extend(#[from] ExtendError),
}

impl PhaseError {
    /// Gets the name of the phase that failed.
    pub fn phase(&self) -> PhaseName {
        match self {
            PhaseError::Idle(_) => PhaseName::Idle,
            PhaseError::Train(_) => PhaseName::Train,
            PhaseError::Aggregate(_) => PhaseName::Aggregate,
            PhaseError::Evaluate(_) => PhaseName::Evaluate,
            PhaseError::Extend(_) => PhaseName::Extend,
        }
    }

    /// Checks whether the error was caused by the store, in which case the phase can be retried
    /// once the store is ready again.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            PhaseError::Idle(IdleError::SetCoordinatorState(_))
                | PhaseError::Aggregate(AggregateError::SetGlobalModel(_))
                | PhaseError::Aggregate(AggregateError::SetCoordinatorState(_))
                | PhaseError::Evaluate(EvaluateError::SetCoordinatorState(_))
                | PhaseError::Extend(ExtendError::SetGlobalModel(_))
                | PhaseError::Extend(ExtendError::SetCoordinatorState(_))
        )
    }
}

/// The failure state.
#[derive(Debug)]
pub struct Failure {
    pub(in crate::state_machine) error: PhaseError,
}

#[async_trait]
impl<T> Phase<T> for PhaseState<Failure, T>
where
    T: Storage,
{
    const NAME: PhaseName = PhaseName::Failure;

    async fn process(&mut self) -> Result<(), PhaseError> {
        error!("phase state error: {}", self.private.error);
        let phase = self.private.error.phase().to_string();
        let handling = if self.private.error.is_storage() {
            "retry"
        } else {
            "fatal"
        };
        event!(
            "Phase error",
            self.private.error.to_string(),
            [phase.as_str(), handling]
        );

        Ok(())
    }

    fn broadcast(&mut self) {
        info!("broadcasting invalidation of the silo evaluations");
        self.shared
            .events
            .broadcast_evaluations(EvaluationUpdate::Invalidate);
    }

    async fn next(mut self) -> Option<StateMachine<T>> {
        if !self.private.error.is_storage() {
            let outcome = Outcome::Failed(self.private.error.to_string());
            return Some(PhaseState::<Shutdown, _>::new(self.shared, outcome).into());
        }

        self.wait_for_store_readiness().await;
        Some(self.into_retry_state())
    }
}

impl<T> PhaseState<Failure, T> {
    /// Creates a new error phase.
    pub fn new(shared: Shared<T>, error: PhaseError) -> Self {
        Self {
            private: Failure { error },
            shared,
        }
    }

    /// Gets the phase to retry after a storage error.
    ///
    /// A failed round is run again under a new round ID. A failed evaluation or extension
    /// restarts from the evaluation of the current iteration, as does a round that failed after
    /// its model was counted as the last one of the iteration.
    fn into_retry_state(self) -> StateMachine<T> {
        match self.private.error {
            PhaseError::Evaluate(_) | PhaseError::Extend(_) => {
                PhaseState::<Evaluate, _>::new(self.shared).into()
            }
            _ if self.shared.state.is_iteration_done() => {
                PhaseState::<Evaluate, _>::new(self.shared).into()
            }
            _ => PhaseState::<Idle, _>::new(self.shared).into(),
        }
    }
}

impl<T> PhaseState<Failure, T>
where
    T: Storage,
{
    /// Waits until the [`Store`] is ready.
    ///
    /// [`Store`]: crate::storage::Store
    async fn wait_for_store_readiness(&mut self) {
        while let Err(err) = <T as Storage>::is_ready(&mut self.shared.store).await {
            error!("store not ready: {}", err);
            info!("try again in 5 sec");
            sleep(Duration::from_secs(5)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    use super::*;
    use crate::{
        state_machine::tests::builder::StateMachineBuilder,
        storage::{
            tests::{init_store, MockCoordinatorStore, MockModelStore},
            Store,
        },
    };
    use uefl_core::aggregation::AggregationError;

    #[tokio::test]
    async fn integration_failure_to_shutdown() {
        let (store, _dir) = init_store().await;
        let (state_machine, events) = StateMachineBuilder::new(store)
            .with_phase(Failure {
                error: PhaseError::Aggregate(AggregateError::Aggregation(AggregationError::NoModel)),
            })
            .build();
        assert!(state_machine.is_failure());

        let state_machine = state_machine.next().await.unwrap();
        assert!(state_machine.is_shutdown());

        let PhaseState { private, .. } = state_machine.into_shutdown_phase_state();
        assert!(matches!(private.outcome, Outcome::Failed(_)));

        // Check all the events that should be emitted during the failure phase
        assert_eq!(
            events.phase_listener().get_latest().event,
            PhaseName::Failure,
        );
        assert_eq!(
            events.evaluations_listener().get_latest().event,
            EvaluationUpdate::Invalidate,
        );
    }

    #[tokio::test(start_paused = true)]
    async fn integration_failure_waits_for_the_store_and_retries_the_round() {
        let mut cs = MockCoordinatorStore::new();
        let mut ready = 0;
        cs.expect_is_ready().times(3).returning(move || {
            ready += 1;
            if ready < 3 {
                Err(anyhow!("disk unavailable"))
            } else {
                Ok(())
            }
        });
        let mut ms = MockModelStore::new();
        ms.expect_is_ready().returning(|| Ok(()));
        let store = Store::new(cs, ms);

        let (state_machine, _events) = StateMachineBuilder::new(store)
            .with_round_id(3)
            .with_round_in_iteration(1)
            .with_phase(Failure {
                error: PhaseError::Aggregate(AggregateError::SetGlobalModel(anyhow!("disk full"))),
            })
            .build();

        let state_machine = state_machine.next().await.unwrap();
        assert!(state_machine.is_idle());

        let PhaseState { shared, .. } = state_machine.into_idle_phase_state();
        assert_eq!(shared.state.round_id, 4);
        assert_eq!(shared.state.round_in_iteration, 1);
    }

    #[tokio::test]
    async fn integration_failure_after_the_last_aggregated_round_continues_with_evaluate() {
        let (store, _dir) = init_store().await;
        let (state_machine, _events) = StateMachineBuilder::new(store)
            .with_round_id(2)
            .with_round_in_iteration(2)
            .with_phase(Failure {
                error: PhaseError::Aggregate(AggregateError::SetCoordinatorState(anyhow!(
                    "disk full"
                ))),
            })
            .build();

        let state_machine = state_machine.next().await.unwrap();
        assert!(state_machine.is_evaluate());
    }

    #[tokio::test]
    async fn integration_failed_extension_is_evaluated_again() {
        let (store, _dir) = init_store().await;
        let (state_machine, _events) = StateMachineBuilder::new(store)
            .with_phase(Failure {
                error: PhaseError::Extend(ExtendError::SetCoordinatorState(anyhow!("disk full"))),
            })
            .build();

        let state_machine = state_machine.next().await.unwrap();
        assert!(state_machine.is_evaluate());
    }

    #[test]
    fn test_is_storage() {
        assert!(PhaseError::Idle(IdleError::SetCoordinatorState(anyhow!(""))).is_storage());
        assert!(PhaseError::Extend(ExtendError::SetGlobalModel(anyhow!(""))).is_storage());
        assert!(!PhaseError::Extend(ExtendError::NoSilo).is_storage());
    }

    #[test]
    fn test_phase_of_error() {
        let error = PhaseError::Aggregate(AggregateError::Aggregation(AggregationError::NoModel));
        assert_eq!(error.phase(), PhaseName::Aggregate);
        assert!(!error.is_storage());

        let error = PhaseError::Extend(ExtendError::SetGlobalModel(anyhow!("disk full")));
        assert_eq!(error.phase(), PhaseName::Extend);
        assert!(error.is_storage());
    }
}
