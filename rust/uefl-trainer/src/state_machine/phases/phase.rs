use std::{fmt, sync::Arc};

use async_trait::async_trait;
use derive_more::Display;
use rayon::prelude::*;
use thiserror::Error;
use tracing::{error_span, info, warn};
use tracing_futures::Instrument;

use crate::{
    metric,
    metrics::Measurement,
    silo::{Federation, SiloError},
    state_machine::{
        coordinator::CoordinatorState,
        events::EventPublisher,
        phases::{Failure, PhaseError},
        StateMachine,
    },
    storage::Storage,
};
use uefl_core::{Model, SiloId};

/// The name of the current phase.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum PhaseName {
    #[display(fmt = "Idle")]
    Idle,
    #[display(fmt = "Train")]
    Train,
    #[display(fmt = "Aggregate")]
    Aggregate,
    #[display(fmt = "Evaluate")]
    Evaluate,
    #[display(fmt = "Extend")]
    Extend,
    #[display(fmt = "Failure")]
    Failure,
    #[display(fmt = "Shutdown")]
    Shutdown,
}

/// A trait that must be implemented by a state in order to move to a next state.
///
/// See the [module level documentation] for more details.
///
/// [module level documentation]: crate::state_machine
#[async_trait]
pub trait Phase<T>
where
    T: Storage,
{
    /// The name of the current phase.
    const NAME: PhaseName;

    /// Performs the tasks of this phase.
    async fn process(&mut self) -> Result<(), PhaseError>;

    /// Broadcasts data of this phase (nothing by default).
    fn broadcast(&mut self) {}

    /// Moves from this phase to the next phase.
    async fn next(self) -> Option<StateMachine<T>>;
}

/// A struct that contains the coordinator state and the I/O interfaces that are shared and
/// accessible by all `PhaseState`s.
pub struct Shared<T> {
    /// The coordinator state.
    pub(in crate::state_machine) state: CoordinatorState,
    /// The event publisher.
    pub(in crate::state_machine) events: EventPublisher,
    /// The store for storing coordinator and model data.
    pub(in crate::state_machine) store: T,
    /// The silos.
    pub(in crate::state_machine) federation: Arc<dyn Federation>,
    /// The latest global model.
    pub(in crate::state_machine) model: Arc<Model>,
}

impl<T> fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("state", &self.state)
            .field("events", &self.events)
            .field("num_silos", &self.federation.num_silos())
            .finish()
    }
}

impl<T> Shared<T> {
    /// Creates a new shared state.
    pub fn new(
        coordinator_state: CoordinatorState,
        publisher: EventPublisher,
        store: T,
        federation: Arc<dyn Federation>,
        model: Arc<Model>,
    ) -> Self {
        Self {
            state: coordinator_state,
            events: publisher,
            store,
            federation,
            model,
        }
    }

    /// Sets the round ID to the given value.
    pub fn set_round_id(&mut self, id: u64) {
        self.state.round_id = id;
        self.events.set_round_id(id);
    }

    /// Returns the current round ID.
    pub fn round_id(&self) -> u64 {
        self.state.round_id
    }
}

/// The state corresponding to a phase of the coordinator.
///
/// This contains the state-dependent `private` state and the state-independent `shared` state
/// which is shared across state transitions.
pub struct PhaseState<S, T> {
    /// The private state.
    pub(in crate::state_machine) private: S,
    /// The shared coordinator state and I/O interfaces.
    pub(in crate::state_machine) shared: Shared<T>,
}

impl<S, T> PhaseState<S, T>
where
    S: Send,
    T: Storage,
    Self: Phase<T>,
{
    /// Runs the current phase to completion.
    ///
    /// 1. Performs the phase tasks.
    /// 2. Broadcasts the phase data.
    /// 3. Transitions to the next phase.
    pub async fn run_phase(mut self) -> Option<StateMachine<T>> {
        let phase = Self::NAME;
        let span = error_span!("run_phase", phase = %phase);

        async move {
            info!("starting phase");
            self.shared.events.broadcast_phase(phase);
            metric!(Measurement::Phase, phase as u8);

            if let Err(err) = self.process().await {
                warn!("failed to perform the phase tasks");
                return Some(self.into_failure_state(err));
            }
            info!("phase ran successfully");

            self.broadcast();

            info!("transitioning to the next phase");
            self.next().await
        }
        .instrument(span)
        .await
    }
}

impl<S, T> PhaseState<S, T> {
    fn into_failure_state(self, err: PhaseError) -> StateMachine<T> {
        PhaseState::<Failure, _>::new(self.shared, err).into()
    }
}

/// Errors which can occur while the silos work.
#[derive(Debug, Error)]
pub enum SiloTaskError {
    #[error("{0}")]
    Silo(#[from] SiloError),
    #[error("silo task aborted: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Runs `task` for all `silos` in parallel on the rayon thread pool.
///
/// The results are in the order of `silos`. The async runtime is not blocked while the silos
/// work.
pub(in crate::state_machine) async fn run_on_silos<F, R>(
    silos: Vec<SiloId>,
    task: F,
) -> Result<Vec<R>, SiloTaskError>
where
    F: Fn(SiloId) -> Result<R, SiloError> + Send + Sync + 'static,
    R: Send + 'static,
{
    let results = tokio::task::spawn_blocking(move || {
        silos
            .into_par_iter()
            .map(task)
            .collect::<Result<Vec<_>, _>>()
    })
    .await?;
    Ok(results?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{state_machine::tests::utils, storage::tests::init_store};

    #[tokio::test]
    async fn integration_update_round_id() {
        let (store, _dir) = init_store().await;
        let coordinator_state = utils::coordinator_state();
        let (mut shared, event_subscriber) = utils::init_shared(coordinator_state, store);

        let phases = event_subscriber.phase_listener();
        // When starting the round ID should be 0
        let id = phases.get_latest().round_id;
        assert_eq!(id, 0);

        shared.set_round_id(1);
        assert_eq!(shared.state.round_id, 1);

        // Old events should still have the same round ID
        let id = phases.get_latest().round_id;
        assert_eq!(id, 0);

        // But new events should have the new round ID
        shared.events.broadcast_phase(PhaseName::Train);
        let id = phases.get_latest().round_id;
        assert_eq!(id, 1);
    }

    #[tokio::test]
    async fn test_run_on_silos_keeps_the_order() {
        let silos = (0..16).map(SiloId).collect();
        let results = run_on_silos(silos, |silo| Ok(silo.0 * 2)).await.unwrap();
        assert_eq!(results, (0..16).map(|i| i * 2).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_run_on_silos_fails_if_one_silo_fails() {
        let silos = (0..4).map(SiloId).collect();
        let err = run_on_silos(silos, |silo| {
            if silo.0 == 2 {
                Err(SiloError::UnknownSilo(silo))
            } else {
                Ok(())
            }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, SiloTaskError::Silo(SiloError::UnknownSilo(SiloId(2)))));
    }
}
