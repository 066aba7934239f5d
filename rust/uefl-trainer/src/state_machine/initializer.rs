use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::{
    settings::{DataSettings, ModelSettings, RestoreSettings, TrainSettings},
    silo::{Federation, SiloError},
    state_machine::{
        coordinator::CoordinatorState,
        events::{EventPublisher, EventSubscriber, ModelUpdate},
        phases::{Evaluate, Idle, PhaseName, PhaseState, Shared},
        StateMachine,
    },
    storage::{Storage, StorageError},
};
use uefl_core::Model;

type StateMachineInitializationResult<T> = Result<T, StateMachineInitializationError>;

/// Errors which can occur during the initialization of the [`StateMachine`].
#[derive(Debug, Error)]
pub enum StateMachineInitializationError {
    #[error("the store is not ready: {0}")]
    StoreNotReady(StorageError),
    #[error("fetching coordinator state failed: {0}")]
    FetchCoordinatorState(StorageError),
    #[error("deleting coordinator data failed: {0}")]
    DeleteCoordinatorData(StorageError),
    #[error("deleting global models failed: {0}")]
    DeleteGlobalModels(StorageError),
    #[error("fetching global model failed: {0}")]
    FetchGlobalModel(StorageError),
    #[error("setting the initial global model failed: {0}")]
    SetGlobalModel(StorageError),
    #[error("creating the initial global model failed: {0}")]
    InitModel(#[from] SiloError),
    #[error("{0}")]
    GlobalModelUnavailable(String),
    #[error("{0}")]
    GlobalModelInvalid(String),
    #[error("{0}")]
    StateInvalid(String),
}

/// The state machine initializer that initializes a new state machine.
pub struct StateMachineInitializer<T> {
    data_settings: DataSettings,
    model_settings: ModelSettings,
    train_settings: TrainSettings,
    restore_settings: RestoreSettings,

    federation: Arc<dyn Federation>,
    store: T,
}

impl<T> StateMachineInitializer<T>
where
    T: Storage,
{
    /// Creates a new [`StateMachineInitializer`].
    pub fn new(
        data_settings: DataSettings,
        model_settings: ModelSettings,
        train_settings: TrainSettings,
        restore_settings: RestoreSettings,
        federation: Arc<dyn Federation>,
        store: T,
    ) -> Self {
        Self {
            data_settings,
            model_settings,
            train_settings,
            restore_settings,
            federation,
            store,
        }
    }

    /// Initializes a new [`StateMachine`], either from the settings or by restoring the previous
    /// coordinator state along with the latest global model.
    ///
    /// # Behavior
    ///
    /// - If the [`RestoreSettings.enable`] flag is set to `false`, the current coordinator
    ///   state will be reset and a new [`StateMachine`] is created with the given settings.
    /// - If no coordinator state exists, the current coordinator state will be reset and a new
    ///   [`StateMachine`] is created with the given settings.
    /// - If the coordinator state belongs to a completed run, the initialization will fail with
    ///   [`StateMachineInitializationError::StateInvalid`].
    /// - If a global model has been created but does not exist, the initialization will fail with
    ///   [`StateMachineInitializationError::GlobalModelUnavailable`].
    /// - If a global model exists but its layout doesn't match the model settings or the
    ///   codebook registry, the initialization will fail with
    ///   [`StateMachineInitializationError::GlobalModelInvalid`].
    /// - A restored [`StateMachine`] starts with a new round. If the iteration had already run
    ///   all its rounds, it starts with the evaluation of the iteration instead.
    ///
    /// [`RestoreSettings.enable`]: crate::settings::RestoreSettings::enable
    pub async fn init(mut self) -> StateMachineInitializationResult<(StateMachine<T>, EventSubscriber)> {
        <T as Storage>::is_ready(&mut self.store)
            .await
            .map_err(StateMachineInitializationError::StoreNotReady)?;

        let (coordinator_state, global_model) = if self.restore_settings.enable {
            self.from_previous_state().await?
        } else {
            info!("restoring coordinator state is disabled");
            info!("initialize state machine from settings");
            self.from_settings().await?
        };

        Ok(self.init_state_machine(coordinator_state, global_model))
    }

    // Creates a new [`CoordinatorState`] from the given settings and deletes
    // all coordinator data. Should only be called for the first start
    // or if we need to perform reset.
    async fn from_settings(&mut self) -> StateMachineInitializationResult<(CoordinatorState, Model)> {
        self.store
            .delete_coordinator_data()
            .await
            .map_err(StateMachineInitializationError::DeleteCoordinatorData)?;
        self.store
            .delete_global_models()
            .await
            .map_err(StateMachineInitializationError::DeleteGlobalModels)?;

        let mut coordinator_state = CoordinatorState::new(
            &self.data_settings,
            &self.model_settings,
            &self.train_settings,
        );
        let global_model = self.federation.init_model()?;
        let id = self
            .store
            .set_global_model(0, 0, &global_model)
            .await
            .map_err(StateMachineInitializationError::SetGlobalModel)?;
        debug!("stored initial global model {}", id);
        coordinator_state.latest_model_id = Some(id);

        Ok((coordinator_state, global_model))
    }

    // see [`StateMachineInitializer::init`]
    async fn from_previous_state(&mut self) -> StateMachineInitializationResult<(CoordinatorState, Model)> {
        if let Some(coordinator_state) = self
            .store
            .coordinator_state()
            .await
            .map_err(StateMachineInitializationError::FetchCoordinatorState)?
        {
            self.try_restore_state(coordinator_state).await
        } else {
            info!("no coordinator state available: initialize state machine from settings");
            self.from_settings().await
        }
    }

    // see [`StateMachineInitializer::init`]
    async fn try_restore_state(
        &mut self,
        coordinator_state: CoordinatorState,
    ) -> StateMachineInitializationResult<(CoordinatorState, Model)> {
        if coordinator_state.completed {
            return Err(StateMachineInitializationError::StateInvalid(
                "the previous run has already completed".to_string(),
            ));
        }
        if coordinator_state.registry.num_silos() != self.federation.num_silos() {
            return Err(StateMachineInitializationError::StateInvalid(format!(
                "the coordinator state has {} silos but the federation has {}",
                coordinator_state.registry.num_silos(),
                self.federation.num_silos(),
            )));
        }

        let global_model_id = match coordinator_state.latest_model_id.clone() {
            Some(global_model_id) => global_model_id,
            None => {
                return Err(StateMachineInitializationError::GlobalModelUnavailable(
                    "the coordinator state has no global model".to_string(),
                ))
            }
        };
        let global_model = self
            .load_global_model(&coordinator_state, &global_model_id)
            .await?;

        debug!(
            "restore coordinator with global model id: {}",
            global_model_id
        );
        Ok((coordinator_state, global_model))
    }

    // Loads a global model and checks its properties for suitability.
    async fn load_global_model(
        &mut self,
        coordinator_state: &CoordinatorState,
        global_model_id: &str,
    ) -> StateMachineInitializationResult<Model> {
        match self
            .store
            .global_model(global_model_id)
            .await
            .map_err(StateMachineInitializationError::FetchGlobalModel)?
        {
            Some(global_model) => {
                self.check_model_properties(coordinator_state, &global_model)
                    .map_err(|reason| {
                        StateMachineInitializationError::GlobalModelInvalid(format!(
                            "the global model with the id {} is invalid: {}",
                            global_model_id, reason
                        ))
                    })?;
                Ok(global_model)
            }
            // the model id exists but we cannot find it in the model store
            None => Err(StateMachineInitializationError::GlobalModelUnavailable(
                format!("cannot find global model {}", global_model_id),
            )),
        }
    }

    // Checks whether the properties of the loaded global model match the current
    // model settings and the codebooks of the coordinator.
    fn check_model_properties(
        &self,
        coordinator_state: &CoordinatorState,
        global_model: &Model,
    ) -> Result<(), String> {
        let num_codebooks = coordinator_state.registry.num_codebooks();
        if global_model.num_codebooks() != num_codebooks {
            return Err(format!(
                "it has {} codebooks instead of {}",
                global_model.num_codebooks(),
                num_codebooks
            ));
        }

        let reference = self.federation.init_model().map_err(|err| err.to_string())?;
        for (name, weights) in reference.iter() {
            match global_model.get(name) {
                Some(restored) if restored.shape == weights.shape => {}
                Some(restored) => {
                    return Err(format!(
                        "the shape of {} is {:?} instead of {:?}",
                        name, restored.shape, weights.shape
                    ))
                }
                None => return Err(format!("the parameter {} is missing", name)),
            }
        }
        Ok(())
    }

    // Initializes a new [`StateMachine`] with its components.
    fn init_state_machine(
        self,
        coordinator_state: CoordinatorState,
        global_model: Model,
    ) -> (StateMachine<T>, EventSubscriber) {
        let global_model = Arc::new(global_model);
        let (event_publisher, event_subscriber) = EventPublisher::init(
            coordinator_state.round_id,
            coordinator_state.round_params,
            PhaseName::Idle,
            ModelUpdate::New(global_model.clone()),
        );

        let is_iteration_done = coordinator_state.is_iteration_done();
        let shared = Shared::new(
            coordinator_state,
            event_publisher,
            self.store,
            self.federation,
            global_model,
        );

        let state_machine = if is_iteration_done {
            info!("the iteration has run all its rounds: continue with the evaluation");
            StateMachine::from(PhaseState::<Evaluate, _>::new(shared))
        } else {
            StateMachine::from(PhaseState::<Idle, _>::new(shared))
        };
        (state_machine, event_subscriber)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    use super::*;
    use crate::{
        state_machine::{coordinator::Outcome, tests::utils},
        storage::{
            tests::{init_store, MockCoordinatorStore, MockModelStore},
            CoordinatorStorage,
            ModelStorage,
            Store,
        },
    };
    use uefl_core::{testutils::models::constant_model, BookIndex, SiloId};

    fn initializer<T: Storage>(store: T, restore: bool) -> StateMachineInitializer<T> {
        let (data_settings, model_settings, train_settings) = utils::settings();
        StateMachineInitializer::new(
            data_settings,
            model_settings,
            train_settings,
            RestoreSettings { enable: restore },
            Arc::new(utils::FakeFederation::new(3)),
            store,
        )
    }

    #[tokio::test]
    async fn integration_init_from_settings() {
        let (mut store, _dir) = init_store().await;
        let mut old_state = utils::coordinator_state();
        old_state.round_id = 12;
        store.set_coordinator_state(&old_state).await.unwrap();
        let old_model = constant_model(1., 2, utils::NUM_CODES, utils::CODE_DIM);
        store.set_global_model(1, 12, &old_model).await.unwrap();
        store.set_global_model(0, 0, &old_model).await.unwrap();

        let (state_machine, events) = initializer(store.clone(), false).init().await.unwrap();
        assert!(state_machine.is_idle());

        let PhaseState { shared, .. } = state_machine.into_idle_phase_state();
        assert_eq!(shared.state.round_id, 1);
        assert_eq!(shared.state.latest_model_id.as_deref(), Some("0_0"));
        assert_eq!(shared.model.num_codebooks(), 2);

        // the previous state and models are gone, the initial model is stored
        assert!(store.coordinator_state().await.unwrap().is_none());
        assert!(store.global_model("1_12").await.unwrap().is_none());
        assert_eq!(
            store.global_model("0_0").await.unwrap().as_ref(),
            Some(shared.model.as_ref())
        );
        assert!(matches!(
            events.model_listener().get_latest().event,
            ModelUpdate::New(_)
        ));
    }

    #[tokio::test]
    async fn integration_restore_without_state_starts_from_settings() {
        let (store, _dir) = init_store().await;
        let (state_machine, _events) = initializer(store, true).init().await.unwrap();
        let PhaseState { shared, .. } = state_machine.into_idle_phase_state();
        assert_eq!(shared.state.round_id, 1);
    }

    #[tokio::test]
    async fn integration_restore_state() {
        let (mut store, _dir) = init_store().await;
        let federation = utils::FakeFederation::new(3);
        let mut model = federation.init_model().unwrap();
        model.insert(
            uefl_core::model::codebook_name(2),
            model.codebook(1).unwrap().clone(),
        );
        let id = store.set_global_model(2, 9, &model).await.unwrap();

        let mut state = utils::coordinator_state();
        state.round_id = 9;
        state.iteration = 2;
        state.round_in_iteration = 0;
        state.registry.ensure_codebook(2);
        state.registry.assign(SiloId(1), BookIndex(2));
        state.latest_model_id = Some(id);
        store.set_coordinator_state(&state).await.unwrap();

        let (state_machine, _events) = initializer(store, true).init().await.unwrap();
        assert!(state_machine.is_idle());
        let PhaseState { shared, .. } = state_machine.into_idle_phase_state();
        assert_eq!(shared.state.round_id, 10);
        assert_eq!(shared.state.iteration, 2);
        assert_eq!(shared.state.registry.book(SiloId(1)), BookIndex(2));
        assert_eq!(*shared.model, model);
    }

    #[tokio::test]
    async fn integration_restore_finished_iteration_continues_with_evaluate() {
        let (mut store, _dir) = init_store().await;
        let model = utils::FakeFederation::new(3).init_model().unwrap();
        let id = store.set_global_model(0, 3, &model).await.unwrap();

        let mut state = utils::coordinator_state();
        state.round_id = 3;
        state.round_in_iteration = state.schedule.round;
        state.latest_model_id = Some(id);
        store.set_coordinator_state(&state).await.unwrap();

        let (state_machine, _events) = initializer(store, true).init().await.unwrap();
        assert!(state_machine.is_evaluate());
    }

    #[tokio::test]
    async fn integration_restore_interrupted_round_runs_it_again() {
        let (mut store, _dir) = init_store().await;
        let rounds = utils::coordinator_state().schedule.round;

        // finish all but the last round, then stop while the last one is training
        let (mut state_machine, _events) = initializer(store.clone(), false).init().await.unwrap();
        for _ in 0..3 * (rounds - 1) {
            state_machine = state_machine.next().await.unwrap();
        }
        assert!(state_machine.is_idle());
        let state_machine = state_machine.next().await.unwrap();
        assert!(state_machine.is_train());
        drop(state_machine);

        let stored = store.coordinator_state().await.unwrap().unwrap();
        assert_eq!(stored.round_in_iteration, rounds - 1);
        assert_eq!(stored.latest_model_id.as_deref(), Some("0_1"));

        let (state_machine, _events) = initializer(store, true).init().await.unwrap();
        assert!(state_machine.is_idle());
        let PhaseState { shared, .. } = state_machine.into_idle_phase_state();
        assert_eq!(shared.state.round_in_iteration, rounds - 1);
        assert!(!shared.state.is_iteration_done());
        assert_eq!(shared.state.round_id, rounds as u64 + 1);
    }

    #[tokio::test]
    async fn integration_restore_completed_run_fails() {
        let (mut store, _dir) = init_store().await;
        let mut state = utils::coordinator_state();
        state.completed = true;
        store.set_coordinator_state(&state).await.unwrap();
        store
            .set_summary(&state.summary(Outcome::Completed))
            .await
            .unwrap();

        assert!(matches!(
            initializer(store, true).init().await,
            Err(StateMachineInitializationError::StateInvalid(_))
        ));
    }

    #[tokio::test]
    async fn integration_restore_missing_model_fails() {
        let (mut store, _dir) = init_store().await;
        let mut state = utils::coordinator_state();
        state.latest_model_id = Some("0_4".into());
        store.set_coordinator_state(&state).await.unwrap();

        assert!(matches!(
            initializer(store, true).init().await,
            Err(StateMachineInitializationError::GlobalModelUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn integration_restore_invalid_model_fails() {
        let (mut store, _dir) = init_store().await;
        // one codebook too many
        let model = constant_model(0., 3, utils::NUM_CODES, utils::CODE_DIM);
        let id = store.set_global_model(0, 1, &model).await.unwrap();
        let mut state = utils::coordinator_state();
        state.latest_model_id = Some(id);
        store.set_coordinator_state(&state).await.unwrap();

        assert!(matches!(
            initializer(store.clone(), true).init().await,
            Err(StateMachineInitializationError::GlobalModelInvalid(_))
        ));

        // wrong codeword dimension
        let model = constant_model(0., 2, utils::NUM_CODES, utils::CODE_DIM + 1);
        let id = store.set_global_model(0, 2, &model).await.unwrap();
        state.latest_model_id = Some(id);
        store.set_coordinator_state(&state).await.unwrap();

        assert!(matches!(
            initializer(store, true).init().await,
            Err(StateMachineInitializationError::GlobalModelInvalid(_))
        ));
    }

    #[tokio::test]
    async fn integration_store_not_ready() {
        let mut cs = MockCoordinatorStore::new();
        cs.expect_is_ready()
            .returning(|| Err(anyhow!("disk unavailable")));
        let mut ms = MockModelStore::new();
        ms.expect_is_ready().returning(|| Ok(()));

        assert!(matches!(
            initializer(Store::new(cs, ms), false).init().await,
            Err(StateMachineInitializationError::StoreNotReady(_))
        ));
    }
}
