//! A generic store.

use async_trait::async_trait;

use crate::{
    state_machine::coordinator::{CoordinatorState, Summary},
    storage::{CoordinatorStorage, ModelStorage, Storage, StorageResult},
};
use uefl_core::Model;

#[derive(Clone)]
/// A generic store.
pub struct Store<C, M>
where
    C: CoordinatorStorage,
    M: ModelStorage,
{
    /// A coordinator store.
    coordinator: C,
    /// A model store.
    model: M,
}

impl<C, M> Store<C, M>
where
    C: CoordinatorStorage,
    M: ModelStorage,
{
    /// Creates a new [`Store`].
    pub fn new(coordinator: C, model: M) -> Self {
        Self { coordinator, model }
    }
}

#[async_trait]
impl<C, M> CoordinatorStorage for Store<C, M>
where
    C: CoordinatorStorage,
    M: ModelStorage,
{
    async fn set_coordinator_state(&mut self, state: &CoordinatorState) -> StorageResult<()> {
        self.coordinator.set_coordinator_state(state).await
    }

    async fn coordinator_state(&mut self) -> StorageResult<Option<CoordinatorState>> {
        self.coordinator.coordinator_state().await
    }

    async fn set_summary(&mut self, summary: &Summary) -> StorageResult<()> {
        self.coordinator.set_summary(summary).await
    }

    async fn delete_coordinator_data(&mut self) -> StorageResult<()> {
        self.coordinator.delete_coordinator_data().await
    }

    async fn is_ready(&mut self) -> StorageResult<()> {
        self.coordinator.is_ready().await
    }
}

#[async_trait]
impl<C, M> ModelStorage for Store<C, M>
where
    C: CoordinatorStorage,
    M: ModelStorage,
{
    async fn set_global_model(
        &mut self,
        iteration: usize,
        round_id: u64,
        global_model: &Model,
    ) -> StorageResult<String> {
        self.model
            .set_global_model(iteration, round_id, global_model)
            .await
    }

    async fn global_model(&mut self, id: &str) -> StorageResult<Option<Model>> {
        self.model.global_model(id).await
    }

    async fn delete_global_models(&mut self) -> StorageResult<()> {
        self.model.delete_global_models().await
    }

    async fn is_ready(&mut self) -> StorageResult<()> {
        self.model.is_ready().await
    }
}

#[async_trait]
impl<C, M> Storage for Store<C, M>
where
    C: CoordinatorStorage,
    M: ModelStorage,
{
    async fn is_ready(&mut self) -> StorageResult<()> {
        tokio::try_join!(self.coordinator.is_ready(), self.model.is_ready()).map(|_| ())
    }
}
