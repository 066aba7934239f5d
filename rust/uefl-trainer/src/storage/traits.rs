//! Storage API.

use async_trait::async_trait;

use crate::state_machine::coordinator::{CoordinatorState, Summary};
use uefl_core::Model;

/// The error type for storage operations that are not directly related to application domain.
/// These include, for example IO errors like broken pipe, file not found, out-of-memory, etc.
pub type StorageError = anyhow::Error;

/// The result of the storage operation.
pub type StorageResult<T> = Result<T, StorageError>;

#[async_trait]
/// An abstract coordinator storage.
pub trait CoordinatorStorage
where
    Self: Clone + Send + Sync + 'static,
{
    /// Sets a [`CoordinatorState`].
    ///
    /// # Behavior
    ///
    /// - If no state has been set yet, set the state and return `StorageResult::Ok(())`.
    /// - If a state already exists, override the state and return `StorageResult::Ok(())`.
    async fn set_coordinator_state(&mut self, state: &CoordinatorState) -> StorageResult<()>;

    /// Returns a [`CoordinatorState`].
    ///
    /// # Behavior
    ///
    /// - If no state has been set yet, return `StorageResult::Ok(Option::None)`.
    /// - If a state exists, return `StorageResult::Ok(Some(CoordinatorState))`.
    async fn coordinator_state(&mut self) -> StorageResult<Option<CoordinatorState>>;

    /// Sets the [`Summary`] of a finished run, overriding any previous one.
    async fn set_summary(&mut self, summary: &Summary) -> StorageResult<()>;

    /// Deletes all coordinator data. This includes the coordinator state as well as the
    /// summary.
    async fn delete_coordinator_data(&mut self) -> StorageResult<()>;

    /// Checks if the [`CoordinatorStorage`] is ready to process requests.
    ///
    /// # Behavior
    ///
    /// If the [`CoordinatorStorage`] is ready to process requests, return `StorageResult::Ok(())`.
    /// If the [`CoordinatorStorage`] cannot process requests because of an IO error,
    /// for example, return `StorageResult::Err(error)`.
    async fn is_ready(&mut self) -> StorageResult<()>;
}

#[async_trait]
/// An abstract model storage.
pub trait ModelStorage
where
    Self: Clone + Send + Sync + 'static,
{
    /// Sets a global model.
    ///
    /// # Behavior
    ///
    /// Stores the model under the id of [`ModelStorage::create_global_model_id`] and returns
    /// the id. A model with the same id is overridden.
    async fn set_global_model(
        &mut self,
        iteration: usize,
        round_id: u64,
        global_model: &Model,
    ) -> StorageResult<String>;

    /// Returns a global model.
    ///
    /// # Behavior
    ///
    /// - If the global model does not exist, return `StorageResult::Ok(Option::None)`.
    /// - If the global model exists, return `StorageResult::Ok(Option::Some(Model))`.
    async fn global_model(&mut self, id: &str) -> StorageResult<Option<Model>>;

    /// Deletes all global models.
    ///
    /// # Behavior
    ///
    /// - If no global model exists, return `StorageResult::Ok(())`.
    /// - Models stored afterwards are not affected.
    async fn delete_global_models(&mut self) -> StorageResult<()>;

    /// Creates a unique global model id by using the iteration and the round id in which
    /// the global model was created.
    ///
    /// The format of the default implementation is `iteration_roundid`.
    fn create_global_model_id(iteration: usize, round_id: u64) -> String {
        format!("{}_{}", iteration, round_id)
    }

    /// Checks if the [`ModelStorage`] is ready to process requests.
    ///
    /// # Behavior
    ///
    /// If the [`ModelStorage`] is ready to process requests, return `StorageResult::Ok(())`.
    /// If the [`ModelStorage`] cannot process requests because of an IO error,
    /// for example, return `StorageResult::Err(error)`.
    async fn is_ready(&mut self) -> StorageResult<()>;
}

#[async_trait]
pub trait Storage: CoordinatorStorage + ModelStorage {
    /// Checks if the [`CoordinatorStorage`] and the [`ModelStorage`] are ready to process
    /// requests.
    ///
    /// # Behavior
    ///
    /// If all inner services are ready to process requests,
    /// return `StorageResult::Ok(())`.
    /// If any inner service cannot process requests,
    /// return `StorageResult::Err(error)`.
    async fn is_ready(&mut self) -> StorageResult<()>;
}
