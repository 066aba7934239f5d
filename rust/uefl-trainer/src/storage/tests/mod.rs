use async_trait::async_trait;
use mockall::mock;

use crate::{
    state_machine::coordinator::{CoordinatorState, Summary},
    storage::{CoordinatorStorage, FileStore, ModelStorage, StorageResult},
};
use uefl_core::Model;

mock! {
    pub CoordinatorStore {}

    impl Clone for CoordinatorStore {
        fn clone(&self) -> Self;
    }

    #[async_trait]
    impl CoordinatorStorage for CoordinatorStore {
        async fn set_coordinator_state(&mut self, state: &CoordinatorState) -> StorageResult<()>;
        async fn coordinator_state(&mut self) -> StorageResult<Option<CoordinatorState>>;
        async fn set_summary(&mut self, summary: &Summary) -> StorageResult<()>;
        async fn delete_coordinator_data(&mut self) -> StorageResult<()>;
        async fn is_ready(&mut self) -> StorageResult<()>;
    }
}

mock! {
    pub ModelStore {}

    impl Clone for ModelStore {
        fn clone(&self) -> Self;
    }

    #[async_trait]
    impl ModelStorage for ModelStore {
        async fn set_global_model(
            &mut self,
            iteration: usize,
            round_id: u64,
            global_model: &Model,
        ) -> StorageResult<String>;
        async fn global_model(&mut self, id: &str) -> StorageResult<Option<Model>>;
        async fn delete_global_models(&mut self) -> StorageResult<()>;
        async fn is_ready(&mut self) -> StorageResult<()>;
    }
}

/// Creates a file store in a fresh temporary directory. The directory is removed once the
/// returned guard is dropped.
pub async fn init_store() -> (FileStore, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut store = FileStore::in_workdir(dir.path());
    <FileStore as crate::storage::Storage>::is_ready(&mut store)
        .await
        .unwrap();
    (store, dir)
}
