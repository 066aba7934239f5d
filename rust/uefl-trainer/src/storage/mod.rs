//! Storage backends for the coordinator.

pub mod file;
pub mod store;
pub mod traits;

pub use self::{
    file::{FileCoordinatorStore, FileModelStore, FileStore},
    store::Store,
    traits::{CoordinatorStorage, ModelStorage, Storage, StorageError, StorageResult},
};

#[cfg(test)]
pub(crate) mod tests;
