//! The participants of the federation.
//!
//! The coordinator talks to the silos through the [`Federation`] trait. [`LocalFederation`]
//! simulates all silos in-process, each with its own data partition and a [`UeflNet`] that is
//! rebuilt from the global model whenever the silo is asked to do some work.
//!
//! [`UeflNet`]: crate::net::UeflNet

mod local;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::local::{LocalFederation, Silo, EVAL_BATCH_SIZE, KMEANS_MAX_ITER};
use crate::net::NetError;
use uefl_core::{
    data::DataError,
    kmeans::KMeansError,
    BookIndex,
    Model,
    RoundParameters,
    SiloId,
};

#[derive(Debug, Error)]
/// Errors related to the work of a silo.
pub enum SiloError {
    #[error("unknown silo {0}")]
    UnknownSilo(SiloId),
    #[error("network error: {0}")]
    Net(#[from] NetError),
    #[error("tensor operation failed: {0}")]
    Tensor(#[from] candle_core::Error),
    #[error("failed to load the silo data: {0}")]
    Data(#[from] DataError),
    #[error("failed to cluster the local features: {0}")]
    KMeans(#[from] KMeansError),
}

/// The outcome of a round of local training.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalUpdate {
    pub silo: SiloId,
    /// The locally trained model.
    pub model: Model,
    /// The number of training samples, which weighs the model in the aggregation.
    pub samples: usize,
    /// The mean training loss over all mini-batches.
    pub loss: f64,
    /// The mean codebook perplexity over all mini-batches.
    pub perplexity: f64,
}

/// The performance of the global model on the validation split of a silo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiloEvaluation {
    pub silo: SiloId,
    /// The book index the silo quantized with.
    pub book: BookIndex,
    /// The data distribution of the silo.
    pub distribution: usize,
    pub accuracy: f64,
    /// The mean normalized predictive entropy in `[0, 1]`.
    pub uncertainty: f64,
    pub perplexity: f64,
}

/// The centroids of the local encoder features of a silo.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalCentroids {
    pub silo: SiloId,
    /// The centroids, `k × code_dim` in row-major order.
    pub centroids: Vec<f32>,
    /// The number of features assigned to every centroid.
    pub sizes: Vec<f64>,
}

/// The silos of a federation, as seen by the coordinator.
pub trait Federation: Send + Sync {
    /// Gets the number of silos.
    fn num_silos(&self) -> usize;

    /// Creates the initial global model.
    fn init_model(&self) -> Result<Model, SiloError>;

    /// Trains the global model on the data of a silo.
    fn train(
        &self,
        silo: SiloId,
        global: &Model,
        book: BookIndex,
        params: &RoundParameters,
    ) -> Result<LocalUpdate, SiloError>;

    /// Evaluates the global model on the validation data of a silo.
    fn evaluate(
        &self,
        silo: SiloId,
        global: &Model,
        book: BookIndex,
    ) -> Result<SiloEvaluation, SiloError>;

    /// Clusters the encoder features of the training data of a silo into `k` centroids.
    fn local_centroids(
        &self,
        silo: SiloId,
        global: &Model,
        k: usize,
        seed: u64,
    ) -> Result<LocalCentroids, SiloError>;
}
