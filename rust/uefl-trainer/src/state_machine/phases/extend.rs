use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    metric,
    metrics::Measurement,
    silo::LocalCentroids,
    state_machine::{
        events::ModelUpdate,
        phases::{
            run_on_silos,
            Idle,
            Phase,
            PhaseError,
            PhaseName,
            PhaseState,
            Shared,
            SiloTaskError,
        },
        StateMachine,
    },
    storage::{Storage, StorageError},
};
use uefl_core::{
    kmeans::{KMeans, KMeansError},
    model::codebook_name,
    BookIndex,
    SiloId,
    Weights,
};

/// Errors which can occur during the extend phase.
#[derive(Debug, Error)]
pub enum ExtendError {
    #[error("no silo needs an extension codebook")]
    NoSilo,
    #[error("the global model has no shared codebook")]
    NoSharedCodebook,
    #[error("computing the local centroids failed: {0}")]
    Silos(#[from] SiloTaskError),
    #[error("clustering the local centroids failed: {0}")]
    KMeans(#[from] KMeansError),
    #[error("the clustered codebook doesn't have {0} codewords")]
    InvalidCodebook(usize),
    #[error("setting the global model failed: {0}")]
    SetGlobalModel(StorageError),
    #[error("setting the coordinator state failed: {0}")]
    SetCoordinatorState(StorageError),
}

/// The extend state.
#[derive(Debug)]
pub struct Extend {
    /// The silos that get the new codebook.
    pub(in crate::state_machine) uncertain: Vec<SiloId>,
}

#[async_trait]
impl<T> Phase<T> for PhaseState<Extend, T>
where
    T: Storage,
{
    const NAME: PhaseName = PhaseName::Extend;

    async fn process(&mut self) -> Result<(), PhaseError> {
        if self.private.uncertain.is_empty() {
            return Err(ExtendError::NoSilo.into());
        }
        let code_dim = self
            .shared
            .model
            .codebook(BookIndex::SHARED.0)
            .and_then(|codebook| codebook.shape.get(1).copied())
            .ok_or(ExtendError::NoSharedCodebook)?;

        // the shared state is only updated once the extension is stored
        let mut state = self.shared.state.clone();
        state.iteration += 1;
        let book = state.registry.ensure_codebook(state.iteration);
        for silo in &self.private.uncertain {
            state.registry.assign(*silo, book);
        }
        info!(
            "iteration {}: assigned codebook {} to {} silos",
            state.iteration,
            book,
            self.private.uncertain.len(),
        );

        let num_codes = state.schedule.num_codes;
        let seed = state.schedule.seed;
        let federation = self.shared.federation.clone();
        let global = self.shared.model.clone();
        let local = run_on_silos(self.private.uncertain.clone(), move |silo| {
            federation.local_centroids(silo, &global, num_codes, seed)
        })
        .await
        .map_err(ExtendError::from)?;

        let codewords = cluster(&local, num_codes, code_dim, seed)?;
        let weights = Weights::new(vec![num_codes, code_dim], codewords)
            .ok_or(ExtendError::InvalidCodebook(num_codes))?;
        let mut model = (*self.shared.model).clone();
        model.insert(codebook_name(book.0), weights);

        let id = self
            .shared
            .store
            .set_global_model(state.iteration, state.round_id, &model)
            .await
            .map_err(ExtendError::SetGlobalModel)?;
        info!("stored global model {}", id);
        state.latest_model_id = Some(id);
        state.round_in_iteration = 0;

        self.shared
            .store
            .set_coordinator_state(&state)
            .await
            .map_err(ExtendError::SetCoordinatorState)?;

        metric!(
            Measurement::CodebookCount,
            state.registry.num_codebooks(),
            ("round_id", state.round_id),
            ("iteration", state.iteration),
        );
        self.shared.state = state;
        self.shared.model = Arc::new(model);

        Ok(())
    }

    fn broadcast(&mut self) {
        info!("broadcasting the extended global model");
        self.shared
            .events
            .broadcast_model(ModelUpdate::New(self.shared.model.clone()));
    }

    async fn next(self) -> Option<StateMachine<T>> {
        Some(PhaseState::<Idle, _>::new(self.shared).into())
    }
}

impl<T> PhaseState<Extend, T> {
    /// Creates a new extend state.
    pub fn new(shared: Shared<T>, uncertain: Vec<SiloId>) -> Self {
        Self {
            private: Extend { uncertain },
            shared,
        }
    }
}

/// Clusters the union of the local centroids into `num_codes` codewords, weighted by the number
/// of local features behind every centroid.
fn cluster(
    local: &[LocalCentroids],
    num_codes: usize,
    code_dim: usize,
    seed: u64,
) -> Result<Vec<f32>, ExtendError> {
    let points = local
        .iter()
        .flat_map(|centroids| centroids.centroids.iter().copied())
        .collect::<Vec<_>>();
    let weights = local
        .iter()
        .flat_map(|centroids| centroids.sizes.iter().copied())
        .collect::<Vec<_>>();
    debug!(
        "clustering {} local centroids into {} codewords",
        weights.len(),
        num_codes
    );

    let clustering = KMeans::new(num_codes, code_dim)
        .with_seed(seed)
        .fit_weighted(&points, &weights)?;
    Ok(clustering.centroids)
}
