use std::sync::Arc;

use crate::{
    net::EncoderKind,
    settings::{DataSettings, ModelSettings, TrainSettings},
    silo::{Federation, LocalCentroids, LocalUpdate, SiloError, SiloEvaluation},
    state_machine::{
        coordinator::CoordinatorState,
        events::{EventPublisher, EventSubscriber, ModelUpdate},
        phases::{PhaseName, Shared},
    },
};
use uefl_core::{
    codebook::INITIAL_CODEBOOKS,
    data::DatasetKind,
    testutils::models::constant_model,
    BookIndex,
    Model,
    RoundParameters,
    SiloId,
};

use tracing_subscriber::*;

/// The number of codewords per codebook of the test models.
pub const NUM_CODES: usize = 4;
/// The codeword dimension of the test models.
pub const CODE_DIM: usize = 3;

#[allow(dead_code)]
pub fn enable_logging() {
    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(true)
        .try_init();
}

pub fn data_settings() -> DataSettings {
    DataSettings {
        dataset: DatasetKind::Mnist,
        dir: "data".into(),
        num_silo: 3,
        num_dist: 3,
        sample: 8,
        noise: false,
    }
}

pub fn model_settings() -> ModelSettings {
    ModelSettings {
        encoder: EncoderKind::Cnn,
        dim: 2,
        depth: 1,
        num_codes: NUM_CODES,
        seg: 1,
    }
}

pub fn train_settings() -> TrainSettings {
    TrainSettings {
        round: 2,
        round_plus: 1,
        epoch: 1,
        step: 1,
        thd: 0.1,
        batch_size: 4,
        lr: 1e-2,
        seed: 0,
    }
}

pub fn settings() -> (DataSettings, ModelSettings, TrainSettings) {
    (data_settings(), model_settings(), train_settings())
}

pub fn coordinator_state() -> CoordinatorState {
    CoordinatorState::new(&data_settings(), &model_settings(), &train_settings())
}

pub fn init_shared<T>(coordinator_state: CoordinatorState, store: T) -> (Shared<T>, EventSubscriber) {
    init_shared_with(coordinator_state, store, FakeFederation::new(3))
}

pub fn init_shared_with<T>(
    coordinator_state: CoordinatorState,
    store: T,
    federation: FakeFederation,
) -> (Shared<T>, EventSubscriber) {
    let model = Arc::new(federation.init_model().unwrap());
    let (event_publisher, event_subscriber) = EventPublisher::init(
        coordinator_state.round_id,
        coordinator_state.round_params,
        PhaseName::Idle,
        ModelUpdate::New(model.clone()),
    );

    (
        Shared::new(
            coordinator_state,
            event_publisher,
            store,
            Arc::new(federation),
            model,
        ),
        event_subscriber,
    )
}

pub fn evaluation(silo: usize, accuracy: f64, uncertainty: f64) -> SiloEvaluation {
    SiloEvaluation {
        silo: SiloId(silo),
        book: BookIndex::SHARED,
        distribution: 0,
        accuracy,
        uncertainty,
        perplexity: 1.,
    }
}

pub fn local_update(silo: SiloId, model: Model, samples: usize, loss: f64) -> LocalUpdate {
    LocalUpdate {
        silo,
        model,
        samples,
        loss,
        perplexity: loss,
    }
}

/// A federation without networks.
///
/// Training adds `1` to every parameter of the global model. The uncertainty of a silo is taken
/// from the configured list as long as the silo quantizes with the shared codebook. Silos with an
/// extension codebook are certain.
#[derive(Debug, Clone)]
pub struct FakeFederation {
    num_silos: usize,
    failing: Option<SiloId>,
    uncertainties: Vec<f64>,
    local_codes: Option<usize>,
}

impl FakeFederation {
    pub fn new(num_silos: usize) -> Self {
        Self {
            num_silos,
            failing: None,
            uncertainties: vec![0.; num_silos],
            local_codes: None,
        }
    }

    /// Lets every task of the given silo fail.
    pub fn failing_on(mut self, silo: SiloId) -> Self {
        self.failing = Some(silo);
        self
    }

    pub fn with_uncertainties(mut self, uncertainties: Vec<f64>) -> Self {
        assert_eq!(uncertainties.len(), self.num_silos);
        self.uncertainties = uncertainties;
        self
    }

    /// Overrides the number of local centroids of every silo.
    pub fn with_local_codes(mut self, k: usize) -> Self {
        self.local_codes = Some(k);
        self
    }

    fn check(&self, silo: SiloId) -> Result<(), SiloError> {
        if silo.0 >= self.num_silos || self.failing == Some(silo) {
            Err(SiloError::UnknownSilo(silo))
        } else {
            Ok(())
        }
    }
}

impl Federation for FakeFederation {
    fn num_silos(&self) -> usize {
        self.num_silos
    }

    fn init_model(&self) -> Result<Model, SiloError> {
        Ok(constant_model(0., INITIAL_CODEBOOKS, NUM_CODES, CODE_DIM))
    }

    fn train(
        &self,
        silo: SiloId,
        global: &Model,
        _book: BookIndex,
        _params: &RoundParameters,
    ) -> Result<LocalUpdate, SiloError> {
        self.check(silo)?;
        let mut model = global.clone();
        for (_, weights) in model.iter_mut() {
            weights.data.iter_mut().for_each(|x| *x += 1.);
        }
        Ok(local_update(silo, model, 10 * (silo.0 + 1), 1.))
    }

    fn evaluate(
        &self,
        silo: SiloId,
        _global: &Model,
        book: BookIndex,
    ) -> Result<SiloEvaluation, SiloError> {
        self.check(silo)?;
        let uncertainty = if book.is_shared() {
            self.uncertainties[silo.0]
        } else {
            0.
        };
        Ok(SiloEvaluation {
            silo,
            book,
            distribution: silo.0,
            accuracy: 1. - uncertainty,
            uncertainty,
            perplexity: 1.,
        })
    }

    fn local_centroids(
        &self,
        silo: SiloId,
        _global: &Model,
        k: usize,
        _seed: u64,
    ) -> Result<LocalCentroids, SiloError> {
        self.check(silo)?;
        let k = self.local_codes.unwrap_or(k);
        // row `i` of silo `s` is filled with `s + i / k`, which lies in `[s, s + 1)`
        let centroids = (0..k)
            .flat_map(|i| vec![silo.0 as f32 + i as f32 / k as f32; CODE_DIM])
            .collect();
        Ok(LocalCentroids {
            silo,
            centroids,
            sizes: vec![10.; k],
        })
    }
}
