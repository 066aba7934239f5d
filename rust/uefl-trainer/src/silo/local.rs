use candle_core::{Device, Tensor, D};
use candle_nn::{loss, ops, AdamW, Optimizer, ParamsAdamW};
use rand::{seq::SliceRandom, SeedableRng};
use rand_chacha::ChaCha20Rng;
use tracing::debug;

use super::{Federation, LocalCentroids, LocalUpdate, SiloError, SiloEvaluation};
use crate::net::{NetConfig, UeflNet};
use uefl_core::{
    data::{Dataset, SiloConfig, SiloData, SiloSplits, NUM_CLASSES},
    kmeans::KMeans,
    uncertainty::mean_normalized_entropy,
    BookIndex,
    Model,
    RoundParameters,
    SiloId,
};

/// The mini-batch size for evaluation and feature extraction.
pub const EVAL_BATCH_SIZE: usize = 256;

/// The maximal number of Lloyd iterations of the local k-means.
pub const KMEANS_MAX_ITER: usize = 100;

/// A silo with its private data.
pub struct Silo {
    splits: SiloSplits,
    config: NetConfig,
    device: Device,
}

impl Silo {
    pub fn new(splits: SiloSplits, config: NetConfig, device: Device) -> Self {
        Self {
            splits,
            config,
            device,
        }
    }

    pub fn id(&self) -> SiloId {
        self.splits.silo
    }

    fn net(&self, global: &Model) -> Result<UeflNet, SiloError> {
        let SiloData { height, width, .. } = self.splits.train;
        Ok(UeflNet::from_model(
            self.config,
            height,
            width,
            global,
            &self.device,
        )?)
    }

    fn batch(&self, data: &SiloData, indices: &[usize]) -> Result<(Tensor, Tensor), SiloError> {
        let (images, labels) = data.batch(indices);
        let n = labels.len();
        let xs = Tensor::from_vec(images, (n, 1, data.height, data.width), &self.device)?;
        let ys = Tensor::from_vec(labels, n, &self.device)?;
        Ok((xs, ys))
    }

    /// Trains the global model for `local_epochs` epochs of at most `steps` mini-batches.
    pub fn train(
        &self,
        global: &Model,
        book: BookIndex,
        params: &RoundParameters,
    ) -> Result<LocalUpdate, SiloError> {
        let net = self.net(global)?;
        let mut optimizer = AdamW::new(
            net.vars(),
            ParamsAdamW {
                lr: params.lr,
                weight_decay: 0.,
                ..Default::default()
            },
        )?;

        let train = &self.splits.train;
        let mut rng = ChaCha20Rng::seed_from_u64(params.silo_seed(self.id()));
        let mut indices: Vec<usize> = (0..train.len()).collect();
        let steps = if params.steps == 0 {
            usize::MAX
        } else {
            params.steps
        };

        let (mut loss_sum, mut perplexity_sum, mut batches) = (0., 0., 0_usize);
        for epoch in 0..params.local_epochs {
            indices.shuffle(&mut rng);
            for chunk in indices.chunks(params.batch_size.max(1)).take(steps) {
                let (xs, ys) = self.batch(train, chunk)?;
                let output = net.forward(&xs, book)?;
                let loss = (loss::cross_entropy(&output.logits, &ys)? + &output.vq_loss)?;
                optimizer.backward_step(&loss)?;

                loss_sum += loss.to_scalar::<f32>()? as f64;
                perplexity_sum += output.perplexity;
                batches += 1;
            }
            debug!(silo = %self.id(), epoch, "local epoch done");
        }

        let batches = batches.max(1) as f64;
        Ok(LocalUpdate {
            silo: self.id(),
            model: net.to_model()?,
            samples: train.len(),
            loss: loss_sum / batches,
            perplexity: perplexity_sum / batches,
        })
    }

    /// Evaluates the global model on the validation split.
    pub fn evaluate(&self, global: &Model, book: BookIndex) -> Result<SiloEvaluation, SiloError> {
        let net = self.net(global)?;
        let validation = &self.splits.validation;
        let indices: Vec<usize> = (0..validation.len()).collect();

        let (mut correct, mut entropy_sum, mut perplexity_sum, mut batches) = (0, 0., 0., 0_usize);
        for chunk in indices.chunks(EVAL_BATCH_SIZE) {
            let (xs, ys) = self.batch(validation, chunk)?;
            let output = net.forward(&xs, book)?;
            let probs = ops::softmax(&output.logits, D::Minus1)?;

            let predictions = probs.argmax(D::Minus1)?.to_vec1::<u32>()?;
            let labels = ys.to_vec1::<u32>()?;
            correct += predictions
                .iter()
                .zip(&labels)
                .filter(|(p, l)| p == l)
                .count();

            let probs = probs.flatten_all()?.to_vec1::<f32>()?;
            entropy_sum += mean_normalized_entropy(&probs, NUM_CLASSES) * chunk.len() as f64;
            perplexity_sum += output.perplexity;
            batches += 1;
        }

        let n = validation.len().max(1) as f64;
        Ok(SiloEvaluation {
            silo: self.id(),
            book,
            distribution: self.splits.distribution,
            accuracy: correct as f64 / n,
            uncertainty: entropy_sum / n,
            perplexity: perplexity_sum / batches.max(1) as f64,
        })
    }

    /// Clusters the encoder features of the training split into `k` centroids.
    pub fn local_centroids(
        &self,
        global: &Model,
        k: usize,
        seed: u64,
    ) -> Result<LocalCentroids, SiloError> {
        let net = self.net(global)?;
        let train = &self.splits.train;
        let indices: Vec<usize> = (0..train.len()).collect();

        let mut points = Vec::new();
        for chunk in indices.chunks(EVAL_BATCH_SIZE) {
            let (xs, _) = self.batch(train, chunk)?;
            points.extend(net.code_vectors(&xs)?.flatten_all()?.to_vec1::<f32>()?);
        }

        let clustering = KMeans::new(k, self.config.code_dim())
            .with_seed(seed)
            .with_max_iter(KMEANS_MAX_ITER)
            .fit(&points)?;
        debug!(
            silo = %self.id(),
            iterations = clustering.iterations,
            "local k-means done"
        );
        Ok(LocalCentroids {
            silo: self.id(),
            centroids: clustering.centroids,
            sizes: clustering.sizes,
        })
    }
}

/// A federation of silos that all live in this process.
pub struct LocalFederation {
    silos: Vec<Silo>,
    config: NetConfig,
    device: Device,
}

impl LocalFederation {
    /// Creates a federation of the given silos. The silo at position `i` must have the id `i`.
    pub fn new(splits: Vec<SiloSplits>, config: NetConfig, device: Device) -> Self {
        let silos = splits
            .into_iter()
            .map(|splits| Silo::new(splits, config, device.clone()))
            .collect();
        Self {
            silos,
            config,
            device,
        }
    }

    /// Partitions the dataset into silos.
    pub fn open(
        dataset: &Dataset,
        silo_config: &SiloConfig,
        config: NetConfig,
        device: Device,
    ) -> Result<Self, SiloError> {
        let splits = (0..silo_config.num_silos)
            .map(|silo| dataset.silo(SiloId(silo), silo_config))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(splits, config, device))
    }

    fn silo(&self, silo: SiloId) -> Result<&Silo, SiloError> {
        self.silos.get(silo.0).ok_or(SiloError::UnknownSilo(silo))
    }
}

impl Federation for LocalFederation {
    fn num_silos(&self) -> usize {
        self.silos.len()
    }

    fn init_model(&self) -> Result<Model, SiloError> {
        let (height, width) = self
            .silos
            .first()
            .map(|silo| (silo.splits.train.height, silo.splits.train.width))
            .ok_or(SiloError::UnknownSilo(SiloId(0)))?;
        Ok(UeflNet::new(self.config, height, width, &self.device)?.to_model()?)
    }

    fn train(
        &self,
        silo: SiloId,
        global: &Model,
        book: BookIndex,
        params: &RoundParameters,
    ) -> Result<LocalUpdate, SiloError> {
        self.silo(silo)?.train(global, book, params)
    }

    fn evaluate(
        &self,
        silo: SiloId,
        global: &Model,
        book: BookIndex,
    ) -> Result<SiloEvaluation, SiloError> {
        self.silo(silo)?.evaluate(global, book)
    }

    fn local_centroids(
        &self,
        silo: SiloId,
        global: &Model,
        k: usize,
        seed: u64,
    ) -> Result<LocalCentroids, SiloError> {
        self.silo(silo)?.local_centroids(global, k, seed)
    }
}

#[cfg(test)]
mod tests {
    use uefl_core::testutils::data::separable_silo_data;

    use super::*;
    use crate::net::EncoderKind;

    fn config() -> NetConfig {
        NetConfig {
            encoder: EncoderKind::Cnn,
            input_channels: 1,
            dim: 2,
            depth: 1,
            num_codes: 4,
            seg: 1,
        }
    }

    fn federation(num_silos: usize) -> LocalFederation {
        let splits = (0..num_silos)
            .map(|silo| SiloSplits {
                silo: SiloId(silo),
                train: separable_silo_data(20, 4, 4),
                validation: separable_silo_data(10, 4, 4),
                angle: 0.,
                distribution: silo,
            })
            .collect();
        LocalFederation::new(splits, config(), Device::Cpu)
    }

    fn params() -> RoundParameters {
        RoundParameters {
            iteration: 0,
            round_id: 1,
            local_epochs: 2,
            steps: 2,
            batch_size: 4,
            lr: 1e-2,
            seed: 0,
        }
    }

    #[test]
    fn test_init_model() {
        let federation = federation(2);
        assert_eq!(federation.num_silos(), 2);
        let model = federation.init_model().unwrap();
        assert_eq!(model.num_codebooks(), 2);
        // 2 channels on a 2×2 grid
        assert_eq!(model.get("classifier.fc1.weight").unwrap().shape[1], 8);
    }

    #[test]
    fn test_train() {
        let federation = federation(2);
        let global = federation.init_model().unwrap();
        let update = federation
            .train(SiloId(1), &global, BookIndex::SHARED, &params())
            .unwrap();

        assert_eq!(update.silo, SiloId(1));
        assert_eq!(update.samples, 20);
        assert!(update.model.has_same_layout(&global));
        assert_ne!(update.model, global);
        assert!(update.loss.is_finite());
        assert!(update.perplexity >= 1. - 1e-6 && update.perplexity <= 4. + 1e-6);
    }

    #[test]
    fn test_train_extension_book() {
        let federation = federation(1);
        let global = federation.init_model().unwrap();
        let update = federation
            .train(SiloId(0), &global, BookIndex(1), &params())
            .unwrap();
        assert!(update.perplexity <= 8. + 1e-6);
        assert!(federation
            .train(SiloId(0), &global, BookIndex(2), &params())
            .is_err());
    }

    #[test]
    fn test_evaluate() {
        let federation = federation(2);
        let global = federation.init_model().unwrap();
        let evaluation = federation
            .evaluate(SiloId(1), &global, BookIndex(1))
            .unwrap();

        assert_eq!(evaluation.silo, SiloId(1));
        assert_eq!(evaluation.book, BookIndex(1));
        assert_eq!(evaluation.distribution, 1);
        assert!((0. ..=1.).contains(&evaluation.accuracy));
        assert!((0. ..=1.).contains(&evaluation.uncertainty));
    }

    #[test]
    fn test_local_centroids() {
        let federation = federation(1);
        let global = federation.init_model().unwrap();
        let centroids = federation
            .local_centroids(SiloId(0), &global, 4, 7)
            .unwrap();

        // one 2 channel vector per position of the 2×2 grid of every image
        assert_eq!(centroids.centroids.len(), 4 * 2);
        assert_eq!(centroids.sizes.iter().sum::<f64>(), (20 * 4) as f64);
    }

    #[test]
    fn test_unknown_silo() {
        let federation = federation(1);
        let global = federation.init_model().unwrap();
        assert!(matches!(
            federation.evaluate(SiloId(3), &global, BookIndex::SHARED),
            Err(SiloError::UnknownSilo(SiloId(3)))
        ));
    }
}
