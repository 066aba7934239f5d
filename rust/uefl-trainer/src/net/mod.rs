//! The network of a silo.
//!
//! [`UeflNet`] chains a [`CnnEncoder`], the extensible vector quantizer [`ExtVq`] and the
//! [`Mlp`] classifier. Its parameters live in a [`VarMap`] under stable names such as
//! `encoder.conv0.weight` or `discretizer.codebook.1`, which is how they are exchanged with the
//! coordinator as a [`Model`].

mod classifier;
mod encoder;
mod quantizer;

use std::str::FromStr;

use candle_core::{DType, Device, Module, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use derive_more::Display;
use serde::Deserialize;
use thiserror::Error;

pub use self::{
    classifier::{Mlp, HIDDEN_FEATURES},
    encoder::CnnEncoder,
    quantizer::{ExtVq, VqOutput, COMMITMENT_COST},
};
use uefl_core::{
    codebook::INITIAL_CODEBOOKS,
    data::NUM_CLASSES,
    model::codebook_name,
    BookIndex,
    Model,
    ModelError,
};

#[derive(Debug, Error)]
/// Errors related to the network.
pub enum NetError {
    #[error("tensor operation failed: {0}")]
    Tensor(#[from] candle_core::Error),
    #[error("unknown encoder: {0}")]
    UnknownEncoder(String),
    #[error("{channels} encoded channels cannot be split into {seg} segments")]
    Segments { channels: usize, seg: usize },
    #[error("the model lacks the parameter {0}")]
    MissingParameter(String),
    #[error("the network has no parameter {0}")]
    UnexpectedParameter(String),
    #[error("parameter {name} has the shape {actual:?} instead of {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("unknown codebook {0}")]
    UnknownCodebook(BookIndex),
    #[error("the network parameters are poisoned")]
    Poisoned,
    #[error("invalid model: {0}")]
    Model(#[from] ModelError),
}

/// The supported encoder families.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderKind {
    #[display(fmt = "cnn")]
    Cnn,
}

impl FromStr for EncoderKind {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cnn" => Ok(EncoderKind::Cnn),
            _ => Err(NetError::UnknownEncoder(s.to_string())),
        }
    }
}

/// The architecture of a [`UeflNet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetConfig {
    pub encoder: EncoderKind,
    pub input_channels: usize,
    /// The number of channels of the first encoder block.
    pub dim: usize,
    /// The number of encoder blocks.
    pub depth: usize,
    /// The number of codewords per codebook.
    pub num_codes: usize,
    /// The number of segments per encoded feature vector.
    pub seg: usize,
}

impl NetConfig {
    /// The number of channels of the encoded features.
    pub fn channels(&self) -> usize {
        self.dim << self.depth.saturating_sub(1)
    }

    /// The length of a codeword.
    pub fn code_dim(&self) -> usize {
        self.channels() / self.seg.max(1)
    }

    /// The number of encoded features of a `height × width` image.
    pub fn flat_features(&self, height: usize, width: usize) -> usize {
        self.channels() * (height >> self.depth) * (width >> self.depth)
    }

    fn check(&self) -> Result<(), NetError> {
        let channels = self.channels();
        if self.seg == 0 || channels % self.seg != 0 {
            return Err(NetError::Segments {
                channels,
                seg: self.seg,
            });
        }
        Ok(())
    }
}

/// The logits of a forward pass along with the quantizer statistics.
#[derive(Debug)]
pub struct NetOutput {
    pub logits: Tensor,
    pub vq_loss: Tensor,
    pub perplexity: f64,
}

/// A classifier with an extensible codebook bottleneck.
pub struct UeflNet {
    config: NetConfig,
    varmap: VarMap,
    device: Device,
    encoder: CnnEncoder,
    discretizer: ExtVq,
    classifier: Mlp,
}

impl UeflNet {
    /// Creates a randomly initialised network for `height × width` images with the shared and
    /// the spare codebook.
    pub fn new(
        config: NetConfig,
        height: usize,
        width: usize,
        device: &Device,
    ) -> Result<Self, NetError> {
        config.check()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let encoder = match config.encoder {
            EncoderKind::Cnn => {
                CnnEncoder::new(config.input_channels, config.dim, config.depth, vb.pp("encoder"))?
            }
        };
        let discretizer = ExtVq::new(
            config.num_codes,
            config.code_dim(),
            INITIAL_CODEBOOKS,
            vb.pp("discretizer"),
        )?;
        let classifier = Mlp::new(
            config.flat_features(height, width),
            HIDDEN_FEATURES,
            NUM_CLASSES,
            vb.pp("classifier"),
        )?;

        Ok(Self {
            config,
            varmap,
            device: device.clone(),
            encoder,
            discretizer,
            classifier,
        })
    }

    /// Creates a network and loads the parameters of the given model into it.
    pub fn from_model(
        config: NetConfig,
        height: usize,
        width: usize,
        model: &Model,
        device: &Device,
    ) -> Result<Self, NetError> {
        let mut net = Self::new(config, height, width, device)?;
        net.load_model(model)?;
        Ok(net)
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Classifies a batch of `N × C × H × W` images, quantizing with the given book index.
    pub fn forward(&self, xs: &Tensor, book: BookIndex) -> Result<NetOutput, NetError> {
        self.check_book(book)?;
        let features = self.encoder.forward(xs)?;
        let vq = self.discretizer.forward(&features, book)?;
        let logits = self.classifier.forward(&vq.quantized.flatten_from(1)?)?;
        Ok(NetOutput {
            logits,
            vq_loss: vq.loss,
            perplexity: vq.perplexity,
        })
    }

    /// Encodes a batch of images into `N × channels × H' × W'` features.
    pub fn features(&self, xs: &Tensor) -> Result<Tensor, NetError> {
        Ok(self.encoder.forward(xs)?)
    }

    /// Encodes a batch of images into the rows that the quantizer maps onto codewords.
    pub fn code_vectors(&self, xs: &Tensor) -> Result<Tensor, NetError> {
        Ok(self.discretizer.flatten(&self.features(xs)?)?)
    }

    pub fn num_codebooks(&self) -> usize {
        self.discretizer.num_codebooks()
    }

    pub fn codebooks(&self) -> &[Tensor] {
        self.discretizer.codebooks()
    }

    /// Appends `count` randomly initialised codebooks.
    pub fn extend_codebooks(&mut self, count: usize) -> Result<(), NetError> {
        Ok(self.discretizer.extend(count)?)
    }

    /// Overwrites the codewords of a codebook with the given `num_codes × code_dim` values.
    pub fn set_codebook(&mut self, book: BookIndex, centroids: &[f32]) -> Result<(), NetError> {
        self.check_book(book)?;
        let shape = vec![self.config.num_codes, self.config.code_dim()];
        self.set_var(&codebook_name(book.0), &shape, centroids)
    }

    /// The variables that are optimized during local training.
    pub fn vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    /// Exports the parameters of the network.
    pub fn to_model(&self) -> Result<Model, NetError> {
        let data = self.varmap.data().lock().map_err(|_| NetError::Poisoned)?;
        let mut params = Vec::with_capacity(data.len());
        for (name, var) in data.iter() {
            let shape = var.dims().to_vec();
            let values = var.flatten_all()?.to_vec1::<f32>()?;
            params.push((name.clone(), shape, values));
        }
        Ok(Model::from_primitives(params)?)
    }

    /// Loads the parameters of the given model. Missing codebooks are appended first.
    ///
    /// # Errors
    /// Fails if the model has a different architecture than the network.
    pub fn load_model(&mut self, model: &Model) -> Result<(), NetError> {
        let missing = model.num_codebooks().saturating_sub(self.num_codebooks());
        if missing > 0 {
            self.extend_codebooks(missing)?;
        }

        let data = self.varmap.data().lock().map_err(|_| NetError::Poisoned)?;
        if let Some((name, _)) = model.iter().find(|(name, _)| !data.contains_key(*name)) {
            return Err(NetError::UnexpectedParameter(name.clone()));
        }
        for (name, var) in data.iter() {
            let weights = model
                .get(name)
                .ok_or_else(|| NetError::MissingParameter(name.clone()))?;
            if var.dims() != weights.shape.as_slice() {
                return Err(NetError::ShapeMismatch {
                    name: name.clone(),
                    expected: var.dims().to_vec(),
                    actual: weights.shape.clone(),
                });
            }
            let values = Tensor::from_slice(&weights.data, weights.shape.as_slice(), &self.device)?;
            var.set(&values)?;
        }
        Ok(())
    }

    fn set_var(&self, name: &str, shape: &[usize], values: &[f32]) -> Result<(), NetError> {
        let data = self.varmap.data().lock().map_err(|_| NetError::Poisoned)?;
        let var = data
            .get(name)
            .ok_or_else(|| NetError::UnexpectedParameter(name.to_string()))?;
        if shape.iter().product::<usize>() != values.len() {
            return Err(NetError::ShapeMismatch {
                name: name.to_string(),
                expected: shape.to_vec(),
                actual: vec![values.len()],
            });
        }
        var.set(&Tensor::from_slice(values, shape, &self.device)?)?;
        Ok(())
    }

    fn check_book(&self, book: BookIndex) -> Result<(), NetError> {
        if book.0 < self.num_codebooks() {
            Ok(())
        } else {
            Err(NetError::UnknownCodebook(book))
        }
    }
}
