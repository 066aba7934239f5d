//! Loading and validation of settings.
//!
//! Settings are assembled from four layers, each overriding the previous one:
//!
//! 1. the built-in defaults,
//! 2. an optional TOML configuration file (see `configs/config.toml` in the repository root),
//! 3. environment variables prefixed with `UEFL_` where sections and keys are separated by
//!    `__`, e.g. `UEFL_TRAIN__ROUND=10`,
//! 4. the [`Overrides`] given on the command line.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use config::{Config, ConfigError, Environment, Value};
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

use uefl_core::data::{DatasetKind, SiloConfig};

use crate::net::{EncoderKind, NetConfig};

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct Settings {
    #[validate]
    pub data: DataSettings,
    #[validate]
    pub model: ModelSettings,
    #[validate]
    pub train: TrainSettings,
    pub output: OutputSettings,
    pub restore: RestoreSettings,
    pub log: LoggingSettings,
}

impl Settings {
    /// Loads and validates the settings.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: Option<&Path>, overrides: Overrides) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(path, overrides)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: Option<&Path>, overrides: Overrides) -> Result<Self, ConfigError> {
        let mut config = Config::new();
        set_defaults(&mut config)?;
        if let Some(path) = path {
            config.merge(config::File::from(path))?;
        }
        config.merge(Environment::with_prefix("uefl").separator("__"))?;
        for (key, value) in overrides {
            config.set(key, value)?;
        }
        config.try_into()
    }

    /// Gets the silo partitioning.
    pub fn silo_config(&self) -> SiloConfig {
        SiloConfig {
            num_silos: self.data.num_silo,
            sample: self.data.sample,
            noise: self.data.noise,
            seed: self.train.seed,
        }
    }

    /// Gets the network configuration for images with a single channel.
    pub fn net_config(&self) -> NetConfig {
        NetConfig {
            encoder: self.model.encoder,
            input_channels: 1,
            dim: self.model.dim,
            depth: self.model.depth,
            num_codes: self.model.num_codes,
            seg: self.model.seg,
        }
    }
}

fn set_defaults(config: &mut Config) -> Result<(), ConfigError> {
    config
        .set_default("data.dataset", "fmnist")?
        .set_default("data.dir", "data")?
        .set_default("data.num_silo", 9_i64)?
        .set_default("data.num_dist", 3_i64)?
        .set_default("data.sample", 2000_i64)?
        .set_default("data.noise", false)?
        .set_default("model.encoder", "cnn")?
        .set_default("model.dim", 128_i64)?
        .set_default("model.depth", 3_i64)?
        .set_default("model.num_codes", 64_i64)?
        .set_default("model.seg", 1_i64)?
        .set_default("train.round", 20_i64)?
        .set_default("train.round_plus", 5_i64)?
        .set_default("train.epoch", 20_i64)?
        .set_default("train.step", 20_i64)?
        .set_default("train.thd", 0.1)?
        .set_default("train.batch_size", 64_i64)?
        .set_default("train.lr", 1e-3)?
        .set_default("train.seed", 0_i64)?
        .set_default("output.workdir", "runs/uefl")?
        .set_default("restore.enable", false)?
        .set_default("log.filter", "info")?;
    Ok(())
}

/// Settings given on the command line, which take precedence over all other sources.
#[derive(Debug, Default)]
pub struct Overrides(Vec<(&'static str, Value)>);

impl Overrides {
    /// Creates an empty set of overrides.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the setting `key` (e.g. `train.round`) with the given value, if any.
    pub fn set(&mut self, key: &'static str, value: Option<impl Into<Value>>) -> &mut Self {
        if let Some(value) = value {
            self.0.push((key, value.into()));
        }
        self
    }
}

impl IntoIterator for Overrides {
    type Item = (&'static str, Value);
    type IntoIter = std::vec::IntoIter<(&'static str, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
/// The dataset settings.
pub struct DataSettings {
    /// The dataset to train on: `mnist` or `fmnist`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [data]
    /// dataset = "mnist"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// UEFL_DATA__DATASET=mnist
    /// ```
    pub dataset: DatasetKind,
    /// The directory that contains one sub directory per dataset with its IDX files.
    pub dir: PathBuf,
    /// The number of silos.
    #[validate(range(min = 1, max = 9))]
    pub num_silo: usize,
    /// The number of data distributions. This caps the number of codebook iterations.
    #[validate(range(min = 1))]
    pub num_dist: usize,
    /// The number of training records per silo. Each silo validates on a quarter of that.
    #[validate(range(min = 4))]
    pub sample: usize,
    /// Whether the silos with an index above 5 receive Gaussian pixel noise.
    pub noise: bool,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[validate(schema(function = "validate_model"))]
/// The network settings.
pub struct ModelSettings {
    /// The encoder family.
    pub encoder: EncoderKind,
    /// The number of channels of the first encoder block. Every further block doubles it.
    #[validate(range(min = 1))]
    pub dim: usize,
    /// The number of encoder blocks.
    #[validate(range(min = 1, max = 4))]
    pub depth: usize,
    /// The number of codewords per codebook.
    #[validate(range(min = 1))]
    pub num_codes: usize,
    /// The number of segments every encoded feature vector is split into before quantization.
    #[validate(range(min = 1))]
    pub seg: usize,
}

impl ModelSettings {
    /// Checks that the feature vectors can be split into equally long segments.
    fn validate_segments(&self) -> Result<(), ValidationError> {
        let channels = self
            .depth
            .checked_sub(1)
            .and_then(|shift| self.dim.checked_shl(shift as u32))
            .unwrap_or(0);
        if self.seg > 0 && channels > 0 && channels % self.seg == 0 {
            Ok(())
        } else {
            Err(ValidationError::new("seg must divide the encoded channels"))
        }
    }
}

/// A wrapper for validate derive.
fn validate_model(s: &ModelSettings) -> Result<(), ValidationError> {
    s.validate_segments()
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[validate(schema(function = "validate_train"))]
/// The federated training settings.
pub struct TrainSettings {
    /// The number of rounds of the first iteration.
    #[validate(range(min = 1))]
    pub round: usize,
    /// The number of rounds of every further iteration.
    #[validate(range(min = 1))]
    pub round_plus: usize,
    /// The number of local epochs per round.
    #[validate(range(min = 1))]
    pub epoch: usize,
    /// The maximal number of mini-batches per local epoch. `0` means a full pass.
    pub step: usize,
    /// Silos whose uncertainty exceeds this threshold get an extension codebook.
    #[validate(range(min = 0.0, max = 1.0))]
    pub thd: f64,
    #[validate(range(min = 1))]
    pub batch_size: usize,
    /// The learning rate of the local optimizer.
    pub lr: f64,
    /// The seed of the data shuffling, the pixel noise and k-means.
    pub seed: u64,
}

impl TrainSettings {
    /// Checks the learning rate.
    fn validate_lr(&self) -> Result<(), ValidationError> {
        if self.lr.is_finite() && self.lr > 0. {
            Ok(())
        } else {
            Err(ValidationError::new("the learning rate must be positive"))
        }
    }
}

/// A wrapper for validate derive.
fn validate_train(s: &TrainSettings) -> Result<(), ValidationError> {
    s.validate_lr()
}

#[derive(Debug, Clone, Deserialize)]
/// The output settings.
pub struct OutputSettings {
    /// The directory that receives checkpoints, the coordinator state, metrics and the summary.
    pub workdir: PathBuf,
}

#[derive(Debug, Clone, Copy, Deserialize)]
/// Restore settings.
pub struct RestoreSettings {
    /// If set to `false`, the coordinator state in the work directory is reset and training
    /// starts from scratch. Otherwise an unfinished run in the work directory is continued.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [restore]
    /// enable = true
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// UEFL_RESTORE__ENABLE=true
    /// ```
    pub enable: bool,
}

#[derive(Debug, Deserialize)]
/// The logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives. More information about logging directives
    /// can be found [here].
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// UEFL_LOG__FILTER=info
    /// ```
    ///
    /// [here]: https://docs.rs/tracing-subscriber/0.3.15/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive: https://docs.rs/tracing-subscriber/0.3.15/tracing_subscriber/filter/struct.EnvFilter.html#directives")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}
