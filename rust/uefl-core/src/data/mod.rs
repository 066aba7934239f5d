//! Silo datasets.
//!
//! The MNIST family of datasets ships as four IDX files. Every silo receives a consecutive
//! slice of the training and test records, which are then rotated by the silo's angle to give
//! each silo a distribution of its own. See the [`augment`] and [`partition`] modules.

pub mod augment;
pub mod idx;
pub mod partition;

use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use derive_more::Display;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::{
    idx::{IdxArray, IdxError},
    partition::{Partition, Split},
};
use crate::common::SiloId;

/// The number of classes of the MNIST family of datasets.
pub const NUM_CLASSES: usize = 10;

/// The largest pixel value of the raw images.
const PIXEL_MAX: f32 = 255.;

/// The supported datasets.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    #[display(fmt = "mnist")]
    Mnist,
    #[display(fmt = "fmnist")]
    Fmnist,
}

impl DatasetKind {
    /// The name of the directory below the data root that holds the dataset files.
    pub fn dir_name(self) -> &'static str {
        match self {
            DatasetKind::Mnist => "mnist",
            DatasetKind::Fmnist => "fmnist",
        }
    }
}

impl FromStr for DatasetKind {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mnist" => Ok(DatasetKind::Mnist),
            "fmnist" => Ok(DatasetKind::Fmnist),
            _ => Err(DataError::UnknownDataset(s.to_string())),
        }
    }
}

/// The IDX files of a dataset.
pub const TRAIN_IMAGES: &str = "train-images-idx3-ubyte";
pub const TRAIN_LABELS: &str = "train-labels-idx1-ubyte";
pub const TEST_IMAGES: &str = "t10k-images-idx3-ubyte";
pub const TEST_LABELS: &str = "t10k-labels-idx1-ubyte";

#[derive(Debug, Error)]
/// Errors related to loading silo datasets.
pub enum DataError {
    #[error("unknown dataset {0}")]
    UnknownDataset(String),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid IDX file {path}: {source}")]
    Idx { path: PathBuf, source: IdxError },
    #[error("expected images of shape N×H×W, got {0:?}")]
    ImageShape(Vec<usize>),
    #[error("{images} images but {labels} labels")]
    LabelMismatch { images: usize, labels: usize },
    #[error("label {0} is out of range")]
    InvalidLabel(u8),
    #[error("the {split} split of {silo} is empty")]
    EmptySplit { silo: SiloId, split: Split },
}

#[derive(Debug, Clone, PartialEq)]
/// Images and labels of one split of a silo.
pub struct SiloData {
    /// The images, `N × 1 × height × width` in row-major order, scaled to `[0, 1]`.
    pub images: Vec<f32>,
    /// The class of every image.
    pub labels: Vec<u32>,
    pub height: usize,
    pub width: usize,
}

impl SiloData {
    /// Gets the number of records.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Checks whether there are no records.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Gets the number of pixels per image.
    pub fn image_size(&self) -> usize {
        self.height * self.width
    }

    /// Gets the image with the given index.
    pub fn image(&self, index: usize) -> &[f32] {
        let size = self.image_size();
        &self.images[index * size..(index + 1) * size]
    }

    /// Gathers the images and labels of the given records into a mini-batch.
    pub fn batch(&self, indices: &[usize]) -> (Vec<f32>, Vec<u32>) {
        let mut images = Vec::with_capacity(indices.len() * self.image_size());
        let mut labels = Vec::with_capacity(indices.len());
        for &i in indices {
            images.extend_from_slice(self.image(i));
            labels.push(self.labels[i]);
        }
        (images, labels)
    }
}

#[derive(Debug, Clone, PartialEq)]
/// The data of a silo.
pub struct SiloSplits {
    pub silo: SiloId,
    pub train: SiloData,
    pub validation: SiloData,
    /// The rotation angle in degrees.
    pub angle: f32,
    /// The distribution the silo belongs to.
    pub distribution: usize,
}

/// How the dataset is divided among the silos.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SiloConfig {
    pub num_silos: usize,
    /// The number of training records per silo.
    pub sample: usize,
    /// Whether the silos with an index above 5 receive pixel noise.
    pub noise: bool,
    pub seed: u64,
}

#[derive(Debug, Clone)]
struct Records {
    images: IdxArray,
    labels: IdxArray,
    height: usize,
    width: usize,
}

impl Records {
    fn new(images: IdxArray, labels: IdxArray) -> Result<Self, DataError> {
        let (height, width) = match images.dims.as_slice() {
            [_, h, w] => (*h, *w),
            _ => return Err(DataError::ImageShape(images.dims)),
        };
        if images.len() != labels.len() {
            return Err(DataError::LabelMismatch {
                images: images.len(),
                labels: labels.len(),
            });
        }
        if let Some(label) = labels.data.iter().find(|l| **l as usize >= NUM_CLASSES) {
            return Err(DataError::InvalidLabel(*label));
        }
        Ok(Self {
            images,
            labels,
            height,
            width,
        })
    }

    fn len(&self) -> usize {
        self.labels.len()
    }
}

#[derive(Debug, Clone)]
/// A dataset with its training and test records.
pub struct Dataset {
    train: Records,
    test: Records,
}

impl Dataset {
    /// Reads the dataset of the given kind from `<root>/<kind>/`.
    pub fn open(root: impl AsRef<Path>, kind: DatasetKind) -> Result<Self, DataError> {
        let dir = root.as_ref().join(kind.dir_name());
        Self::from_arrays(
            read_idx(&dir.join(TRAIN_IMAGES))?,
            read_idx(&dir.join(TRAIN_LABELS))?,
            read_idx(&dir.join(TEST_IMAGES))?,
            read_idx(&dir.join(TEST_LABELS))?,
        )
    }

    /// Creates a dataset from already decoded arrays.
    pub fn from_arrays(
        train_images: IdxArray,
        train_labels: IdxArray,
        test_images: IdxArray,
        test_labels: IdxArray,
    ) -> Result<Self, DataError> {
        Ok(Self {
            train: Records::new(train_images, train_labels)?,
            test: Records::new(test_images, test_labels)?,
        })
    }

    /// Gets the number of records of the given split. Validation records are test records.
    pub fn len(&self, split: Split) -> usize {
        self.records(split).len()
    }

    fn records(&self, split: Split) -> &Records {
        match split {
            Split::Train => &self.train,
            Split::Validation => &self.test,
        }
    }

    /// Gets the augmented training and validation data of the given silo.
    ///
    /// # Errors
    /// Fails if either split of the silo is empty.
    pub fn silo(&self, silo: SiloId, config: &SiloConfig) -> Result<SiloSplits, DataError> {
        let angle = augment::silo_angle(silo, config.num_silos);
        Ok(SiloSplits {
            silo,
            train: self.split(silo, Split::Train, angle, config)?,
            validation: self.split(silo, Split::Validation, angle, config)?,
            angle,
            distribution: augment::distribution_id(silo, config.num_silos),
        })
    }

    fn split(
        &self,
        silo: SiloId,
        split: Split,
        angle: f32,
        config: &SiloConfig,
    ) -> Result<SiloData, DataError> {
        let records = self.records(split);
        let range = Partition::new(config.sample).range(silo, split, records.len());
        if range.is_empty() {
            return Err(DataError::EmptySplit { silo, split });
        }

        let (height, width) = (records.height, records.width);
        let noisy = augment::is_noisy(silo, config.noise);
        let mut rng = ChaCha20Rng::seed_from_u64(config.seed.wrapping_add(silo.0 as u64));
        rng.set_stream(split as u64);

        let mut images = Vec::with_capacity(range.len() * height * width);
        for raw in records.images.records(range.clone()).chunks_exact(height * width) {
            let mut image: Vec<f32> = raw.iter().map(|&p| p as f32).collect();
            if noisy {
                augment::add_gaussian_noise(&mut image, augment::NOISE_STD, &mut rng);
            }
            let rotated = augment::rotate(&image, height, width, angle);
            images.extend(rotated.into_iter().map(|p| p / PIXEL_MAX));
        }
        let labels = records
            .labels
            .records(range)
            .iter()
            .map(|&l| l as u32)
            .collect();

        Ok(SiloData {
            images,
            labels,
            height,
            width,
        })
    }
}

fn read_idx(path: &Path) -> Result<IdxArray, DataError> {
    let bytes = fs::read(path).map_err(|source| DataError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    IdxArray::parse(&bytes).map_err(|source| DataError::Idx {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::data::idx_dataset;

    fn config(num_silos: usize, sample: usize) -> SiloConfig {
        SiloConfig {
            num_silos,
            sample,
            noise: false,
            seed: 0,
        }
    }

    #[test]
    fn test_dataset_kind() {
        assert_eq!("FMNIST".parse::<DatasetKind>().unwrap(), DatasetKind::Fmnist);
        assert_eq!(DatasetKind::Mnist.to_string(), "mnist");
        assert!(matches!(
            "cifar10".parse::<DatasetKind>(),
            Err(DataError::UnknownDataset(_))
        ));
    }

    #[test]
    fn test_silo_partition() {
        let (xtr, ytr, xte, yte) = idx_dataset(40, 10, 4, 4);
        let dataset = Dataset::from_arrays(xtr, ytr, xte, yte).unwrap();

        let silo = dataset.silo(SiloId(1), &config(3, 8)).unwrap();
        assert_eq!(silo.train.len(), 8);
        assert_eq!(silo.validation.len(), 2);
        // records 8..16 with labels `record % 10`
        assert_eq!(silo.train.labels, vec![8, 9, 0, 1, 2, 3, 4, 5]);
        assert_eq!(silo.validation.labels, vec![2, 3]);
        assert_eq!(silo.angle, 0.);
        assert_eq!(silo.distribution, 0);
    }

    #[test]
    fn test_unrotated_silo_is_scaled() {
        let (xtr, ytr, xte, yte) = idx_dataset(8, 4, 2, 3);
        let expected: Vec<f32> = xtr.records(0..4).iter().map(|&p| p as f32 / 255.).collect();
        let dataset = Dataset::from_arrays(xtr, ytr, xte, yte).unwrap();

        let silo = dataset.silo(SiloId(0), &config(2, 4)).unwrap();
        assert_eq!(silo.train.images, expected);
        assert!(silo.train.images.iter().all(|p| (0. ..=1.).contains(p)));
    }

    #[test]
    fn test_rotated_silo_differs() {
        let (xtr, ytr, xte, yte) = idx_dataset(40, 40, 6, 6);
        let raw: Vec<f32> = xtr.records(12..13).iter().map(|&p| p as f32 / 255.).collect();
        let dataset = Dataset::from_arrays(xtr, ytr, xte, yte).unwrap();

        let rotated = dataset.silo(SiloId(3), &config(9, 4)).unwrap();
        assert_eq!(rotated.angle, -50.);
        assert_eq!(rotated.distribution, 1);
        assert_eq!(rotated.train.images.len(), 4 * 36);
        assert_ne!(rotated.train.image(0), raw.as_slice());
    }

    #[test]
    fn test_noise_is_seeded() {
        let (xtr, ytr, xte, yte) = idx_dataset(80, 20, 4, 4);
        let dataset = Dataset::from_arrays(xtr, ytr, xte, yte).unwrap();
        let noisy = SiloConfig {
            noise: true,
            ..config(9, 8)
        };

        let a = dataset.silo(SiloId(7), &noisy).unwrap();
        let b = dataset.silo(SiloId(7), &noisy).unwrap();
        assert_eq!(a, b);
        let clean = dataset.silo(SiloId(7), &config(9, 8)).unwrap();
        assert_ne!(a.train.images, clean.train.images);
    }

    #[test]
    fn test_empty_split() {
        let (xtr, ytr, xte, yte) = idx_dataset(10, 10, 2, 2);
        let dataset = Dataset::from_arrays(xtr, ytr, xte, yte).unwrap();
        assert!(matches!(
            dataset.silo(SiloId(2), &config(3, 5)),
            Err(DataError::EmptySplit {
                silo: SiloId(2),
                split: Split::Train
            })
        ));
    }

    #[test]
    fn test_invalid_arrays() {
        let (xtr, ytr, xte, yte) = idx_dataset(10, 10, 2, 2);
        let labels = IdxArray {
            dims: vec![9],
            data: vec![0; 9],
        };
        assert!(matches!(
            Dataset::from_arrays(xtr.clone(), labels, xte.clone(), yte.clone()),
            Err(DataError::LabelMismatch {
                images: 10,
                labels: 9
            })
        ));

        let flat = IdxArray {
            dims: vec![10, 4],
            data: vec![0; 40],
        };
        assert!(matches!(
            Dataset::from_arrays(flat, ytr, xte, yte),
            Err(DataError::ImageShape(_))
        ));
    }

    #[test]
    fn test_open() {
        let dir = tempfile::tempdir().unwrap();
        let fmnist = dir.path().join("fmnist");
        std::fs::create_dir(&fmnist).unwrap();

        let (xtr, ytr, xte, yte) = idx_dataset(8, 4, 3, 3);
        for (name, array) in [
            (TRAIN_IMAGES, &xtr),
            (TRAIN_LABELS, &ytr),
            (TEST_IMAGES, &xte),
            (TEST_LABELS, &yte),
        ] {
            std::fs::write(fmnist.join(name), array.to_bytes()).unwrap();
        }

        let dataset = Dataset::open(dir.path(), DatasetKind::Fmnist).unwrap();
        assert_eq!(dataset.len(Split::Train), 8);
        assert_eq!(dataset.len(Split::Validation), 4);

        assert!(matches!(
            Dataset::open(dir.path(), DatasetKind::Mnist),
            Err(DataError::Io { .. })
        ));
    }
}
