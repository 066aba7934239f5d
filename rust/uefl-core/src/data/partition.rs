//! Partitioning of the dataset records into silos.

use std::ops::Range;

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::common::SiloId;

/// The split of a silo's data.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Split {
    #[display(fmt = "train")]
    Train,
    #[display(fmt = "validation")]
    Validation,
}

/// How many records every silo receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    /// The number of training records per silo.
    pub sample: usize,
}

impl Partition {
    pub fn new(sample: usize) -> Self {
        Self { sample }
    }

    /// The number of records per silo in the given split.
    ///
    /// The validation split is a quarter of the training split.
    pub fn split_size(&self, split: Split) -> usize {
        match split {
            Split::Train => self.sample,
            Split::Validation => self.sample / 4,
        }
    }

    /// The records of the given split that belong to `silo`, clamped to the `available`
    /// records.
    ///
    /// The range may be empty if the silo lies beyond the end of the dataset.
    pub fn range(&self, silo: SiloId, split: Split, available: usize) -> Range<usize> {
        let size = self.split_size(split);
        let start = silo.0.saturating_mul(size).min(available);
        let end = silo.0.saturating_add(1).saturating_mul(size).min(available);
        start..end
    }
}
