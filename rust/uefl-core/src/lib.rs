#![cfg_attr(docsrs, feature(doc_cfg))]
//! # UEFL: federated learning with extensible codebooks
//!
//! ###### tags: Federated Learning, Vector Quantization, Heterogeneous Data Silos
//!
//! Data silos rarely share a single distribution. A hospital images differently than the next
//! one, a handwriting corpus is scanned at a different angle than another. Federated averaging
//! of a single model over such silos tends to settle on a compromise that serves none of them
//! well.
//!
//! UEFL keeps the federation but gives the model a discrete bottleneck: encoded features are
//! mapped onto codewords of a *codebook*. All silos start with one shared codebook. After each
//! training iteration the silos measure how uncertain the global model is on their own
//! validation data. Silos that stay uncertain are handed an additional codebook, initialised
//! from their local features with k-means, which they use on top of the shared one. The
//! codebook grows only where the data demands it.
//!
//! This crate contains the parts of that scheme that do not depend on a deep learning
//! framework:
//!
//! - [`model`]: a named-parameter representation of a model that can be exchanged between
//!   silos and the coordinator.
//! - [`aggregation`]: weighted federated averaging of such models.
//! - [`codebook`]: bookkeeping of the extensible codebook and of the silo assignments.
//! - [`kmeans`]: seeded, weighted k-means for codebook initialisation.
//! - [`uncertainty`]: entropy based uncertainty and codebook perplexity.
//! - [`data`]: IDX datasets, silo partitioning and per-silo augmentation.
//! - [`common`]: round parameters shared by the coordinator and the silos.

#[macro_use]
extern crate serde;

pub mod aggregation;
pub mod codebook;
pub mod common;
pub mod data;
pub mod kmeans;
pub mod model;
pub mod uncertainty;

#[cfg(any(test, feature = "testutils"))]
#[cfg_attr(docsrs, doc(cfg(feature = "testutils")))]
pub mod testutils;

pub use self::{
    aggregation::{Aggregation, AggregationError},
    codebook::{BookIndex, CodebookRegistry},
    common::{RoundParameters, SiloId},
    model::{Model, ModelError, Weights},
};
