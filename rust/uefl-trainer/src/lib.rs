#![cfg_attr(docsrs, feature(doc_cfg))]
//! # UEFL trainer
//!
//! ###### tags: Federated Learning, Vector Quantization, Coordinator
//!
//! This crate runs federated training with an extensible codebook on the MNIST family of
//! datasets. A single process plays both roles of the federation: the *coordinator*, which
//! drives the rounds and aggregates the models, and the *silos*, which hold their private data
//! partitions and train locally.
//!
//! ## Training
//! Training proceeds in iterations of federated rounds. In each round the coordinator
//! broadcasts the global model, every silo trains it for a few epochs on its own data, and the
//! coordinator averages the local models weighted by the number of training samples.
//!
//! All silos start out with the shared codebook only. After an iteration the silos evaluate the
//! global model on their validation split. Silos whose predictions are still too uncertain get
//! an extension codebook, initialised with k-means over their local encoder features, and the
//! next iteration starts. Training stops once every silo is confident enough or once there are
//! as many iterations as data distributions.
//!
//! ## Modules
//! - [`settings`]: configuration from defaults, a TOML file, the environment and the command
//!   line.
//! - [`net`]: the network of a silo: CNN encoder, extensible vector quantizer and classifier.
//! - [`silo`]: the simulated silos and the [`Federation`] they form.
//! - [`state_machine`]: the coordinator phases.
//! - [`storage`]: checkpoints and coordinator state.
//! - [`metrics`]: recording of training metrics.
//!
//! [`Federation`]: crate::silo::Federation

pub mod metrics;
pub mod net;
pub mod settings;
pub mod silo;
pub mod state_machine;
pub mod storage;
