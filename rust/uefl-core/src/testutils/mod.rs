//! Helpers for generating synthetic datasets and models in tests.

pub mod data;
pub mod models;
