//! Weighted federated averaging of models.
//!
//! The coordinator aggregates the local models of the silos after every round. Each model is
//! weighted by the number of training samples of its silo, so the aggregated model is
//!
//! ```text
//! θ = Σ wᵢ·θᵢ / Σ wᵢ
//! ```
//!
//! The sums are accumulated in `f64` to keep the error small even for many silos.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::model::{Model, Weights};

#[derive(Debug, Error, PartialEq, Eq)]
/// Errors related to the aggregation of models.
pub enum AggregationError {
    #[error("there is no model to average")]
    NoModel,

    #[error("the aggregation weight must be finite and positive")]
    InvalidWeight,

    #[error("the model to aggregate is incompatible with the already aggregated models")]
    ModelMismatch,

    #[error("the model to aggregate contains non-finite weights")]
    NonFinite,
}

#[derive(Debug, Clone)]
struct Accumulator {
    shape: Vec<usize>,
    sum: Vec<f64>,
}

#[derive(Debug, Clone, Default)]
/// An aggregator for models.
pub struct Aggregation {
    nb_models: usize,
    total_weight: f64,
    params: BTreeMap<String, Accumulator>,
}

#[allow(clippy::len_without_is_empty)]
impl Aggregation {
    /// Creates a new, empty aggregator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets the number of aggregated models.
    pub fn len(&self) -> usize {
        self.nb_models
    }

    /// Gets the sum of the weights of the aggregated models.
    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    /// Validates if the given `model` may be aggregated with the given `weight`.
    ///
    /// This should be checked before calling [`aggregate()`], since aggregation may return
    /// garbage values otherwise.
    ///
    /// # Errors
    /// Fails in one of the following cases:
    /// - The weight is not finite or not positive.
    /// - The parameter names or shapes of `model` differ from the already aggregated models. If
    ///   the aggregator is empty, then a model of any layout may be aggregated.
    /// - The model contains non-finite values.
    ///
    /// [`aggregate()`]: Aggregation::aggregate
    pub fn validate_aggregation(&self, model: &Model, weight: f64) -> Result<(), AggregationError> {
        if !weight.is_finite() || weight <= 0. {
            return Err(AggregationError::InvalidWeight);
        }

        if self.nb_models > 0 {
            let same_layout = self.params.len() == model.num_tensors()
                && self
                    .params
                    .iter()
                    .zip(model.iter())
                    .all(|((n1, acc), (n2, w))| n1 == n2 && acc.shape == w.shape);
            if !same_layout {
                return Err(AggregationError::ModelMismatch);
            }
        }

        if !model.iter().all(|(_, w)| w.is_finite()) {
            return Err(AggregationError::NonFinite);
        }

        Ok(())
    }

    /// Aggregates the given `model` with the given `weight`.
    ///
    /// It should be checked that [`validate_aggregation()`] succeeds before calling this.
    ///
    /// [`validate_aggregation()`]: Aggregation::validate_aggregation
    pub fn aggregate(&mut self, model: &Model, weight: f64) {
        if self.nb_models == 0 {
            self.params = model
                .iter()
                .map(|(name, w)| {
                    let acc = Accumulator {
                        shape: w.shape.clone(),
                        sum: w.data.iter().map(|&x| weight * x as f64).collect(),
                    };
                    (name.clone(), acc)
                })
                .collect();
        } else {
            for (acc, (_, w)) in self.params.values_mut().zip(model.iter()) {
                for (s, &x) in acc.sum.iter_mut().zip(w.data.iter()) {
                    *s += weight * x as f64;
                }
            }
        }
        self.total_weight += weight;
        self.nb_models += 1;
    }

    /// Validates and aggregates the given `model` in one go.
    pub fn try_aggregate(&mut self, model: &Model, weight: f64) -> Result<(), AggregationError> {
        self.validate_aggregation(model, weight)?;
        self.aggregate(model, weight);
        Ok(())
    }

    /// Computes the weighted average of the aggregated models.
    ///
    /// # Errors
    /// Fails if no model has been aggregated yet.
    pub fn average(&self) -> Result<Model, AggregationError> {
        if self.nb_models == 0 {
            return Err(AggregationError::NoModel);
        }
        let total = self.total_weight;
        Ok(self
            .params
            .iter()
            .map(|(name, acc)| {
                let data = acc.sum.iter().map(|s| (s / total) as f32).collect();
                let weights = Weights {
                    shape: acc.shape.clone(),
                    data,
                };
                (name.clone(), weights)
            })
            .collect())
    }
}
