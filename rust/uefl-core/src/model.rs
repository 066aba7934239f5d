//! Model representation and conversion.
//!
//! A [`Model`] is an ordered collection of named tensors, the [`Weights`]. The names are the
//! parameter paths of the network that produced them, which makes the representation
//! independent of the deep learning framework used by the silos: the coordinator aggregates
//! and persists models without knowing anything about layers.
//!
//! ```
//! # use uefl_core::model::Model;
//! let model = Model::from_primitives(vec![
//!     ("classifier.fc1.bias", vec![2], vec![0.5_f32, -0.5]),
//!     ("discretizer.codebook.0", vec![1, 2], vec![1.0, 2.0]),
//! ])
//! .unwrap();
//! assert_eq!(model.len(), 4);
//! assert_eq!(model.get("classifier.fc1.bias").unwrap().data, vec![0.5, -0.5]);
//! ```

use std::{
    collections::{btree_map, BTreeMap},
    iter::FromIterator,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The prefix of the parameter names under which codebooks are stored.
pub const CODEBOOK_PREFIX: &str = "discretizer.codebook.";

#[derive(Error, Debug, PartialEq, Eq)]
/// Errors related to the construction of models.
pub enum ModelError {
    #[error("shape {shape:?} of parameter {name} does not match its {len} values")]
    ShapeMismatch {
        name: String,
        shape: Vec<usize>,
        len: usize,
    },
    #[error("parameter {0} is defined more than once")]
    Duplicate(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A single named tensor of a model, stored in row-major order.
pub struct Weights {
    /// The dimensions of the tensor.
    pub shape: Vec<usize>,
    /// The values of the tensor.
    pub data: Vec<f32>,
}

impl Weights {
    /// Creates new weights after checking that the shape matches the number of values.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Option<Self> {
        if shape.iter().product::<usize>() == data.len() {
            Some(Self { shape, data })
        } else {
            None
        }
    }

    /// Checks whether all values are finite.
    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|w| w.is_finite())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
/// A numerical representation of a machine learning model as named tensors.
pub struct Model(BTreeMap<String, Weights>);

impl AsRef<Model> for Model {
    fn as_ref(&self) -> &Model {
        self
    }
}

#[allow(clippy::len_without_is_empty)]
impl Model {
    /// Creates a model from `(name, shape, values)` triples.
    ///
    /// # Errors
    /// Fails if a shape doesn't match the number of values or if a name occurs twice.
    pub fn from_primitives<N, I>(iter: I) -> Result<Self, ModelError>
    where
        N: Into<String>,
        I: IntoIterator<Item = (N, Vec<usize>, Vec<f32>)>,
    {
        let mut params = BTreeMap::new();
        for (name, shape, data) in iter {
            let name = name.into();
            let len = data.len();
            let weights = Weights::new(shape.clone(), data).ok_or_else(|| {
                ModelError::ShapeMismatch {
                    name: name.clone(),
                    shape,
                    len,
                }
            })?;
            if params.insert(name.clone(), weights).is_some() {
                return Err(ModelError::Duplicate(name));
            }
        }
        Ok(Self(params))
    }

    /// Gets the total number of weights/parameters of this model.
    pub fn len(&self) -> usize {
        self.0.values().map(|w| w.data.len()).sum()
    }

    /// Gets the number of named tensors of this model.
    pub fn num_tensors(&self) -> usize {
        self.0.len()
    }

    /// Gets the tensor with the given name.
    pub fn get(&self, name: &str) -> Option<&Weights> {
        self.0.get(name)
    }

    /// Inserts or replaces the tensor with the given name.
    pub fn insert(&mut self, name: impl Into<String>, weights: Weights) -> Option<Weights> {
        self.0.insert(name.into(), weights)
    }

    /// Creates an iterator over the named tensors, ordered by name.
    pub fn iter(&self) -> btree_map::Iter<String, Weights> {
        self.0.iter()
    }

    /// Creates an iterator over the mutable named tensors, ordered by name.
    pub fn iter_mut(&mut self) -> btree_map::IterMut<String, Weights> {
        self.0.iter_mut()
    }

    /// Checks whether both models have the same parameter names and shapes.
    pub fn has_same_layout(&self, other: &Model) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .zip(other.0.iter())
                .all(|((n1, w1), (n2, w2))| n1 == n2 && w1.shape == w2.shape)
    }

    /// Gets the number of codebooks contained in this model.
    pub fn num_codebooks(&self) -> usize {
        self.0
            .keys()
            .filter(|name| name.starts_with(CODEBOOK_PREFIX))
            .count()
    }

    /// Gets the codebook with the given index.
    pub fn codebook(&self, index: usize) -> Option<&Weights> {
        self.0.get(&codebook_name(index))
    }
}

/// The parameter name of the codebook with the given index.
pub fn codebook_name(index: usize) -> String {
    format!("{}{}", CODEBOOK_PREFIX, index)
}

impl FromIterator<(String, Weights)> for Model {
    fn from_iter<I: IntoIterator<Item = (String, Weights)>>(iter: I) -> Self {
        Model(iter.into_iter().collect())
    }
}

impl IntoIterator for Model {
    type Item = (String, Weights);
    type IntoIter = btree_map::IntoIter<String, Weights>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_primitives() {
        let model = Model::from_primitives(vec![
            ("b", vec![2, 2], vec![1., 2., 3., 4.]),
            ("a", vec![3], vec![0.; 3]),
        ])
        .unwrap();
        assert_eq!(model.len(), 7);
        assert_eq!(model.num_tensors(), 2);
        // ordered by name
        let names: Vec<_> = model.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_from_primitives_shape_mismatch() {
        let err = Model::from_primitives(vec![("a", vec![2, 2], vec![1., 2., 3.])]).unwrap_err();
        assert_eq!(
            err,
            ModelError::ShapeMismatch {
                name: "a".into(),
                shape: vec![2, 2],
                len: 3
            }
        );
    }

    #[test]
    fn test_from_primitives_duplicate() {
        let err = Model::from_primitives(vec![("a", vec![1], vec![1.]), ("a", vec![1], vec![2.])])
            .unwrap_err();
        assert_eq!(err, ModelError::Duplicate("a".into()));
    }

    #[test]
    fn test_layout() {
        let m1 = Model::from_primitives(vec![("a", vec![2], vec![1., 2.])]).unwrap();
        let m2 = Model::from_primitives(vec![("a", vec![2], vec![3., 4.])]).unwrap();
        let m3 = Model::from_primitives(vec![("a", vec![1, 2], vec![3., 4.])]).unwrap();
        let m4 = Model::from_primitives(vec![("b", vec![2], vec![3., 4.])]).unwrap();
        assert!(m1.has_same_layout(&m2));
        assert!(!m1.has_same_layout(&m3));
        assert!(!m1.has_same_layout(&m4));
    }

    #[test]
    fn test_codebooks() {
        let model = Model::from_primitives(vec![
            (codebook_name(0), vec![1, 1], vec![0.]),
            (codebook_name(1), vec![1, 1], vec![1.]),
            ("encoder.conv0.weight".to_string(), vec![1], vec![0.]),
        ])
        .unwrap();
        assert_eq!(model.num_codebooks(), 2);
        assert_eq!(model.codebook(1).unwrap().data, vec![1.]);
        assert!(model.codebook(2).is_none());
    }
}
