//! Synthetic models.

use crate::model::{codebook_name, Model, Weights};

/// Creates a small model whose every value equals `value`, with `num_codebooks` codebooks of
/// `num_codes × code_dim` codewords.
pub fn constant_model(value: f32, num_codebooks: usize, num_codes: usize, code_dim: usize) -> Model {
    let mut model = Model::from_primitives(vec![
        ("classifier.fc1.weight", vec![2, 3], vec![value; 6]),
        ("classifier.fc1.bias", vec![2], vec![value; 2]),
    ])
    .unwrap();
    for book in 0..num_codebooks {
        let weights = Weights::new(vec![num_codes, code_dim], vec![value; num_codes * code_dim])
            .unwrap();
        model.insert(codebook_name(book), weights);
    }
    model
}
