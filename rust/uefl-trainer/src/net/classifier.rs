use candle_core::{Module, Result, Tensor};
use candle_nn::{linear, Linear, VarBuilder};

/// The width of the hidden layer of the classifier.
pub const HIDDEN_FEATURES: usize = 512;

/// A two layer perceptron with a GELU activation.
#[derive(Debug, Clone)]
pub struct Mlp {
    fc1: Linear,
    fc2: Linear,
}

impl Mlp {
    pub fn new(
        in_features: usize,
        hidden_features: usize,
        out_features: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            fc1: linear(in_features, hidden_features, vb.pp("fc1"))?,
            fc2: linear(hidden_features, out_features, vb.pp("fc2"))?,
        })
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.fc2.forward(&self.fc1.forward(xs)?.gelu_erf()?)
    }
}
