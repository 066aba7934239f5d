use candle_core::{Module, Result, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, VarBuilder};

/// A convolutional encoder of `depth` blocks.
///
/// Block `i` is a 3×3 convolution to `dim·2^i` channels followed by a ReLU and a 2×2 max
/// pooling, so every block halves the spatial resolution.
#[derive(Debug, Clone)]
pub struct CnnEncoder {
    blocks: Vec<Conv2d>,
}

impl CnnEncoder {
    pub fn new(input_channels: usize, dim: usize, depth: usize, vb: VarBuilder) -> Result<Self> {
        let config = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let mut blocks = Vec::with_capacity(depth);
        let mut in_channels = input_channels;
        for i in 0..depth {
            let out_channels = dim << i;
            blocks.push(conv2d(
                in_channels,
                out_channels,
                3,
                config,
                vb.pp(format!("conv{}", i)),
            )?);
            in_channels = out_channels;
        }
        Ok(Self { blocks })
    }
}

impl Module for CnnEncoder {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = xs.clone();
        for block in &self.blocks {
            xs = block.forward(&xs)?.relu()?.max_pool2d(2)?;
        }
        Ok(xs)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    use super::*;

    #[test]
    fn test_output_shape() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let encoder = CnnEncoder::new(1, 4, 3, vb.pp("encoder")).unwrap();

        let xs = Tensor::zeros((2, 1, 28, 28), DType::F32, &Device::Cpu).unwrap();
        // 28 -> 14 -> 7 -> 3
        assert_eq!(encoder.forward(&xs).unwrap().dims(), &[2, 16, 3, 3]);
        assert_eq!(varmap.all_vars().len(), 6);
    }
}
