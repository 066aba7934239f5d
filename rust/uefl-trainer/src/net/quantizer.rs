//! The extensible vector quantizer.
//!
//! The quantizer holds a list of codebooks. Codebook `0` is shared by all silos. A silo with the
//! book index `k > 0` quantizes against the codewords of codebook `0` followed by those of
//! codebook `k`, so its code indices range over `0..2·num_codes`.

use candle_core::{Result, Tensor};
use candle_nn::{loss, Init, VarBuilder};

use uefl_core::{
    uncertainty::{code_counts, perplexity},
    BookIndex,
};

/// The weight of the commitment loss, which pulls the encoder outputs towards their codewords.
pub const COMMITMENT_COST: f64 = 0.25;

/// The result of a quantization.
#[derive(Debug)]
pub struct VqOutput {
    /// The quantized features in the shape of the input. Gradients pass straight through to
    /// the input.
    pub quantized: Tensor,
    /// The codebook loss plus the weighted commitment loss.
    pub loss: Tensor,
    /// The perplexity of the codeword usage.
    pub perplexity: f64,
    /// The codeword of every quantized vector.
    pub indices: Vec<u32>,
}

/// An extensible codebook vector quantizer.
#[derive(Clone)]
pub struct ExtVq {
    num_codes: usize,
    code_dim: usize,
    commitment_cost: f64,
    codebooks: Vec<Tensor>,
    vb: VarBuilder<'static>,
}

impl ExtVq {
    /// Creates a quantizer with `num_codebooks` codebooks of `num_codes × code_dim` codewords,
    /// drawn from a standard normal distribution.
    pub fn new(
        num_codes: usize,
        code_dim: usize,
        num_codebooks: usize,
        vb: VarBuilder<'static>,
    ) -> Result<Self> {
        let mut vq = Self {
            num_codes,
            code_dim,
            commitment_cost: COMMITMENT_COST,
            codebooks: Vec::with_capacity(num_codebooks),
            vb,
        };
        vq.extend(num_codebooks)?;
        Ok(vq)
    }

    /// Appends `count` freshly initialised codebooks.
    pub fn extend(&mut self, count: usize) -> Result<()> {
        for _ in 0..count {
            let name = format!("codebook.{}", self.codebooks.len());
            let codebook = self.vb.get_with_hints(
                (self.num_codes, self.code_dim),
                &name,
                Init::Randn {
                    mean: 0.,
                    stdev: 1.,
                },
            )?;
            self.codebooks.push(codebook);
        }
        Ok(())
    }

    pub fn num_codebooks(&self) -> usize {
        self.codebooks.len()
    }

    pub fn codebooks(&self) -> &[Tensor] {
        &self.codebooks
    }

    /// Gets the codewords available with the given book index.
    pub fn codes(&self, book: BookIndex) -> Result<Tensor> {
        let shared = self
            .codebooks
            .first()
            .ok_or_else(|| candle_core::Error::Msg("the quantizer has no codebook".into()))?;
        if book.is_shared() {
            return Ok(shared.clone());
        }
        let extension = self.codebooks.get(book.0).ok_or_else(|| {
            candle_core::Error::Msg(format!("the quantizer has no codebook {}", book))
        })?;
        Tensor::cat(&[shared, extension], 0)
    }

    /// Rearranges BCHW features into rows of `code_dim` values. The channels of every spatial
    /// position are split into consecutive segments.
    pub fn flatten(&self, features: &Tensor) -> Result<Tensor> {
        let rows = features.elem_count() / self.code_dim;
        features
            .permute((0, 2, 3, 1))?
            .contiguous()?
            .reshape((rows, self.code_dim))
    }

    /// Finds the nearest codeword of every row of `flat`.
    pub fn encode(&self, flat: &Tensor, codes: &Tensor) -> Result<Tensor> {
        let x_sqr = flat.sqr()?.sum_keepdim(1)?;
        let c_sqr = codes.sqr()?.sum(1)?.unsqueeze(0)?;
        let dot = flat.matmul(&codes.t()?)?;
        let distances = x_sqr.broadcast_add(&c_sqr)?.broadcast_sub(&(dot * 2.)?)?;
        distances.argmin(1)
    }

    /// Quantizes BCHW `features` with the codewords of the given book index.
    pub fn forward(&self, features: &Tensor, book: BookIndex) -> Result<VqOutput> {
        let (b, c, h, w) = features.dims4()?;
        let flat = self.flatten(features)?;
        let codes = self.codes(book)?;

        let indices = self.encode(&flat.detach(), &codes.detach())?;
        let quantized = codes.index_select(&indices, 0)?;

        let q_latent_loss = loss::mse(&quantized, &flat.detach())?;
        let e_latent_loss = loss::mse(&quantized.detach(), &flat)?;
        let loss = (q_latent_loss + (e_latent_loss * self.commitment_cost)?)?;

        // straight-through estimator
        let quantized = (&flat + (&quantized - &flat)?.detach())?;
        let quantized = quantized
            .reshape((b, h, w, c))?
            .permute((0, 3, 1, 2))?
            .contiguous()?;

        let indices = indices.to_vec1::<u32>()?;
        let perplexity = perplexity(&code_counts(&indices, codes.dim(0)?));
        Ok(VqOutput {
            quantized,
            loss,
            perplexity,
            indices,
        })
    }
}
