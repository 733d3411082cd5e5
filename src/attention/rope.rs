//! Rotary Position Embeddings (RoPE) at per-token positions.
//!
//! Batch tokens come from many requests, so positions are not a contiguous
//! range: each token is rotated by its own `position`. Inside a speculative
//! tree that is the committed length plus the node's tree depth, so
//! siblings share a rotation.
//!
//! Reference: <https://arxiv.org/abs/2104.09864>

use candle_core::{DType, Device, Tensor};

use crate::error::{Error, Result};

/// Rotary Position Embedding with precomputed cos/sin tables.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    /// Precomputed cosine values [max_positions, head_dim].
    cos_cache: Tensor,
    /// Precomputed sine values [max_positions, head_dim].
    sin_cache: Tensor,
    dim: usize,
    max_positions: usize,
}

impl RotaryEmbedding {
    /// Creates the cos/sin tables.
    ///
    /// # Arguments
    ///
    /// * `dim` - Head dimension (must be even)
    /// * `max_positions` - Number of cache positions per request
    /// * `theta` - Base frequency
    /// * `device` - Device to create tensors on
    pub fn new(dim: usize, max_positions: usize, theta: f64, device: &Device) -> Result<Self> {
        if dim % 2 != 0 {
            return Err(Error::Config(format!("RoPE dimension {dim} must be even")));
        }

        // 1 / (theta^(2i/dim)) for i in 0..dim/2
        let half_dim = dim / 2;
        let inv_freq: Vec<f32> = (0..half_dim)
            .map(|i| 1.0 / theta.powf(2.0 * i as f64 / dim as f64) as f32)
            .collect();
        let inv_freq = Tensor::new(inv_freq.as_slice(), device)?;

        let positions: Vec<f32> = (0..max_positions).map(|p| p as f32).collect();
        let positions = Tensor::new(positions.as_slice(), device)?.reshape((max_positions, 1))?;

        // [max_positions, dim/2] duplicated to [max_positions, dim]
        let freqs = positions.broadcast_mul(&inv_freq)?;
        let freqs = Tensor::cat(&[&freqs, &freqs], 1)?;

        Ok(Self {
            cos_cache: freqs.cos()?,
            sin_cache: freqs.sin()?,
            dim,
            max_positions,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Rotates `x` of shape [tokens, heads, head_dim], token `i` at `depths[i]`.
    pub fn apply(&self, x: &Tensor, depths: &[usize]) -> Result<Tensor> {
        let (num_tokens, _, head_dim) = x.dims3()?;
        if head_dim != self.dim || num_tokens != depths.len() {
            return Err(Error::Shape(format!(
                "rope expects [{}, _, {}], got {:?}",
                depths.len(),
                self.dim,
                x.dims()
            )));
        }
        if let Some(&depth) = depths.iter().find(|&&d| d >= self.max_positions) {
            return Err(Error::capacity("rope position", depth + 1, self.max_positions));
        }

        let index: Vec<u32> = depths.iter().map(|&d| d as u32).collect();
        let index = Tensor::new(index.as_slice(), x.device())?;
        // [tokens, 1, dim] for broadcasting over heads
        let cos = self.cos_cache.index_select(&index, 0)?.unsqueeze(1)?;
        let sin = self.sin_cache.index_select(&index, 0)?.unsqueeze(1)?;

        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;
        let rotated = x
            .broadcast_mul(&cos)?
            .add(&rotate_half(&x)?.broadcast_mul(&sin)?)?;
        Ok(rotated.to_dtype(dtype)?)
    }
}

/// [x1, x2] -> [-x2, x1] over the last dimension.
fn rotate_half(x: &Tensor) -> Result<Tensor> {
    let last = x.rank() - 1;
    let half = x.dim(last)? / 2;
    let x1 = x.narrow(last, 0, half)?;
    let x2 = x.narrow(last, half, half)?;
    Ok(Tensor::cat(&[&x2.neg()?, &x1], last)?)
}
