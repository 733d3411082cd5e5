//! Attention pipeline stages.
//!
//! This module contains, in the order a forward call runs them:
//! - `commit`: move accepted speculative K/V into linear history
//! - `mask`: dense custom mask for the batched path
//! - `qkv`: scatter new K/V into the cache, gather queries
//! - `fused` / `batched`: the two attention kernel families
//! - `rope`: rotary embedding applied to projections before the writer

pub mod batched;
pub mod commit;
pub mod fused;
pub mod mask;
pub mod qkv;
pub mod rope;

pub use batched::{batched_paged_attention, dispatch_batched, PagedIndex};
pub use commit::commit_tokens;
pub use fused::{dispatch_fused, fused_attention};
pub use mask::{update_custom_mask, AttentionMask, MaskSource, MASK_VALUE};
pub use qkv::write_qkv;
pub use rope::RotaryEmbedding;

use crate::config::AttentionConfig;
use crate::core::kv_cache::{CacheElement, KvCache};
use crate::error::{Error, Result};

/// Launch parameters shared by both kernel families.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KernelParams {
    pub num_q_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    /// Multiplier on q·k.
    pub scale: f32,
    /// Visibility source for non-prompt requests.
    pub mask_source: MaskSource,
    /// Add the ALiBi position bias.
    pub position_bias: bool,
    /// Global index of this shard's first query head.
    pub head_offset: usize,
    /// Query heads across all shards; sets the ALiBi slopes.
    pub total_q_heads: usize,
}

impl KernelParams {
    pub fn new(config: &AttentionConfig, mask_source: MaskSource) -> Self {
        Self {
            num_q_heads: config.num_q_heads,
            num_kv_heads: config.num_kv_heads,
            head_dim: config.head_dim,
            scale: config.softmax_scale(),
            mask_source,
            position_bias: config.position_bias,
            head_offset: 0,
            total_q_heads: config.num_q_heads,
        }
    }

    /// Place these (per-shard) heads at shard `rank` of `world_size`.
    pub fn with_shard(self, rank: usize, world_size: usize) -> Self {
        Self {
            head_offset: rank * self.num_q_heads,
            total_q_heads: world_size * self.num_q_heads,
            ..self
        }
    }

    /// ALiBi slope `2^(-8 (h + 1) / total_q_heads)` of local head `head`,
    /// with `h` its global index.
    pub fn alibi_slope(&self, head: usize) -> Option<f32> {
        self.position_bias.then(|| {
            let exponent = 8.0 * (self.head_offset + head + 1) as f32 / self.total_q_heads as f32;
            2f32.powf(-exponent)
        })
    }

    pub fn q_hidden(&self) -> usize {
        self.num_q_heads * self.head_dim
    }

    pub fn kv_hidden(&self) -> usize {
        self.num_kv_heads * self.head_dim
    }

    pub fn group_size(&self) -> usize {
        self.num_q_heads / self.num_kv_heads.max(1)
    }

    /// Shape checks every kernel runs before touching the cache.
    pub(crate) fn check<E: CacheElement>(
        &self,
        head_dim: usize,
        queries_len: usize,
        num_tokens: usize,
        cache: &KvCache<E>,
    ) -> Result<()> {
        if head_dim != self.head_dim {
            return Err(Error::Config(format!(
                "kernel instantiated for head dimension {head_dim}, layer uses {}",
                self.head_dim
            )));
        }
        if self.num_kv_heads == 0 || self.num_q_heads % self.num_kv_heads != 0 {
            return Err(Error::Config(format!(
                "{} query heads cannot be grouped over {} kv heads",
                self.num_q_heads, self.num_kv_heads
            )));
        }
        if queries_len != num_tokens * self.q_hidden() {
            return Err(Error::Shape(format!(
                "query buffer holds {queries_len} elements, expected {num_tokens} x {}",
                self.q_hidden()
            )));
        }
        if cache.layout().kv_hidden() != self.kv_hidden() {
            return Err(Error::Shape(format!(
                "cache stores {} elements per key, kernel expects {}",
                cache.layout().kv_hidden(),
                self.kv_hidden()
            )));
        }
        Ok(())
    }
}
