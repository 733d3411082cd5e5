//! Configuration types for nano-specinfer.

use std::path::Path;

use candle_core::DType;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Fixed maxima every batch snapshot and cache region is sized against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchLimits {
    /// Number of request slots in a batch.
    pub max_requests_per_batch: usize,
    /// Maximum number of new tokens across all requests in one forward call.
    pub max_tokens_per_batch: usize,
    /// Maximum committed (linear) history per request.
    pub max_sequence_length: usize,
    /// Maximum number of in-flight speculative tree tokens per request.
    pub max_spec_tree_token_num: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_requests_per_batch: 64,
            max_tokens_per_batch: 1024,
            max_sequence_length: 1024,
            max_spec_tree_token_num: 64,
        }
    }
}

impl BatchLimits {
    /// Positions reserved per request: linear history plus the tree region.
    pub fn cache_capacity(&self) -> usize {
        self.max_sequence_length + self.max_spec_tree_token_num
    }

    /// Check that every limit is non-zero.
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("max_requests_per_batch", self.max_requests_per_batch),
            ("max_tokens_per_batch", self.max_tokens_per_batch),
            ("max_sequence_length", self.max_sequence_length),
            ("max_spec_tree_token_num", self.max_spec_tree_token_num),
        ];
        for (name, value) in fields {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }
}

/// Which attention kernel family a layer launches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelPath {
    /// Custom kernel walking the cache directly, bitmask applied inline.
    Fused,
    /// Batched paged-attention path fed with a dense custom mask.
    Batched,
}

/// Rotary position embedding settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RotaryConfig {
    /// Base frequency.
    pub theta: f64,
}

impl Default for RotaryConfig {
    fn default() -> Self {
        Self { theta: 10000.0 }
    }
}

/// Attention layer shape and numeric policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttentionConfig {
    /// Input/output embedding width.
    pub hidden_size: usize,
    /// Number of query heads (on this shard).
    pub num_q_heads: usize,
    /// Number of key/value heads (on this shard).
    pub num_kv_heads: usize,
    /// Dimension per head.
    pub head_dim: usize,
    /// Multiply projected queries by `scaling_factor`.
    pub scaling_query: bool,
    pub scaling_factor: f32,
    /// Scale q·k by `1/sqrt(head_dim)`.
    pub qk_prod_scaling: bool,
    /// Rotary embedding, if the model uses one.
    pub rotary: Option<RotaryConfig>,
    /// Add an ALiBi linear position bias to q·k.
    pub position_bias: bool,
    /// Kernel family.
    pub kernel: KernelPath,
    /// Tokens per page for the batched paged path.
    pub page_size: usize,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            hidden_size: 4096,
            num_q_heads: 32,
            num_kv_heads: 32,
            head_dim: 128,
            scaling_query: false,
            scaling_factor: 1.0,
            qk_prod_scaling: true,
            rotary: None,
            position_bias: false,
            kernel: KernelPath::Fused,
            page_size: 16,
        }
    }
}

impl AttentionConfig {
    /// Width of the query projection.
    pub fn q_hidden(&self) -> usize {
        self.num_q_heads * self.head_dim
    }

    /// Width of the key (and value) projection.
    pub fn kv_hidden(&self) -> usize {
        self.num_kv_heads * self.head_dim
    }

    /// Width of one token's fused `[q | k | v]` projection row.
    pub fn qkv_width(&self) -> usize {
        self.q_hidden() + 2 * self.kv_hidden()
    }

    /// Query heads per key/value head.
    pub fn group_size(&self) -> usize {
        self.num_q_heads / self.num_kv_heads
    }

    /// Softmax scale applied to q·k.
    pub fn softmax_scale(&self) -> f32 {
        if self.qk_prod_scaling {
            1.0 / (self.head_dim as f32).sqrt()
        } else {
            1.0
        }
    }

    /// Validate head arithmetic.
    pub fn validate(&self) -> Result<()> {
        if self.hidden_size == 0 || self.head_dim == 0 {
            return Err(Error::Config(
                "hidden_size and head_dim must be non-zero".into(),
            ));
        }
        if self.num_kv_heads == 0 || self.num_q_heads % self.num_kv_heads != 0 {
            return Err(Error::Config(format!(
                "num_q_heads {} is not a multiple of num_kv_heads {}",
                self.num_q_heads, self.num_kv_heads
            )));
        }
        if let Some(rotary) = self.rotary {
            if self.head_dim % 2 != 0 || rotary.theta <= 0.0 {
                return Err(Error::Config(
                    "rotary embedding needs an even head_dim and a positive theta".into(),
                ));
            }
        }
        if self.page_size == 0 {
            return Err(Error::Config("page_size must be non-zero".into()));
        }
        Ok(())
    }

    /// Per-shard configuration for a tensor-parallel world. Heads are split
    /// evenly; the embedding width is replicated.
    pub fn shard(&self, world_size: usize) -> Result<Self> {
        if world_size == 0
            || self.num_q_heads % world_size != 0
            || self.num_kv_heads % world_size != 0
        {
            return Err(Error::Config(format!(
                "cannot split {} query / {} kv heads across {} shards",
                self.num_q_heads, self.num_kv_heads, world_size
            )));
        }
        Ok(Self {
            num_q_heads: self.num_q_heads / world_size,
            num_kv_heads: self.num_kv_heads / world_size,
            ..self.clone()
        })
    }
}

/// Values the kernel dispatcher accepts.
///
/// A value must be listed here *and* have a compiled instantiation; anything
/// else is rejected at dispatch time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub head_dims: Vec<usize>,
    pub group_sizes: Vec<usize>,
    pub page_sizes: Vec<usize>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            head_dims: vec![64, 128],
            group_sizes: vec![1, 4, 8],
            page_sizes: vec![16],
        }
    }
}

impl DispatchConfig {
    /// Reject a configuration outside the supported sets.
    pub fn check(&self, config: &AttentionConfig) -> Result<()> {
        if !self.head_dims.contains(&config.head_dim) {
            return Err(Error::Config(format!(
                "unsupported head dimension {} (supported: {:?})",
                config.head_dim, self.head_dims
            )));
        }
        if config.kernel == KernelPath::Batched {
            if !self.group_sizes.contains(&config.group_size()) {
                return Err(Error::Config(format!(
                    "unsupported group size {} (supported: {:?})",
                    config.group_size(),
                    self.group_sizes
                )));
            }
            if !self.page_sizes.contains(&config.page_size) {
                return Err(Error::Config(format!(
                    "unsupported page size {} (supported: {:?})",
                    config.page_size, self.page_sizes
                )));
            }
        }
        Ok(())
    }
}

/// Storage precision of the KV cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheDType {
    F32,
    F16,
    Bf16,
}

impl CacheDType {
    pub fn to_dtype(self) -> DType {
        match self {
            CacheDType::F32 => DType::F32,
            CacheDType::F16 => DType::F16,
            CacheDType::Bf16 => DType::BF16,
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub limits: BatchLimits,
    /// Unsharded attention shape.
    pub attention: AttentionConfig,
    pub dispatch: DispatchConfig,
    pub cache_dtype: CacheDType,
    /// Number of tensor-parallel shards.
    pub tensor_parallel_size: usize,
    /// Upper bound on bytes the device allocator hands out (unbounded if unset).
    pub memory_budget_bytes: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            limits: BatchLimits::default(),
            attention: AttentionConfig::default(),
            dispatch: DispatchConfig::default(),
            cache_dtype: CacheDType::F32,
            tensor_parallel_size: 1,
            memory_budget_bytes: None,
        }
    }
}

impl EngineConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Validate the whole configuration, including the per-shard dispatch.
    pub fn validate(&self) -> Result<()> {
        self.limits.validate()?;
        self.attention.validate()?;
        let shard = self.attention.shard(self.tensor_parallel_size)?;
        self.dispatch.check(&shard)
    }
}
