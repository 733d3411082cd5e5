//! Attention layer: the per-variant forward entry point.
//!
//! One [`AttentionLayer`] owns a shard's projection weights and KV cache and
//! runs the shared pipeline for its [`InferenceMode`]:
//!
//! ```text
//!  forward(bc, input)
//!      │
//!      ├─ zero active tokens ──────────────► empty output (no-op)
//!      │
//!      ├─ Commit            (TreeVerify, non-prompt)
//!      ├─ last-batch token count = num_active_tokens
//!      ├─ QKV projection + query scaling + rotary
//!      ├─ Mask Update       (batched kernel, non-prompt)
//!      ├─ QKV Cache Writer
//!      ├─ Attention kernel  (fused | batched)
//!      ├─ Output projection
//!      └─ All-reduce across tensor-parallel shards
//! ```

use candle_core::{DType, Device, Tensor};
use rand::Rng;

use super::variant::VariantStrategy;
use crate::attention::{
    commit_tokens, dispatch_batched, dispatch_fused, update_custom_mask, write_qkv,
    KernelParams, RotaryEmbedding,
};
use crate::config::{AttentionConfig, BatchLimits, EngineConfig, KernelPath};
use crate::core::batch_config::{BatchConfig, InferenceMode};
use crate::core::context::ExecutionContext;
use crate::core::kv_cache::{CacheElement, KvCache};
use crate::core::layout::KvLayout;
use crate::error::{Error, Result};

/// Projection weights of one attention layer (or one shard of it).
#[derive(Debug, Clone)]
pub struct AttentionWeights {
    /// Fused QKV projection [hidden, q_hidden + 2 * kv_hidden].
    qkv: Tensor,
    /// Output projection [q_hidden, hidden].
    output: Tensor,
}

impl AttentionWeights {
    /// Wrap projection tensors, checking them against `config`.
    pub fn new(qkv: Tensor, output: Tensor, config: &AttentionConfig) -> Result<Self> {
        let expected_qkv = [config.hidden_size, config.qkv_width()];
        let expected_out = [config.q_hidden(), config.hidden_size];
        if qkv.dims() != expected_qkv || output.dims() != expected_out {
            return Err(Error::Shape(format!(
                "weights are {:?} / {:?}, expected {:?} / {:?}",
                qkv.dims(),
                output.dims(),
                expected_qkv,
                expected_out
            )));
        }
        Ok(Self { qkv, output })
    }

    /// Uniform random weights in `±1/sqrt(hidden_size)`.
    pub fn random(config: &AttentionConfig, rng: &mut impl Rng, device: &Device) -> Result<Self> {
        let bound = 1.0 / (config.hidden_size as f32).sqrt();
        let mut fill = |len: usize| -> Vec<f32> {
            (0..len).map(|_| rng.gen_range(-bound..bound)).collect()
        };
        let qkv = Tensor::from_vec(
            fill(config.hidden_size * config.qkv_width()),
            (config.hidden_size, config.qkv_width()),
            device,
        )?;
        let output = Tensor::from_vec(
            fill(config.q_hidden() * config.hidden_size),
            (config.q_hidden(), config.hidden_size),
            device,
        )?;
        Self::new(qkv, output, config)
    }

    /// Weights that pass activations straight through: q, k and v are the
    /// leading input features and the output projection is the identity on
    /// the leading attention features.
    pub fn identity(config: &AttentionConfig, device: &Device) -> Result<Self> {
        let (hidden, q_hidden, kv_hidden) =
            (config.hidden_size, config.q_hidden(), config.kv_hidden());
        let width = config.qkv_width();
        let mut qkv = vec![0.0f32; hidden * width];
        for i in 0..hidden {
            if i < q_hidden {
                qkv[i * width + i] = 1.0;
            }
            if i < kv_hidden {
                qkv[i * width + q_hidden + i] = 1.0;
                qkv[i * width + q_hidden + kv_hidden + i] = 1.0;
            }
        }
        let mut output = vec![0.0f32; q_hidden * hidden];
        for i in 0..q_hidden.min(hidden) {
            output[i * hidden + i] = 1.0;
        }
        Self::new(
            Tensor::from_vec(qkv, (hidden, width), device)?,
            Tensor::from_vec(output, (q_hidden, hidden), device)?,
            config,
        )
    }

    /// Head-wise slice for shard `rank` of `world_size`.
    ///
    /// `config` describes the unsharded layer. Query, key and value columns
    /// are split by head; output projection rows follow the query heads.
    pub fn shard(&self, config: &AttentionConfig, rank: usize, world_size: usize) -> Result<Self> {
        let shard = config.shard(world_size)?;
        if rank >= world_size {
            return Err(Error::Config(format!(
                "rank {rank} outside a world of {world_size}"
            )));
        }
        let (q_shard, kv_shard) = (shard.q_hidden(), shard.kv_hidden());
        let q = self.qkv.narrow(1, rank * q_shard, q_shard)?;
        let k = self
            .qkv
            .narrow(1, config.q_hidden() + rank * kv_shard, kv_shard)?;
        let v = self.qkv.narrow(
            1,
            config.q_hidden() + config.kv_hidden() + rank * kv_shard,
            kv_shard,
        )?;
        let qkv = Tensor::cat(&[&q, &k, &v], 1)?.contiguous()?;
        let output = self.output.narrow(0, rank * q_shard, q_shard)?.contiguous()?;
        Self::new(qkv, output, &shard)
    }

    pub fn qkv(&self) -> &Tensor {
        &self.qkv
    }

    pub fn output(&self) -> &Tensor {
        &self.output
    }

    fn to_device(&self, dtype: DType, device: &Device) -> Result<Self> {
        Ok(Self {
            qkv: self.qkv.to_device(device)?.to_dtype(dtype)?,
            output: self.output.to_device(device)?.to_dtype(dtype)?,
        })
    }
}

/// One attention layer shard for a single inference variant.
#[derive(Debug)]
pub struct AttentionLayer<E: CacheElement> {
    mode: InferenceMode,
    strategy: VariantStrategy,
    /// Per-shard attention shape.
    config: AttentionConfig,
    limits: BatchLimits,
    params: KernelParams,
    weights: AttentionWeights,
    rotary: Option<RotaryEmbedding>,
    cache: KvCache<E>,
    /// Active tokens of the previous forward call; bounds the next commit.
    num_active_tokens_in_last_batch: usize,
}

impl<E: CacheElement> AttentionLayer<E> {
    /// Create a layer shard.
    ///
    /// # Arguments
    ///
    /// * `ctx` - This shard's execution context
    /// * `config` - Engine configuration (unsharded attention shape)
    /// * `mode` - Attention variant this layer serves
    /// * `weights` - This shard's projection weights
    pub fn new(
        ctx: &ExecutionContext,
        config: &EngineConfig,
        mode: InferenceMode,
        weights: AttentionWeights,
    ) -> Result<Self> {
        config.validate()?;
        if config.tensor_parallel_size != ctx.world_size() {
            return Err(Error::Config(format!(
                "tensor_parallel_size {} does not match a communicator world of {}",
                config.tensor_parallel_size,
                ctx.world_size()
            )));
        }
        if config.cache_dtype.to_dtype() != E::DTYPE {
            return Err(Error::Config(format!(
                "cache dtype {:?} does not match element type {:?}",
                config.cache_dtype,
                E::DTYPE
            )));
        }

        let shard = config.attention.shard(ctx.world_size())?;
        let weights = AttentionWeights::new(weights.qkv, weights.output, &shard)?
            .to_device(E::DTYPE, ctx.device())?;

        let limits = config.limits;
        let layout = match shard.kernel {
            KernelPath::Fused => KvLayout::linear(
                limits.max_requests_per_batch,
                limits.cache_capacity(),
                shard.kv_hidden(),
            ),
            KernelPath::Batched => KvLayout::paged(
                limits.max_requests_per_batch,
                limits.cache_capacity(),
                shard.kv_hidden(),
                shard.page_size,
            ),
        };
        let cache = KvCache::new(ctx, layout)?;
        let rotary = shard
            .rotary
            .map(|r| RotaryEmbedding::new(shard.head_dim, limits.cache_capacity(), r.theta, ctx.device()))
            .transpose()?;

        let strategy = mode.strategy();
        tracing::info!(
            mode = mode.name(),
            rank = ctx.rank(),
            kernel = ?shard.kernel,
            num_q_heads = shard.num_q_heads,
            num_kv_heads = shard.num_kv_heads,
            head_dim = shard.head_dim,
            position_bias = shard.position_bias,
            cache_bytes = cache.size_in_bytes(),
            "attention layer created"
        );
        Ok(Self {
            mode,
            strategy,
            params: KernelParams::new(&shard, strategy.mask_source)
                .with_shard(ctx.rank(), ctx.world_size()),
            config: shard,
            limits,
            weights,
            rotary,
            cache,
            num_active_tokens_in_last_batch: 0,
        })
    }

    /// Ordinary incremental-decoding layer.
    pub fn incremental(
        ctx: &ExecutionContext,
        config: &EngineConfig,
        weights: AttentionWeights,
    ) -> Result<Self> {
        Self::new(ctx, config, InferenceMode::Incremental, weights)
    }

    /// Draft-token (speculative tree growing) layer.
    pub fn speculative(
        ctx: &ExecutionContext,
        config: &EngineConfig,
        weights: AttentionWeights,
    ) -> Result<Self> {
        Self::new(ctx, config, InferenceMode::Speculative, weights)
    }

    /// Tree verification layer; commits accepted tokens each call.
    pub fn tree_verify(
        ctx: &ExecutionContext,
        config: &EngineConfig,
        weights: AttentionWeights,
    ) -> Result<Self> {
        Self::new(ctx, config, InferenceMode::TreeVerify, weights)
    }

    /// Run one forward call.
    ///
    /// # Arguments
    ///
    /// * `ctx` - This shard's execution context
    /// * `bc` - Batch snapshot; must be built for this layer's mode
    /// * `input` - Activations [num_active_tokens, hidden_size] in batch token order
    ///
    /// # Returns
    ///
    /// Attention output [num_active_tokens, hidden_size], reduced across shards.
    pub fn forward(
        &mut self,
        ctx: &ExecutionContext,
        bc: &BatchConfig,
        input: &Tensor,
    ) -> Result<Tensor> {
        let num_tokens = bc.num_active_tokens();
        if num_tokens == 0 {
            tracing::debug!(mode = self.mode.name(), "no active tokens, skipping forward");
            return Ok(Tensor::zeros(
                (0, self.config.hidden_size),
                E::DTYPE,
                ctx.device(),
            )?);
        }
        self.check_inputs(bc, input, num_tokens)?;

        let prompt = bc.is_prompt_phase();
        let committed = if self.strategy.commits && !prompt {
            commit_tokens(&mut self.cache, bc, self.num_active_tokens_in_last_batch)?
        } else {
            0
        };
        self.num_active_tokens_in_last_batch = num_tokens;

        let qkv = self.project_qkv(bc, input)?;

        let mask = (self.config.kernel == KernelPath::Batched && !prompt)
            .then(|| update_custom_mask(bc, self.strategy.mask_source));

        let (q_hidden, kv_hidden) = (self.config.q_hidden(), self.config.kv_hidden());
        let queries = write_qkv(&qkv, bc, &mut self.cache, q_hidden, kv_hidden)?;

        let attn = match self.config.kernel {
            KernelPath::Fused => dispatch_fused(&queries, bc, &self.cache, &self.params)?,
            KernelPath::Batched => dispatch_batched(
                &queries,
                bc,
                &self.cache,
                &self.params,
                mask.as_ref(),
                ctx.device(),
            )?,
        };

        let attn = Tensor::from_vec(attn, (num_tokens, q_hidden), ctx.device())?;
        let output = attn.matmul(&self.weights.output)?;
        let output = ctx.all_reduce(&output)?;

        tracing::debug!(
            mode = self.mode.name(),
            num_requests = bc.num_active_requests(),
            num_tokens,
            prompt,
            committed,
            "forward finished"
        );
        Ok(output)
    }

    /// Training is not supported for these attention variants.
    pub fn backward(&self) -> Result<()> {
        Err(Error::Unsupported(
            "backward pass of incremental/speculative/tree-verify attention",
        ))
    }

    fn check_inputs(&self, bc: &BatchConfig, input: &Tensor, num_tokens: usize) -> Result<()> {
        if bc.mode() != self.mode {
            return Err(Error::Config(format!(
                "{} layer received a {} batch",
                self.mode.name(),
                bc.mode().name()
            )));
        }
        if bc.limits() != &self.limits {
            return Err(Error::Config(
                "batch limits differ from the limits the cache was sized for".into(),
            ));
        }
        if input.dtype() != E::DTYPE {
            return Err(Error::Config(format!(
                "input dtype {:?} does not match cache dtype {:?}",
                input.dtype(),
                E::DTYPE
            )));
        }
        if input.dims() != [num_tokens, self.config.hidden_size] {
            return Err(Error::Shape(format!(
                "input is {:?}, expected [{num_tokens}, {}]",
                input.dims(),
                self.config.hidden_size
            )));
        }
        Ok(())
    }

    /// QKV projection with query scaling and rotary applied, as packed rows.
    fn project_qkv(&self, bc: &BatchConfig, input: &Tensor) -> Result<Vec<E>> {
        let num_tokens = bc.num_active_tokens();
        let (q_hidden, kv_hidden) = (self.config.q_hidden(), self.config.kv_hidden());
        let head_dim = self.config.head_dim;

        let qkv = input.matmul(&self.weights.qkv)?;
        let mut q = qkv.narrow(1, 0, q_hidden)?;
        let mut k = qkv.narrow(1, q_hidden, kv_hidden)?;
        let v = qkv.narrow(1, q_hidden + kv_hidden, kv_hidden)?;

        if self.config.scaling_query {
            q = (q * self.config.scaling_factor as f64)?;
        }
        if let Some(rope) = &self.rotary {
            let positions: Vec<usize> = bc.tokens().iter().map(|t| t.position).collect();
            q = rope
                .apply(
                    &q.reshape((num_tokens, self.config.num_q_heads, head_dim))?,
                    &positions,
                )?
                .reshape((num_tokens, q_hidden))?;
            k = rope
                .apply(
                    &k.reshape((num_tokens, self.config.num_kv_heads, head_dim))?,
                    &positions,
                )?
                .reshape((num_tokens, kv_hidden))?;
        }

        Ok(Tensor::cat(&[&q, &k, &v], 1)?
            .flatten_all()?
            .to_vec1::<E>()?)
    }

    pub fn mode(&self) -> InferenceMode {
        self.mode
    }

    /// Per-shard attention shape.
    pub fn config(&self) -> &AttentionConfig {
        &self.config
    }

    pub fn cache(&self) -> &KvCache<E> {
        &self.cache
    }

    pub fn num_active_tokens_in_last_batch(&self) -> usize {
        self.num_active_tokens_in_last_batch
    }
}
