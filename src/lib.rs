//! nano-specinfer: paged KV-cache attention for tensor-parallel speculative
//! inference.
//!
//! This crate implements the attention core of a speculative-decoding
//! inference engine:
//! - Per-request cache regions in a linear or paged layout
//! - Batch snapshots mixing prompt, decode and speculative tree tokens
//! - Commit of accepted tree tokens into linear history
//! - Fused and batched paged attention kernels with tree bitmasks
//! - Incremental, speculative and tree-verify layers behind one forward call

pub mod config;
pub mod error;

pub mod attention;
pub mod core;
pub mod engine;

pub use attention::{AttentionMask, KernelParams, MaskSource, MASK_VALUE};
pub use config::{
    AttentionConfig, BatchLimits, CacheDType, DispatchConfig, EngineConfig, KernelPath,
    RotaryConfig,
};
pub use crate::core::{
    BatchConfig, BitMask, CacheElement, CommittedTokenInfo, Communicator, ExecutionContext,
    InferenceMode, KvCache, KvLayout, LocalCommunicator, RequestSlots, ThreadCommunicator,
};
pub use engine::{AttentionLayer, AttentionWeights, VariantStrategy};
pub use error::{Error, Result};
