//! Inference orchestration.
//!
//! This module contains:
//! - VariantStrategy, the per-mode stage selection
//! - AttentionLayer, the single forward entry point for all three modes

pub mod layer;
pub mod variant;

pub use layer::{AttentionLayer, AttentionWeights};
pub use variant::VariantStrategy;
