//! Per-variant pipeline hooks.
//!
//! The three attention variants share one forward pipeline and differ only
//! in which stages run and where non-prompt visibility comes from:
//!
//! ```text
//!                 commit   mask source
//! Incremental     no       causal
//! Speculative     no       bitmask
//! TreeVerify      yes      bitmask
//! ```

use crate::attention::mask::MaskSource;
use crate::core::batch_config::InferenceMode;

/// Stage selection for one attention variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariantStrategy {
    /// Run the commit engine on non-prompt batches.
    pub commits: bool,
    pub mask_source: MaskSource,
}

impl InferenceMode {
    pub fn strategy(self) -> VariantStrategy {
        match self {
            InferenceMode::Incremental => VariantStrategy {
                commits: false,
                mask_source: MaskSource::Causal,
            },
            InferenceMode::Speculative => VariantStrategy {
                commits: false,
                mask_source: MaskSource::BitMask,
            },
            InferenceMode::TreeVerify => VariantStrategy {
                commits: true,
                mask_source: MaskSource::BitMask,
            },
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            InferenceMode::Incremental => "incremental",
            InferenceMode::Speculative => "speculative",
            InferenceMode::TreeVerify => "tree_verify",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_tree_verify_commits() {
        assert!(!InferenceMode::Incremental.strategy().commits);
        assert!(!InferenceMode::Speculative.strategy().commits);
        assert!(InferenceMode::TreeVerify.strategy().commits);
    }

    #[test]
    fn test_mask_sources() {
        assert_eq!(
            InferenceMode::Incremental.strategy().mask_source,
            MaskSource::Causal
        );
        assert_eq!(
            InferenceMode::Speculative.strategy().mask_source,
            MaskSource::BitMask
        );
    }
}
