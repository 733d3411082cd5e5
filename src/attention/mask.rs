//! Dense custom attention mask for the batched paged path.
//!
//! Regenerated from the per-request bitmasks immediately before every
//! batched kernel launch. The tree changes shape every speculative round, so
//! nothing here is cached between calls.
//!
//! ## Layout
//!
//! ```text
//! request 0: [q_len_0 x k_len_0] | request 1: [q_len_1 x k_len_1] | ...
//! ^ indptr[0] = 0                 ^ indptr[1] = q_len_0 * k_len_0
//! ```
//!
//! with `k_len = first_token_depth_in_request + q_len`. Visible entries are
//! `0.0`, masked entries [`MASK_VALUE`].

use candle_core::{Device, Tensor};

use crate::core::batch_config::{BatchConfig, PerRequestInfo};
use crate::core::bitmask::BitMask;
use crate::error::Result;

/// Additive penalty for masked positions. Finite so that reduced-precision
/// softmax never sees `-inf - -inf`.
pub const MASK_VALUE: f32 = -5e4;

/// Where non-prompt visibility comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskSource {
    /// Plain causal order by absolute depth.
    Causal,
    /// Committed history plus the per-request tree bitmask.
    BitMask,
}

/// Whether query `q` (request-local) may attend to absolute key `k`.
///
/// Prompt-phase requests are always causal.
pub(crate) fn key_visible(
    source: MaskSource,
    info: &PerRequestInfo,
    bitmask: &BitMask,
    q: usize,
    k: usize,
) -> bool {
    let abs_q = info.first_token_depth_in_request + q;
    if info.prompt_phase || source == MaskSource::Causal {
        return k <= abs_q;
    }
    let boundary = bitmask.non_tree_cache_size();
    if k < boundary {
        return true;
    }
    match abs_q.checked_sub(boundary) {
        Some(tree_query) => bitmask.is_set(tree_query, k - boundary),
        None => k <= abs_q,
    }
}

/// Position of absolute key `k` for the position bias.
///
/// Committed history sits at its depth; a tree key sits at the boundary plus
/// its depth within the tree, so siblings share a position.
pub(crate) fn key_position(
    source: MaskSource,
    info: &PerRequestInfo,
    bitmask: &BitMask,
    k: usize,
) -> usize {
    if info.prompt_phase || source == MaskSource::Causal {
        return k;
    }
    let boundary = bitmask.non_tree_cache_size();
    match k.checked_sub(boundary) {
        Some(node) => boundary + bitmask.node_depth(node),
        None => k,
    }
}

/// Query and key positions of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RequestPositions {
    pub queries: Vec<usize>,
    pub keys: Vec<usize>,
}

impl RequestPositions {
    /// Positions of active `slot`, or `None` if the slot is not in `bc`.
    pub(crate) fn build(source: MaskSource, bc: &BatchConfig, slot: usize) -> Option<Self> {
        let info = bc.request(slot)?;
        let bitmask = bc.bitmask(slot)?;
        let first = bc.first_token_index(slot)?;
        let queries = bc.tokens()[first..first + info.num_tokens_in_batch]
            .iter()
            .map(|t| t.position)
            .collect();
        let keys = (0..info.total_length())
            .map(|k| key_position(source, info, bitmask, k))
            .collect();
        Some(Self { queries, keys })
    }

    /// ALiBi bias of query `q` on key `k`: zero on itself, more negative
    /// the further back the key.
    pub(crate) fn bias(&self, slope: f32, q: usize, k: usize) -> f32 {
        slope * (self.keys[k] as f32 - self.queries[q] as f32)
    }
}

/// Packed per-request `[q_len, k_len]` masks of one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct AttentionMask {
    data: Vec<f32>,
    indptr: Vec<usize>,
    dims: Vec<(usize, usize)>,
}

impl AttentionMask {
    /// Number of requests (compact order).
    pub fn num_requests(&self) -> usize {
        self.dims.len()
    }

    /// Prefix sums of `q_len * k_len`; `num_requests() + 1` entries.
    pub fn indptr(&self) -> &[usize] {
        &self.indptr
    }

    /// `(q_len, k_len)` of request `compact`.
    pub fn dims(&self, compact: usize) -> (usize, usize) {
        self.dims[compact]
    }

    /// Row-major mask of request `compact`.
    pub fn request(&self, compact: usize) -> &[f32] {
        &self.data[self.indptr[compact]..self.indptr[compact + 1]]
    }

    /// Mask of request `compact` as a `[q_len, k_len]` tensor.
    pub fn to_tensor(&self, compact: usize, device: &Device) -> Result<Tensor> {
        let (q_len, k_len) = self.dims(compact);
        Ok(Tensor::from_slice(self.request(compact), (q_len, k_len), device)?)
    }
}

/// Build the custom mask for every active request of `bc`.
pub fn update_custom_mask(bc: &BatchConfig, source: MaskSource) -> AttentionMask {
    let mut data = Vec::new();
    let mut indptr = vec![0];
    let mut dims = Vec::with_capacity(bc.num_active_requests());

    for slot in bc.active_slots() {
        let (Some(info), Some(bitmask)) = (bc.request(slot), bc.bitmask(slot)) else {
            continue;
        };
        let q_len = info.num_tokens_in_batch;
        let k_len = info.total_length();
        for q in 0..q_len {
            for k in 0..k_len {
                let visible = key_visible(source, info, bitmask, q, k);
                data.push(if visible { 0.0 } else { MASK_VALUE });
            }
        }
        indptr.push(data.len());
        dims.push((q_len, k_len));
    }

    tracing::debug!(
        num_requests = dims.len(),
        mask_elements = data.len(),
        ?source,
        "custom mask updated"
    );
    AttentionMask { data, indptr, dims }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BatchLimits;
    use crate::core::batch_config::InferenceMode;

    fn limits() -> BatchLimits {
        BatchLimits {
            max_requests_per_batch: 4,
            max_tokens_per_batch: 32,
            max_sequence_length: 16,
            max_spec_tree_token_num: 8,
        }
    }

    #[test]
    fn test_prompt_mask_is_causal() {
        let mut bc = BatchConfig::new(InferenceMode::TreeVerify, limits());
        bc.add_prompt(0, 1, &[1, 2, 3]).unwrap();
        let mask = update_custom_mask(&bc, MaskSource::BitMask);

        assert_eq!(mask.dims(0), (3, 3));
        let m = mask.request(0);
        for q in 0..3 {
            for k in 0..3 {
                let expected = if k <= q { 0.0 } else { MASK_VALUE };
                assert_eq!(m[q * 3 + k], expected, "q={q} k={k}");
            }
        }
    }

    #[test]
    fn test_tree_mask_follows_bits() {
        // history 2, tree 0 -> {1, 2}
        let mut bc = BatchConfig::new(InferenceMode::TreeVerify, limits());
        bc.add_tree(1, 9, 2, &[5, 6, 7], &[None, Some(0), Some(0)])
            .unwrap();
        let mask = update_custom_mask(&bc, MaskSource::BitMask);

        assert_eq!(mask.dims(0), (3, 5));
        let row = |q: usize| mask.request(0)[q * 5..(q + 1) * 5].to_vec();
        let m = MASK_VALUE;
        assert_eq!(row(0), vec![0.0, 0.0, 0.0, m, m]);
        assert_eq!(row(1), vec![0.0, 0.0, 0.0, 0.0, m]);
        assert_eq!(row(2), vec![0.0, 0.0, 0.0, m, 0.0]);
    }

    #[test]
    fn test_causal_source_ignores_bits() {
        let mut bc = BatchConfig::new(InferenceMode::Incremental, limits());
        bc.add_tree(0, 9, 2, &[5, 6], &[None, None]).unwrap();
        let mask = update_custom_mask(&bc, MaskSource::Causal);
        // Node 1 is a second root, yet causal order lets it see node 0.
        assert_eq!(mask.dims(0), (2, 4));
        assert_eq!(mask.request(0)[4 + 2], 0.0);
    }

    #[test]
    fn test_packed_offsets() {
        let mut bc = BatchConfig::new(InferenceMode::TreeVerify, limits());
        bc.add_prompt(0, 1, &[1, 2]).unwrap();
        bc.add_decode(2, 2, 4, &[3]).unwrap();
        let mask = update_custom_mask(&bc, MaskSource::BitMask);

        assert_eq!(mask.num_requests(), 2);
        assert_eq!(mask.indptr(), &[0, 4, 9]);
        let t = mask.to_tensor(1, &Device::Cpu).unwrap();
        assert_eq!(t.dims(), &[1, 5]);
        assert!(mask.request(1).iter().all(|&v| v == 0.0));
    }
}
