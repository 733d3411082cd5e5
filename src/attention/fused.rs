//! Fused custom attention kernel.
//!
//! Walks the KV cache directly, one work item per (head, request), and
//! applies the visibility rule inline while streaming keys:
//!
//! ```text
//! for each (head, request):
//!     first = first_token_index(request)          // linear scan
//!     for each query q of the request:
//!         load q into scratch                     // [f32; HEAD_DIM]
//!         logits[k] = scale * q·K[k] + bias  for visible k, track max
//!         p[k] = exp(logits[k] - max) / sum
//!         acc[k % V_GROUPS] += p[k] * V[k]        // partial sums
//!         out[first + q, head] = pairwise_reduce(acc)
//! ```
//!
//! Everything is accumulated in `f32` regardless of the cache element type.

use crate::attention::mask::{key_visible, RequestPositions};
use crate::attention::KernelParams;
use crate::core::batch_config::BatchConfig;
use crate::core::kv_cache::{CacheElement, KvCache};
use crate::error::{Error, Result};

/// Number of partial value accumulators per output row. Power of two.
const V_GROUPS: usize = 4;

/// Fused attention over the cache for every active request of `bc`.
///
/// `queries` holds `num_active_tokens * q_hidden` elements in batch token
/// order; the output has the same shape.
pub fn fused_attention<E: CacheElement, const HEAD_DIM: usize>(
    queries: &[E],
    bc: &BatchConfig,
    cache: &KvCache<E>,
    params: &KernelParams,
) -> Result<Vec<E>> {
    params.check(HEAD_DIM, queries.len(), bc.num_active_tokens(), cache)?;
    let q_hidden = params.q_hidden();
    let group_size = params.group_size();
    let mut output = vec![E::zero(); queries.len()];

    for head in 0..params.num_q_heads {
        let kv_head = head / group_size;
        let kv_range = kv_head * HEAD_DIM..(kv_head + 1) * HEAD_DIM;
        for slot in bc.active_slots() {
            let (Some(info), Some(bitmask), Some(first)) =
                (bc.request(slot), bc.bitmask(slot), bc.first_token_index(slot))
            else {
                continue;
            };
            let total = info.total_length();
            let alibi = params.alibi_slope(head).and_then(|slope| {
                RequestPositions::build(params.mask_source, bc, slot).map(|pos| (slope, pos))
            });
            let mut logits = vec![f32::NEG_INFINITY; total];

            for q in 0..info.num_tokens_in_batch {
                let row = (first + q) * q_hidden + head * HEAD_DIM;
                let mut q_vec = [0.0f32; HEAD_DIM];
                for (dst, src) in q_vec.iter_mut().zip(&queries[row..row + HEAD_DIM]) {
                    *dst = src.to_f32();
                }

                let mut max = f32::NEG_INFINITY;
                for (k, logit) in logits.iter_mut().enumerate() {
                    if !key_visible(params.mask_source, info, bitmask, q, k) {
                        *logit = f32::NEG_INFINITY;
                        continue;
                    }
                    let key = &cache.key(slot, k)?[kv_range.clone()];
                    let dot: f32 = q_vec.iter().zip(key).map(|(a, b)| a * b.to_f32()).sum();
                    *logit = dot * params.scale;
                    if let Some((slope, positions)) = &alibi {
                        *logit += positions.bias(*slope, q, k);
                    }
                    max = max.max(*logit);
                }

                let mut exp_sum = 0.0f32;
                for logit in logits.iter_mut() {
                    *logit = if logit.is_finite() {
                        (*logit - max).exp()
                    } else {
                        0.0
                    };
                    exp_sum += *logit;
                }
                if exp_sum == 0.0 {
                    // Nothing visible; the output row stays zero.
                    continue;
                }
                let inv_sum = 1.0 / exp_sum;

                let mut acc = [[0.0f32; HEAD_DIM]; V_GROUPS];
                for (k, &weight) in logits.iter().enumerate() {
                    if weight == 0.0 {
                        continue;
                    }
                    let p = weight * inv_sum;
                    let value = &cache.value(slot, k)?[kv_range.clone()];
                    for (a, v) in acc[k % V_GROUPS].iter_mut().zip(value) {
                        *a += p * v.to_f32();
                    }
                }
                reduce_partials(&mut acc);

                for (dst, &src) in output[row..row + HEAD_DIM].iter_mut().zip(&acc[0]) {
                    *dst = E::from_f32(src);
                }
            }
        }
    }

    Ok(output)
}

/// Fold the partial accumulators into `acc[0]` by pairwise halving.
fn reduce_partials<const HEAD_DIM: usize>(acc: &mut [[f32; HEAD_DIM]; V_GROUPS]) {
    let mut stride = V_GROUPS / 2;
    while stride > 0 {
        for i in 0..stride {
            let upper = acc[i + stride];
            for (a, b) in acc[i].iter_mut().zip(upper) {
                *a += b;
            }
        }
        stride /= 2;
    }
}

/// Select the fused instantiation for `params.head_dim`.
pub fn dispatch_fused<E: CacheElement>(
    queries: &[E],
    bc: &BatchConfig,
    cache: &KvCache<E>,
    params: &KernelParams,
) -> Result<Vec<E>> {
    match params.head_dim {
        64 => fused_attention::<E, 64>(queries, bc, cache, params),
        128 => fused_attention::<E, 128>(queries, bc, cache, params),
        other => Err(Error::Config(format!(
            "no fused attention kernel for head dimension {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attention::mask::MaskSource;
    use crate::config::BatchLimits;
    use crate::core::batch_config::InferenceMode;
    use crate::core::context::ExecutionContext;
    use crate::core::layout::KvLayout;

    fn limits() -> BatchLimits {
        BatchLimits {
            max_requests_per_batch: 2,
            max_tokens_per_batch: 8,
            max_sequence_length: 8,
            max_spec_tree_token_num: 4,
        }
    }

    fn params(num_q_heads: usize, num_kv_heads: usize, head_dim: usize) -> KernelParams {
        KernelParams {
            num_q_heads,
            num_kv_heads,
            head_dim,
            scale: 1.0 / (head_dim as f32).sqrt(),
            mask_source: MaskSource::BitMask,
            position_bias: false,
            head_offset: 0,
            total_q_heads: num_q_heads,
        }
    }

    fn causal(params: KernelParams) -> KernelParams {
        KernelParams {
            mask_source: MaskSource::Causal,
            ..params
        }
    }

    #[test]
    fn test_single_key_returns_value() {
        let ctx = ExecutionContext::cpu();
        let mut cache = KvCache::<f32>::new(&ctx, KvLayout::linear(2, 12, 4)).unwrap();
        let value = [0.3, -1.7, 2.5, 1e-3];
        cache.write(0, 0, &[0.5, 0.1, -0.2, 0.9], &value).unwrap();

        let mut bc = BatchConfig::new(InferenceMode::Incremental, limits());
        bc.add_prompt(0, 1, &[1]).unwrap();
        let out = fused_attention::<f32, 4>(&[1.0, 2.0, 3.0, 4.0], &bc, &cache, &params(1, 1, 4))
            .unwrap();
        assert_eq!(out, value.to_vec());
    }

    #[test]
    fn test_prompt_ignores_future_keys() {
        let ctx = ExecutionContext::cpu();
        let mut cache = KvCache::<f32>::new(&ctx, KvLayout::linear(1, 12, 2)).unwrap();
        cache.write(0, 0, &[1.0, 0.0], &[1.0, 2.0]).unwrap();
        cache.write(0, 1, &[0.0, 1.0], &[3.0, 4.0]).unwrap();

        let limits = BatchLimits {
            max_requests_per_batch: 1,
            ..limits()
        };
        let mut bc = BatchConfig::new(InferenceMode::Incremental, limits);
        bc.add_prompt(0, 1, &[1, 2]).unwrap();
        let queries = [1.0, 1.0, 1.0, 1.0];
        let before = fused_attention::<f32, 2>(&queries, &bc, &cache, &params(1, 1, 2)).unwrap();
        assert_eq!(&before[..2], &[1.0, 2.0]);

        // Rewriting the second key and value must not change query 0.
        cache.write(0, 1, &[9.0, 9.0], &[-50.0, 70.0]).unwrap();
        let after = fused_attention::<f32, 2>(&queries, &bc, &cache, &params(1, 1, 2)).unwrap();
        assert_eq!(&after[..2], &before[..2]);
    }

    #[test]
    fn test_tree_sibling_hidden() {
        let ctx = ExecutionContext::cpu();
        let mut cache = KvCache::<f32>::new(&ctx, KvLayout::linear(1, 12, 2)).unwrap();
        // history 1, tree: 0 -> {1, 2}
        cache.write(0, 0, &[0.0, 0.0], &[1.0, 1.0]).unwrap();
        cache.write(0, 1, &[0.0, 0.0], &[2.0, 2.0]).unwrap();
        cache.write(0, 2, &[0.0, 0.0], &[100.0, 100.0]).unwrap();
        cache.write(0, 3, &[0.0, 0.0], &[4.0, 4.0]).unwrap();

        let limits = BatchLimits {
            max_requests_per_batch: 1,
            ..limits()
        };
        let mut bc = BatchConfig::new(InferenceMode::TreeVerify, limits);
        bc.add_tree(0, 1, 1, &[1, 2, 3], &[None, Some(0), Some(0)])
            .unwrap();
        let out = fused_attention::<f32, 2>(&[0.0; 6], &bc, &cache, &params(1, 1, 2)).unwrap();

        // Node 2 sees keys 0, 1, 3 with equal weight and never key 2.
        let expected = (1.0 + 2.0 + 4.0) / 3.0;
        assert!((out[4] - expected).abs() < 1e-5);
        assert!((out[5] - expected).abs() < 1e-5);
    }

    #[test]
    fn test_grouped_query_heads_share_kv() {
        let ctx = ExecutionContext::cpu();
        let mut cache = KvCache::<f32>::new(&ctx, KvLayout::linear(1, 12, 2)).unwrap();
        cache.write(0, 0, &[1.0, -1.0], &[5.0, 6.0]).unwrap();
        cache.write(0, 1, &[0.5, 2.0], &[7.0, 8.0]).unwrap();

        let limits = BatchLimits {
            max_requests_per_batch: 1,
            ..limits()
        };
        let mut bc = BatchConfig::new(InferenceMode::Incremental, limits);
        bc.add_decode(0, 1, 1, &[1]).unwrap();

        // 2 query heads of dim 2 over a single kv head
        let out =
            fused_attention::<f32, 2>(&[0.3, 0.4, 0.3, 0.4], &bc, &cache, &causal(params(2, 1, 2)))
                .unwrap();
        assert_eq!(out[0], out[2]);
        assert_eq!(out[1], out[3]);
    }

    #[test]
    fn test_half_precision_storage() {
        use half::f16;

        let ctx = ExecutionContext::cpu();
        let mut cache32 = KvCache::<f32>::new(&ctx, KvLayout::linear(1, 12, 4)).unwrap();
        let mut cache16 = KvCache::<f16>::new(&ctx, KvLayout::linear(1, 12, 4)).unwrap();
        for depth in 0..3 {
            let k: Vec<f32> = (0..4).map(|i| ((depth * 4 + i) as f32 * 0.37).sin()).collect();
            let v: Vec<f32> = (0..4).map(|i| ((depth * 4 + i) as f32 * 0.11).cos()).collect();
            let k16: Vec<f16> = k.iter().map(|&x| f16::from_f32(x)).collect();
            let v16: Vec<f16> = v.iter().map(|&x| f16::from_f32(x)).collect();
            cache32.write(0, depth, &k, &v).unwrap();
            cache16.write(0, depth, &k16, &v16).unwrap();
        }

        let limits = BatchLimits {
            max_requests_per_batch: 1,
            ..limits()
        };
        let mut bc = BatchConfig::new(InferenceMode::Incremental, limits);
        bc.add_decode(0, 1, 2, &[1]).unwrap();
        let q = [0.2f32, -0.5, 0.8, 0.1];
        let q16: Vec<f16> = q.iter().map(|&x| f16::from_f32(x)).collect();

        let params = causal(params(1, 1, 4));
        let out32 = fused_attention::<f32, 4>(&q, &bc, &cache32, &params).unwrap();
        let out16 = fused_attention::<f16, 4>(&q16, &bc, &cache16, &params).unwrap();
        for (a, b) in out32.iter().zip(&out16) {
            assert!((a - b.to_f32()).abs() < 1e-2);
        }
    }

    #[test]
    fn test_position_bias_favours_recent_keys() {
        let ctx = ExecutionContext::cpu();
        let mut cache = KvCache::<f32>::new(&ctx, KvLayout::linear(1, 12, 2)).unwrap();
        cache.write(0, 0, &[0.0, 0.0], &[0.0, 0.0]).unwrap();
        cache.write(0, 1, &[0.0, 0.0], &[1.0, 1.0]).unwrap();

        let limits = BatchLimits {
            max_requests_per_batch: 1,
            ..limits()
        };
        let mut bc = BatchConfig::new(InferenceMode::Incremental, limits);
        bc.add_decode(0, 1, 1, &[1]).unwrap();

        let plain = causal(params(1, 1, 2));
        let out = fused_attention::<f32, 2>(&[0.0, 0.0], &bc, &cache, &plain).unwrap();
        assert!((out[0] - 0.5).abs() < 1e-6);

        // Single head: slope 2^-8, bias -slope on the key one step back.
        let biased = KernelParams {
            position_bias: true,
            ..plain
        };
        let out = fused_attention::<f32, 2>(&[0.0, 0.0], &bc, &cache, &biased).unwrap();
        let slope = 2f32.powi(-8);
        let expected = 1.0 / (1.0 + (-slope).exp());
        assert!((out[0] - expected).abs() < 1e-6);
        assert!((out[1] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_position_bias_tree_siblings_share_position() {
        let ctx = ExecutionContext::cpu();
        let mut cache = KvCache::<f32>::new(&ctx, KvLayout::linear(1, 12, 2)).unwrap();
        // history 1, tree: 0 -> {1, 2}; node 2 sits at position 2, not 3.
        cache.write(0, 0, &[0.0, 0.0], &[1.0, 0.0]).unwrap();
        cache.write(0, 1, &[0.0, 0.0], &[0.0, 1.0]).unwrap();
        cache.write(0, 2, &[0.0, 0.0], &[50.0, 50.0]).unwrap();
        cache.write(0, 3, &[0.0, 0.0], &[0.0, 0.0]).unwrap();

        let limits = BatchLimits {
            max_requests_per_batch: 1,
            ..limits()
        };
        let mut bc = BatchConfig::new(InferenceMode::TreeVerify, limits);
        bc.add_tree(0, 1, 1, &[1, 2, 3], &[None, Some(0), Some(0)])
            .unwrap();
        let params = KernelParams {
            position_bias: true,
            ..params(1, 1, 2)
        };
        let out = fused_attention::<f32, 2>(&[0.0; 6], &bc, &cache, &params).unwrap();

        // Node 2 at position 2 sees keys at positions 0, 1 and 2.
        let slope = 2f32.powi(-8);
        let weights = [(-2.0 * slope).exp(), (-slope).exp(), 1.0];
        let sum: f32 = weights.iter().sum();
        assert!((out[4] - weights[0] / sum).abs() < 1e-6);
        assert!((out[5] - weights[1] / sum).abs() < 1e-6);
    }

    #[test]
    fn test_unsupported_head_dim() {
        let ctx = ExecutionContext::cpu();
        let cache = KvCache::<f32>::new(&ctx, KvLayout::linear(1, 4, 96)).unwrap();
        let bc = BatchConfig::new(InferenceMode::Incremental, limits());
        assert!(matches!(
            dispatch_fused(&[], &bc, &cache, &params(1, 1, 96)),
            Err(Error::Config(_))
        ));
    }
}
