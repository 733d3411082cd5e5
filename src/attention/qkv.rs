//! QKV cache writer.
//!
//! Scatters each new token's key and value projections into the cache at
//! `(request_index, abs_depth_in_request)` and gathers its query projection
//! into a compact buffer in batch token order:
//!
//! ```text
//! qkv row t:  [ q (q_hidden) | k (kv_hidden) | v (kv_hidden) ]
//!                   │               │               │
//!                   ▼               └──────┬────────┘
//!            queries[t]          cache(request, depth)
//! ```

use crate::core::batch_config::BatchConfig;
use crate::core::kv_cache::{CacheElement, KvCache};
use crate::error::{Error, Result};

/// Write the batch's new K/V into `cache` and return the packed queries.
///
/// # Arguments
///
/// * `qkv` - `num_active_tokens` rows of `q_hidden + 2 * kv_hidden` elements
/// * `bc` - Current batch
/// * `cache` - The layer's KV cache
/// * `q_hidden` - Query projection width
/// * `kv_hidden` - Key (and value) projection width
///
/// # Returns
///
/// `num_active_tokens * q_hidden` query elements.
pub fn write_qkv<E: CacheElement>(
    qkv: &[E],
    bc: &BatchConfig,
    cache: &mut KvCache<E>,
    q_hidden: usize,
    kv_hidden: usize,
) -> Result<Vec<E>> {
    let tokens = bc.tokens();
    let width = q_hidden + 2 * kv_hidden;
    if qkv.len() != tokens.len() * width {
        return Err(Error::Shape(format!(
            "qkv buffer holds {} elements, expected {} tokens x {width}",
            qkv.len(),
            tokens.len()
        )));
    }
    if cache.layout().kv_hidden() != kv_hidden {
        return Err(Error::Shape(format!(
            "cache stores {} elements per key, projection produces {kv_hidden}",
            cache.layout().kv_hidden()
        )));
    }
    // Reject the whole batch before writing any of it.
    for token in tokens {
        cache
            .layout()
            .check(token.request_index, token.abs_depth_in_request)?;
    }

    let mut queries = Vec::with_capacity(tokens.len() * q_hidden);
    for (row, token) in qkv.chunks_exact(width).zip(tokens) {
        let (q, kv) = row.split_at(q_hidden);
        let (k, v) = kv.split_at(kv_hidden);
        cache.write(token.request_index, token.abs_depth_in_request, k, v)?;
        queries.extend_from_slice(q);
    }

    tracing::debug!(num_tokens = tokens.len(), "qkv written to cache");
    Ok(queries)
}
