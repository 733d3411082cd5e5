//! Commit engine: moves accepted speculative tokens into linear history.
//!
//! ```text
//!  depth:    0 1 2 3 | 4 5 6 7      committed history = 4
//!  tree:             | r a b c      accepted path r -> b (tree nodes 0, 2)
//!  commit:   (4 -> 4), (6 -> 5)
//!  after:    0 1 2 3 r b | ...
//! ```
//!
//! Records are validated as a whole before the first copy, so a rejected
//! commit leaves the cache as it was. Copies run in ascending destination
//! order within a request; since every destination is at or below its
//! source, no later copy reads a slot an earlier one overwrote.

use crate::core::batch_config::{BatchConfig, CommittedTokenInfo};
use crate::core::kv_cache::{CacheElement, KvCache};
use crate::error::{Error, Result};

/// Apply the batch's committed-token records to `cache`.
///
/// # Arguments
///
/// * `cache` - The layer's KV cache
/// * `bc` - Current batch; its committed records refer to the previous call's tree
/// * `num_active_tokens_in_last_batch` - Active token count of the previous call
///
/// # Returns
///
/// Number of records applied (sentinel records are skipped).
pub fn commit_tokens<E: CacheElement>(
    cache: &mut KvCache<E>,
    bc: &BatchConfig,
    num_active_tokens_in_last_batch: usize,
) -> Result<usize> {
    let mut moves: Vec<(usize, usize, usize)> = Vec::new();
    for record in bc.committed_tokens() {
        let Some(source) = record.source_depth() else {
            continue;
        };
        moves.push(validate(cache, record, source)?);
    }

    if moves.len() > num_active_tokens_in_last_batch {
        return Err(Error::capacity(
            "committed tokens",
            moves.len(),
            num_active_tokens_in_last_batch,
        ));
    }

    moves.sort_unstable_by_key(|&(request, _, destination)| (request, destination));
    for &(request, source, destination) in &moves {
        if source != destination {
            cache.copy_slot(request, source, destination)?;
        }
        tracing::trace!(request, source, destination, "token committed");
    }

    tracing::debug!(
        num_committed = moves.len(),
        num_active_tokens_in_last_batch,
        "commit finished"
    );
    Ok(moves.len())
}

fn validate<E: CacheElement>(
    cache: &KvCache<E>,
    record: &CommittedTokenInfo,
    source: usize,
) -> Result<(usize, usize, usize)> {
    let request = record.request_index;
    let destination = record.token_depth;
    if destination > source {
        return Err(Error::CommitOrdering {
            request,
            source_depth: source,
            destination,
        });
    }
    cache.layout().check(request, source)?;
    Ok((request, source, destination))
}
