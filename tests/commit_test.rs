//! Integration tests for committing accepted tree tokens.

use nano_specinfer::attention::commit_tokens;
use nano_specinfer::{
    BatchConfig, BatchLimits, CommittedTokenInfo, Error, ExecutionContext, InferenceMode, KvCache,
    KvLayout,
};

const KV_HIDDEN: usize = 4;

fn limits() -> BatchLimits {
    BatchLimits {
        max_requests_per_batch: 2,
        max_tokens_per_batch: 8,
        max_sequence_length: 16,
        max_spec_tree_token_num: 8,
    }
}

fn filled_cache(ctx: &ExecutionContext, layout: KvLayout) -> KvCache<f32> {
    let mut cache = KvCache::new(ctx, layout).unwrap();
    for request in 0..2 {
        for depth in 0..12 {
            let tag = (request * 100 + depth) as f32;
            cache
                .write(request, depth, &[tag; KV_HIDDEN], &[-tag; KV_HIDDEN])
                .unwrap();
        }
    }
    cache
}

fn verify_batch(records: Vec<CommittedTokenInfo>) -> BatchConfig {
    let mut bc = BatchConfig::new(InferenceMode::TreeVerify, limits());
    bc.add_committed(records).unwrap();
    bc
}

#[test]
fn test_commit_moves_depth_six_to_five() {
    let ctx = ExecutionContext::cpu();
    let mut cache = filled_cache(&ctx, KvLayout::linear(2, 24, KV_HIDDEN));
    let bc = verify_batch(vec![CommittedTokenInfo::new(0, 6, 5)]);

    assert_eq!(commit_tokens(&mut cache, &bc, 3).unwrap(), 1);
    assert_eq!(cache.key(0, 5).unwrap(), &[6.0; KV_HIDDEN]);
    assert_eq!(cache.value(0, 5).unwrap(), &[-6.0; KV_HIDDEN]);
    // The source slot is left as it was.
    assert_eq!(cache.key(0, 6).unwrap(), &[6.0; KV_HIDDEN]);
    // Other requests are untouched.
    assert_eq!(cache.key(1, 5).unwrap(), &[105.0; KV_HIDDEN]);
}

#[test]
fn test_commit_accepted_path_on_paged_layout() {
    let ctx = ExecutionContext::cpu();
    let mut cache = filled_cache(&ctx, KvLayout::paged(2, 24, KV_HIDDEN, 4));
    // Tree on top of 4 committed tokens; nodes 0, 2 and 5 accepted.
    let bc = verify_batch(CommittedTokenInfo::accepted_path(1, 4, &[0, 2, 5]));

    assert_eq!(commit_tokens(&mut cache, &bc, 6).unwrap(), 3);
    assert_eq!(cache.key(1, 4).unwrap(), &[104.0; KV_HIDDEN]);
    assert_eq!(cache.key(1, 5).unwrap(), &[106.0; KV_HIDDEN]);
    assert_eq!(cache.key(1, 6).unwrap(), &[109.0; KV_HIDDEN]);
    assert_eq!(cache.value(1, 6).unwrap(), &[-109.0; KV_HIDDEN]);
}

#[test]
fn test_commit_skips_not_present_records() {
    let ctx = ExecutionContext::cpu();
    let mut cache = filled_cache(&ctx, KvLayout::linear(2, 24, KV_HIDDEN));
    let bc = verify_batch(vec![
        CommittedTokenInfo::not_present(0, 3),
        CommittedTokenInfo::new(0, 7, 4),
    ]);

    assert_eq!(commit_tokens(&mut cache, &bc, 2).unwrap(), 1);
    assert_eq!(cache.key(0, 3).unwrap(), &[3.0; KV_HIDDEN]);
    assert_eq!(cache.key(0, 4).unwrap(), &[7.0; KV_HIDDEN]);
}

#[test]
fn test_commit_rejects_forward_move() {
    let ctx = ExecutionContext::cpu();
    let mut cache = filled_cache(&ctx, KvLayout::linear(2, 24, KV_HIDDEN));
    let bc = verify_batch(vec![
        CommittedTokenInfo::new(0, 6, 5),
        CommittedTokenInfo::new(0, 4, 5),
    ]);

    let err = commit_tokens(&mut cache, &bc, 4).unwrap_err();
    assert!(matches!(
        err,
        Error::CommitOrdering {
            request: 0,
            source_depth: 4,
            destination: 5
        }
    ));
    // Nothing was applied.
    assert_eq!(cache.key(0, 5).unwrap(), &[5.0; KV_HIDDEN]);
}

#[test]
fn test_commit_ordering_error_message() {
    let err = Error::CommitOrdering {
        request: 1,
        source_depth: 4,
        destination: 6,
    };
    assert_eq!(
        err.to_string(),
        "commit ordering violated for request 1: destination 6 > source 4"
    );
    assert!(std::error::Error::source(&err).is_none());
}

#[test]
fn test_commit_rejects_more_records_than_last_batch() {
    let ctx = ExecutionContext::cpu();
    let mut cache = filled_cache(&ctx, KvLayout::linear(2, 24, KV_HIDDEN));
    let bc = verify_batch(CommittedTokenInfo::accepted_path(0, 4, &[0, 1, 2]));

    let err = commit_tokens(&mut cache, &bc, 2).unwrap_err();
    assert!(matches!(err, Error::Capacity { .. }));
}

#[test]
fn test_commit_empty_batch_is_noop() {
    let ctx = ExecutionContext::cpu();
    let mut cache = filled_cache(&ctx, KvLayout::linear(2, 24, KV_HIDDEN));
    let before = cache.as_slice().to_vec();
    let bc = BatchConfig::new(InferenceMode::TreeVerify, limits());

    assert_eq!(commit_tokens(&mut cache, &bc, 0).unwrap(), 0);
    assert_eq!(cache.as_slice(), before.as_slice());
}
