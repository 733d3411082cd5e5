//! Integration tests for batch snapshots and request slots.

use nano_specinfer::{
    BatchConfig, BatchLimits, BitMask, CommittedTokenInfo, Error, InferenceMode, RequestSlots,
};

fn limits() -> BatchLimits {
    BatchLimits {
        max_requests_per_batch: 4,
        max_tokens_per_batch: 8,
        max_sequence_length: 12,
        max_spec_tree_token_num: 4,
    }
}

#[test]
fn test_tokens_laid_out_in_slot_order() {
    let mut bc = BatchConfig::new(InferenceMode::Incremental, limits());
    bc.add_decode(2, 20, 7, &[5]).unwrap();
    bc.add_prompt(0, 10, &[1, 2, 3]).unwrap();

    assert_eq!(bc.num_active_requests(), 2);
    assert_eq!(bc.num_active_tokens(), 4);
    assert_eq!(bc.active_slots().collect::<Vec<_>>(), vec![0, 2]);

    let depths: Vec<(usize, usize)> = bc
        .tokens()
        .iter()
        .map(|t| (t.request_index, t.abs_depth_in_request))
        .collect();
    assert_eq!(depths, vec![(0, 0), (0, 1), (0, 2), (2, 7)]);

    assert_eq!(bc.first_token_index(2), Some(3));
    assert_eq!(bc.compact_index(2), Some(1));
    assert_eq!(bc.request(2).unwrap().total_length(), 8);
    assert!(bc.request(1).is_none());
}

#[test]
fn test_prompt_phase_requires_all_prompts() {
    let mut bc = BatchConfig::new(InferenceMode::Incremental, limits());
    assert!(!bc.is_prompt_phase());
    bc.add_prompt(1, 1, &[1, 2]).unwrap();
    assert!(bc.is_prompt_phase());
    bc.add_decode(3, 2, 4, &[9]).unwrap();
    assert!(!bc.is_prompt_phase());
}

#[test]
fn test_tree_layers_extend_depth() {
    let mut tree = BitMask::from_parents(5, &[None], 4).unwrap();
    let mut bc = BatchConfig::new(InferenceMode::Speculative, limits());
    bc.add_tree_layer(0, 1, tree.clone(), &[3]).unwrap();
    assert_eq!(bc.request(0).unwrap().first_token_depth_in_request, 5);

    tree.append_nodes(&[Some(0), Some(0)]).unwrap();
    let mut bc = BatchConfig::new(InferenceMode::Speculative, limits());
    bc.add_tree_layer(0, 1, tree, &[4, 6]).unwrap();
    let info = bc.request(0).unwrap();
    assert_eq!(info.first_token_depth_in_request, 6);
    assert_eq!(info.total_length(), 8);
    assert!(bc.bitmask(0).unwrap().is_set(2, 0));
    assert!(!bc.bitmask(0).unwrap().is_set(2, 1));
}

#[test]
fn test_limits_enforced() {
    let mut bc = BatchConfig::new(InferenceMode::Incremental, limits());
    assert!(matches!(
        bc.add_prompt(4, 1, &[1]),
        Err(Error::Capacity { .. })
    ));
    assert!(matches!(
        bc.add_prompt(0, 1, &[0; 9]),
        Err(Error::Capacity { .. })
    ));
    assert!(matches!(
        bc.add_decode(0, 1, 13, &[1]),
        Err(Error::Capacity { .. })
    ));
    // 12 committed + 5 new overflows the 16-position cache region.
    assert!(matches!(
        bc.add_decode(0, 1, 12, &[1; 5]),
        Err(Error::Capacity { .. })
    ));
    assert!(matches!(bc.add_prompt(0, 1, &[]), Err(Error::Config(_))));
    assert_eq!(bc.num_active_requests(), 0);
}

#[test]
fn test_duplicate_slot_rejected() {
    let mut bc = BatchConfig::new(InferenceMode::Incremental, limits());
    bc.add_prompt(1, 1, &[1]).unwrap();
    assert!(matches!(bc.add_prompt(1, 2, &[1]), Err(Error::Config(_))));
}

#[test]
fn test_tree_parent_length_mismatch() {
    let mut bc = BatchConfig::new(InferenceMode::TreeVerify, limits());
    assert!(matches!(
        bc.add_tree(0, 1, 3, &[1, 2], &[None]),
        Err(Error::Shape(_))
    ));
}

#[test]
fn test_committed_records() {
    let mut bc = BatchConfig::new(InferenceMode::TreeVerify, limits());
    bc.add_committed(CommittedTokenInfo::accepted_path(1, 6, &[0, 3]))
        .unwrap();
    bc.add_committed([CommittedTokenInfo::not_present(1, 8)])
        .unwrap();

    let records = bc.committed_tokens();
    assert_eq!(records.len(), 3);
    assert_eq!(records[1].source_depth(), Some(9));
    assert_eq!(records[1].token_depth, 7);
    assert_eq!(records[2].source_depth(), None);

    assert!(matches!(
        bc.add_committed([CommittedTokenInfo::new(4, 1, 0)]),
        Err(Error::Capacity { .. })
    ));
}

#[test]
fn test_request_slots_reuse() {
    let mut slots = RequestSlots::new(2);
    let a = slots.acquire(100).unwrap();
    let b = slots.acquire(200).unwrap();
    assert_ne!(a, b);
    assert_eq!(slots.acquire(100).unwrap(), a);
    assert!(matches!(slots.acquire(300), Err(Error::Capacity { .. })));

    assert_eq!(slots.release(100), Some(a));
    assert_eq!(slots.release(100), None);
    assert_eq!(slots.num_free(), 1);
    assert_eq!(slots.acquire(300).unwrap(), a);
    assert_eq!(slots.slot_of(300), Some(a));
}
