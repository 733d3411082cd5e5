//! Integration tests for engine configuration.

use nano_specinfer::{CacheDType, EngineConfig, Error, KernelPath};

#[test]
fn test_defaults_are_valid() {
    let config = EngineConfig::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.tensor_parallel_size, 1);
    assert_eq!(config.attention.kernel, KernelPath::Fused);
    assert_eq!(config.limits.cache_capacity(), 1024 + 64);
}

#[test]
fn test_parse_partial_json() {
    let json = r#"{
        "limits": { "max_requests_per_batch": 8, "max_sequence_length": 256 },
        "attention": {
            "hidden_size": 1024,
            "num_q_heads": 16,
            "num_kv_heads": 4,
            "head_dim": 64,
            "kernel": "batched",
            "rotary": { "theta": 500000.0 },
            "position_bias": true
        },
        "cache_dtype": "bf16",
        "tensor_parallel_size": 2
    }"#;
    let config = EngineConfig::from_json_str(json).unwrap();

    assert_eq!(config.limits.max_requests_per_batch, 8);
    assert_eq!(config.limits.max_tokens_per_batch, 1024);
    assert_eq!(config.attention.kernel, KernelPath::Batched);
    assert_eq!(config.attention.group_size(), 4);
    assert_eq!(config.attention.rotary.map(|r| r.theta), Some(500000.0));
    assert!(config.attention.position_bias);
    assert!(config.attention.shard(2).unwrap().position_bias);
    assert_eq!(config.cache_dtype, CacheDType::Bf16);
    assert_eq!(config.attention.shard(2).unwrap().num_q_heads, 8);
}

#[test]
fn test_unsupported_head_dim_rejected() {
    let json = r#"{ "attention": { "hidden_size": 768, "num_q_heads": 8, "num_kv_heads": 8, "head_dim": 96 } }"#;
    assert!(matches!(
        EngineConfig::from_json_str(json),
        Err(Error::Config(_))
    ));
}

#[test]
fn test_dispatch_set_narrows_group_sizes() {
    let json = r#"{
        "attention": { "num_q_heads": 32, "num_kv_heads": 16, "kernel": "batched" },
        "dispatch": { "group_sizes": [1, 2] }
    }"#;
    assert!(EngineConfig::from_json_str(json).is_ok());

    let json = r#"{
        "attention": { "num_q_heads": 32, "num_kv_heads": 16, "kernel": "batched" }
    }"#;
    assert!(matches!(
        EngineConfig::from_json_str(json),
        Err(Error::Config(_))
    ));
}

#[test]
fn test_indivisible_shards_rejected() {
    let json = r#"{ "attention": { "num_q_heads": 6, "num_kv_heads": 6 }, "tensor_parallel_size": 4 }"#;
    assert!(matches!(
        EngineConfig::from_json_str(json),
        Err(Error::Config(_))
    ));
}

#[test]
fn test_malformed_json() {
    assert!(matches!(
        EngineConfig::from_json_str("{ \"limits\": 3 }"),
        Err(Error::Json(_))
    ));
}

#[test]
fn test_zero_limit_rejected() {
    let json = r#"{ "limits": { "max_tokens_per_batch": 0 } }"#;
    assert!(matches!(
        EngineConfig::from_json_str(json),
        Err(Error::Config(_))
    ));
}
