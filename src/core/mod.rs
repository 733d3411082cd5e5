//! Core infrastructure for nano-specinfer.
//!
//! This module contains the fundamental building blocks:
//! - BitMask and KvLayout for speculative visibility and cache addressing
//! - BatchConfig and RequestSlots for per-call batch bookkeeping
//! - KvCache for key-value storage
//! - ExecutionContext and Communicator for device state and collectives

pub mod batch_config;
pub mod bitmask;
pub mod comm;
pub mod context;
pub mod kv_cache;
pub mod layout;
pub mod slots;

pub use batch_config::{
    BatchConfig, CommittedTokenInfo, InferenceMode, PerRequestInfo, PerTokenInfo,
};
pub use bitmask::BitMask;
pub use comm::{Communicator, LocalCommunicator, ThreadCommunicator};
pub use context::{Allocation, DeviceAllocator, ExecutionContext};
pub use kv_cache::{CacheElement, KvCache};
pub use layout::{KvLayout, LayoutKind};
pub use slots::RequestSlots;
