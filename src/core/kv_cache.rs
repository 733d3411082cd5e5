//! KV cache for storing key-value states.
//!
//! One flat buffer per attention layer holds both planes for every request
//! slot, addressed through a [`KvLayout`]. Only the QKV cache writer and the
//! commit engine mutate it; attention kernels only read it.
//!
//! Memory for the buffer is reserved through the [`ExecutionContext`]'s
//! allocator and returned when the cache is dropped.

use candle_core::WithDType;
use half::{bf16, f16};

use super::context::{Allocation, ExecutionContext};
use super::layout::KvLayout;
use crate::error::{Error, Result};

/// Storage element of the cache. Kernels always accumulate in `f32`.
pub trait CacheElement: WithDType {
    fn to_f32(self) -> f32;
    fn from_f32(value: f32) -> Self;
}

impl CacheElement for f32 {
    fn to_f32(self) -> f32 {
        self
    }

    fn from_f32(value: f32) -> Self {
        value
    }
}

impl CacheElement for f16 {
    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }

    fn from_f32(value: f32) -> Self {
        f16::from_f32(value)
    }
}

impl CacheElement for bf16 {
    fn to_f32(self) -> f32 {
        bf16::to_f32(self)
    }

    fn from_f32(value: f32) -> Self {
        bf16::from_f32(value)
    }
}

/// Per-layer KV cache.
#[derive(Debug)]
pub struct KvCache<E: CacheElement> {
    data: Vec<E>,
    layout: KvLayout,
    _allocation: Allocation,
}

impl<E: CacheElement> KvCache<E> {
    /// Allocate a zero-filled cache for `layout`.
    pub fn new(ctx: &ExecutionContext, layout: KvLayout) -> Result<Self> {
        let elements = layout.total_elements();
        let allocation = ctx.reserve(elements * std::mem::size_of::<E>())?;
        Ok(Self {
            data: vec![E::zero(); elements],
            layout,
            _allocation: allocation,
        })
    }

    pub fn layout(&self) -> &KvLayout {
        &self.layout
    }

    /// Size of the buffer in bytes.
    pub fn size_in_bytes(&self) -> usize {
        self.data.len() * std::mem::size_of::<E>()
    }

    /// Key vector at (request, depth).
    pub fn key(&self, request: usize, depth: usize) -> Result<&[E]> {
        self.layout.check(request, depth)?;
        let offset = self.layout.key_offset(request, depth);
        Ok(&self.data[offset..offset + self.layout.kv_hidden()])
    }

    /// Value vector at (request, depth).
    pub fn value(&self, request: usize, depth: usize) -> Result<&[E]> {
        self.layout.check(request, depth)?;
        let offset = self.layout.value_offset(request, depth);
        Ok(&self.data[offset..offset + self.layout.kv_hidden()])
    }

    /// Overwrite the key and value vectors at (request, depth).
    pub fn write(&mut self, request: usize, depth: usize, key: &[E], value: &[E]) -> Result<()> {
        self.layout.check(request, depth)?;
        let kv_hidden = self.layout.kv_hidden();
        if key.len() != kv_hidden || value.len() != kv_hidden {
            return Err(Error::Shape(format!(
                "cache write expects {kv_hidden} elements, got key {} value {}",
                key.len(),
                value.len()
            )));
        }
        let k = self.layout.key_offset(request, depth);
        let v = self.layout.value_offset(request, depth);
        self.data[k..k + kv_hidden].copy_from_slice(key);
        self.data[v..v + kv_hidden].copy_from_slice(value);
        Ok(())
    }

    /// Copy both planes of `request` from depth `source` to depth `destination`.
    pub fn copy_slot(&mut self, request: usize, source: usize, destination: usize) -> Result<()> {
        self.layout.check(request, source)?;
        self.layout.check(request, destination)?;
        let kv_hidden = self.layout.kv_hidden();
        let k_src = self.layout.key_offset(request, source);
        let k_dst = self.layout.key_offset(request, destination);
        self.data.copy_within(k_src..k_src + kv_hidden, k_dst);
        let v_src = self.layout.value_offset(request, source);
        let v_dst = self.layout.value_offset(request, destination);
        self.data.copy_within(v_src..v_src + kv_hidden, v_dst);
        Ok(())
    }

    /// Raw buffer, for snapshots in tests and debugging.
    pub fn as_slice(&self) -> &[E] {
        &self.data
    }
}
