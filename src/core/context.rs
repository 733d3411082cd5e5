//! Explicit execution context: device, communicator and memory allocator.
//!
//! A context is created once per shard and passed to every call that touches
//! the device. Several contexts (several model instances, several tests) can
//! coexist in one process; nothing here is global.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use candle_core::{Device, Tensor};

use super::comm::{Communicator, LocalCommunicator};
use crate::error::{Error, Result};

/// Tracks device bytes handed out against an optional budget.
#[derive(Debug, Clone)]
pub struct DeviceAllocator {
    budget: Option<usize>,
    in_use: Arc<AtomicUsize>,
}

impl DeviceAllocator {
    pub fn new(budget: Option<usize>) -> Self {
        Self {
            budget,
            in_use: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Reserve `bytes`; the reservation is released when the returned
    /// [`Allocation`] is dropped.
    pub fn reserve(&self, bytes: usize) -> Result<Allocation> {
        let mut current = self.in_use.load(Ordering::Acquire);
        loop {
            let next = current + bytes;
            if let Some(budget) = self.budget {
                if next > budget {
                    return Err(Error::OutOfMemory {
                        requested: bytes,
                        available: budget.saturating_sub(current),
                    });
                }
            }
            match self.in_use.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        Ok(Allocation {
            bytes,
            in_use: Arc::clone(&self.in_use),
        })
    }

    /// Bytes currently reserved.
    pub fn bytes_in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn budget(&self) -> Option<usize> {
        self.budget
    }
}

/// RAII reservation of device memory.
#[derive(Debug)]
pub struct Allocation {
    bytes: usize,
    in_use: Arc<AtomicUsize>,
}

impl Allocation {
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        self.in_use.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}

/// Per-shard execution context.
pub struct ExecutionContext {
    device: Device,
    communicator: Box<dyn Communicator>,
    allocator: DeviceAllocator,
}

impl ExecutionContext {
    /// Create a context for one shard.
    pub fn new(
        device: Device,
        communicator: Box<dyn Communicator>,
        memory_budget: Option<usize>,
    ) -> Self {
        tracing::info!(
            rank = communicator.rank(),
            world_size = communicator.world_size(),
            ?memory_budget,
            "execution context created"
        );
        Self {
            device,
            communicator,
            allocator: DeviceAllocator::new(memory_budget),
        }
    }

    /// Single-shard CPU context without a memory budget.
    pub fn cpu() -> Self {
        Self::new(Device::Cpu, Box::new(LocalCommunicator), None)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn rank(&self) -> usize {
        self.communicator.rank()
    }

    pub fn world_size(&self) -> usize {
        self.communicator.world_size()
    }

    pub fn allocator(&self) -> &DeviceAllocator {
        &self.allocator
    }

    /// Reserve device memory for a long-lived buffer.
    pub fn reserve(&self, bytes: usize) -> Result<Allocation> {
        self.allocator.reserve(bytes)
    }

    /// Sum-reduce across the tensor-parallel group.
    pub fn all_reduce(&self, tensor: &Tensor) -> Result<Tensor> {
        self.communicator.all_reduce(tensor)
    }

    /// Block until all work issued on this shard's device has finished.
    pub fn synchronize(&self) -> Result<()> {
        Ok(self.device.synchronize()?)
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        if let Err(e) = self.device.synchronize() {
            tracing::error!(error = %e, "device synchronize failed during teardown");
        }
        tracing::info!(
            rank = self.communicator.rank(),
            bytes_in_use = self.allocator.bytes_in_use(),
            "execution context released"
        );
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("device", &self.device)
            .field("rank", &self.communicator.rank())
            .field("world_size", &self.communicator.world_size())
            .field("allocator", &self.allocator)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_released_on_drop() {
        let allocator = DeviceAllocator::new(Some(100));
        {
            let a = allocator.reserve(60).unwrap();
            assert_eq!(a.bytes(), 60);
            assert_eq!(allocator.bytes_in_use(), 60);
            assert!(matches!(
                allocator.reserve(50),
                Err(Error::OutOfMemory { available: 40, .. })
            ));
        }
        assert_eq!(allocator.bytes_in_use(), 0);
        assert!(allocator.reserve(100).is_ok());
    }

    #[test]
    fn test_unbounded_allocator() {
        let allocator = DeviceAllocator::new(None);
        let _a = allocator.reserve(usize::MAX / 2).unwrap();
        assert_eq!(allocator.bytes_in_use(), usize::MAX / 2);
    }

    #[test]
    fn test_cpu_context() {
        let ctx = ExecutionContext::cpu();
        assert_eq!(ctx.rank(), 0);
        assert_eq!(ctx.world_size(), 1);
        assert!(ctx.synchronize().is_ok());
    }
}
