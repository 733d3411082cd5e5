//! Request slot allocator.
//!
//! Hands out the fixed batch slots (and with them, the per-request cache
//! regions) to incoming requests. Releasing a slot does not clear its cache
//! region: the next owner starts at depth 0 and the kernels never read past
//! the depth bookkeeping, so stale data is unreachable.

use std::collections::{HashMap, VecDeque};

use crate::error::{Error, Result};

/// Free-list allocator over `max_requests_per_batch` slots.
#[derive(Debug)]
pub struct RequestSlots {
    /// Free slots; released slots are pushed to the front for reuse.
    free_list: VecDeque<usize>,
    /// Request guid -> slot.
    owners: HashMap<u64, usize>,
    num_slots: usize,
}

impl RequestSlots {
    pub fn new(num_slots: usize) -> Self {
        Self {
            free_list: (0..num_slots).collect(),
            owners: HashMap::with_capacity(num_slots),
            num_slots,
        }
    }

    /// Assign a slot to `request_guid`. Acquiring twice returns the same slot.
    pub fn acquire(&mut self, request_guid: u64) -> Result<usize> {
        if let Some(&slot) = self.owners.get(&request_guid) {
            return Ok(slot);
        }
        let slot = self.free_list.pop_front().ok_or_else(|| {
            Error::capacity("request slots", self.num_slots + 1, self.num_slots)
        })?;
        self.owners.insert(request_guid, slot);
        tracing::trace!(request_guid, slot, "slot acquired");
        Ok(slot)
    }

    /// Return `request_guid`'s slot to the free list.
    pub fn release(&mut self, request_guid: u64) -> Option<usize> {
        let slot = self.owners.remove(&request_guid)?;
        self.free_list.push_front(slot);
        tracing::trace!(request_guid, slot, "slot released");
        Some(slot)
    }

    pub fn slot_of(&self, request_guid: u64) -> Option<usize> {
        self.owners.get(&request_guid).copied()
    }

    pub fn num_free(&self) -> usize {
        self.free_list.len()
    }

    pub fn num_slots(&self) -> usize {
        self.num_slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release() {
        let mut slots = RequestSlots::new(2);
        let a = slots.acquire(100).unwrap();
        let b = slots.acquire(200).unwrap();
        assert_ne!(a, b);
        assert_eq!(slots.num_free(), 0);
        assert!(matches!(slots.acquire(300), Err(Error::Capacity { .. })));

        assert_eq!(slots.release(100), Some(a));
        assert_eq!(slots.acquire(300).unwrap(), a);
        assert_eq!(slots.slot_of(300), Some(a));
        assert_eq!(slots.slot_of(100), None);
    }

    #[test]
    fn test_acquire_is_idempotent() {
        let mut slots = RequestSlots::new(4);
        let slot = slots.acquire(1).unwrap();
        assert_eq!(slots.acquire(1).unwrap(), slot);
        assert_eq!(slots.num_free(), 3);
    }

    #[test]
    fn test_release_unknown() {
        let mut slots = RequestSlots::new(1);
        assert_eq!(slots.release(42), None);
        assert_eq!(slots.num_free(), 1);
    }
}
