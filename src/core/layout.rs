//! Placement of per-request KV cache regions in device memory.
//!
//! Every request slot owns a region of `capacity` token positions
//! (`max_sequence_length + max_spec_tree_token_num`). Regions never alias.
//!
//! ## Linear layout
//!
//! ```text
//! key plane:    [request][depth][kv_hidden]
//! value plane:  [request][depth][kv_hidden]   (follows the key plane)
//!
//! offset(request, depth) = request * capacity * kv_hidden + depth * kv_hidden
//! ```
//!
//! ## Paged layout
//!
//! A request owns `pages_per_request` consecutive physical pages. Each page
//! stores a key sub-plane followed by a value sub-plane:
//!
//! ```text
//! page(request, depth) = request * pages_per_request + depth / page_size
//! page:                  [K: page_size x kv_hidden][V: page_size x kv_hidden]
//! slot in sub-plane:     depth % page_size
//! ```

use crate::error::{Error, Result};

/// Addressing scheme of the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutKind {
    Linear,
    Paged { page_size: usize },
}

/// Maps (request, token depth) to element offsets in the cache buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvLayout {
    kind: LayoutKind,
    num_requests: usize,
    capacity: usize,
    kv_hidden: usize,
}

impl KvLayout {
    pub fn linear(num_requests: usize, capacity: usize, kv_hidden: usize) -> Self {
        Self {
            kind: LayoutKind::Linear,
            num_requests,
            capacity,
            kv_hidden,
        }
    }

    pub fn paged(num_requests: usize, capacity: usize, kv_hidden: usize, page_size: usize) -> Self {
        Self {
            kind: LayoutKind::Paged {
                page_size: page_size.max(1),
            },
            num_requests,
            capacity,
            kv_hidden,
        }
    }

    pub fn kind(&self) -> LayoutKind {
        self.kind
    }

    pub fn num_requests(&self) -> usize {
        self.num_requests
    }

    /// Token positions per request.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Elements per key (or value) vector.
    pub fn kv_hidden(&self) -> usize {
        self.kv_hidden
    }

    /// Page size, or `None` for the linear layout.
    pub fn page_size(&self) -> Option<usize> {
        match self.kind {
            LayoutKind::Linear => None,
            LayoutKind::Paged { page_size } => Some(page_size),
        }
    }

    /// Physical pages reserved for each request.
    pub fn pages_per_request(&self) -> usize {
        match self.kind {
            LayoutKind::Linear => 1,
            LayoutKind::Paged { page_size } => self.capacity.div_ceil(page_size),
        }
    }

    /// Total number of cache elements (keys and values).
    pub fn total_elements(&self) -> usize {
        match self.kind {
            LayoutKind::Linear => 2 * self.plane_elements(),
            LayoutKind::Paged { page_size } => {
                self.num_requests * self.pages_per_request() * 2 * page_size * self.kv_hidden
            }
        }
    }

    /// Reject positions outside the cache.
    pub fn check(&self, request: usize, depth: usize) -> Result<()> {
        if request >= self.num_requests {
            return Err(Error::capacity(
                "request slot",
                request + 1,
                self.num_requests,
            ));
        }
        if depth >= self.capacity {
            return Err(Error::capacity("cache depth", depth + 1, self.capacity));
        }
        Ok(())
    }

    /// Element offset of the key vector at (request, depth).
    pub fn key_offset(&self, request: usize, depth: usize) -> usize {
        match self.kind {
            LayoutKind::Linear => (request * self.capacity + depth) * self.kv_hidden,
            LayoutKind::Paged { page_size } => {
                let page = self.physical_page(request, depth / page_size);
                page * 2 * page_size * self.kv_hidden + (depth % page_size) * self.kv_hidden
            }
        }
    }

    /// Element offset of the value vector at (request, depth).
    pub fn value_offset(&self, request: usize, depth: usize) -> usize {
        match self.kind {
            LayoutKind::Linear => self.plane_elements() + self.key_offset(request, depth),
            LayoutKind::Paged { page_size } => {
                self.key_offset(request, depth) + page_size * self.kv_hidden
            }
        }
    }

    /// Physical page ids covering the first `len` tokens of `request`.
    pub fn page_table(&self, request: usize, len: usize) -> Vec<usize> {
        match self.kind {
            LayoutKind::Linear => vec![request],
            LayoutKind::Paged { page_size } => (0..len.div_ceil(page_size))
                .map(|logical| self.physical_page(request, logical))
                .collect(),
        }
    }

    /// Number of valid slots in the last page of a `len`-token sequence.
    pub fn last_page_len(&self, len: usize) -> usize {
        match self.kind {
            LayoutKind::Linear => len,
            LayoutKind::Paged { page_size } => {
                if len == 0 {
                    0
                } else {
                    (len - 1) % page_size + 1
                }
            }
        }
    }

    fn physical_page(&self, request: usize, logical_page: usize) -> usize {
        request * self.pages_per_request() + logical_page
    }

    fn plane_elements(&self) -> usize {
        self.num_requests * self.capacity * self.kv_hidden
    }
}
