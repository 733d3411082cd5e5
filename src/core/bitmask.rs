//! Per-request speculative-tree visibility mask.
//!
//! Keys below `non_tree_cache_size` are committed linear history and are
//! visible to every query. Keys at or above it live in the speculative tree
//! region, and a query may only attend to the ones whose bit is set:
//!
//! ```text
//!  absolute key:  0 1 2 3 | 4 5 6        non_tree_cache_size = 4
//!                 history | tree
//!  tree query 0:  x x x x | x . .        node 0 (root)
//!  tree query 1:  x x x x | x x .        node 1, parent 0
//!  tree query 2:  x x x x | x . x        node 2, parent 0
//! ```
//!
//! Storage is one bit row per tree key slot, one bit per tree query index,
//! so testing "may query `q` see key `k`" is a single word lookup.

use crate::error::{Error, Result};

const WORD_BITS: usize = 64;

/// Fixed-capacity bit matrix (tree query × tree key) for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitMask {
    /// `capacity` rows of `words_per_row` words; row = key, bit = query.
    bits: Vec<u64>,
    words_per_row: usize,
    capacity: usize,
    /// Boundary between committed history and the tree region.
    non_tree_cache_size: usize,
    /// Number of tree slots in use.
    tree_size: usize,
}

impl BitMask {
    /// Create an empty mask able to hold `capacity` tree tokens.
    pub fn new(capacity: usize) -> Self {
        let words_per_row = capacity.div_ceil(WORD_BITS).max(1);
        Self {
            bits: vec![0; capacity * words_per_row],
            words_per_row,
            capacity,
            non_tree_cache_size: 0,
            tree_size: 0,
        }
    }

    /// Lower-triangular chain of `n` tokens after `boundary` committed ones:
    /// the visibility of ordinary multi-token decoding.
    pub fn causal(boundary: usize, n: usize, capacity: usize) -> Result<Self> {
        let parents: Vec<Option<usize>> = (0..n).map(|i| i.checked_sub(1)).collect();
        Self::from_parents(boundary, &parents, capacity)
    }

    /// Build the mask of a token tree given each node's parent index.
    pub fn from_parents(
        boundary: usize,
        parents: &[Option<usize>],
        capacity: usize,
    ) -> Result<Self> {
        let mut mask = Self::new(capacity);
        mask.non_tree_cache_size = boundary;
        mask.append_nodes(parents)?;
        Ok(mask)
    }

    /// Grow the tree by one node per entry of `parents`.
    ///
    /// Parent indices are tree-relative and must refer to a node that already
    /// exists (including nodes appended earlier in the same call). Every new
    /// node sees itself and all of its ancestors.
    pub fn append_nodes(&mut self, parents: &[Option<usize>]) -> Result<()> {
        let new_size = self.tree_size + parents.len();
        if new_size > self.capacity {
            return Err(Error::capacity(
                "speculative tree tokens",
                new_size,
                self.capacity,
            ));
        }

        for (offset, parent) in parents.iter().enumerate() {
            let node = self.tree_size + offset;
            if let Some(parent) = *parent {
                if parent >= node {
                    return Err(Error::Config(format!(
                        "tree node {node} has parent {parent}, which does not precede it"
                    )));
                }
            }
        }

        for (offset, parent) in parents.iter().enumerate() {
            let node = self.tree_size + offset;
            self.set(node, node)?;
            if let Some(parent) = *parent {
                // The parent already carries its full ancestor chain.
                for key in 0..=parent {
                    if self.is_set(parent, key) {
                        self.set(node, key)?;
                    }
                }
            }
        }

        self.tree_size = new_size;
        Ok(())
    }

    /// Allow tree query `query` to attend to tree key `key`.
    pub fn set(&mut self, query: usize, key: usize) -> Result<()> {
        if query >= self.capacity || key >= self.capacity {
            return Err(Error::capacity(
                "bitmask index",
                query.max(key) + 1,
                self.capacity,
            ));
        }
        let word = key * self.words_per_row + query / WORD_BITS;
        self.bits[word] |= 1u64 << (query % WORD_BITS);
        Ok(())
    }

    /// Whether tree query `query` may attend to tree key `key`.
    /// Out-of-range indices are never visible.
    pub fn is_set(&self, query: usize, key: usize) -> bool {
        if query >= self.capacity || key >= self.capacity {
            return false;
        }
        let word = key * self.words_per_row + query / WORD_BITS;
        self.bits[word] & (1u64 << (query % WORD_BITS)) != 0
    }

    /// Visibility over absolute key positions: committed history is always
    /// visible, tree keys are bit-gated.
    pub fn is_visible(&self, tree_query: usize, key: usize) -> bool {
        key < self.non_tree_cache_size || self.is_set(tree_query, key - self.non_tree_cache_size)
    }

    /// Drop every bit and the tree; the boundary is kept.
    pub fn clear(&mut self) {
        self.bits.fill(0);
        self.tree_size = 0;
    }

    pub fn non_tree_cache_size(&self) -> usize {
        self.non_tree_cache_size
    }

    pub fn set_non_tree_cache_size(&mut self, size: usize) {
        self.non_tree_cache_size = size;
    }

    pub fn tree_size(&self) -> usize {
        self.tree_size
    }

    /// Number of ancestors of tree node `node`; 0 for a root.
    pub fn node_depth(&self, node: usize) -> usize {
        (0..node).filter(|&key| self.is_set(node, key)).count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
