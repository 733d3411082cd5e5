//! Per-forward-call batch snapshot.
//!
//! A [`BatchConfig`] describes what is live in one forward call: which of the
//! fixed request slots are active, where each request's new tokens start in
//! its history, and which of them are speculative tree nodes. It is built
//! once per scheduling round and read by every stage of the layer.
//!
//! ## Token Order
//!
//! ```text
//! slot:        0        1        2        3
//! available:   yes      no       yes      yes
//! tokens:      [a a a]           [b]      [c c]
//! batch index: 0 1 2             3        4 5
//! ```
//!
//! Tokens are laid out in slot order, so a request's first token index is the
//! sum of `num_tokens_in_batch` over the available slots before it. Kernels
//! recompute that (and the compact request index) with a linear scan of the
//! availability flags.

use serde::{Deserialize, Serialize};

use crate::config::BatchLimits;
use crate::core::bitmask::BitMask;
use crate::error::{Error, Result};

/// Which attention variant a batch is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InferenceMode {
    /// Ordinary autoregressive decoding.
    Incremental,
    /// Draft-token generation over a growing speculative tree.
    Speculative,
    /// Verification of a speculative tree, committing the accepted path.
    TreeVerify,
}

/// Metadata of one active request slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PerRequestInfo {
    /// Depth of this batch's first token within the request.
    pub first_token_depth_in_request: usize,
    /// Index of this request's first token in the batch token list.
    pub first_token_offset_in_batch: usize,
    pub num_tokens_in_batch: usize,
    /// Slot index; stable while the request stays in the batch.
    pub batch_config_request_id: usize,
    pub request_guid: u64,
    pub prompt_phase: bool,
}

impl PerRequestInfo {
    /// Key positions this request attends over in this call.
    pub fn total_length(&self) -> usize {
        self.first_token_depth_in_request + self.num_tokens_in_batch
    }
}

/// Metadata of one new token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerTokenInfo {
    /// Cache depth within the request.
    pub abs_depth_in_request: usize,
    /// Position fed to rotary and position bias. Equals the cache depth
    /// except inside a speculative tree, where siblings share a position.
    pub position: usize,
    /// Owning request slot.
    pub request_index: usize,
    pub token_id: u32,
}

/// One accepted speculative token to move into linear history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedTokenInfo {
    /// Source depth in the tree region, or [`Self::NOT_PRESENT`].
    pub index_in_kv_cache: i64,
    pub request_index: usize,
    /// Destination depth in linear history.
    pub token_depth: usize,
}

impl CommittedTokenInfo {
    /// Sentinel source: the token was not in the previous tree.
    pub const NOT_PRESENT: i64 = -1;

    pub fn new(request_index: usize, source_depth: usize, token_depth: usize) -> Self {
        Self {
            index_in_kv_cache: source_depth as i64,
            request_index,
            token_depth,
        }
    }

    /// Record for a token with nothing to move.
    pub fn not_present(request_index: usize, token_depth: usize) -> Self {
        Self {
            index_in_kv_cache: Self::NOT_PRESENT,
            request_index,
            token_depth,
        }
    }

    /// Source depth, or `None` for the sentinel.
    pub fn source_depth(&self) -> Option<usize> {
        usize::try_from(self.index_in_kv_cache).ok()
    }

    /// Records for an accepted path through the previous tree.
    ///
    /// # Arguments
    ///
    /// * `request_index` - Owning request slot
    /// * `committed_len` - Committed history length the tree was built on
    /// * `tree_indices` - Tree-relative node indices of the accepted path, root first
    pub fn accepted_path(
        request_index: usize,
        committed_len: usize,
        tree_indices: &[usize],
    ) -> Vec<Self> {
        tree_indices
            .iter()
            .enumerate()
            .map(|(i, &node)| Self::new(request_index, committed_len + node, committed_len + i))
            .collect()
    }
}

/// Snapshot of the active batch for one forward call.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    mode: InferenceMode,
    limits: BatchLimits,
    request_available: Vec<bool>,
    requests: Vec<PerRequestInfo>,
    /// `(token_id, position)` of each slot's new tokens.
    slot_tokens: Vec<Vec<(u32, usize)>>,
    bitmasks: Vec<BitMask>,
    tokens: Vec<PerTokenInfo>,
    committed_tokens: Vec<CommittedTokenInfo>,
}

impl BatchConfig {
    /// Create an empty batch with `max_requests_per_batch` free slots.
    pub fn new(mode: InferenceMode, limits: BatchLimits) -> Self {
        let slots = limits.max_requests_per_batch;
        Self {
            mode,
            limits,
            request_available: vec![false; slots],
            requests: vec![PerRequestInfo::default(); slots],
            slot_tokens: vec![Vec::new(); slots],
            bitmasks: vec![BitMask::new(limits.max_spec_tree_token_num); slots],
            tokens: Vec::new(),
            committed_tokens: Vec::new(),
        }
    }

    /// Add a request's prompt tokens. All of them are mutually causal.
    pub fn add_prompt(&mut self, slot: usize, request_guid: u64, tokens: &[u32]) -> Result<()> {
        self.add_prompt_chunk(slot, request_guid, 0, tokens)
    }

    /// Add the next chunk of a prompt whose first `first_depth` tokens were
    /// processed by earlier calls. The chunk attends causally over them.
    pub fn add_prompt_chunk(
        &mut self,
        slot: usize,
        request_guid: u64,
        first_depth: usize,
        tokens: &[u32],
    ) -> Result<()> {
        self.check_new_request(slot, first_depth, first_depth, tokens.len())?;
        // Prompts never consult the bitmask.
        let bitmask = BitMask::new(self.limits.max_spec_tree_token_num);
        let positions = (first_depth..first_depth + tokens.len()).collect();
        self.insert(slot, request_guid, first_depth, true, tokens, positions, bitmask)
    }

    /// Add new tokens that extend `first_depth` committed tokens as a chain.
    ///
    /// Incremental batches are read causally, so their chain may be longer
    /// than the speculative tree region.
    pub fn add_decode(
        &mut self,
        slot: usize,
        request_guid: u64,
        first_depth: usize,
        tokens: &[u32],
    ) -> Result<()> {
        self.check_new_request(slot, first_depth, first_depth, tokens.len())?;
        let capacity = self.limits.max_spec_tree_token_num;
        let bitmask = if self.mode == InferenceMode::Incremental {
            let mut bitmask = BitMask::new(capacity);
            bitmask.set_non_tree_cache_size(first_depth);
            bitmask
        } else {
            BitMask::causal(first_depth, tokens.len(), capacity)?
        };
        let positions = (first_depth..first_depth + tokens.len()).collect();
        self.insert(slot, request_guid, first_depth, false, tokens, positions, bitmask)
    }

    /// Add a whole speculative tree on top of `committed_len` committed tokens.
    ///
    /// `parents[i]` is the tree-relative parent of node `i` (`None` for a root).
    pub fn add_tree(
        &mut self,
        slot: usize,
        request_guid: u64,
        committed_len: usize,
        tokens: &[u32],
        parents: &[Option<usize>],
    ) -> Result<()> {
        if parents.len() != tokens.len() {
            return Err(Error::Shape(format!(
                "{} tree tokens but {} parent entries",
                tokens.len(),
                parents.len()
            )));
        }
        self.check_new_request(slot, committed_len, committed_len, tokens.len())?;
        let bitmask = BitMask::from_parents(
            committed_len,
            parents,
            self.limits.max_spec_tree_token_num,
        )?;
        let positions = (0..tokens.len())
            .map(|node| committed_len + bitmask.node_depth(node))
            .collect();
        self.insert(slot, request_guid, committed_len, false, tokens, positions, bitmask)
    }

    /// Add the newest layer of a growing speculative tree.
    ///
    /// `bitmask` already holds every node, and `tokens` are its last
    /// `tokens.len()` nodes.
    pub fn add_tree_layer(
        &mut self,
        slot: usize,
        request_guid: u64,
        bitmask: BitMask,
        tokens: &[u32],
    ) -> Result<()> {
        if tokens.len() > bitmask.tree_size() {
            return Err(Error::Shape(format!(
                "{} new tokens but the tree holds {} nodes",
                tokens.len(),
                bitmask.tree_size()
            )));
        }
        if bitmask.capacity() != self.limits.max_spec_tree_token_num {
            return Err(Error::Config(format!(
                "bitmask capacity {} does not match max_spec_tree_token_num {}",
                bitmask.capacity(),
                self.limits.max_spec_tree_token_num
            )));
        }
        let boundary = bitmask.non_tree_cache_size();
        let first_node = bitmask.tree_size() - tokens.len();
        let first_depth = boundary + first_node;
        self.check_new_request(slot, boundary, first_depth, tokens.len())?;
        let positions = (first_node..bitmask.tree_size())
            .map(|node| boundary + bitmask.node_depth(node))
            .collect();
        self.insert(slot, request_guid, first_depth, false, tokens, positions, bitmask)
    }

    /// Queue accepted tokens for the commit engine.
    pub fn add_committed(
        &mut self,
        records: impl IntoIterator<Item = CommittedTokenInfo>,
    ) -> Result<()> {
        for record in records {
            if record.request_index >= self.limits.max_requests_per_batch {
                return Err(Error::capacity(
                    "request slot",
                    record.request_index + 1,
                    self.limits.max_requests_per_batch,
                ));
            }
            if self.committed_tokens.len() == self.limits.max_tokens_per_batch {
                return Err(Error::capacity(
                    "committed tokens",
                    self.committed_tokens.len() + 1,
                    self.limits.max_tokens_per_batch,
                ));
            }
            self.committed_tokens.push(record);
        }
        Ok(())
    }

    /// `committed` is the request's linear history length, `first_depth` the
    /// cache depth of its first new token.
    fn check_new_request(
        &self,
        slot: usize,
        committed: usize,
        first_depth: usize,
        num_tokens: usize,
    ) -> Result<()> {
        if slot >= self.limits.max_requests_per_batch {
            return Err(Error::capacity(
                "request slot",
                slot + 1,
                self.limits.max_requests_per_batch,
            ));
        }
        if self.request_available[slot] {
            return Err(Error::Config(format!("request slot {slot} is already active")));
        }
        if num_tokens == 0 {
            return Err(Error::Config(format!(
                "request slot {slot} has no tokens in the batch"
            )));
        }
        let total = self.tokens.len() + num_tokens;
        if total > self.limits.max_tokens_per_batch {
            return Err(Error::capacity(
                "tokens per batch",
                total,
                self.limits.max_tokens_per_batch,
            ));
        }
        if committed > self.limits.max_sequence_length {
            return Err(Error::capacity(
                "sequence length",
                committed,
                self.limits.max_sequence_length,
            ));
        }
        if first_depth + num_tokens > self.limits.cache_capacity() {
            return Err(Error::capacity(
                "cache positions",
                first_depth + num_tokens,
                self.limits.cache_capacity(),
            ));
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn insert(
        &mut self,
        slot: usize,
        request_guid: u64,
        first_depth: usize,
        prompt_phase: bool,
        tokens: &[u32],
        positions: Vec<usize>,
        bitmask: BitMask,
    ) -> Result<()> {
        self.request_available[slot] = true;
        self.requests[slot] = PerRequestInfo {
            first_token_depth_in_request: first_depth,
            first_token_offset_in_batch: 0,
            num_tokens_in_batch: tokens.len(),
            batch_config_request_id: slot,
            request_guid,
            prompt_phase,
        };
        self.slot_tokens[slot] = tokens.iter().copied().zip(positions).collect();
        self.bitmasks[slot] = bitmask;
        self.rebuild_tokens();
        tracing::trace!(
            slot,
            request_guid,
            first_depth,
            num_tokens = tokens.len(),
            prompt_phase,
            "request added to batch"
        );
        Ok(())
    }

    fn rebuild_tokens(&mut self) {
        self.tokens.clear();
        for slot in 0..self.request_available.len() {
            if !self.request_available[slot] {
                continue;
            }
            let info = &mut self.requests[slot];
            info.first_token_offset_in_batch = self.tokens.len();
            let first_depth = info.first_token_depth_in_request;
            for (i, &(token_id, position)) in self.slot_tokens[slot].iter().enumerate() {
                self.tokens.push(PerTokenInfo {
                    abs_depth_in_request: first_depth + i,
                    position,
                    request_index: slot,
                    token_id,
                });
            }
        }
    }

    pub fn mode(&self) -> InferenceMode {
        self.mode
    }

    pub fn limits(&self) -> &BatchLimits {
        &self.limits
    }

    /// Number of slots in the snapshot.
    pub fn max_requests(&self) -> usize {
        self.request_available.len()
    }

    /// Population count over the availability flags.
    pub fn num_active_requests(&self) -> usize {
        self.request_available.iter().filter(|&&a| a).count()
    }

    /// Sum of `num_tokens_in_batch` over the active requests.
    pub fn num_active_tokens(&self) -> usize {
        self.active_slots()
            .map(|slot| self.requests[slot].num_tokens_in_batch)
            .sum()
    }

    /// True when every active request is in the prompt phase.
    pub fn is_prompt_phase(&self) -> bool {
        self.num_active_requests() > 0 && self.active_slots().all(|s| self.requests[s].prompt_phase)
    }

    pub fn is_available(&self, slot: usize) -> bool {
        self.request_available.get(slot).copied().unwrap_or(false)
    }

    /// Active slot indices in ascending order.
    pub fn active_slots(&self) -> impl Iterator<Item = usize> + '_ {
        self.request_available
            .iter()
            .enumerate()
            .filter_map(|(slot, &available)| available.then_some(slot))
    }

    /// Dense ordinal of `slot` among the available slots.
    pub fn compact_index(&self, slot: usize) -> Option<usize> {
        if !self.is_available(slot) {
            return None;
        }
        let mut index = 0;
        for &available in &self.request_available[..slot] {
            if available {
                index += 1;
            }
        }
        Some(index)
    }

    /// Batch index of `slot`'s first token.
    pub fn first_token_index(&self, slot: usize) -> Option<usize> {
        if !self.is_available(slot) {
            return None;
        }
        let mut index = 0;
        for prev in 0..slot {
            if self.request_available[prev] {
                index += self.requests[prev].num_tokens_in_batch;
            }
        }
        Some(index)
    }

    /// Metadata of an active slot.
    pub fn request(&self, slot: usize) -> Option<&PerRequestInfo> {
        self.is_available(slot).then(|| &self.requests[slot])
    }

    /// Bitmask of an active slot.
    pub fn bitmask(&self, slot: usize) -> Option<&BitMask> {
        self.is_available(slot).then(|| &self.bitmasks[slot])
    }

    /// New tokens in slot order.
    pub fn tokens(&self) -> &[PerTokenInfo] {
        &self.tokens
    }

    pub fn committed_tokens(&self) -> &[CommittedTokenInfo] {
        &self.committed_tokens
    }
}
