//! Flat pool of physical KV cache blocks.
//!
//! Key properties:
//! - Blocks are created once and live for the lifetime of the pool.
//! - The free list is a plain FIFO: allocation pops the front, release
//!   appends to the back. There is no LRU ranking.
//! - A released block keeps its committed hash and tokens until it is reset,
//!   so an identical prefix arriving later can revive it.

use std::collections::{HashSet, VecDeque};

use crate::block_hash::BlockHash;

/// Metadata for a single physical block.
#[derive(Debug, Clone)]
pub struct Block {
    /// Block ID, ranging from 0 to num_blocks - 1.
    block_id: usize,
    /// Number of logical blocks bound to this block. 0 means free.
    ref_count: usize,
    /// Content hash, set only once the block holds a full block of tokens.
    hash: Option<BlockHash>,
    /// Committed token content.
    token_ids: Vec<u32>,
}

impl Block {
    fn new(block_id: usize) -> Self {
        Self {
            block_id,
            ref_count: 0,
            hash: None,
            token_ids: Vec::new(),
        }
    }

    pub fn block_id(&self) -> usize {
        self.block_id
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    pub fn hash(&self) -> Option<BlockHash> {
        self.hash
    }

    pub fn token_ids(&self) -> &[u32] {
        &self.token_ids
    }

    pub fn is_free(&self) -> bool {
        self.ref_count == 0
    }

    pub fn is_finalized(&self) -> bool {
        self.hash.is_some()
    }
}

/// The block pool owns every physical block plus the free/used bookkeeping.
#[derive(Debug)]
pub struct BlockPool {
    blocks: Vec<Block>,
    free_ids: VecDeque<usize>,
    used_ids: HashSet<usize>,
    block_size: usize,
}

impl BlockPool {
    /// Create a pool with `num_blocks` free blocks of `block_size` tokens.
    pub fn new(num_blocks: usize, block_size: usize) -> Self {
        assert!(num_blocks > 0, "Must have at least 1 block");
        assert!(block_size > 0, "Block size must be non-zero");
        Self {
            blocks: (0..num_blocks).map(Block::new).collect(),
            free_ids: (0..num_blocks).collect(),
            used_ids: HashSet::with_capacity(num_blocks),
            block_size,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn num_free_blocks(&self) -> usize {
        self.free_ids.len()
    }

    pub fn num_used_blocks(&self) -> usize {
        self.used_ids.len()
    }

    /// Get KV cache usage as a fraction [0.0, 1.0].
    #[allow(clippy::cast_precision_loss)]
    pub fn usage(&self) -> f64 {
        self.num_used_blocks() as f64 / self.num_blocks() as f64
    }

    pub fn block(&self, block_id: usize) -> &Block {
        &self.blocks[block_id]
    }

    /// Free ids in allocation order.
    pub fn free_ids(&self) -> impl Iterator<Item = usize> + '_ {
        self.free_ids.iter().copied()
    }

    pub fn is_used(&self, block_id: usize) -> bool {
        self.used_ids.contains(&block_id)
    }

    /// The id the next allocation will take, if any.
    pub fn peek_free(&self) -> Option<usize> {
        self.free_ids.front().copied()
    }

    /// Pop the first free block and reset it into the used state.
    pub fn pop_free(&mut self) -> Option<usize> {
        let block_id = self.peek_free()?;
        self.reset(block_id);
        Some(block_id)
    }

    /// Move a free block into the used state with `ref_count = 1`, clearing
    /// its hash and content.
    ///
    /// The id is usually at the front of the free list; reviving a cached
    /// block takes it from wherever it sits.
    pub fn reset(&mut self, block_id: usize) {
        let block = &mut self.blocks[block_id];
        assert_eq!(
            block.ref_count, 0,
            "Block {block_id} reset while still referenced (ref_count={})",
            block.ref_count
        );
        block.ref_count = 1;
        block.hash = None;
        block.token_ids.clear();

        if self.free_ids.front() == Some(&block_id) {
            self.free_ids.pop_front();
        } else {
            let pos = self
                .free_ids
                .iter()
                .position(|&id| id == block_id)
                .unwrap_or_else(|| panic!("Free block {block_id} missing from the free list"));
            self.free_ids.remove(pos);
        }
        self.used_ids.insert(block_id);
    }

    /// Record the content identity of a block that now holds a full block
    /// of tokens. Finalized content is never rewritten in place.
    pub fn finalize(&mut self, block_id: usize, hash: BlockHash, token_ids: &[u32]) {
        assert_eq!(
            token_ids.len(),
            self.block_size,
            "Block {block_id} finalized with {} tokens, block size is {}",
            token_ids.len(),
            self.block_size
        );
        let block = &mut self.blocks[block_id];
        assert!(block.ref_count > 0, "Block {block_id} finalized while free");
        block.hash = Some(hash);
        block.token_ids.clear();
        block.token_ids.extend_from_slice(token_ids);
    }

    /// Bind one more logical block to an already used block.
    pub fn acquire(&mut self, block_id: usize) {
        let block = &mut self.blocks[block_id];
        assert!(block.ref_count > 0, "Block {block_id} acquired while free");
        block.ref_count += 1;
    }

    /// Unbind one logical block. Returns `true` if the block became free, in
    /// which case it was appended to the back of the free list.
    pub fn release(&mut self, block_id: usize) -> bool {
        let block = &mut self.blocks[block_id];
        if block.ref_count == 0 {
            panic!("Block {block_id} experienced a double free!");
        }
        block.ref_count -= 1;
        if block.ref_count > 0 {
            return false;
        }
        self.used_ids.remove(&block_id);
        self.free_ids.push_back(block_id);
        true
    }

    /// Forget every retained hash and token list. Only allowed while all
    /// blocks are free.
    pub(crate) fn clear_retained_content(&mut self) -> bool {
        if !self.used_ids.is_empty() {
            return false;
        }
        for block in &mut self.blocks {
            block.hash = None;
            block.token_ids.clear();
        }
        true
    }

    /// Check that the free list and used set partition the pool and agree
    /// with every block's reference count.
    pub(crate) fn integrity_violation(&self) -> Option<String> {
        let mut seen = vec![false; self.blocks.len()];
        for &id in &self.free_ids {
            if id >= self.blocks.len() {
                return Some(format!("free list holds out-of-range id {id}"));
            }
            if seen[id] {
                return Some(format!("block {id} appears twice in the free list"));
            }
            seen[id] = true;
            if self.blocks[id].ref_count != 0 {
                return Some(format!(
                    "free block {id} has ref_count {}",
                    self.blocks[id].ref_count
                ));
            }
        }
        for &id in &self.used_ids {
            if seen[id] {
                return Some(format!("block {id} is both free and used"));
            }
            seen[id] = true;
            if self.blocks[id].ref_count == 0 {
                return Some(format!("used block {id} has ref_count 0"));
            }
        }
        if let Some(id) = seen.iter().position(|s| !s) {
            return Some(format!("block {id} is neither free nor used"));
        }
        for block in &self.blocks {
            if block.hash.is_some() && block.token_ids.len() != self.block_size {
                return Some(format!(
                    "finalized block {} holds {} tokens",
                    block.block_id,
                    block.token_ids.len()
                ));
            }
        }
        None
    }
}
