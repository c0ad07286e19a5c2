//! The block allocator maps each sequence's logical blocks onto physical
//! blocks of a fixed pool, sharing full blocks between sequences whose
//! prefixes are identical.
//!
//! Lifecycle driven by the scheduler:
//! - `can_allocate` / `allocate` when a sequence is admitted,
//! - `can_append` / `may_append` after every generated token,
//! - `deallocate` when the sequence finishes or is preempted.
//!
//! All mutating operations take `&mut self`: one scheduling thread owns the
//! allocator and serializes every call.

use std::collections::HashMap;

use tracing::{debug, info, trace};

use crate::{
    block_hash::{BlockHash, BlockHasher, Xxh64Hasher},
    block_pool::{Block, BlockPool},
    config::CacheConfig,
    error::{BlockError, Result},
    sequence::Sequence,
};

/// Point-in-time view of the pool and the prefix cache counters.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockAllocatorStats {
    pub total_blocks: usize,
    pub free_blocks: usize,
    pub used_blocks: usize,
    pub indexed_hashes: usize,
    pub prefix_cache_hits: usize,
    pub prefix_cache_misses: usize,
}

impl BlockAllocatorStats {
    /// Prefix cache hit rate over full-block lookups, as a percentage.
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let total = self.prefix_cache_hits + self.prefix_cache_misses;
        if total == 0 {
            0.0
        } else {
            100.0 * self.prefix_cache_hits as f64 / total as f64
        }
    }
}

pub struct BlockAllocator {
    pool: BlockPool,
    /// Content hash -> the block currently claiming it. Last writer wins.
    hash_index: HashMap<BlockHash, usize>,
    hasher: Box<dyn BlockHasher>,
    hits: usize,
    misses: usize,
}

impl BlockAllocator {
    pub fn new(num_blocks: usize, block_size: usize) -> Self {
        Self::with_hasher(num_blocks, block_size, Xxh64Hasher::default())
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.num_blocks, config.block_size)
    }

    pub fn with_hasher(
        num_blocks: usize,
        block_size: usize,
        hasher: impl BlockHasher + 'static,
    ) -> Self {
        info!("Block allocator: {num_blocks} blocks of {block_size} tokens.");
        Self {
            pool: BlockPool::new(num_blocks, block_size),
            hash_index: HashMap::new(),
            hasher: Box::new(hasher),
            hits: 0,
            misses: 0,
        }
    }

    pub fn block_size(&self) -> usize {
        self.pool.block_size()
    }

    pub fn num_blocks(&self) -> usize {
        self.pool.num_blocks()
    }

    pub fn num_free_blocks(&self) -> usize {
        self.pool.num_free_blocks()
    }

    pub fn num_used_blocks(&self) -> usize {
        self.pool.num_used_blocks()
    }

    pub fn usage(&self) -> f64 {
        self.pool.usage()
    }

    pub fn block(&self, block_id: usize) -> &Block {
        self.pool.block(block_id)
    }

    pub fn free_block_ids(&self) -> impl Iterator<Item = usize> + '_ {
        self.pool.free_ids()
    }

    /// The block currently registered under `hash`, if any.
    pub fn lookup(&self, hash: BlockHash) -> Option<usize> {
        self.hash_index.get(&hash).copied()
    }

    pub fn hasher(&self) -> &dyn BlockHasher {
        self.hasher.as_ref()
    }

    pub fn stats(&self) -> BlockAllocatorStats {
        BlockAllocatorStats {
            total_blocks: self.pool.num_blocks(),
            free_blocks: self.pool.num_free_blocks(),
            used_blocks: self.pool.num_used_blocks(),
            indexed_hashes: self.hash_index.len(),
            prefix_cache_hits: self.hits,
            prefix_cache_misses: self.misses,
        }
    }

    /// Whether `allocate` can bind every logical block of `seq`. Counts every
    /// logical block as a fresh allocation, so prefix hits only add slack.
    pub fn can_allocate(&self, seq: &Sequence) -> bool {
        self.pool.num_free_blocks() >= seq.num_blocks()
    }

    /// Bind all logical blocks of a newly admitted sequence, reusing cached
    /// blocks for the longest matching prefix.
    pub fn allocate(&mut self, seq: &mut Sequence) -> Result<()> {
        self.check_block_size(seq)?;
        if !seq.block_table.is_empty() {
            return Err(BlockError::AlreadyAllocated(seq.id()));
        }
        if !self.can_allocate(seq) {
            return Err(BlockError::OutOfBlocks {
                needed: seq.num_blocks(),
                free: self.pool.num_free_blocks(),
            });
        }

        let block_size = self.block_size();
        let num_blocks = seq.num_blocks();
        let mut block_table = Vec::with_capacity(num_blocks);
        let mut cached_tokens = 0;
        let mut prefix: Option<BlockHash> = None;
        let mut cache_miss = false;

        for i in 0..num_blocks {
            let tokens = seq.block(i);
            let hash = (tokens.len() == block_size).then(|| self.hasher.hash_block(prefix, tokens));

            // Once a block misses, nothing after it may be shared.
            let cached = if cache_miss {
                None
            } else {
                hash.and_then(|h| self.cached_block(h, tokens))
            };

            let block_id = match cached {
                Some(block_id) => {
                    if self.pool.is_used(block_id) {
                        self.pool.acquire(block_id);
                    } else {
                        // Freed earlier but never handed out again: revive it.
                        self.pool.reset(block_id);
                    }
                    cached_tokens += block_size;
                    self.hits += 1;
                    trace!("Seq {}: logical block {i} hit block {block_id}.", seq.id());
                    block_id
                }
                None => {
                    cache_miss = true;
                    if hash.is_some() {
                        self.misses += 1;
                    }
                    let block_id = self.take_free_block().ok_or(BlockError::OutOfBlocks {
                        needed: num_blocks - i,
                        free: 0,
                    })?;
                    trace!("Seq {}: logical block {i} -> new block {block_id}.", seq.id());
                    block_id
                }
            };

            if let Some(h) = hash {
                if self.pool.block(block_id).hash() != Some(h) {
                    self.pool.finalize(block_id, h, tokens);
                }
                self.hash_index.insert(h, block_id);
            }
            block_table.push(block_id);
            prefix = hash;
        }

        seq.num_cached_tokens += cached_tokens;
        seq.block_table = block_table;
        debug!(
            "Allocated {num_blocks} blocks for seq {} ({cached_tokens} tokens from prefix cache), {} free.",
            seq.id(),
            self.pool.num_free_blocks()
        );
        Ok(())
    }

    /// Whether `may_append` can run for the token just appended to `seq`.
    /// A fresh block is needed only when that token opened a new logical block.
    pub fn can_append(&self, seq: &Sequence) -> bool {
        self.pool.num_free_blocks() >= usize::from(seq.last_token_opens_block())
    }

    /// Extend the block table after exactly one token was appended to `seq`.
    ///
    /// - The token opened a logical block: bind a fresh physical block.
    /// - The token filled a logical block: hash it (chained on the previous
    ///   block) and register it in the prefix cache.
    /// - Otherwise nothing changes.
    ///
    /// With a block size of 1 every token does both.
    pub fn may_append(&mut self, seq: &mut Sequence) -> Result<()> {
        self.check_block_size(seq)?;
        if seq.is_empty() {
            return Ok(());
        }

        let opens = seq.last_token_opens_block();
        let fills = seq.last_token_fills_block();
        let expected = if opens {
            seq.num_blocks() - 1
        } else {
            seq.num_blocks()
        };
        if seq.block_table.len() != expected {
            if seq.block_table.is_empty() {
                return Err(BlockError::NotAllocated(seq.id()));
            }
            return Err(BlockError::BlockTableMismatch {
                seq: seq.id(),
                expected,
                got: seq.block_table.len(),
            });
        }

        let last = seq.block_table.last().copied();
        if opens {
            if let Some(prev) = last {
                self.expect_hash_state(prev, true)?;
            }
            let block_id = self.take_free_block().ok_or(BlockError::OutOfBlocks {
                needed: 1,
                free: 0,
            })?;
            seq.block_table.push(block_id);
        } else if let Some(current) = last {
            self.expect_hash_state(current, false)?;
        }

        if fills {
            self.finalize_last_block(seq);
        }
        Ok(())
    }

    /// Release every block of `seq`, tail first so a chain's tail returns to
    /// the free list before its prefix.
    pub fn deallocate(&mut self, seq: &mut Sequence) {
        let mut freed = 0;
        for &block_id in seq.block_table.iter().rev() {
            if self.pool.release(block_id) {
                freed += 1;
            }
        }
        debug!(
            "Released {} blocks of seq {} ({freed} now free).",
            seq.block_table.len(),
            seq.id()
        );
        seq.num_cached_tokens = 0;
        seq.block_table.clear();
    }

    /// Drop the hash index and all retained block content. Only succeeds if
    /// every block is free.
    pub fn reset_prefix_cache(&mut self) -> bool {
        if !self.pool.clear_retained_content() {
            return false;
        }
        self.hash_index.clear();
        true
    }

    /// Verify the pool bookkeeping and the hash index.
    pub fn check_integrity(&self) -> Result<()> {
        if let Some(msg) = self.pool.integrity_violation() {
            return Err(BlockError::Integrity(msg));
        }
        for (&hash, &block_id) in &self.hash_index {
            if self.pool.block(block_id).hash() != Some(hash) {
                return Err(BlockError::Integrity(format!(
                    "hash {hash} indexes block {block_id}, which holds {:?}",
                    self.pool.block(block_id).hash()
                )));
            }
        }
        Ok(())
    }

    fn check_block_size(&self, seq: &Sequence) -> Result<()> {
        if seq.block_size() != self.block_size() {
            return Err(BlockError::BlockSizeMismatch {
                allocator: self.block_size(),
                sequence: seq.block_size(),
            });
        }
        Ok(())
    }

    fn expect_hash_state(&self, block_id: usize, finalized: bool) -> Result<()> {
        if self.pool.block(block_id).is_finalized() != finalized {
            return Err(BlockError::UnexpectedHashState {
                block_id,
                expected_finalized: finalized,
            });
        }
        Ok(())
    }

    /// A block that can serve a logical block with this hash and content.
    fn cached_block(&self, hash: BlockHash, tokens: &[u32]) -> Option<usize> {
        let block_id = self.lookup(hash)?;
        let block = self.pool.block(block_id);
        (block.hash() == Some(hash) && block.token_ids() == tokens).then_some(block_id)
    }

    /// Pop the front of the free list, dropping its stale index entry first.
    fn take_free_block(&mut self) -> Option<usize> {
        let block_id = self.pool.peek_free()?;
        if let Some(hash) = self.pool.block(block_id).hash() {
            if self.hash_index.get(&hash) == Some(&block_id) {
                self.hash_index.remove(&hash);
            }
        }
        self.pool.pop_free()
    }

    fn finalize_last_block(&mut self, seq: &Sequence) {
        let n = seq.block_table.len();
        let block_id = seq.block_table[n - 1];
        let prefix = if n > 1 {
            self.pool.block(seq.block_table[n - 2]).hash()
        } else {
            None
        };
        debug_assert!(n == 1 || prefix.is_some(), "unhashed prefix block");

        let tokens = seq.block(n - 1);
        let hash = self.hasher.hash_block(prefix, tokens);
        self.pool.finalize(block_id, hash, tokens);
        self.hash_index.insert(hash, block_id);
    }
}
