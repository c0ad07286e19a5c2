#![deny(clippy::cast_possible_truncation, clippy::cast_precision_loss)]

//! Physical block management for a paged KV cache.
//!
//! The [`BlockAllocator`] owns a fixed pool of blocks and binds each
//! [`Sequence`]'s logical blocks to physical ones. Full blocks are content
//! addressed by a chained hash so sequences that share a prompt prefix share
//! the physical blocks holding it; blocks are reference counted and return to
//! a FIFO free list once nothing references them.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

mod block_allocator;
mod block_hash;
mod block_pool;
mod config;
mod error;
mod sequence;
mod snapshot;

pub use block_allocator::{BlockAllocator, BlockAllocatorStats};
pub use block_hash::{compute_block_hashes, BlockHash, BlockHasher, Xxh64Hasher};
pub use block_pool::Block;
pub use config::CacheConfig;
pub use error::{BlockError, ConfigError, Result, SnapshotError};
pub use sequence::{SamplingParams, Sequence, SequenceId, SequenceIdAllocator, SequenceStatus};
pub use snapshot::{SequenceSnapshot, SnapshotTail};

/// Install a `tracing` subscriber. The level defaults to INFO, or DEBUG when
/// `PAGEKV_DEBUG=1`; `RUST_LOG` overrides either.
pub fn initialize_logging() {
    let is_debug = std::env::var("PAGEKV_DEBUG")
        .unwrap_or_default()
        .contains('1');

    let filter = EnvFilter::builder()
        .with_default_directive(if is_debug {
            LevelFilter::DEBUG.into()
        } else {
            LevelFilter::INFO.into()
        })
        .from_env_lossy();
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
