use thiserror::Error;

use crate::sequence::SequenceId;

/// Errors returned by the block allocator. All of them are caller contract
/// violations detected before any state was touched.
///
/// None of them is transient. A scheduler that checks `can_allocate` and
/// `can_append` first never sees `OutOfBlocks`, and `UnexpectedHashState`
/// means the block table and the pool disagree. Treat every variant as a bug
/// in the caller, not as a condition to retry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("Out of KV cache blocks: need {needed}, only {free} free.")]
    OutOfBlocks { needed: usize, free: usize },
    #[error("Sequence {0} already has a block table.")]
    AlreadyAllocated(SequenceId),
    #[error("Sequence {0} has no block table.")]
    NotAllocated(SequenceId),
    #[error("Sequence {seq} has {got} blocks in its table, expected {expected}. Extend once per generated token.")]
    BlockTableMismatch {
        seq: SequenceId,
        expected: usize,
        got: usize,
    },
    #[error("Block size mismatch: allocator uses {allocator}, sequence uses {sequence}.")]
    BlockSizeMismatch { allocator: usize, sequence: usize },
    #[error(
        "Block {block_id} is in an unexpected hash state (expected finalized: {expected_finalized})."
    )]
    UnexpectedHashState {
        block_id: usize,
        expected_finalized: bool,
    },
    #[error("Block pool integrity check failed: {0}")]
    Integrity(String),
}

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Snapshot carries only the last token, but the receiver holds no earlier tokens.")]
    MissingHistory,
    #[error("Snapshot token list has {got} tokens, expected {expected}.")]
    LengthMismatch { expected: usize, got: usize },
    #[error("Receiver holds {held} tokens, cannot append a delta for a {num_tokens}-token sequence.")]
    NonContiguous { held: usize, num_tokens: usize },
    #[error("Snapshot claims {num_prompt_tokens} prompt tokens out of {num_tokens} tokens.")]
    PromptExceedsTokens {
        num_prompt_tokens: usize,
        num_tokens: usize,
    },
    #[error("Snapshot claims {num_cached_tokens} cached tokens, which is not a whole number of {block_size}-token blocks within {num_tokens} tokens.")]
    InvalidCachedTokens {
        num_cached_tokens: usize,
        num_tokens: usize,
        block_size: usize,
    },
    #[error("Snapshot has {num_completion_tokens} completion tokens but a {tail} tail.")]
    TailMismatch {
        num_completion_tokens: usize,
        tail: &'static str,
    },
    #[error("Snapshot block table has {got} entries, but {num_tokens} tokens span at most {max} blocks.")]
    BlockTableTooLong {
        got: usize,
        max: usize,
        num_tokens: usize,
    },
    #[error("Could not decode snapshot: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("`block_size` must be non-zero.")]
    ZeroBlockSize,
    #[error("`num_blocks` must be non-zero.")]
    ZeroBlocks,
    #[error("Could not read cache config: {0}")]
    Read(#[from] std::io::Error),
    #[error("Could not parse cache config: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BlockError>;
