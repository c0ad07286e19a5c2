use std::{
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SequenceId(usize);

impl SequenceId {
    pub fn new(id: usize) -> Self {
        Self(id)
    }

    pub fn get(&self) -> usize {
        self.0
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out monotonically increasing sequence ids. Owned by the scheduler
/// context and cloned into whatever builds sequences.
#[derive(Clone, Debug, Default)]
pub struct SequenceIdAllocator {
    next: Arc<AtomicUsize>,
}

impl SequenceIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(first: usize) -> Self {
        Self {
            next: Arc::new(AtomicUsize::new(first)),
        }
    }

    pub fn next_id(&self) -> SequenceId {
        SequenceId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequenceStatus {
    Waiting,
    Running,
    Finished,
}

/// Sampling settings carried for the model runner. The block manager never
/// looks at them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    pub temperature: f32,
    pub max_tokens: usize,
    pub ignore_eos: bool,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            max_tokens: 64,
            ignore_eos: false,
        }
    }
}

/// A request's token stream plus its logical-to-physical block table.
#[derive(Clone, Debug)]
pub struct Sequence {
    id: SequenceId,
    status: SequenceStatus,
    pub(crate) token_ids: Vec<u32>,
    pub(crate) num_prompt_tokens: usize,
    pub(crate) num_cached_tokens: usize,
    pub(crate) block_table: Vec<usize>,
    block_size: usize,
    sampling_params: SamplingParams,
}

impl Sequence {
    pub fn new(
        ids: &SequenceIdAllocator,
        token_ids: Vec<u32>,
        block_size: usize,
        sampling_params: SamplingParams,
    ) -> Self {
        Self::with_id(ids.next_id(), token_ids, block_size, sampling_params)
    }

    pub fn with_id(
        id: SequenceId,
        token_ids: Vec<u32>,
        block_size: usize,
        sampling_params: SamplingParams,
    ) -> Self {
        assert!(block_size > 0, "Block size must be non-zero");
        Self {
            id,
            status: SequenceStatus::Waiting,
            num_prompt_tokens: token_ids.len(),
            token_ids,
            num_cached_tokens: 0,
            block_table: Vec::new(),
            block_size,
            sampling_params,
        }
    }

    pub fn id(&self) -> SequenceId {
        self.id
    }

    pub fn status(&self) -> SequenceStatus {
        self.status
    }

    pub fn set_status(&mut self, status: SequenceStatus) {
        self.status = status;
    }

    pub fn is_finished(&self) -> bool {
        self.status == SequenceStatus::Finished
    }

    pub fn is_running(&self) -> bool {
        self.status == SequenceStatus::Running
    }

    pub fn is_waiting(&self) -> bool {
        self.status == SequenceStatus::Waiting
    }

    pub fn sampling_params(&self) -> &SamplingParams {
        &self.sampling_params
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn len(&self) -> usize {
        self.token_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.token_ids.is_empty()
    }

    pub fn num_tokens(&self) -> usize {
        self.token_ids.len()
    }

    pub fn num_prompt_tokens(&self) -> usize {
        self.num_prompt_tokens
    }

    pub fn num_completion_tokens(&self) -> usize {
        self.num_tokens() - self.num_prompt_tokens
    }

    pub fn num_cached_tokens(&self) -> usize {
        self.num_cached_tokens
    }

    pub fn num_cached_blocks(&self) -> usize {
        self.num_cached_tokens / self.block_size
    }

    pub fn token_ids(&self) -> &[u32] {
        &self.token_ids
    }

    pub fn prompt_token_ids(&self) -> &[u32] {
        &self.token_ids[..self.num_prompt_tokens]
    }

    pub fn completion_token_ids(&self) -> &[u32] {
        &self.token_ids[self.num_prompt_tokens..]
    }

    pub fn last_token(&self) -> Option<u32> {
        self.token_ids.last().copied()
    }

    pub fn block_table(&self) -> &[usize] {
        &self.block_table
    }

    /// Number of logical blocks: `ceil(num_tokens / block_size)`.
    pub fn num_blocks(&self) -> usize {
        self.num_tokens().div_ceil(self.block_size)
    }

    /// Tokens held by the last logical block (0 for an empty sequence).
    pub fn last_block_num_tokens(&self) -> usize {
        match self.num_blocks() {
            0 => 0,
            n => self.num_tokens() - (n - 1) * self.block_size,
        }
    }

    /// Token content of logical block `i`.
    pub fn block(&self, i: usize) -> &[u32] {
        assert!(
            i < self.num_blocks(),
            "Logical block {i} out of range for {} blocks",
            self.num_blocks()
        );
        let start = i * self.block_size;
        let end = (start + self.block_size).min(self.num_tokens());
        &self.token_ids[start..end]
    }

    /// The newest token opened a new logical block.
    pub(crate) fn last_token_opens_block(&self) -> bool {
        !self.is_empty() && (self.num_tokens() - 1) % self.block_size == 0
    }

    /// The newest token filled its logical block.
    pub(crate) fn last_token_fills_block(&self) -> bool {
        !self.is_empty() && self.num_tokens() % self.block_size == 0
    }

    pub fn append_token(&mut self, token_id: u32) {
        self.token_ids.push(token_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(tokens: Vec<u32>, block_size: usize) -> Sequence {
        Sequence::with_id(
            SequenceId::new(0),
            tokens,
            block_size,
            SamplingParams::default(),
        )
    }

    #[test]
    fn test_ids_are_monotonic() {
        let ids = SequenceIdAllocator::new();
        let handle = ids.clone();
        let a = Sequence::new(&ids, vec![1], 4, SamplingParams::default());
        let b = Sequence::new(&handle, vec![1], 4, SamplingParams::default());
        assert_eq!(a.id().get(), 0);
        assert_eq!(b.id().get(), 1);
        assert_eq!(SequenceIdAllocator::starting_at(10).next_id().get(), 10);
    }

    #[test]
    fn test_block_geometry() {
        let s = seq((1..=10).collect(), 4);
        assert_eq!(s.num_blocks(), 3);
        assert_eq!(s.block(0), &[1, 2, 3, 4]);
        assert_eq!(s.block(2), &[9, 10]);
        assert_eq!(s.last_block_num_tokens(), 2);

        let full = seq((1..=8).collect(), 4);
        assert_eq!(full.num_blocks(), 2);
        assert_eq!(full.last_block_num_tokens(), 4);

        let empty = seq(Vec::new(), 4);
        assert_eq!(empty.num_blocks(), 0);
        assert_eq!(empty.last_block_num_tokens(), 0);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_block_out_of_range() {
        seq(vec![1, 2], 4).block(1);
    }

    #[test]
    fn test_append_and_completion_counts() {
        let mut s = seq(vec![1, 2, 3], 4);
        assert_eq!(s.num_completion_tokens(), 0);
        s.append_token(7);
        s.append_token(8);
        assert_eq!(s.num_tokens(), 5);
        assert_eq!(s.num_prompt_tokens(), 3);
        assert_eq!(s.num_completion_tokens(), 2);
        assert_eq!(s.prompt_token_ids(), &[1, 2, 3]);
        assert_eq!(s.completion_token_ids(), &[7, 8]);
        assert_eq!(s.last_token(), Some(8));
    }

    #[test]
    fn test_block_boundaries() {
        let mut s = seq(vec![1, 2, 3], 4);
        assert!(!s.last_token_opens_block());
        assert!(!s.last_token_fills_block());
        s.append_token(4);
        assert!(s.last_token_fills_block());
        s.append_token(5);
        assert!(s.last_token_opens_block());

        // With one token per block every token both opens and fills a block.
        let single = seq(vec![1], 1);
        assert!(single.last_token_opens_block());
        assert!(single.last_token_fills_block());
    }

    #[test]
    fn test_status_transitions() {
        let mut s = seq(vec![1], 4);
        assert!(s.is_waiting());
        s.set_status(SequenceStatus::Running);
        assert!(s.is_running());
        s.set_status(SequenceStatus::Finished);
        assert!(s.is_finished());
    }

    #[test]
    fn test_sampling_params_defaults() {
        let p: SamplingParams = serde_json::from_str(r#"{"max_tokens": 8}"#).unwrap();
        assert_eq!(p.max_tokens, 8);
        assert!((p.temperature - 1.0).abs() < f32::EPSILON);
        assert!(!p.ignore_eos);
    }
}
