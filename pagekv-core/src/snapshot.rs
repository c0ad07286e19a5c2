//! Compact sequence state for scheduler-to-worker transfer.
//!
//! Before any token has been generated the snapshot carries the whole token
//! list. Afterwards it carries only the newest token: the receiver already
//! holds everything earlier from previous transfers, so a running generation
//! costs a constant payload per step.

use serde::{Deserialize, Serialize};

use crate::{
    error::SnapshotError,
    sequence::{SamplingParams, Sequence, SequenceId},
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SnapshotTail {
    /// Every token of a sequence with no completion tokens yet.
    Full(Vec<u32>),
    /// The most recently generated token.
    Last(u32),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceSnapshot {
    pub num_tokens: usize,
    pub num_prompt_tokens: usize,
    pub num_cached_tokens: usize,
    pub block_table: Vec<usize>,
    pub tail: SnapshotTail,
}

impl SequenceSnapshot {
    pub fn num_completion_tokens(&self) -> usize {
        self.num_tokens.saturating_sub(self.num_prompt_tokens)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SnapshotError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SnapshotError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Check that the decoded fields agree with each other for a receiver
    /// using `block_size`-token blocks.
    pub fn validate(&self, block_size: usize) -> Result<(), SnapshotError> {
        let num_tokens = self.num_tokens;
        if self.num_prompt_tokens > num_tokens {
            return Err(SnapshotError::PromptExceedsTokens {
                num_prompt_tokens: self.num_prompt_tokens,
                num_tokens,
            });
        }
        if self.num_cached_tokens > num_tokens || self.num_cached_tokens % block_size != 0 {
            return Err(SnapshotError::InvalidCachedTokens {
                num_cached_tokens: self.num_cached_tokens,
                num_tokens,
                block_size,
            });
        }
        let num_completion_tokens = num_tokens - self.num_prompt_tokens;
        // A full token list is sent exactly while nothing has been generated.
        let full = matches!(self.tail, SnapshotTail::Full(_));
        if full != (num_completion_tokens == 0) {
            return Err(SnapshotError::TailMismatch {
                num_completion_tokens,
                tail: if full { "full" } else { "last-token" },
            });
        }
        let max = num_tokens.div_ceil(block_size);
        if self.block_table.len() > max {
            return Err(SnapshotError::BlockTableTooLong {
                got: self.block_table.len(),
                max,
                num_tokens,
            });
        }
        Ok(())
    }
}

impl Sequence {
    pub fn snapshot(&self) -> SequenceSnapshot {
        let tail = match (self.num_completion_tokens(), self.last_token()) {
            (0, _) | (_, None) => SnapshotTail::Full(self.token_ids.clone()),
            (_, Some(last)) => SnapshotTail::Last(last),
        };
        SequenceSnapshot {
            num_tokens: self.num_tokens(),
            num_prompt_tokens: self.num_prompt_tokens,
            num_cached_tokens: self.num_cached_tokens,
            block_table: self.block_table.clone(),
            tail,
        }
    }

    /// Build a receiver-side sequence from a first transfer. Only a snapshot
    /// carrying the full token list can seed a fresh receiver.
    pub fn from_snapshot(
        id: SequenceId,
        block_size: usize,
        snapshot: SequenceSnapshot,
    ) -> Result<Self, SnapshotError> {
        let mut seq = Sequence::with_id(id, Vec::new(), block_size, SamplingParams::default());
        snapshot.validate(block_size)?;
        match snapshot.tail {
            SnapshotTail::Full(_) => {
                seq.apply_snapshot(snapshot)?;
                Ok(seq)
            }
            SnapshotTail::Last(_) => Err(SnapshotError::MissingHistory),
        }
    }

    /// Bring a receiver-side sequence up to date with a newer snapshot.
    /// Nothing changes unless the whole snapshot is accepted.
    pub fn apply_snapshot(&mut self, snapshot: SequenceSnapshot) -> Result<(), SnapshotError> {
        snapshot.validate(self.block_size())?;
        let SequenceSnapshot {
            num_tokens,
            num_prompt_tokens,
            num_cached_tokens,
            block_table,
            tail,
        } = snapshot;

        match tail {
            SnapshotTail::Full(tokens) => {
                if tokens.len() != num_tokens {
                    return Err(SnapshotError::LengthMismatch {
                        expected: num_tokens,
                        got: tokens.len(),
                    });
                }
                self.token_ids = tokens;
            }
            SnapshotTail::Last(token) => {
                if self.token_ids.is_empty() {
                    return Err(SnapshotError::MissingHistory);
                }
                if self.token_ids.len() + 1 != num_tokens {
                    return Err(SnapshotError::NonContiguous {
                        held: self.token_ids.len(),
                        num_tokens,
                    });
                }
                self.token_ids.push(token);
            }
        }
        self.num_prompt_tokens = num_prompt_tokens;
        self.num_cached_tokens = num_cached_tokens;
        self.block_table = block_table;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(tokens: Vec<u32>) -> Sequence {
        Sequence::with_id(SequenceId::new(3), tokens, 4, SamplingParams::default())
    }

    #[test]
    fn test_prompt_only_carries_full_list() {
        let mut s = seq(vec![1, 2, 3, 4, 5]);
        s.block_table = vec![0, 1];
        let snap = s.snapshot();
        assert_eq!(snap.tail, SnapshotTail::Full(vec![1, 2, 3, 4, 5]));
        assert_eq!(snap.num_tokens, 5);
        assert_eq!(snap.block_table, vec![0, 1]);
    }

    #[test]
    fn test_generation_carries_last_token() {
        let mut s = seq(vec![1, 2, 3]);
        s.append_token(9);
        let snap = s.snapshot();
        assert_eq!(snap.tail, SnapshotTail::Last(9));
        assert_eq!(snap.num_completion_tokens(), 1);
    }

    #[test]
    fn test_untagged_tail_encoding() {
        let mut s = seq(vec![1, 2]);
        let json = String::from_utf8(s.snapshot().to_bytes().unwrap()).unwrap();
        assert!(json.contains(r#""tail":[1,2]"#));
        s.append_token(5);
        let json = String::from_utf8(s.snapshot().to_bytes().unwrap()).unwrap();
        assert!(json.contains(r#""tail":5"#));
    }

    #[test]
    fn test_payload_constant_during_generation() {
        let mut s = seq((0..512).collect());
        s.append_token(1);
        let first = s.snapshot().to_bytes().unwrap().len();
        for _ in 0..100 {
            s.append_token(1);
        }
        let later = s.snapshot().to_bytes().unwrap().len();
        // Only the token counters grow, by a few digits at most.
        assert!(later <= first + 4);
    }

    #[test]
    fn test_from_snapshot_requires_history() {
        let mut s = seq(vec![1, 2]);
        s.append_token(3);
        let err = Sequence::from_snapshot(SequenceId::new(3), 4, s.snapshot()).unwrap_err();
        assert!(matches!(err, SnapshotError::MissingHistory));
    }

    #[test]
    fn test_apply_rejects_gap() {
        let s = seq(vec![1, 2]);
        let mut receiver = Sequence::from_snapshot(s.id(), 4, s.snapshot()).unwrap();

        let mut sender = s.clone();
        sender.append_token(3);
        sender.append_token(4);
        let err = receiver.apply_snapshot(sender.snapshot()).unwrap_err();
        assert!(matches!(
            err,
            SnapshotError::NonContiguous {
                held: 2,
                num_tokens: 4
            }
        ));
    }

    #[test]
    fn test_full_tail_length_checked() {
        let snap = SequenceSnapshot {
            num_tokens: 3,
            num_prompt_tokens: 3,
            num_cached_tokens: 0,
            block_table: vec![0],
            tail: SnapshotTail::Full(vec![1, 2]),
        };
        let err = Sequence::from_snapshot(SequenceId::new(0), 4, snap).unwrap_err();
        assert!(matches!(
            err,
            SnapshotError::LengthMismatch {
                expected: 3,
                got: 2
            }
        ));
    }

    fn full_snapshot(tokens: Vec<u32>) -> SequenceSnapshot {
        SequenceSnapshot {
            num_tokens: tokens.len(),
            num_prompt_tokens: tokens.len(),
            num_cached_tokens: 0,
            block_table: Vec::new(),
            tail: SnapshotTail::Full(tokens),
        }
    }

    #[test]
    fn test_rejects_prompt_longer_than_sequence() {
        let snap = SequenceSnapshot {
            num_prompt_tokens: 5,
            ..full_snapshot((1..=2).collect())
        };
        let err = Sequence::from_snapshot(SequenceId::new(0), 4, snap).unwrap_err();
        assert!(matches!(
            err,
            SnapshotError::PromptExceedsTokens {
                num_prompt_tokens: 5,
                num_tokens: 2
            }
        ));
    }

    #[test]
    fn test_rejects_cached_tokens_past_end() {
        let snap = SequenceSnapshot {
            num_cached_tokens: 8,
            ..full_snapshot((1..=6).collect())
        };
        let err = Sequence::from_snapshot(SequenceId::new(0), 4, snap).unwrap_err();
        assert!(matches!(
            err,
            SnapshotError::InvalidCachedTokens {
                num_cached_tokens: 8,
                ..
            }
        ));
    }

    #[test]
    fn test_rejects_partial_block_of_cached_tokens() {
        let snap = SequenceSnapshot {
            num_cached_tokens: 3,
            ..full_snapshot((1..=6).collect())
        };
        let err = Sequence::from_snapshot(SequenceId::new(0), 4, snap).unwrap_err();
        assert!(matches!(
            err,
            SnapshotError::InvalidCachedTokens {
                num_cached_tokens: 3,
                block_size: 4,
                ..
            }
        ));
    }

    #[test]
    fn test_rejects_last_tail_without_completion() {
        let mut receiver = seq(vec![1, 2]);
        let snap = SequenceSnapshot {
            num_tokens: 3,
            num_prompt_tokens: 3,
            num_cached_tokens: 0,
            block_table: vec![0],
            tail: SnapshotTail::Last(3),
        };
        let err = receiver.apply_snapshot(snap).unwrap_err();
        assert!(matches!(
            err,
            SnapshotError::TailMismatch {
                num_completion_tokens: 0,
                tail: "last-token"
            }
        ));
        assert_eq!(receiver.token_ids(), &[1, 2]);
        assert_eq!(receiver.num_prompt_tokens(), 2);
    }

    #[test]
    fn test_rejects_full_tail_with_completion() {
        let snap = SequenceSnapshot {
            num_prompt_tokens: 2,
            ..full_snapshot((1..=3).collect())
        };
        let err = Sequence::from_snapshot(SequenceId::new(0), 4, snap).unwrap_err();
        assert!(matches!(
            err,
            SnapshotError::TailMismatch {
                num_completion_tokens: 1,
                tail: "full"
            }
        ));
    }

    #[test]
    fn test_rejects_oversized_block_table() {
        let snap = SequenceSnapshot {
            block_table: vec![0, 1, 2],
            ..full_snapshot((1..=5).collect())
        };
        let err = Sequence::from_snapshot(SequenceId::new(0), 4, snap).unwrap_err();
        assert!(matches!(
            err,
            SnapshotError::BlockTableTooLong { got: 3, max: 2, .. }
        ));
    }

    #[test]
    fn test_rejected_delta_leaves_receiver_untouched() {
        let mut sender = seq(vec![1, 2, 3, 4]);
        sender.block_table = vec![0];
        let mut receiver = Sequence::from_snapshot(sender.id(), 4, sender.snapshot()).unwrap();

        sender.append_token(5);
        let mut snap = sender.snapshot();
        snap.num_cached_tokens = 2;
        assert!(receiver.apply_snapshot(snap).is_err());
        assert_eq!(receiver.token_ids(), &[1, 2, 3, 4]);
        assert_eq!(receiver.block_table(), &[0]);
        assert_eq!(receiver.num_completion_tokens(), 0);
    }

    #[test]
    fn test_decode_error() {
        assert!(matches!(
            SequenceSnapshot::from_bytes(b"not json"),
            Err(SnapshotError::Decode(_))
        ));
    }
}
