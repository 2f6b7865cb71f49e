//! Producer fence table: duplicate, zombie, and gap detection.
//!
//! Per stream, each producer id maps to its last accepted
//! `(epoch, seq, offset, payload hash)`. The check runs under the stream's
//! writer lock, which is what makes it race-free.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::xxh64;

use crate::error::EngineError;

/// Idempotent-producer identity attached to an append request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProducerClaims {
    pub id: String,
    pub epoch: u64,
    pub seq: u64,
}

/// Persisted fence state for one producer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FenceEntry {
    pub epoch: u64,
    pub last_seq: u64,
    /// Encoded offset token of the last committed append.
    pub last_offset: String,
    pub last_hash: u64,
    /// Unix millis of the last accepted or replayed append.
    pub touched_at: i64,
}

/// Result of a fence check that did not reject.
#[derive(Debug, PartialEq, Eq)]
pub enum FenceOutcome {
    /// Fresh write; the caller commits an updated entry with the batch.
    Accept,
    /// Byte-identical replay; return the recorded offset without writing.
    Duplicate { offset: String },
}

/// Payload hash for duplicate detection. Salted per stream; a collision only
/// weakens duplicate detection, it is not a security property.
pub fn payload_hash(salt: u64, payload: &[u8]) -> u64 {
    xxh64(payload, salt)
}

/// Run the fence check for one append request.
///
/// Entries idle past `ttl` are treated as absent: a producer reappearing
/// after the retention window starts over (and is expected to carry a fresh
/// epoch).
pub fn check(
    entry: Option<&FenceEntry>,
    claims: &ProducerClaims,
    hash: u64,
    now_ms: i64,
    ttl: Duration,
) -> Result<FenceOutcome, EngineError> {
    let entry = match entry {
        Some(e) if !expired(e, now_ms, ttl) => e,
        _ => return Ok(FenceOutcome::Accept),
    };

    if claims.epoch < entry.epoch {
        return Err(EngineError::StaleEpoch {
            current_epoch: entry.epoch,
        });
    }
    if claims.epoch > entry.epoch {
        // New generation; sequence tracking restarts at whatever it sends.
        return Ok(FenceOutcome::Accept);
    }

    if claims.seq == entry.last_seq {
        if hash == entry.last_hash {
            return Ok(FenceOutcome::Duplicate {
                offset: entry.last_offset.clone(),
            });
        }
        return Err(EngineError::SequenceConflict {
            message: format!(
                "different payload for already-committed seq {}",
                claims.seq
            ),
        });
    }
    if claims.seq == entry.last_seq + 1 {
        return Ok(FenceOutcome::Accept);
    }
    if claims.seq < entry.last_seq {
        // Only the newest (seq, hash, offset) is retained, so older seqs
        // cannot be verified as replays.
        return Err(EngineError::SequenceConflict {
            message: format!(
                "seq {} is below last committed seq {}",
                claims.seq, entry.last_seq
            ),
        });
    }
    Err(EngineError::SequenceGap {
        expected: entry.last_seq + 1,
        received: claims.seq,
    })
}

fn expired(entry: &FenceEntry, now_ms: i64, ttl: Duration) -> bool {
    let age = now_ms.saturating_sub(entry.touched_at);
    age > ttl.as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

    fn claims(epoch: u64, seq: u64) -> ProducerClaims {
        ProducerClaims {
            id: "p".to_string(),
            epoch,
            seq,
        }
    }

    fn entry(epoch: u64, last_seq: u64, last_hash: u64) -> FenceEntry {
        FenceEntry {
            epoch,
            last_seq,
            last_offset: "0000000000000000_0000000000000001".to_string(),
            last_hash,
            touched_at: 1_000,
        }
    }

    #[test]
    fn first_seen_producer_accepted_at_any_seq() {
        let out = check(None, &claims(1, 7), 99, 2_000, TTL).unwrap();
        assert_eq!(out, FenceOutcome::Accept);
    }

    #[test]
    fn identical_replay_is_duplicate_success() {
        let e = entry(1, 0, 42);
        let out = check(Some(&e), &claims(1, 0), 42, 2_000, TTL).unwrap();
        assert_eq!(
            out,
            FenceOutcome::Duplicate {
                offset: e.last_offset.clone()
            }
        );
    }

    #[test]
    fn same_seq_different_payload_is_conflict() {
        let e = entry(1, 0, 42);
        let err = check(Some(&e), &claims(1, 0), 43, 2_000, TTL).unwrap_err();
        assert!(matches!(err, EngineError::SequenceConflict { .. }));
    }

    #[test]
    fn next_seq_accepted() {
        let e = entry(1, 0, 42);
        let out = check(Some(&e), &claims(1, 1), 7, 2_000, TTL).unwrap();
        assert_eq!(out, FenceOutcome::Accept);
    }

    #[test]
    fn gap_reports_expected_and_received() {
        let e = entry(1, 1, 42);
        let err = check(Some(&e), &claims(1, 3), 7, 2_000, TTL).unwrap_err();
        match err {
            EngineError::SequenceGap { expected, received } => {
                assert_eq!(expected, 2);
                assert_eq!(received, 3);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn older_seq_rejected() {
        let e = entry(1, 5, 42);
        let err = check(Some(&e), &claims(1, 3), 7, 2_000, TTL).unwrap_err();
        assert!(matches!(err, EngineError::SequenceConflict { .. }));
    }

    #[test]
    fn stale_epoch_fenced_with_current() {
        let e = entry(2, 0, 42);
        let err = check(Some(&e), &claims(1, 2), 7, 2_000, TTL).unwrap_err();
        match err {
            EngineError::StaleEpoch { current_epoch } => assert_eq!(current_epoch, 2),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn higher_epoch_resets_tracking() {
        let e = entry(1, 9, 42);
        let out = check(Some(&e), &claims(2, 0), 7, 2_000, TTL).unwrap();
        assert_eq!(out, FenceOutcome::Accept);
    }

    #[test]
    fn idle_entry_past_ttl_is_forgotten() {
        let mut e = entry(3, 9, 42);
        e.touched_at = 0;
        let now = TTL.as_millis() as i64 + 1_000;
        // Even a stale epoch is accepted once the entry has aged out.
        let out = check(Some(&e), &claims(1, 0), 7, now, TTL).unwrap();
        assert_eq!(out, FenceOutcome::Accept);
    }

    #[test]
    fn payload_hash_is_salted() {
        assert_ne!(payload_hash(1, b"same"), payload_hash(2, b"same"));
        assert_eq!(payload_hash(1, b"same"), payload_hash(1, b"same"));
    }
}
