//! Proof-of-work gate that precedes any asymmetric work on the server.
//!
//! The server picks a secret target `t` in `[30000, 65536)` and publishes a
//! 100-byte challenge together with `SHA-256(challenge ‖ decimal(t))`. The
//! client recovers `t` by exhaustive search over the public domain
//! `[-1, 65537)`, so an honest client always succeeds after at most 65 538
//! hash evaluations, and the server verifies with one comparison.

use std::ops::Range;

use rand::Rng;
use sha2::{Digest, Sha256};

use crate::crypto::{random_bytes, CryptoError};
use crate::error::ProtocolError;

pub const CHALLENGE_LEN: usize = 100;

/// Range the server draws its secret target from.
pub const TARGET_RANGE: Range<i64> = 30_000..65_536;

/// Range the client searches.
pub const SEARCH_DOMAIN: Range<i64> = -1..65_537;

/// What the server sends, and what it must remember.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Puzzle {
    pub challenge: Vec<u8>,
    pub digest: [u8; 32],
    pub target: i64,
}

impl Puzzle {
    pub fn issue() -> Result<Self, CryptoError> {
        let target = rand::thread_rng().gen_range(TARGET_RANGE);
        Self::issue_with_target(target)
    }

    /// Issue a puzzle with a chosen target (fixtures and tests).
    pub fn issue_with_target(target: i64) -> Result<Self, CryptoError> {
        let challenge = random_bytes::<CHALLENGE_LEN>()?.to_vec();
        let digest = digest_for(&challenge, target);
        Ok(Self { challenge, digest, target })
    }

    pub fn verify(&self, answer: i64) -> Result<(), ProtocolError> {
        if answer == self.target {
            Ok(())
        } else {
            Err(ProtocolError::PuzzleRejected)
        }
    }
}

pub fn digest_for(challenge: &[u8], candidate: i64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(challenge);
    hasher.update(candidate.to_string().as_bytes());
    hasher.finalize().into()
}

/// Search the public domain for the candidate whose digest matches.
///
/// First match wins.
pub fn solve(challenge: &[u8], digest: &[u8; 32]) -> Result<i64, ProtocolError> {
    SEARCH_DOMAIN
        .into_iter()
        .find(|candidate| digest_for(challenge, *candidate) == *digest)
        .ok_or(ProtocolError::PuzzleUnsolvable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solve_recovers_target() {
        let puzzle = Puzzle::issue_with_target(40_000).unwrap();
        assert_eq!(solve(&puzzle.challenge, &puzzle.digest), Ok(40_000));
        assert!(puzzle.verify(40_000).is_ok());
    }

    #[test]
    fn test_solve_random_targets() {
        for _ in 0..3 {
            let puzzle = Puzzle::issue().unwrap();
            assert!(TARGET_RANGE.contains(&puzzle.target));
            let answer = solve(&puzzle.challenge, &puzzle.digest).unwrap();
            assert!(puzzle.verify(answer).is_ok());
        }
    }

    #[test]
    fn test_solve_domain_edges() {
        let challenge = [5u8; CHALLENGE_LEN];
        assert_eq!(solve(&challenge, &digest_for(&challenge, -1)), Ok(-1));
        assert_eq!(solve(&challenge, &digest_for(&challenge, 65_536)), Ok(65_536));
    }

    #[test]
    fn test_unsolvable_terminates() {
        let challenge = [1u8; CHALLENGE_LEN];
        assert_eq!(
            solve(&challenge, &digest_for(&challenge, 65_537)),
            Err(ProtocolError::PuzzleUnsolvable)
        );
        assert_eq!(solve(&challenge, &[0u8; 32]), Err(ProtocolError::PuzzleUnsolvable));
    }

    #[test]
    fn test_verify_rejects_wrong_answer() {
        let puzzle = Puzzle::issue_with_target(31_337).unwrap();
        assert_eq!(puzzle.verify(31_338), Err(ProtocolError::PuzzleRejected));
    }

    #[test]
    fn test_digest_uses_decimal_rendering() {
        let mut hasher = Sha256::new();
        hasher.update(b"abc");
        hasher.update(b"-1");
        let expected: [u8; 32] = hasher.finalize().into();
        assert_eq!(digest_for(b"abc", -1), expected);
    }
}
