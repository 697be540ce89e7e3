//! Randomness oracle client interface.
//!
//! A round close issues one [`RandomnessRequest`] through
//! [`RandomnessOracle::request_random_words`] and gets back a request id
//! immediately. The answer arrives later, on its own schedule, as a call to
//! `fulfill_random_words(request_id, random_words)` on the raffle.

use thiserror::Error;

pub mod local;
pub mod vrf;

pub use local::{
    run_fulfiller, FulfillerSettings, FulfillmentDelivery, LocalVrfOracle, PendingRandomness,
};

/// A single 32-byte random word as delivered by the oracle.
pub type RandomWord = [u8; 32];

/// Parameters of one randomness request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RandomnessRequest {
    /// Routing key selecting the oracle's proving key.
    pub key_hash: [u8; 32],
    /// Subscription billed for the request.
    pub subscription_id: u64,
    /// Confirmations to wait before answering.
    pub request_confirmations: u16,
    /// Compute budget for the fulfillment callback.
    pub callback_compute_limit: u32,
    pub num_words: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OracleError {
    #[error("unknown subscription {0}")]
    UnknownSubscription(u64),
    #[error("num_words {requested} outside 1..={max}")]
    InvalidNumWords { requested: u32, max: u32 },
    /// The oracle cannot take more requests right now.
    #[error("oracle unavailable")]
    Unavailable,
}

/// Client side of the randomness oracle.
pub trait RandomnessOracle: Send + Sync {
    /// Submit a request and return its id without waiting for the answer.
    fn request_random_words(&self, request: &RandomnessRequest) -> Result<u64, OracleError>;
}

/// Build a word whose integer value is `value`.
pub fn word_from_u64(value: u64) -> RandomWord {
    let mut word = [0u8; 32];
    word[..8].copy_from_slice(&value.to_le_bytes());
    word
}

/// Reduce a word, read as a little-endian 256-bit integer, modulo `modulus`.
///
/// All 32 bytes contribute, so there is no truncation bias beyond the
/// inherent `2^256 mod n` one. `modulus` must be non-zero.
pub fn reduce_word(word: &RandomWord, modulus: u64) -> u64 {
    debug_assert!(modulus > 0, "modulus must be non-zero");
    let modulus = modulus as u128;
    word.iter()
        .rev()
        .fold(0u128, |acc, &byte| ((acc << 8) | byte as u128) % modulus) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_words_reduce_like_integers() {
        assert_eq!(reduce_word(&word_from_u64(37), 4), 1);
        assert_eq!(reduce_word(&word_from_u64(2), 4), 2);
        assert_eq!(reduce_word(&word_from_u64(0), 3), 0);
        assert_eq!(reduce_word(&word_from_u64(u64::MAX), 10), u64::MAX % 10);
    }

    #[test]
    fn high_bytes_take_part_in_reduction() {
        // 2^64 mod 3 == 1
        let mut word = [0u8; 32];
        word[8] = 1;
        assert_eq!(reduce_word(&word, 3), 1);

        // 2^248 mod 5 == 1 (2^4 == 1 mod 5, 248 divisible by 4)
        let mut word = [0u8; 32];
        word[31] = 1;
        assert_eq!(reduce_word(&word, 5), 1);
    }

    #[test]
    fn modulus_one_always_selects_zero() {
        assert_eq!(reduce_word(&[0xff; 32], 1), 0);
    }
}
