//! Deterministic VRF output computation for the local oracle.
//!
//! Uses HMAC-SHA256 keyed by the oracle's secret to produce a 32-byte
//! base output that is deterministic (same inputs = same output) but
//! unpredictable without the secret key, then expands it into as many
//! words as the request asked for.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use super::RandomWord;
use crate::clock::UnixTimestamp;

type HmacSha256 = Hmac<Sha256>;

/// Derive the per-request seed the oracle mixes into its output.
///
/// ```text
/// seed = SHA256(key_hash || subscription_id_le || request_id_le)
/// ```
pub fn request_seed(key_hash: &[u8; 32], subscription_id: u64, request_id: u64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(key_hash);
    hasher.update(subscription_id.to_le_bytes());
    hasher.update(request_id.to_le_bytes());
    hasher.finalize().into()
}

/// Compute the 32-byte base output for a randomness request.
///
/// ```text
/// output = HMAC-SHA256(secret, seed || requested_at_le || request_id_le)
/// ```
pub fn compute_randomness(
    hmac_secret: &[u8],
    seed: &[u8; 32],
    requested_at: UnixTimestamp,
    request_id: u64,
) -> [u8; 32] {
    let mut mac =
        HmacSha256::new_from_slice(hmac_secret).expect("HMAC accepts keys of any size");

    mac.update(seed);
    mac.update(&requested_at.to_le_bytes());
    mac.update(&request_id.to_le_bytes());

    mac.finalize().into_bytes().into()
}

/// Expand base randomness into multiple words: `word[i] = SHA256(base || i_le)`.
pub fn expand_randomness(base: &[u8; 32], num_words: u32) -> Vec<RandomWord> {
    (0..num_words)
        .map(|i| {
            let mut hasher = Sha256::new();
            hasher.update(base);
            hasher.update(i.to_le_bytes());
            let word: RandomWord = hasher.finalize().into();
            word
        })
        .collect()
}
