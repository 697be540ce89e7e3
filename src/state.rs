use serde::Serialize;
use solana_sdk::pubkey::Pubkey;
use std::fmt;

use crate::clock::UnixTimestamp;
use crate::oracle::RandomnessRequest;

/// Number of random words requested per round. The winner is drawn from the first.
pub const NUM_WORDS: u32 = 1;

/// Block confirmations the oracle waits before answering, unless configured otherwise.
pub const DEFAULT_REQUEST_CONFIRMATIONS: u16 = 3;

/// Immutable raffle parameters, fixed when the raffle is constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaffleConfig {
    /// Minimum stake (in lamports) accepted by `enter`.
    pub entrance_fee: u64,
    /// Minimum number of seconds a round stays open before it may close.
    pub interval: u64,
    /// Oracle routing key ("gas lane") selecting the proving key.
    pub key_hash: [u8; 32],
    /// Oracle subscription that pays for randomness requests.
    pub subscription_id: u64,
    /// Compute budget granted to the fulfillment callback.
    pub callback_compute_limit: u32,
    /// Confirmations the oracle waits before fulfilling.
    pub request_confirmations: u16,
    /// Seconds after which a pending request may be abandoned by an operator.
    /// `None` disables recovery entirely.
    pub recovery_timeout: Option<u64>,
}

impl RaffleConfig {
    /// The request issued to the oracle when a round closes.
    pub fn randomness_request(&self) -> RandomnessRequest {
        RandomnessRequest {
            key_hash: self.key_hash,
            subscription_id: self.subscription_id,
            request_confirmations: self.request_confirmations,
            callback_compute_limit: self.callback_compute_limit,
            num_words: NUM_WORDS,
        }
    }
}

/// Round lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RafflePhase {
    /// Accepting entries.
    Open,
    /// Closed, waiting for the oracle to deliver randomness.
    Closing,
}

impl fmt::Display for RafflePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RafflePhase::Open => f.write_str("open"),
            RafflePhase::Closing => f.write_str("closing"),
        }
    }
}

/// One accepted entry. Its position in the participant list is its ticket index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Participant {
    pub player: Pubkey,
    pub amount: u64,
}

/// The single randomness request in flight while a round is closing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRequest {
    pub request_id: u64,
    pub requested_at: UnixTimestamp,
}

/// Mutable round ledger. Only [`crate::raffle::Raffle`] mutates it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundState {
    pub(crate) phase: RafflePhase,
    pub(crate) participants: Vec<Participant>,
    pub(crate) accumulated_balance: u64,
    pub(crate) round_opened_at: UnixTimestamp,
    /// Set iff `phase == Closing`.
    pub(crate) pending_request: Option<PendingRequest>,
    pub(crate) recent_winner: Option<Pubkey>,
    /// Sequential round number, starting at 1.
    pub(crate) round: u64,
}

impl RoundState {
    pub fn new(now: UnixTimestamp) -> Self {
        Self {
            phase: RafflePhase::Open,
            participants: Vec::new(),
            accumulated_balance: 0,
            round_opened_at: now,
            pending_request: None,
            recent_winner: None,
            round: 1,
        }
    }
}

/// Read-only summary of the raffle, served by the `/status` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RaffleSnapshot {
    pub phase: RafflePhase,
    pub round: u64,
    pub entrance_fee: u64,
    pub interval: u64,
    pub accumulated_balance: u64,
    pub num_players: usize,
    pub round_opened_at: UnixTimestamp,
    pub pending_request_id: Option<u64>,
    pub recent_winner: Option<String>,
    pub num_words: u32,
    pub request_confirmations: u16,
}
