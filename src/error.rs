use solana_sdk::pubkey::Pubkey;
use thiserror::Error;

use crate::oracle::OracleError;
use crate::state::RafflePhase;

/// Errors returned by raffle operations.
///
/// Every variant except the two payout ones is raised before any state is
/// touched. Those are raised after the transfer, which happens before
/// bookkeeping, so they also leave the round unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RaffleError {
    /// The stake is below the configured entrance fee.
    #[error("stake of {amount} lamports is below the entrance fee of {minimum}")]
    InsufficientStake { amount: u64, minimum: u64 },
    /// Entries are only accepted while the round is open.
    #[error("raffle is not open")]
    RaffleNotOpen,
    /// The close preconditions do not hold right now.
    #[error("upkeep not needed (balance={balance}, players={players}, phase={phase})")]
    UpkeepNotNeeded {
        balance: u64,
        players: usize,
        phase: RafflePhase,
    },
    /// The fulfillment does not answer the pending request.
    #[error("request {request_id} is not the pending randomness request")]
    UnknownRequest { request_id: u64 },
    /// No one entered, so there is nobody to draw.
    #[error("no participants in the current round")]
    NoParticipants,
    /// The fulfillment carried an empty word list.
    #[error("fulfillment carried no random words")]
    MissingRandomWord,
    /// Transferring the pot to the winner failed.
    #[error("payout of {amount} lamports to {winner} failed: {reason}")]
    PayoutFailed {
        winner: Pubkey,
        amount: u64,
        reason: String,
    },
    /// A payout transaction was submitted but whether it landed is unknown.
    /// The round stays closing; the signature has to be checked by hand
    /// before the request is recovered, or the pot may be paid twice.
    #[error(
        "payout of {amount} lamports to {winner} unconfirmed (transaction {signature}): {reason}"
    )]
    PayoutUnconfirmed {
        winner: Pubkey,
        amount: u64,
        signature: String,
        reason: String,
    },
    /// The oracle refused the randomness request.
    #[error("randomness request rejected: {0}")]
    OracleRequestFailed(#[from] OracleError),
    #[error("accumulated balance overflow")]
    BalanceOverflow,
    #[error("no player at index {index} ({players} players)")]
    PlayerIndexOutOfRange { index: usize, players: usize },
    /// A stalled request cannot be abandoned yet (or recovery is disabled).
    #[error("recovery not allowed: {0}")]
    RecoveryNotAllowed(&'static str),
}

impl RaffleError {
    /// Whether repeating the same call later can succeed without anything
    /// else changing first.
    ///
    /// Only a payout known not to have happened qualifies: the round stays
    /// closing with the same pending request, so the oracle may redeliver its
    /// answer. An unconfirmed payout is not retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RaffleError::PayoutFailed { .. })
    }
}
