//! The raffle state machine.
//!
//! ```text
//!            enter
//!           ┌─────┐
//!           ▼     │
//!         ┌──────────┐  perform_upkeep   ┌───────────┐
//!  new ──▶│   Open   │ ────────────────▶ │  Closing  │
//!         └──────────┘ ◀──────────────── └───────────┘
//!                       fulfill_random_words
//!                       recover_stalled_request
//! ```
//!
//! [`Raffle`] owns the round ledger; its methods are the only way to change
//! it. It does no locking of its own: callers serialise access, which
//! [`crate::service::RaffleService`] does with a single mutex.

use solana_sdk::pubkey::Pubkey;

use crate::clock::UnixTimestamp;
use crate::error::RaffleError;
use crate::events::{EntryAccepted, RandomnessRequested, RequestRecovered, WinnerPicked};
use crate::oracle::{reduce_word, RandomWord, RandomnessOracle};
use crate::payout::{Payout, PayoutError};
use crate::state::{
    Participant, PendingRequest, RaffleConfig, RafflePhase, RaffleSnapshot, RoundState, NUM_WORDS,
};

/// Result of the close predicate, with each condition kept separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpkeepCheck {
    pub is_open: bool,
    pub time_passed: bool,
    pub has_balance: bool,
    pub has_players: bool,
}

impl UpkeepCheck {
    /// True only when all four conditions hold.
    pub fn upkeep_needed(&self) -> bool {
        self.is_open && self.time_passed && self.has_balance && self.has_players
    }
}

#[derive(Debug, Clone)]
pub struct Raffle {
    config: RaffleConfig,
    state: RoundState,
}

impl Raffle {
    /// Open the first round at `now`.
    pub fn new(config: RaffleConfig, now: UnixTimestamp) -> Self {
        Self {
            config,
            state: RoundState::new(now),
        }
    }

    /// Record a stake for the current round.
    ///
    /// Each call takes a new ticket slot, so a player entering twice holds
    /// two positions in the draw.
    pub fn enter(&mut self, player: Pubkey, amount: u64) -> Result<EntryAccepted, RaffleError> {
        if self.state.phase != RafflePhase::Open {
            return Err(RaffleError::RaffleNotOpen);
        }
        if amount < self.config.entrance_fee {
            return Err(RaffleError::InsufficientStake {
                amount,
                minimum: self.config.entrance_fee,
            });
        }
        let balance = self
            .state
            .accumulated_balance
            .checked_add(amount)
            .ok_or(RaffleError::BalanceOverflow)?;

        self.state.participants.push(Participant { player, amount });
        self.state.accumulated_balance = balance;

        Ok(EntryAccepted {
            player,
            amount,
            round: self.state.round,
        })
    }

    /// Evaluate whether the current round should close at `now`. No side effects.
    pub fn check_upkeep(&self, now: UnixTimestamp) -> UpkeepCheck {
        let interval = i64::try_from(self.config.interval).unwrap_or(i64::MAX);
        UpkeepCheck {
            is_open: self.state.phase == RafflePhase::Open,
            time_passed: now.saturating_sub(self.state.round_opened_at) >= interval,
            has_balance: self.state.accumulated_balance > 0,
            has_players: !self.state.participants.is_empty(),
        }
    }

    /// Close the round and request randomness.
    ///
    /// The close predicate is re-evaluated here; a trigger that polled
    /// `check_upkeep` earlier may be acting on stale state.
    pub fn perform_upkeep<O: RandomnessOracle + ?Sized>(
        &mut self,
        oracle: &O,
        now: UnixTimestamp,
    ) -> Result<RandomnessRequested, RaffleError> {
        if !self.check_upkeep(now).upkeep_needed() {
            return Err(RaffleError::UpkeepNotNeeded {
                balance: self.state.accumulated_balance,
                players: self.state.participants.len(),
                phase: self.state.phase,
            });
        }

        let request_id = oracle.request_random_words(&self.config.randomness_request())?;

        self.state.phase = RafflePhase::Closing;
        self.state.pending_request = Some(PendingRequest {
            request_id,
            requested_at: now,
        });

        Ok(RandomnessRequested {
            request_id,
            round: self.state.round,
        })
    }

    /// Consume the oracle's answer: draw the winner, pay the pot, reopen.
    ///
    /// The transfer runs before any bookkeeping. If it fails the round is
    /// left exactly as it was (closing, same pending request) and the same
    /// answer can be delivered again.
    pub async fn fulfill_random_words<P: Payout>(
        &mut self,
        payout: &P,
        request_id: u64,
        random_words: &[RandomWord],
        now: UnixTimestamp,
    ) -> Result<WinnerPicked, RaffleError> {
        match self.state.pending_request {
            Some(pending) if pending.request_id == request_id => {}
            _ => return Err(RaffleError::UnknownRequest { request_id }),
        }
        if self.state.participants.is_empty() {
            return Err(RaffleError::NoParticipants);
        }
        let word = random_words.first().ok_or(RaffleError::MissingRandomWord)?;

        let players = self.state.participants.len();
        let winner_index = reduce_word(word, players as u64) as usize;
        let winner = self.state.participants[winner_index].player;
        let amount = self.state.accumulated_balance;

        let receipt = payout
            .transfer(&winner, amount)
            .await
            .map_err(|e| match e {
                PayoutError::NotSent(reason) => RaffleError::PayoutFailed {
                    winner,
                    amount,
                    reason,
                },
                PayoutError::Unconfirmed { signature, reason } => RaffleError::PayoutUnconfirmed {
                    winner,
                    amount,
                    signature,
                    reason,
                },
            })?;

        let settled_round = self.state.round;
        self.state.participants.clear();
        self.state.accumulated_balance = 0;
        self.state.round_opened_at = now;
        self.state.pending_request = None;
        self.state.phase = RafflePhase::Open;
        self.state.recent_winner = Some(winner);
        self.state.round += 1;

        Ok(WinnerPicked {
            winner,
            amount,
            request_id,
            round: settled_round,
            receipt,
        })
    }

    /// Abandon a randomness request that has been pending for at least the
    /// configured recovery timeout.
    ///
    /// Participants, balance and the round's open time are kept; the next
    /// upkeep issues a fresh request. A late answer to the abandoned request
    /// is rejected as unknown.
    pub fn recover_stalled_request(
        &mut self,
        now: UnixTimestamp,
    ) -> Result<RequestRecovered, RaffleError> {
        let Some(pending) = self.state.pending_request else {
            return Err(RaffleError::RecoveryNotAllowed("no randomness request is pending"));
        };
        let Some(timeout) = self.config.recovery_timeout else {
            return Err(RaffleError::RecoveryNotAllowed("recovery timeout is not configured"));
        };
        let timeout = i64::try_from(timeout).unwrap_or(i64::MAX);
        if now.saturating_sub(pending.requested_at) < timeout {
            return Err(RaffleError::RecoveryNotAllowed(
                "request has not been pending for the recovery timeout",
            ));
        }

        self.state.pending_request = None;
        self.state.phase = RafflePhase::Open;

        Ok(RequestRecovered {
            request_id: pending.request_id,
            round: self.state.round,
        })
    }

    pub fn entrance_fee(&self) -> u64 {
        self.config.entrance_fee
    }

    pub fn interval(&self) -> u64 {
        self.config.interval
    }

    pub fn phase(&self) -> RafflePhase {
        self.state.phase
    }

    /// When the current round opened.
    pub fn round_opened_at(&self) -> UnixTimestamp {
        self.state.round_opened_at
    }

    pub fn accumulated_balance(&self) -> u64 {
        self.state.accumulated_balance
    }

    pub fn num_players(&self) -> usize {
        self.state.participants.len()
    }

    pub fn player(&self, index: usize) -> Result<Participant, RaffleError> {
        self.state
            .participants
            .get(index)
            .copied()
            .ok_or(RaffleError::PlayerIndexOutOfRange {
                index,
                players: self.state.participants.len(),
            })
    }

    pub fn recent_winner(&self) -> Option<Pubkey> {
        self.state.recent_winner
    }

    pub fn pending_request(&self) -> Option<PendingRequest> {
        self.state.pending_request
    }

    pub fn pending_request_id(&self) -> Option<u64> {
        self.state.pending_request.map(|p| p.request_id)
    }

    pub fn round(&self) -> u64 {
        self.state.round
    }

    pub fn num_words(&self) -> u32 {
        NUM_WORDS
    }

    pub fn request_confirmations(&self) -> u16 {
        self.config.request_confirmations
    }

    pub fn snapshot(&self) -> RaffleSnapshot {
        RaffleSnapshot {
            phase: self.state.phase,
            round: self.state.round,
            entrance_fee: self.config.entrance_fee,
            interval: self.config.interval,
            accumulated_balance: self.state.accumulated_balance,
            num_players: self.state.participants.len(),
            round_opened_at: self.state.round_opened_at,
            pending_request_id: self.pending_request_id(),
            recent_winner: self.state.recent_winner.map(|w| w.to_string()),
            num_words: NUM_WORDS,
            request_confirmations: self.config.request_confirmations,
        }
    }
}
