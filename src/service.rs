//! Shared, lock-protected raffle.
//!
//! [`RaffleService`] puts the [`Raffle`] behind one `tokio::sync::Mutex`
//! covering every operation, supplies the clock, publishes events to
//! observers and keeps the metrics. The lock is held across the payout in
//! `fulfill_random_words`, so no entry or upkeep can interleave with a
//! settlement in progress.

use std::sync::Arc;

use solana_sdk::pubkey::Pubkey;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::RaffleError;
use crate::events::{
    EntryAccepted, RaffleEvent, RandomnessRequested, RequestRecovered, WinnerPicked,
};
use crate::metrics::Metrics;
use crate::oracle::{FulfillmentDelivery, RandomWord, RandomnessOracle};
use crate::payout::Payout;
use crate::raffle::{Raffle, UpkeepCheck};
use crate::state::{Participant, RaffleSnapshot};

/// Capacity of the event broadcast channel. Slow observers lag, they never block the raffle.
const EVENT_CHANNEL_CAPACITY: usize = 256;

pub struct RaffleService<O, P> {
    raffle: Mutex<Raffle>,
    oracle: O,
    payout: P,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<RaffleEvent>,
    metrics: Arc<Metrics>,
}

impl<O: RandomnessOracle, P: Payout> RaffleService<O, P> {
    pub fn new(
        raffle: Raffle,
        oracle: O,
        payout: P,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            raffle: Mutex::new(raffle),
            oracle,
            payout,
            clock,
            events,
            metrics,
        }
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RaffleEvent> {
        self.events.subscribe()
    }

    pub fn payout(&self) -> &P {
        &self.payout
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub async fn enter(&self, player: Pubkey, amount: u64) -> Result<EntryAccepted, RaffleError> {
        let result = self.raffle.lock().await.enter(player, amount);
        self.metrics.record_entry(result.is_ok());

        match &result {
            Ok(event) => {
                info!(player = %player, amount, round = event.round, "Entry accepted");
                self.publish(event.clone());
            }
            Err(e) => debug!(player = %player, amount, reason = %e, "Entry rejected"),
        }
        result
    }

    pub async fn check_upkeep(&self) -> UpkeepCheck {
        self.raffle.lock().await.check_upkeep(self.clock.now())
    }

    pub async fn perform_upkeep(&self) -> Result<RandomnessRequested, RaffleError> {
        let result = {
            let mut raffle = self.raffle.lock().await;
            raffle.perform_upkeep(&self.oracle, self.clock.now())
        };
        self.metrics.record_upkeep(result.is_ok());

        match &result {
            Ok(event) => {
                info!(request_id = event.request_id, round = event.round, "Randomness requested");
                self.publish(event.clone());
            }
            Err(e) => warn!(reason = %e, "Upkeep rejected"),
        }
        result
    }

    /// Route the oracle's answer into the raffle.
    pub async fn fulfill_random_words(
        &self,
        request_id: u64,
        random_words: &[RandomWord],
    ) -> Result<WinnerPicked, RaffleError> {
        let (result, requested_at) = {
            let mut raffle = self.raffle.lock().await;
            let requested_at = raffle.pending_request().map(|p| p.requested_at);
            let now = self.clock.now();
            let result = raffle
                .fulfill_random_words(&self.payout, request_id, random_words, now)
                .await;
            (result.map(|event| (event, now)), requested_at)
        };

        match result {
            Ok((event, settled_at)) => {
                let latency = requested_at
                    .map(|at| settled_at.saturating_sub(at).max(0) as u64)
                    .unwrap_or(0);
                self.metrics.record_settlement(event.amount, latency);
                info!(
                    request_id,
                    winner = %event.winner,
                    amount = event.amount,
                    round = event.round,
                    receipt = %event.receipt,
                    "Winner picked"
                );
                self.publish(event.clone());
                Ok(event)
            }
            Err(e) => {
                match &e {
                    RaffleError::UnknownRequest { .. } => self.metrics.record_unknown_fulfillment(),
                    RaffleError::PayoutFailed { .. } | RaffleError::PayoutUnconfirmed { .. } => {
                        self.metrics.record_payout_failure()
                    }
                    _ => {}
                }
                warn!(request_id, reason = %e, "Fulfillment rejected");
                Err(e)
            }
        }
    }

    /// Operator escape hatch for a request the oracle never answered.
    pub async fn recover_stalled_request(&self) -> Result<RequestRecovered, RaffleError> {
        let result = self
            .raffle
            .lock()
            .await
            .recover_stalled_request(self.clock.now());

        match &result {
            Ok(event) => {
                warn!(
                    request_id = event.request_id,
                    round = event.round,
                    "Stalled request abandoned"
                );
                self.publish(event.clone());
            }
            Err(e) => info!(reason = %e, "Recovery refused"),
        }
        result
    }

    pub async fn snapshot(&self) -> RaffleSnapshot {
        self.raffle.lock().await.snapshot()
    }

    pub async fn player(&self, index: usize) -> Result<Participant, RaffleError> {
        self.raffle.lock().await.player(index)
    }

    pub async fn recent_winner(&self) -> Option<Pubkey> {
        self.raffle.lock().await.recent_winner()
    }

    fn publish(&self, event: impl Into<RaffleEvent>) {
        // No subscribers is fine.
        let _ = self.events.send(event.into());
    }
}

impl<O, P> FulfillmentDelivery for RaffleService<O, P>
where
    O: RandomnessOracle + 'static,
    P: Payout + 'static,
{
    async fn deliver(
        &self,
        request_id: u64,
        random_words: Vec<RandomWord>,
    ) -> Result<(), RaffleError> {
        self.fulfill_random_words(request_id, &random_words)
            .await
            .map(|_| ())
    }
}
