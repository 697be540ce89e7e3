//! Automation trigger: polls the close predicate and performs upkeep.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::oracle::RandomnessOracle;
use crate::payout::Payout;
use crate::service::RaffleService;

/// Poll forever, closing rounds as soon as they are due.
pub async fn run_keeper<O, P>(service: Arc<RaffleService<O, P>>, poll_interval: Duration)
where
    O: RandomnessOracle,
    P: Payout,
{
    info!(poll_interval = ?poll_interval, "Keeper started");

    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        poll_once(&service).await;
    }
}

/// One keeper tick. Returns the request id when a round was closed.
pub async fn poll_once<O, P>(service: &RaffleService<O, P>) -> Option<u64>
where
    O: RandomnessOracle,
    P: Payout,
{
    let check = service.check_upkeep().await;
    if !check.upkeep_needed() {
        debug!(?check, "Upkeep not needed");
        return None;
    }

    // State may have moved since the check; perform_upkeep re-validates.
    match service.perform_upkeep().await {
        Ok(event) => Some(event.request_id),
        Err(e) => {
            warn!(reason = %e, "Keeper upkeep failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::metrics::Metrics;
    use crate::oracle::{LocalVrfOracle, PendingRandomness};
    use crate::payout::LedgerPayout;
    use crate::raffle::Raffle;
    use crate::state::{RaffleConfig, RafflePhase};
    use solana_sdk::pubkey::Pubkey;

    fn service(
        clock: Arc<ManualClock>,
    ) -> (
        RaffleService<LocalVrfOracle, LedgerPayout>,
        tokio::sync::mpsc::Receiver<PendingRandomness>,
    ) {
        let config = RaffleConfig {
            entrance_fee: 10,
            interval: 30,
            key_hash: [0u8; 32],
            subscription_id: 1,
            callback_compute_limit: 500_000,
            request_confirmations: 0,
            recovery_timeout: None,
        };
        let (oracle, rx) = LocalVrfOracle::new(1, 1, clock.clone(), 4);
        let service = RaffleService::new(
            Raffle::new(config, clock.now()),
            oracle,
            LedgerPayout::new(),
            clock,
            Arc::new(Metrics::new()),
        );
        (service, rx)
    }

    #[tokio::test]
    async fn closes_only_when_due() {
        let clock = Arc::new(ManualClock::new(100));
        let (service, mut requests) = service(clock.clone());

        assert_eq!(poll_once(&service).await, None);

        service.enter(Pubkey::new_unique(), 10).await.unwrap();
        assert_eq!(poll_once(&service).await, None);

        clock.advance(30);
        assert_eq!(poll_once(&service).await, Some(1));
        assert_eq!(service.snapshot().await.phase, RafflePhase::Closing);

        // Already closing: nothing more to do.
        clock.advance(30);
        assert_eq!(poll_once(&service).await, None);
        assert_eq!(service.snapshot().await.pending_request_id, Some(1));
        assert_eq!(requests.try_recv().unwrap().request_id, 1);
        assert!(requests.try_recv().is_err());
    }
}
