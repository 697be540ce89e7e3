use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use solana_sdk::pubkey::Pubkey;

use raffle_keeper::clock::{Clock, ManualClock};
use raffle_keeper::events::RaffleEvent;
use raffle_keeper::keeper::poll_once;
use raffle_keeper::metrics::Metrics;
use raffle_keeper::oracle::vrf::{compute_randomness, expand_randomness, request_seed};
use raffle_keeper::oracle::{
    reduce_word, run_fulfiller, word_from_u64, FulfillerSettings, LocalVrfOracle, OracleError,
    RandomnessOracle, RandomnessRequest,
};
use raffle_keeper::payout::LedgerPayout;
use raffle_keeper::{Raffle, RaffleConfig, RaffleError, RafflePhase, RaffleService};

const FEE: u64 = 10;
const INTERVAL: u64 = 30;
const START: i64 = 1_700_000_000;
const KEY_HASH: [u8; 32] = [0x79; 32];
const SUBSCRIPTION_ID: u64 = 6926;

fn config() -> RaffleConfig {
    RaffleConfig {
        entrance_fee: FEE,
        interval: INTERVAL,
        key_hash: KEY_HASH,
        subscription_id: SUBSCRIPTION_ID,
        callback_compute_limit: 500_000,
        request_confirmations: 0,
        recovery_timeout: None,
    }
}

/// Oracle stand-in whose answers the test delivers by hand.
struct ManualOracle(AtomicU64);

impl RandomnessOracle for ManualOracle {
    fn request_random_words(&self, _request: &RandomnessRequest) -> Result<u64, OracleError> {
        Ok(self.0.fetch_add(1, Ordering::SeqCst))
    }
}

#[tokio::test]
async fn four_entrants_third_one_wins_the_pot() {
    let clock = Arc::new(ManualClock::new(START));
    let service = RaffleService::new(
        Raffle::new(config(), clock.now()),
        ManualOracle(AtomicU64::new(1)),
        LedgerPayout::new(),
        clock.clone(),
        Arc::new(Metrics::new()),
    );

    let entrants: Vec<Pubkey> = (0..4).map(|_| Pubkey::new_unique()).collect();
    for player in &entrants {
        service.enter(*player, FEE).await.unwrap();
    }
    assert_eq!(service.snapshot().await.accumulated_balance, 40);

    // Too early: the keeper does nothing and a direct close is rejected.
    assert_eq!(poll_once(&service).await, None);
    assert!(matches!(
        service.perform_upkeep().await,
        Err(RaffleError::UpkeepNotNeeded { .. })
    ));

    clock.advance(INTERVAL as i64 + 1);
    let request_id = poll_once(&service).await.expect("round should close");
    assert_eq!(service.snapshot().await.phase, RafflePhase::Closing);

    // A stale or forged answer changes nothing.
    let before = service.snapshot().await;
    assert_eq!(
        service
            .fulfill_random_words(request_id + 1, &[word_from_u64(2)])
            .await,
        Err(RaffleError::UnknownRequest { request_id: request_id + 1 })
    );
    assert_eq!(service.snapshot().await, before);

    let picked = service
        .fulfill_random_words(request_id, &[word_from_u64(2)])
        .await
        .unwrap();
    assert_eq!(picked.winner, entrants[2]);
    assert_eq!(picked.amount, 40);

    let after = service.snapshot().await;
    assert_eq!(after.phase, RafflePhase::Open);
    assert_eq!(after.num_players, 0);
    assert_eq!(after.accumulated_balance, 0);
    assert_eq!(after.recent_winner, Some(entrants[2].to_string()));
    assert_eq!(after.round, 2);
    assert_eq!(service.payout().balance_of(&entrants[2]), 40);

    // The next round starts clean.
    let newcomer = Pubkey::new_unique();
    service.enter(newcomer, FEE).await.unwrap();
    assert_eq!(service.player(0).await.unwrap().player, newcomer);
}

#[tokio::test]
async fn local_oracle_settles_rounds_end_to_end() {
    let clock = Arc::new(ManualClock::new(START));
    let (oracle, requests) = LocalVrfOracle::new(SUBSCRIPTION_ID, 1, clock.clone(), 16);
    let service = Arc::new(RaffleService::new(
        Raffle::new(config(), clock.now()),
        oracle,
        LedgerPayout::new(),
        clock.clone(),
        Arc::new(Metrics::new()),
    ));
    let mut events = service.subscribe();

    let settings = FulfillerSettings {
        hmac_secret: b"integration-secret".to_vec(),
        concurrency: 2,
        max_retries: 3,
        initial_retry_delay: Duration::from_millis(1),
    };
    tokio::spawn(run_fulfiller(requests, settings, service.clone()));

    let entrants: Vec<Pubkey> = (0..3).map(|_| Pubkey::new_unique()).collect();
    for player in &entrants {
        service.enter(*player, FEE).await.unwrap();
    }

    clock.advance(INTERVAL as i64);
    let closed_at = clock.now();
    let request_id = poll_once(service.as_ref()).await.expect("round should close");
    assert_eq!(request_id, 1);

    let picked = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let RaffleEvent::WinnerPicked(event) = events.recv().await.unwrap() {
                return event;
            }
        }
    })
    .await
    .expect("oracle should answer");

    // The winner is reproducible from the oracle's secret and the request.
    let seed = request_seed(&KEY_HASH, SUBSCRIPTION_ID, request_id);
    let base = compute_randomness(b"integration-secret", &seed, closed_at, request_id);
    let words = expand_randomness(&base, 1);
    let expected = entrants[reduce_word(&words[0], 3) as usize];

    assert_eq!(picked.request_id, request_id);
    assert_eq!(picked.winner, expected);
    assert_eq!(picked.amount, 3 * FEE);
    assert_eq!(service.payout().balance_of(&expected), 3 * FEE);

    let snapshot = service.snapshot().await;
    assert_eq!(snapshot.phase, RafflePhase::Open);
    assert_eq!(snapshot.num_players, 0);
    assert_eq!(snapshot.recent_winner, Some(expected.to_string()));
    assert_eq!(service.metrics().to_json()["rounds_completed"], 1);
}
