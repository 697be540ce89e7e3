//! In-process VRF oracle.
//!
//! [`LocalVrfOracle`] accepts requests synchronously and queues them on a
//! bounded channel. [`run_fulfiller`] drains that channel, waits out the
//! requested confirmations, computes HMAC-SHA256 randomness and hands the
//! words back through a [`FulfillmentDelivery`], retrying deliveries that
//! failed for a retryable reason.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tracing::{error, info, instrument, warn};

use super::vrf::{compute_randomness, expand_randomness, request_seed};
use super::{OracleError, RandomWord, RandomnessOracle, RandomnessRequest};
use crate::clock::{Clock, UnixTimestamp};
use crate::error::RaffleError;

/// Time represented by one confirmation.
pub const SLOT_DURATION: Duration = Duration::from_millis(400);

/// Upper bound on the delay between two delivery attempts.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// A request accepted by the local oracle and waiting to be fulfilled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRandomness {
    pub request_id: u64,
    pub seed: [u8; 32],
    pub requested_at: UnixTimestamp,
    pub request_confirmations: u16,
    pub num_words: u32,
}

/// Oracle that serves one subscription from inside the process.
pub struct LocalVrfOracle {
    subscription_id: u64,
    max_num_words: u32,
    next_request_id: AtomicU64,
    clock: Arc<dyn Clock>,
    tx: mpsc::Sender<PendingRandomness>,
}

impl LocalVrfOracle {
    /// Create the oracle and the receiving end of its request queue.
    ///
    /// Request ids start at 1.
    pub fn new(
        subscription_id: u64,
        max_num_words: u32,
        clock: Arc<dyn Clock>,
        queue_capacity: usize,
    ) -> (Self, mpsc::Receiver<PendingRandomness>) {
        let (tx, rx) = mpsc::channel(queue_capacity);
        let oracle = Self {
            subscription_id,
            max_num_words,
            next_request_id: AtomicU64::new(1),
            clock,
            tx,
        };
        (oracle, rx)
    }
}

impl RandomnessOracle for LocalVrfOracle {
    fn request_random_words(&self, request: &RandomnessRequest) -> Result<u64, OracleError> {
        if request.subscription_id != self.subscription_id {
            return Err(OracleError::UnknownSubscription(request.subscription_id));
        }
        if request.num_words == 0 || request.num_words > self.max_num_words {
            return Err(OracleError::InvalidNumWords {
                requested: request.num_words,
                max: self.max_num_words,
            });
        }

        // Reserve queue space first so a full queue does not burn a request id.
        let permit = self.tx.try_reserve().map_err(|_| OracleError::Unavailable)?;
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);

        permit.send(PendingRandomness {
            request_id,
            seed: request_seed(&request.key_hash, request.subscription_id, request_id),
            requested_at: self.clock.now(),
            request_confirmations: request.request_confirmations,
            num_words: request.num_words,
        });

        Ok(request_id)
    }
}

/// Receiver of fulfilled randomness; the raffle service in production.
pub trait FulfillmentDelivery: Send + Sync + 'static {
    fn deliver(
        &self,
        request_id: u64,
        random_words: Vec<RandomWord>,
    ) -> impl Future<Output = Result<(), RaffleError>> + Send;
}

/// Tuning for [`run_fulfiller`].
#[derive(Clone)]
pub struct FulfillerSettings {
    /// Secret key for HMAC-SHA256 randomness generation.
    pub hmac_secret: Vec<u8>,
    /// Maximum concurrent fulfillment tasks.
    pub concurrency: usize,
    /// Maximum delivery attempts per request.
    pub max_retries: u32,
    /// Delay before the first redelivery; doubles on every attempt.
    pub initial_retry_delay: Duration,
}

/// Main fulfiller loop. Returns once every oracle handle has been dropped.
pub async fn run_fulfiller<D: FulfillmentDelivery>(
    mut rx: mpsc::Receiver<PendingRandomness>,
    settings: FulfillerSettings,
    delivery: Arc<D>,
) {
    let semaphore = Arc::new(Semaphore::new(settings.concurrency.max(1)));

    while let Some(pending) = rx.recv().await {
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => {
                error!("Semaphore closed, stopping fulfiller");
                break;
            }
        };
        let settings = settings.clone();
        let delivery = delivery.clone();

        tokio::spawn(async move {
            let _permit = permit;
            fulfill_pending(&settings, delivery.as_ref(), pending).await;
        });
    }

    info!("Oracle request queue closed, shutting down fulfiller");
}

#[instrument(skip_all, fields(request_id = pending.request_id))]
async fn fulfill_pending<D: FulfillmentDelivery>(
    settings: &FulfillerSettings,
    delivery: &D,
    pending: PendingRandomness,
) {
    let wait = SLOT_DURATION * u32::from(pending.request_confirmations);
    if !wait.is_zero() {
        tokio::time::sleep(wait).await;
    }

    let randomness = compute_randomness(
        &settings.hmac_secret,
        &pending.seed,
        pending.requested_at,
        pending.request_id,
    );
    let words = expand_randomness(&randomness, pending.num_words);

    match deliver_with_retries(settings, delivery, pending.request_id, words).await {
        Ok(()) => info!("Randomness delivered"),
        Err(e) if e.is_retryable() => error!(
            error = %e,
            attempts = settings.max_retries,
            "Giving up on delivery; the round stays closing until POST /admin/recover \
             (requires RECOVERY_TIMEOUT_SECS and ADMIN_TOKEN)"
        ),
        Err(e @ RaffleError::PayoutUnconfirmed { .. }) => error!(
            error = %e,
            "Payout outcome unknown; check the transaction before POST /admin/recover, \
             or the pot may be paid twice"
        ),
        Err(e) => warn!(reason = %e, "Delivery rejected (non-retryable)"),
    }
}

/// Deliver with exponential backoff on retryable errors.
async fn deliver_with_retries<D: FulfillmentDelivery>(
    settings: &FulfillerSettings,
    delivery: &D,
    request_id: u64,
    words: Vec<RandomWord>,
) -> Result<(), RaffleError> {
    let max_attempts = settings.max_retries.max(1);
    let mut retry_delay = settings.initial_retry_delay;
    let mut attempt = 1;

    loop {
        match delivery.deliver(request_id, words.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                warn!(
                    attempt,
                    delay = ?retry_delay,
                    error = %e,
                    "Delivery failed, retrying"
                );
                tokio::time::sleep(retry_delay).await;
                retry_delay = retry_delay.saturating_mul(2).min(MAX_RETRY_DELAY);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
