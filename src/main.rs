//! Raffle keeper service
//!
//! Hosts the raffle and runs three concurrent subsystems:
//!
//! - **Keeper**: polls the close predicate and performs upkeep when due.
//! - **Fulfiller**: local VRF oracle answering randomness requests.
//! - **HTTP server**: entries, status, metrics and operator recovery.

use actix_web::{web, App, HttpServer};
use anyhow::Context;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_commitment_config::CommitmentConfig;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use raffle_keeper::clock::{Clock, SystemClock};
use raffle_keeper::config::{AppConfig, PayoutMode};
use raffle_keeper::deposit::DepositVerifier;
use raffle_keeper::http::{self, AppState};
use raffle_keeper::keeper;
use raffle_keeper::metrics::Metrics;
use raffle_keeper::oracle::{self, FulfillerSettings, LocalVrfOracle};
use raffle_keeper::payout::{LedgerPayout, PayoutBackend, RpcPayout};
use raffle_keeper::{Raffle, RaffleService};

/// Capacity of the local oracle's request queue.
const ORACLE_QUEUE_CAPACITY: usize = 256;

const DEFAULT_LOG_FILTER: &str = "info,solana_client=warn,solana_rpc_client=warn,hyper=warn";

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_target(true)
        .with_ansi(true)
        .init();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    info!(
        entrance_fee = config.entrance_fee,
        interval_secs = config.interval_secs,
        subscription_id = config.subscription_id,
        confirmations = config.request_confirmations,
        "Starting raffle keeper"
    );
    if config.recovery_timeout_secs.is_none() {
        warn!(
            "RECOVERY_TIMEOUT_SECS is unset: a round whose randomness never arrives stays \
             closing until restart"
        );
    }

    let (payout, deposits) = match (config.payout_mode, &config.vault_keypair) {
        (PayoutMode::Rpc, Some(vault)) => {
            let rpc = Arc::new(RpcClient::new_with_commitment(
                config.rpc_url.clone(),
                CommitmentConfig::confirmed(),
            ));
            let payout = RpcPayout::new(
                rpc.clone(),
                vault.clone(),
                config.cluster.clone(),
                config.max_retries,
                config.initial_retry_delay,
            );
            // Only deposits made while this process runs can fund entries.
            let deposits = DepositVerifier::new(rpc, payout.vault(), clock.now());
            info!(rpc = %config.rpc_url, vault = %payout.vault(), "Paying winners on-chain");
            (PayoutBackend::Rpc(payout), Some(deposits))
        }
        (PayoutMode::Rpc, None) => anyhow::bail!("rpc payout mode requires a vault keypair"),
        (PayoutMode::Ledger, _) => {
            info!("Paying winners into the in-memory ledger");
            (PayoutBackend::Ledger(LedgerPayout::new()), None)
        }
    };

    let (vrf_oracle, requests) = LocalVrfOracle::new(
        config.subscription_id,
        config.max_num_words,
        clock.clone(),
        ORACLE_QUEUE_CAPACITY,
    );

    let metrics = Arc::new(Metrics::new());
    let raffle = Raffle::new(config.raffle_config(), clock.now());
    let service = Arc::new(RaffleService::new(
        raffle,
        vrf_oracle,
        payout,
        clock.clone(),
        metrics,
    ));

    // Background: answer randomness requests and route them back into the raffle.
    let settings = FulfillerSettings {
        hmac_secret: config.hmac_secret.clone(),
        concurrency: config.fulfillment_concurrency,
        max_retries: config.max_retries,
        initial_retry_delay: config.initial_retry_delay,
    };
    let delivery = service.clone();
    tokio::spawn(async move {
        oracle::run_fulfiller(requests, settings, delivery).await;
    });

    // Background: close rounds when they are due.
    let keeper_service = service.clone();
    let poll_interval = config.keeper_poll_interval;
    tokio::spawn(async move {
        keeper::run_keeper(keeper_service, poll_interval).await;
    });

    let state = web::Data::new(AppState {
        service: service.clone(),
        admin_token: config.admin_token.clone(),
        deposits,
    });

    info!(port = config.http_port, "Starting HTTP server");

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .configure(http::routes::<LocalVrfOracle, PayoutBackend, Arc<RpcClient>>)
    })
    .bind(("0.0.0.0", config.http_port))?
    .run()
    .await?;

    Ok(())
}
