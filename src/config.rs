//! Application configuration loaded from environment variables.
//!
//! Required: `HMAC_SECRET`
//! Optional: `RAFFLE_ENTRANCE_FEE`, `RAFFLE_INTERVAL_SECS`, `VRF_KEY_HASH`,
//!           `VRF_SUBSCRIPTION_ID`, `CALLBACK_COMPUTE_LIMIT`,
//!           `REQUEST_CONFIRMATIONS`, `MAX_NUM_WORDS`, `RECOVERY_TIMEOUT_SECS`,
//!           `KEEPER_POLL_INTERVAL_MS`, `HTTP_PORT`, `MAX_RETRIES`,
//!           `INITIAL_RETRY_DELAY_MS`, `FULFILLMENT_CONCURRENCY`,
//!           `ADMIN_TOKEN`, `PAYOUT_MODE`, `RPC_URL`, `VAULT_KEYPAIR_PATH`,
//!           `CLUSTER`

use anyhow::{Context, Result, bail};
use solana_sdk::signature::{Keypair, read_keypair_file};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::state::{DEFAULT_REQUEST_CONFIRMATIONS, RaffleConfig};

/// 0.01 SOL.
const DEFAULT_ENTRANCE_FEE: u64 = 10_000_000;
const DEFAULT_INTERVAL_SECS: u64 = 30;
const DEFAULT_CALLBACK_COMPUTE_LIMIT: u32 = 500_000;

/// Where winners get paid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayoutMode {
    /// In-memory ledger.
    Ledger,
    /// On-chain transfer from the vault keypair.
    Rpc,
}

impl FromStr for PayoutMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ledger" => Ok(PayoutMode::Ledger),
            "rpc" => Ok(PayoutMode::Rpc),
            other => bail!("unknown payout mode {other:?} (expected \"ledger\" or \"rpc\")"),
        }
    }
}

/// Application configuration for the raffle service.
#[derive(Clone)]
pub struct AppConfig {
    /// Minimum stake in lamports.
    pub entrance_fee: u64,
    /// Minimum seconds between a round opening and closing.
    pub interval_secs: u64,
    /// Oracle routing key.
    pub key_hash: [u8; 32],
    pub subscription_id: u64,
    pub callback_compute_limit: u32,
    pub request_confirmations: u16,
    /// Upper bound on words per request accepted by the local oracle.
    pub max_num_words: u32,
    /// Seconds before a pending request may be abandoned; unset disables recovery.
    pub recovery_timeout_secs: Option<u64>,
    /// Secret key for HMAC-SHA256 randomness generation.
    pub hmac_secret: Vec<u8>,
    pub keeper_poll_interval: Duration,
    /// HTTP server port.
    pub http_port: u16,
    /// Maximum delivery / send attempts.
    pub max_retries: u32,
    /// Initial retry delay.
    pub initial_retry_delay: Duration,
    /// Maximum concurrent fulfillment tasks.
    pub fulfillment_concurrency: usize,
    /// Token required by admin endpoints; admin endpoints are disabled when unset.
    pub admin_token: Option<String>,
    pub payout_mode: PayoutMode,
    /// Solana JSON-RPC endpoint (HTTP), used in `rpc` payout mode.
    pub rpc_url: String,
    /// Vault keypair paying winners in `rpc` payout mode.
    pub vault_keypair: Option<Arc<Keypair>>,
    /// Cluster name for explorer URLs.
    pub cluster: String,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let hmac_secret = std::env::var("HMAC_SECRET")
            .context("HMAC_SECRET env var must be set")?
            .into_bytes();

        let key_hash = match std::env::var("VRF_KEY_HASH") {
            Ok(s) => parse_key_hash(&s).with_context(|| format!("invalid VRF_KEY_HASH: {s}"))?,
            Err(_) => [0u8; 32],
        };

        let payout_mode = parse_env("PAYOUT_MODE", PayoutMode::Ledger)?;
        let rpc_url = std::env::var("RPC_URL").unwrap_or_else(|_| "http://127.0.0.1:8899".into());

        let vault_keypair = match payout_mode {
            PayoutMode::Ledger => None,
            PayoutMode::Rpc => {
                let keypair_path = std::env::var("VAULT_KEYPAIR_PATH")
                    .unwrap_or_else(|_| "~/.config/solana/id.json".into());
                let keypair_path = shellexpand::tilde(&keypair_path).to_string();
                let keypair = read_keypair_file(&keypair_path)
                    .map_err(|e| anyhow::anyhow!("{e}"))
                    .with_context(|| format!("failed to read keypair from {keypair_path}"))?;
                Some(Arc::new(keypair))
            }
        };

        let recovery_timeout_secs = match std::env::var("RECOVERY_TIMEOUT_SECS") {
            Ok(v) => Some(
                v.parse()
                    .with_context(|| format!("invalid RECOVERY_TIMEOUT_SECS: {v}"))?,
            ),
            Err(_) => None,
        };

        let config = Self {
            entrance_fee: parse_env("RAFFLE_ENTRANCE_FEE", DEFAULT_ENTRANCE_FEE)?,
            interval_secs: parse_env("RAFFLE_INTERVAL_SECS", DEFAULT_INTERVAL_SECS)?,
            key_hash,
            subscription_id: parse_env("VRF_SUBSCRIPTION_ID", 1)?,
            callback_compute_limit: parse_env(
                "CALLBACK_COMPUTE_LIMIT",
                DEFAULT_CALLBACK_COMPUTE_LIMIT,
            )?,
            request_confirmations: parse_env(
                "REQUEST_CONFIRMATIONS",
                DEFAULT_REQUEST_CONFIRMATIONS,
            )?,
            max_num_words: parse_env("MAX_NUM_WORDS", 10)?,
            recovery_timeout_secs,
            hmac_secret,
            keeper_poll_interval: Duration::from_millis(parse_env(
                "KEEPER_POLL_INTERVAL_MS",
                1_000,
            )?),
            http_port: parse_env("HTTP_PORT", 8080)?,
            max_retries: parse_env("MAX_RETRIES", 5)?,
            initial_retry_delay: Duration::from_millis(parse_env("INITIAL_RETRY_DELAY_MS", 500)?),
            fulfillment_concurrency: parse_env("FULFILLMENT_CONCURRENCY", 4)?,
            admin_token: std::env::var("ADMIN_TOKEN").ok().filter(|t| !t.is_empty()),
            payout_mode,
            rpc_url,
            vault_keypair,
            cluster: std::env::var("CLUSTER").unwrap_or_else(|_| "devnet".into()),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.entrance_fee == 0 {
            bail!("RAFFLE_ENTRANCE_FEE must be greater than zero");
        }
        if self.keeper_poll_interval.is_zero() {
            bail!("KEEPER_POLL_INTERVAL_MS must be greater than zero");
        }
        if self.max_num_words == 0 {
            bail!("MAX_NUM_WORDS must be greater than zero");
        }
        Ok(())
    }

    /// The immutable raffle parameters.
    pub fn raffle_config(&self) -> RaffleConfig {
        RaffleConfig {
            entrance_fee: self.entrance_fee,
            interval: self.interval_secs,
            key_hash: self.key_hash,
            subscription_id: self.subscription_id,
            callback_compute_limit: self.callback_compute_limit,
            request_confirmations: self.request_confirmations,
            recovery_timeout: self.recovery_timeout_secs,
        }
    }
}

/// Read `key` and parse it, falling back to `default` only when it is unset.
fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(v) => v
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {key}={v}: {e}")),
        Err(_) => Ok(default),
    }
}

/// Decode a base58 32-byte key hash.
fn parse_key_hash(s: &str) -> Result<[u8; 32]> {
    let bytes = bs58::decode(s.trim()).into_vec().context("not valid base58")?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("expected 32 bytes, got {len}"))
}
