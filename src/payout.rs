//! Winner payouts.
//!
//! The raffle pays the whole pot through a [`Payout`] before it commits any
//! round bookkeeping, so a failed transfer leaves the round untouched.
//!
//! - [`LedgerPayout`] credits an in-memory ledger (local runs and tests).
//! - [`RpcPayout`] sends a System Program transfer from a vault keypair.
//!
//! An on-chain send can fail after the transaction already reached the
//! cluster. [`RpcPayout`] therefore tracks the signature of every attempt and
//! asks the cluster what became of it before signing a new one: a transfer
//! that landed is reported as paid, and one whose fate cannot be established
//! is reported as [`PayoutError::Unconfirmed`], which is never retried.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, anyhow};
use solana_client::client_error::ClientErrorKind;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_request::RpcError;
use solana_commitment_config::CommitmentConfig;
use solana_sdk::hash::Hash;
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signature, Signer};
use solana_sdk::transaction::{Transaction, VersionedTransaction};
use solana_transaction_status_client_types::UiTransactionEncoding;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::clock::UnixTimestamp;

/// `SystemInstruction::Transfer` discriminant in the System Program's bincode layout.
pub(crate) const SYSTEM_TRANSFER_TAG: u32 = 2;

/// Upper bound on the delay between two send attempts.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Why a payout did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayoutError {
    /// No lamports reached the winner; the transfer may be attempted again.
    #[error("{0}")]
    NotSent(String),
    /// A transaction was submitted and its outcome could not be established.
    #[error("transaction {signature} may have landed: {reason}")]
    Unconfirmed { signature: String, reason: String },
}

impl From<anyhow::Error> for PayoutError {
    fn from(e: anyhow::Error) -> Self {
        PayoutError::NotSent(format!("{e:#}"))
    }
}

/// Moves lamports from the raffle's custody to a winner.
pub trait Payout: Send + Sync {
    /// Transfer `lamports` to `to`, returning a receipt (a transaction
    /// signature or ledger entry id) once the transfer is final.
    fn transfer(
        &self,
        to: &Pubkey,
        lamports: u64,
    ) -> impl Future<Output = Result<String, PayoutError>> + Send;
}

/// In-memory credit ledger.
///
/// Each credit is a single checked add on one map entry, so a panic while the
/// lock is held cannot leave a half-applied transfer behind; a poisoned lock
/// is recovered rather than reported.
#[derive(Debug, Default)]
pub struct LedgerPayout {
    balances: Mutex<HashMap<Pubkey, u64>>,
    transfers: AtomicU64,
}

impl LedgerPayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lamports credited to `account` so far.
    pub fn balance_of(&self, account: &Pubkey) -> u64 {
        let balances = self.balances.lock().unwrap_or_else(PoisonError::into_inner);
        balances.get(account).copied().unwrap_or(0)
    }

    /// Number of completed transfers.
    pub fn transfer_count(&self) -> u64 {
        self.transfers.load(Ordering::Relaxed)
    }
}

impl Payout for LedgerPayout {
    async fn transfer(&self, to: &Pubkey, lamports: u64) -> Result<String, PayoutError> {
        {
            let mut balances = self.balances.lock().unwrap_or_else(PoisonError::into_inner);
            let balance = balances.entry(*to).or_insert(0);
            *balance = balance
                .checked_add(lamports)
                .ok_or_else(|| anyhow!("ledger balance overflow for {to}"))?;
        }
        let entry = self.transfers.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(format!("ledger-{entry}"))
    }
}

/// Failure to submit a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// The node answered and refused the transaction.
    #[error("rejected: {0}")]
    Rejected(String),
    /// The request failed in transit; the node may have accepted it.
    #[error("outcome unknown: {0}")]
    Ambiguous(String),
}

/// A finalized transaction fetched by signature.
#[derive(Debug, Clone)]
pub struct FetchedTransaction {
    pub transaction: VersionedTransaction,
    /// Whether the transaction executed without error.
    pub succeeded: bool,
    pub block_time: Option<UnixTimestamp>,
}

/// The cluster calls made by [`RpcPayout`] and the deposit check.
pub trait VaultRpc: Send + Sync {
    fn fresh_blockhash(&self) -> impl Future<Output = anyhow::Result<Hash>> + Send;

    /// Submit without waiting for confirmation.
    fn submit(
        &self,
        transaction: &Transaction,
    ) -> impl Future<Output = Result<Signature, SubmitError>> + Send;

    /// `None` while the cluster has not seen the signature; otherwise the
    /// execution result, with the error rendered as text.
    fn status_of(
        &self,
        signature: &Signature,
    ) -> impl Future<Output = anyhow::Result<Option<Result<(), String>>>> + Send;

    /// Whether transactions built on `blockhash` can still land.
    fn blockhash_is_valid(
        &self,
        blockhash: &Hash,
    ) -> impl Future<Output = anyhow::Result<bool>> + Send;

    /// Look up a finalized transaction.
    fn fetch_transaction(
        &self,
        signature: &Signature,
    ) -> impl Future<Output = anyhow::Result<FetchedTransaction>> + Send;
}

impl VaultRpc for RpcClient {
    async fn fresh_blockhash(&self) -> anyhow::Result<Hash> {
        self.get_latest_blockhash()
            .await
            .context("failed to fetch latest blockhash")
    }

    async fn submit(&self, transaction: &Transaction) -> Result<Signature, SubmitError> {
        self.send_transaction(transaction).await.map_err(|e| match e.kind() {
            ClientErrorKind::RpcError(RpcError::RpcResponseError { .. }) => {
                SubmitError::Rejected(e.to_string())
            }
            _ => SubmitError::Ambiguous(e.to_string()),
        })
    }

    async fn status_of(
        &self,
        signature: &Signature,
    ) -> anyhow::Result<Option<Result<(), String>>> {
        let status = self
            .get_signature_status(signature)
            .await
            .context("getSignatureStatuses failed")?;
        Ok(status.map(|result| result.map_err(|e| e.to_string())))
    }

    async fn blockhash_is_valid(&self, blockhash: &Hash) -> anyhow::Result<bool> {
        self.is_blockhash_valid(blockhash, CommitmentConfig::processed())
            .await
            .context("isBlockhashValid failed")
    }

    async fn fetch_transaction(&self, signature: &Signature) -> anyhow::Result<FetchedTransaction> {
        let confirmed = self
            .get_transaction(signature, UiTransactionEncoding::Base64)
            .await
            .with_context(|| format!("transaction {signature} not found or not finalized"))?;
        let succeeded = confirmed
            .transaction
            .meta
            .as_ref()
            .is_some_and(|meta| meta.err.is_none());
        let transaction = confirmed
            .transaction
            .transaction
            .decode()
            .with_context(|| format!("transaction {signature} did not decode"))?;
        Ok(FetchedTransaction {
            transaction,
            succeeded,
            block_time: confirmed.block_time,
        })
    }
}

impl<R: VaultRpc> VaultRpc for Arc<R> {
    fn fresh_blockhash(&self) -> impl Future<Output = anyhow::Result<Hash>> + Send {
        (**self).fresh_blockhash()
    }

    fn submit(
        &self,
        transaction: &Transaction,
    ) -> impl Future<Output = Result<Signature, SubmitError>> + Send {
        (**self).submit(transaction)
    }

    fn status_of(
        &self,
        signature: &Signature,
    ) -> impl Future<Output = anyhow::Result<Option<Result<(), String>>>> + Send {
        (**self).status_of(signature)
    }

    fn blockhash_is_valid(
        &self,
        blockhash: &Hash,
    ) -> impl Future<Output = anyhow::Result<bool>> + Send {
        (**self).blockhash_is_valid(blockhash)
    }

    fn fetch_transaction(
        &self,
        signature: &Signature,
    ) -> impl Future<Output = anyhow::Result<FetchedTransaction>> + Send {
        (**self).fetch_transaction(signature)
    }
}

/// What became of a submitted transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SendOutcome {
    Landed,
    Failed(String),
    /// Its blockhash expired before it landed; it never will.
    Dropped,
}

/// Pays winners on-chain from a vault keypair.
pub struct RpcPayout<R = Arc<RpcClient>> {
    rpc: R,
    vault: Arc<Keypair>,
    cluster: String,
    max_retries: u32,
    initial_retry_delay: Duration,
}

impl<R: VaultRpc> RpcPayout<R> {
    pub fn new(
        rpc: R,
        vault: Arc<Keypair>,
        cluster: String,
        max_retries: u32,
        initial_retry_delay: Duration,
    ) -> Self {
        Self {
            rpc,
            vault,
            cluster,
            max_retries: max_retries.max(1),
            initial_retry_delay,
        }
    }

    /// The account paying winners, which is also where stakes are deposited.
    pub fn vault(&self) -> Pubkey {
        self.vault.pubkey()
    }

    /// Send a transaction, signing a new one only once the previous attempt
    /// is known not to have landed.
    async fn send_with_retries(&self, instructions: &[Instruction]) -> Result<String, PayoutError> {
        let mut retry_delay = self.initial_retry_delay;

        for attempt in 1..=self.max_retries {
            let blockhash = self.rpc.fresh_blockhash().await?;
            let tx = Transaction::new_signed_with_payer(
                instructions,
                Some(&self.vault.pubkey()),
                &[self.vault.as_ref()],
                blockhash,
            );
            let signature = tx.signatures[0];

            let reason = match self.rpc.submit(&tx).await {
                Ok(_) => None,
                Err(SubmitError::Rejected(reason)) => {
                    if attempt == self.max_retries {
                        return Err(PayoutError::NotSent(reason));
                    }
                    warn!(
                        attempt,
                        delay = ?retry_delay,
                        error = %reason,
                        "Transaction rejected, retrying"
                    );
                    tokio::time::sleep(retry_delay).await;
                    retry_delay = retry_delay.saturating_mul(2).min(MAX_RETRY_DELAY);
                    continue;
                }
                Err(SubmitError::Ambiguous(reason)) => Some(reason),
            };

            match self.resolve_outcome(&signature, &blockhash).await {
                Ok(SendOutcome::Landed) => {
                    if let Some(reason) = reason {
                        warn!(
                            %signature,
                            error = %reason,
                            "Submit reported an error but the transaction landed"
                        );
                    }
                    return Ok(signature.to_string());
                }
                Ok(SendOutcome::Failed(failure)) => {
                    return Err(PayoutError::NotSent(format!(
                        "transaction {signature} failed: {failure}"
                    )));
                }
                Ok(SendOutcome::Dropped) if attempt < self.max_retries => {
                    warn!(
                        attempt,
                        %signature,
                        delay = ?retry_delay,
                        "Transaction expired unconfirmed, retrying"
                    );
                    tokio::time::sleep(retry_delay).await;
                    retry_delay = retry_delay.saturating_mul(2).min(MAX_RETRY_DELAY);
                }
                Ok(SendOutcome::Dropped) => {
                    return Err(PayoutError::NotSent(format!(
                        "transaction {signature} expired unconfirmed"
                    )));
                }
                Err(e) => {
                    error!(%signature, error = %e, "Lost track of a submitted payout");
                    return Err(PayoutError::Unconfirmed {
                        signature: signature.to_string(),
                        reason: format!("{e:#}"),
                    });
                }
            }
        }

        Err(PayoutError::NotSent(format!("max retries ({}) exceeded", self.max_retries)))
    }

    /// Poll the signature until it lands, fails, or its blockhash expires.
    async fn resolve_outcome(
        &self,
        signature: &Signature,
        blockhash: &Hash,
    ) -> anyhow::Result<SendOutcome> {
        loop {
            match self.rpc.status_of(signature).await? {
                Some(Ok(())) => return Ok(SendOutcome::Landed),
                Some(Err(failure)) => return Ok(SendOutcome::Failed(failure)),
                None => {}
            }
            if !self.rpc.blockhash_is_valid(blockhash).await? {
                // It may have landed between the two queries.
                return Ok(match self.rpc.status_of(signature).await? {
                    Some(Ok(())) => SendOutcome::Landed,
                    Some(Err(failure)) => SendOutcome::Failed(failure),
                    None => SendOutcome::Dropped,
                });
            }
            tokio::time::sleep(self.initial_retry_delay).await;
        }
    }
}

impl<R: VaultRpc> Payout for RpcPayout<R> {
    #[instrument(skip(self), fields(vault = %self.vault.pubkey()))]
    async fn transfer(&self, to: &Pubkey, lamports: u64) -> Result<String, PayoutError> {
        let ix = build_transfer_instruction(&self.vault.pubkey(), to, lamports);
        let signature = self.send_with_retries(&[ix]).await?;
        info!(
            signature = %signature,
            explorer = %explorer_url(&self.cluster, &signature),
            "Payout confirmed"
        );
        Ok(signature)
    }
}

/// Payout backend selected by configuration.
pub enum PayoutBackend {
    Ledger(LedgerPayout),
    Rpc(RpcPayout),
}

impl Payout for PayoutBackend {
    async fn transfer(&self, to: &Pubkey, lamports: u64) -> Result<String, PayoutError> {
        match self {
            PayoutBackend::Ledger(ledger) => ledger.transfer(to, lamports).await,
            PayoutBackend::Rpc(rpc) => rpc.transfer(to, lamports).await,
        }
    }
}

/// Build a System Program `Transfer` instruction.
pub(crate) fn build_transfer_instruction(from: &Pubkey, to: &Pubkey, lamports: u64) -> Instruction {
    // The System Program id is the all-zero key.
    let system_program_id = Pubkey::default();

    let mut data = Vec::with_capacity(12);
    data.extend_from_slice(&SYSTEM_TRANSFER_TAG.to_le_bytes());
    data.extend_from_slice(&lamports.to_le_bytes());

    Instruction {
        program_id: system_program_id,
        accounts: vec![
            AccountMeta::new(*from, true), // vault (signer, payer)
            AccountMeta::new(*to, false),  // winner
        ],
        data,
    }
}

/// Return the Solscan explorer URL for a given transaction signature.
pub fn explorer_url(cluster: &str, signature: &str) -> String {
    match cluster {
        "mainnet-beta" => format!("https://solscan.io/tx/{signature}"),
        cluster => format!("https://solscan.io/tx/{signature}?cluster={cluster}"),
    }
}
