//! Stake deposits for on-chain mode.
//!
//! An entry's stake is the lamports a finalized System Program transfer moved
//! from the player to the vault, never a number the caller asserts. Each
//! deposit funds at most one entry.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::message::VersionedMessage;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use thiserror::Error;
use tracing::{debug, info};

use crate::clock::UnixTimestamp;
use crate::payout::{SYSTEM_TRANSFER_TAG, VaultRpc};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DepositError {
    #[error("deposit {0} already funded an entry")]
    AlreadyClaimed(Signature),
    #[error("deposit lookup failed: {0}")]
    Lookup(String),
    #[error("deposit transaction {0} failed on-chain")]
    Failed(Signature),
    /// Older than this process, so it may have funded an entry before a restart.
    #[error("deposit {0} predates the running raffle")]
    Stale(Signature),
    #[error("deposit {0} moves no lamports from the player to the vault")]
    NoTransfer(Signature),
}

/// A verified deposit, reserved for one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deposit {
    pub signature: Signature,
    pub lamports: u64,
}

pub struct DepositVerifier<R = Arc<RpcClient>> {
    rpc: R,
    vault: Pubkey,
    /// Deposits with an earlier block time are refused.
    not_before: UnixTimestamp,
    claimed: Mutex<HashSet<Signature>>,
}

impl<R: VaultRpc> DepositVerifier<R> {
    pub fn new(rpc: R, vault: Pubkey, not_before: UnixTimestamp) -> Self {
        Self {
            rpc,
            vault,
            not_before,
            claimed: Mutex::new(HashSet::new()),
        }
    }

    pub fn vault(&self) -> Pubkey {
        self.vault
    }

    /// Verify that `signature` is a successful, finalized transfer from
    /// `player` to the vault and reserve it.
    ///
    /// The reservation holds until [`DepositVerifier::release`] is called.
    pub async fn claim(
        &self,
        player: &Pubkey,
        signature: &Signature,
    ) -> Result<Deposit, DepositError> {
        if self.is_claimed(signature) {
            return Err(DepositError::AlreadyClaimed(*signature));
        }

        let fetched = self
            .rpc
            .fetch_transaction(signature)
            .await
            .map_err(|e| DepositError::Lookup(format!("{e:#}")))?;
        if !fetched.succeeded {
            return Err(DepositError::Failed(*signature));
        }
        match fetched.block_time {
            Some(block_time) if block_time >= self.not_before => {}
            _ => return Err(DepositError::Stale(*signature)),
        }

        let lamports = transferred_lamports(&fetched.transaction.message, player, &self.vault);
        if lamports == 0 {
            return Err(DepositError::NoTransfer(*signature));
        }

        // Re-check under the lock: another request may have claimed it meanwhile.
        if !self.claims().insert(*signature) {
            return Err(DepositError::AlreadyClaimed(*signature));
        }
        info!(%player, %signature, lamports, "Deposit verified");

        Ok(Deposit {
            signature: *signature,
            lamports,
        })
    }

    /// Give a reservation back, after the entry it was meant for was refused.
    pub fn release(&self, signature: &Signature) {
        if self.claims().remove(signature) {
            debug!(%signature, "Deposit released");
        }
    }

    pub fn is_claimed(&self, signature: &Signature) -> bool {
        self.claims().contains(signature)
    }

    fn claims(&self) -> MutexGuard<'_, HashSet<Signature>> {
        self.claimed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Total lamports the message's top-level System transfers move from `from` to `to`.
///
/// Accounts resolved through address lookup tables are not considered.
pub fn transferred_lamports(message: &VersionedMessage, from: &Pubkey, to: &Pubkey) -> u64 {
    let keys = message.static_account_keys();
    let key = |index: u8| keys.get(usize::from(index));
    let system_program = Pubkey::default();

    message
        .instructions()
        .iter()
        .filter(|ix| key(ix.program_id_index) == Some(&system_program))
        .filter(|ix| {
            matches!(ix.accounts.as_slice(), [source, dest, ..]
                if key(*source) == Some(from) && key(*dest) == Some(to))
        })
        .filter_map(|ix| {
            let (tag, lamports) = ix.data.split_first_chunk::<4>()?;
            if u32::from_le_bytes(*tag) != SYSTEM_TRANSFER_TAG {
                return None;
            }
            let lamports: [u8; 8] = lamports.try_into().ok()?;
            Some(u64::from_le_bytes(lamports))
        })
        .fold(0u64, u64::saturating_add)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use solana_sdk::instruction::Instruction;
    use solana_sdk::transaction::{Transaction, VersionedTransaction};

    use super::*;
    use crate::payout::FetchedTransaction;
    use crate::payout::fake::FakeRpc;
    use crate::payout::build_transfer_instruction;

    /// Record a finalized transaction carrying `instructions` under a fresh signature.
    pub(crate) fn record_deposit(
        rpc: &FakeRpc,
        payer: &Pubkey,
        instructions: &[Instruction],
        succeeded: bool,
        block_time: UnixTimestamp,
    ) -> Signature {
        let signature = Signature::from([rpc.transactions.lock().unwrap().len() as u8 + 1; 64]);
        let transaction = Transaction::new_with_payer(instructions, Some(payer));
        rpc.transactions.lock().unwrap().insert(
            signature,
            FetchedTransaction {
                transaction: VersionedTransaction::from(transaction),
                succeeded,
                block_time: Some(block_time),
            },
        );
        signature
    }

    /// Record a plain transfer of `lamports` from `player` to `vault`.
    pub(crate) fn record_transfer(
        rpc: &FakeRpc,
        player: &Pubkey,
        vault: &Pubkey,
        lamports: u64,
    ) -> Signature {
        let ix = build_transfer_instruction(player, vault, lamports);
        record_deposit(rpc, player, &[ix], true, 100)
    }
}
