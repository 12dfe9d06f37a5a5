use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::asset::AssetCode;

/// Confirmation lifecycle of an observed escrow credit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DepositStatus {
    /// Seen in the mempool, not mined yet.
    Unconfirmed,
    /// Mined but below the chain's required confirmation depth.
    Pending,
    /// At or above the required confirmation depth.
    Confirmed,
    /// Previously mined, now absent from the chain after a reorg. The amount
    /// no longer counts toward the collected balance.
    Orphaned,
}

/// Outcome of the synthetic-txid resolution pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    Resolved,
    Failed,
}

/// An observed credit to an escrow address.
///
/// When a balance is discovered without a discoverable originating
/// transaction (token balances seen via balance query before the
/// transfer-log scan completes), a placeholder entry is written with
/// `is_synthetic = true` and a deterministic placeholder txid; the watcher
/// later rewrites the txid once the real transfer is found.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deposit {
    pub asset_code: AssetCode,
    pub amount: Decimal,
    pub txid: String,
    pub block_height: Option<u64>,
    pub observed_at: DateTime<Utc>,
    pub confirmations: i64,
    pub min_conf_required: u32,
    pub status: DepositStatus,
    #[serde(default)]
    pub is_synthetic: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_txid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_status: Option<ResolutionStatus>,
    #[serde(default)]
    pub resolution_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_resolution_at: Option<DateTime<Utc>>,
}

impl Deposit {
    /// Whether the deposit contributes to the side's collected balance.
    pub fn counts_toward_collected(&self) -> bool {
        self.status != DepositStatus::Orphaned
    }

    /// Whether the deposit satisfies collection sufficiency.
    pub fn is_confirmed(&self) -> bool {
        self.status == DepositStatus::Confirmed
    }

    /// Refresh the status from a newly observed confirmation count.
    /// `-1` means the transaction is gone from the chain (reorg).
    pub fn apply_confirmations(&mut self, confirmations: i64, block_height: Option<u64>) {
        self.confirmations = confirmations;
        if block_height.is_some() {
            self.block_height = block_height;
        }
        self.status = if confirmations < 0 {
            DepositStatus::Orphaned
        } else if confirmations == 0 {
            DepositStatus::Unconfirmed
        } else if confirmations >= self.min_conf_required as i64 {
            DepositStatus::Confirmed
        } else {
            DepositStatus::Pending
        };
    }

    /// Whether a synthetic entry is still awaiting resolution of its real
    /// originating transaction.
    pub fn resolution_outstanding(&self) -> bool {
        self.is_synthetic && self.resolution_status.is_none()
    }
}

/// Ordering key used for deposits within one escrow: mined entries first by
/// height, mempool entries last, ties broken by observation time.
pub fn deposit_sort_key(d: &Deposit) -> (u64, DateTime<Utc>, String) {
    (d.block_height.unwrap_or(u64::MAX), d.observed_at, d.txid.clone())
}
