//! SQLite persistence. One `Store` wraps the pool; the per-area impl blocks
//! live in the submodules (deals, tokens, payouts, quotes, deposits).
//!
//! Writers go through optimistic concurrency on `deals.version`; a failed
//! version check surfaces `VersionConflict` and the caller re-reads and
//! re-applies. Readers always get a consistent snapshot of one row.

mod deal_store;
mod deposit_store;
mod oracle_store;
mod payout_store;
mod token_store;

pub use payout_store::QueueItem;
pub use token_store::{new_party_token, TokenRecord};

use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use crate::error::{BrokerError, Result};

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        let store = Store { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub async fn in_memory() -> Result<Self> {
        // A single connection keeps the :memory: database alive and shared.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Store { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self) -> Result<()> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS deals (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                stage TEXT NOT NULL,
                timeout_seconds INTEGER NOT NULL,
                expires_at TEXT,
                spec_a_json TEXT NOT NULL,
                spec_b_json TEXT NOT NULL,
                commission_plan_json TEXT NOT NULL,
                escrow_a_json TEXT,
                escrow_b_json TEXT,
                side_a_state_json TEXT NOT NULL,
                side_b_state_json TEXT NOT NULL,
                events_json TEXT NOT NULL,
                gas_reimbursement_json TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                terminated_at TEXT,
                version INTEGER NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS party_details (
                deal_id TEXT NOT NULL,
                party TEXT NOT NULL,
                payback_address TEXT NOT NULL,
                recipient_address TEXT NOT NULL,
                email TEXT,
                filled_at TEXT NOT NULL,
                locked INTEGER NOT NULL,
                escrow_address TEXT,
                escrow_key_ref TEXT,
                PRIMARY KEY (deal_id, party)
            )",
            "CREATE TABLE IF NOT EXISTS tokens (
                token TEXT PRIMARY KEY,
                deal_id TEXT NOT NULL,
                party TEXT NOT NULL,
                created_at TEXT NOT NULL,
                used_at TEXT
            )",
            "CREATE TABLE IF NOT EXISTS payouts (
                payout_id TEXT PRIMARY KEY,
                deal_id TEXT NOT NULL,
                chain_id TEXT NOT NULL,
                from_addr TEXT NOT NULL,
                to_addr TEXT NOT NULL,
                asset_code TEXT NOT NULL,
                amount TEXT NOT NULL,
                purpose TEXT NOT NULL,
                status TEXT NOT NULL,
                min_confirmations INTEGER NOT NULL,
                submitted_tx_json TEXT,
                payout_group_id TEXT,
                created_at TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS payouts_deal ON payouts (deal_id)",
            "CREATE TABLE IF NOT EXISTS queue_items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                payout_id TEXT,
                deal_id TEXT NOT NULL,
                chain_id TEXT NOT NULL,
                asset TEXT NOT NULL,
                amount TEXT NOT NULL,
                from_json TEXT NOT NULL,
                to_addr TEXT NOT NULL,
                purpose TEXT NOT NULL,
                status TEXT NOT NULL,
                submitted_tx_json TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS queue_items_key ON queue_items (chain_id, from_json, status)",
            "CREATE TABLE IF NOT EXISTS oracle_quotes (
                chain_id TEXT NOT NULL,
                pair TEXT NOT NULL,
                price TEXT NOT NULL,
                as_of TEXT NOT NULL,
                source TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS oracle_quotes_pair ON oracle_quotes (chain_id, pair, as_of)",
            "CREATE TABLE IF NOT EXISTS escrow_deposits (
                deal_id TEXT NOT NULL,
                side TEXT NOT NULL,
                asset_code TEXT NOT NULL,
                amount TEXT NOT NULL,
                txid TEXT NOT NULL,
                original_txid TEXT,
                block_height INTEGER,
                confirmations INTEGER NOT NULL,
                is_synthetic INTEGER NOT NULL,
                resolution_status TEXT,
                resolution_metadata_json TEXT,
                observed_at TEXT NOT NULL,
                PRIMARY KEY (deal_id, side, txid)
            )",
            "CREATE TABLE IF NOT EXISTS adapter_submissions (
                chain_id TEXT NOT NULL,
                intent_id TEXT NOT NULL,
                txid TEXT NOT NULL,
                raw_tx TEXT,
                submitted_at TEXT NOT NULL,
                PRIMARY KEY (chain_id, intent_id)
            )",
            "CREATE TABLE IF NOT EXISTS adapter_escrows (
                chain_id TEXT NOT NULL,
                address TEXT NOT NULL,
                key_ref TEXT NOT NULL,
                asset_code TEXT NOT NULL,
                deal_id TEXT NOT NULL,
                side TEXT NOT NULL,
                first_seen_block INTEGER NOT NULL,
                PRIMARY KEY (chain_id, address)
            )",
        ];
        for sql in statements {
            sqlx::query(sql).execute(&self.pool).await?;
        }
        Ok(())
    }
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| BrokerError::Fatal(format!("serialize: {e}")))
}

pub(crate) fn from_json<T: DeserializeOwned>(raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| BrokerError::Fatal(format!("corrupt stored state: {e}")))
}
