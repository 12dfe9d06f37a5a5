use crate::error::Result;
use crate::model::{Deposit, Side};

use super::{to_json, Store};

impl Store {
    /// Write-through projection of the deal's deposit ledger, one row per
    /// observed credit. The deal JSON stays canonical; this table exists for
    /// operator queries and audits.
    pub async fn upsert_deposit_row(&self, deal_id: &str, side: Side, deposit: &Deposit) -> Result<()> {
        sqlx::query(
            "INSERT INTO escrow_deposits (deal_id, side, asset_code, amount, txid, original_txid, \
             block_height, confirmations, is_synthetic, resolution_status, \
             resolution_metadata_json, observed_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (deal_id, side, txid) DO UPDATE SET \
             amount = excluded.amount, \
             original_txid = excluded.original_txid, \
             block_height = excluded.block_height, \
             confirmations = excluded.confirmations, \
             is_synthetic = excluded.is_synthetic, \
             resolution_status = excluded.resolution_status, \
             resolution_metadata_json = excluded.resolution_metadata_json",
        )
        .bind(deal_id)
        .bind(side.to_string())
        .bind(deposit.asset_code.to_string())
        .bind(deposit.amount.to_string())
        .bind(&deposit.txid)
        .bind(&deposit.original_txid)
        .bind(deposit.block_height.map(|h| h as i64))
        .bind(deposit.confirmations)
        .bind(deposit.is_synthetic as i64)
        .bind(deposit.resolution_status.map(|s| to_json(&s)).transpose()?)
        .bind(resolution_metadata(deposit)?)
        .bind(deposit.observed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// A resolved synthetic entry changes txid; retire the placeholder row.
    pub async fn delete_deposit_row(&self, deal_id: &str, side: Side, txid: &str) -> Result<()> {
        sqlx::query("DELETE FROM escrow_deposits WHERE deal_id = ? AND side = ? AND txid = ?")
            .bind(deal_id)
            .bind(side.to_string())
            .bind(txid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn resolution_metadata(deposit: &Deposit) -> Result<Option<String>> {
    if !deposit.is_synthetic && deposit.original_txid.is_none() {
        return Ok(None);
    }
    Ok(Some(to_json(&serde_json::json!({
        "attempts": deposit.resolution_attempts,
        "nextAttemptAt": deposit.next_resolution_at,
    }))?))
}
