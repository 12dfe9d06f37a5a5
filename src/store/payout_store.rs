use std::str::FromStr;

use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::error::{BrokerError, Result};
use crate::model::{Escrow, PayoutIntent, PayoutPurpose, PayoutStatus, SubmittedTx};

use super::{from_json, to_json, Store};

/// One unit of submission work: the intent plus the escrow it spends from.
/// Ordered by the queue row id, which is assigned at persist time and gives
/// the per-`(chain, escrow)` submission order.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub queue_id: i64,
    pub intent: PayoutIntent,
    pub from: Escrow,
}

/// Insert one intent plus its queue row inside an open transaction; used by
/// the deal store so stage transitions and their payouts commit atomically.
pub(super) async fn insert_intent_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    intent: &PayoutIntent,
    from: &Escrow,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO payouts (payout_id, deal_id, chain_id, from_addr, to_addr, asset_code, \
         amount, purpose, status, min_confirmations, submitted_tx_json, payout_group_id, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&intent.id)
    .bind(&intent.deal_id)
    .bind(&intent.chain_id)
    .bind(&intent.from_escrow)
    .bind(&intent.to_address)
    .bind(intent.asset_code.to_string())
    .bind(intent.amount.to_string())
    .bind(intent.purpose.to_string())
    .bind(intent.status.to_string())
    .bind(intent.min_confirmations as i64)
    .bind(intent.submitted_tx.as_ref().map(to_json).transpose()?)
    .bind(&intent.payout_group_id)
    .bind(intent.created_at)
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        "INSERT INTO queue_items (payout_id, deal_id, chain_id, asset, amount, from_json, \
         to_addr, purpose, status, submitted_tx_json, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&intent.id)
    .bind(&intent.deal_id)
    .bind(&intent.chain_id)
    .bind(intent.asset_code.to_string())
    .bind(intent.amount.to_string())
    .bind(to_json(from)?)
    .bind(&intent.to_address)
    .bind(intent.purpose.to_string())
    .bind(intent.status.to_string())
    .bind(intent.submitted_tx.as_ref().map(to_json).transpose()?)
    .bind(intent.created_at)
    .bind(Utc::now())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

impl Store {
    /// Persist intents outside a deal transition (surveillance refunds, tank
    /// sweeps).
    pub async fn enqueue_intents(&self, intents: &[(PayoutIntent, Escrow)]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (intent, from) in intents {
            insert_intent_tx(&mut tx, intent, from).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn load_intent(&self, intent_id: &str) -> Result<PayoutIntent> {
        let row = sqlx::query("SELECT * FROM payouts WHERE payout_id = ?")
            .bind(intent_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| BrokerError::NotFound(format!("payout {intent_id}")))?;
        intent_from_row(&row)
    }

    pub async fn load_intents_for_deal(&self, deal_id: &str) -> Result<Vec<PayoutIntent>> {
        let rows = sqlx::query("SELECT * FROM payouts WHERE deal_id = ? ORDER BY created_at, payout_id")
            .bind(deal_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(intent_from_row).collect()
    }

    /// Escrow queues that still have unfinished work, for worker spawning.
    pub async fn queue_keys_with_work(&self) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query(
            "SELECT DISTINCT chain_id, from_addr FROM payouts \
             WHERE status IN ('PENDING', 'SUBMITTED')",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| (r.get("chain_id"), r.get("from_addr"))).collect())
    }

    /// The next item for one escrow queue, in queue-row order. Earlier items
    /// must reach a terminal status before later ones are handed out, which
    /// enforces the one-SUBMITTED-per-escrow invariant.
    pub async fn next_queue_item(&self, chain_id: &str, from_addr: &str) -> Result<Option<QueueItem>> {
        let row = sqlx::query(
            "SELECT q.id AS queue_id, q.from_json, p.* FROM queue_items q \
             JOIN payouts p ON p.payout_id = q.payout_id \
             WHERE p.chain_id = ? AND p.from_addr = ? AND p.status IN ('PENDING', 'SUBMITTED') \
             ORDER BY q.id LIMIT 1",
        )
        .bind(chain_id)
        .bind(from_addr)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let intent = intent_from_row(&row)?;
                let from: Escrow = from_json(row.get::<String, _>("from_json").as_str())?;
                Ok(Some(QueueItem { queue_id: row.get("queue_id"), intent, from }))
            }
        }
    }

    /// Record the pre-submission attempt: the intent flips to SUBMITTED with
    /// no tx yet, so a crash during the adapter call is detectable and the
    /// retry reuses the same intent id.
    pub async fn mark_submitting(&self, intent_id: &str) -> Result<()> {
        self.set_intent_status(intent_id, PayoutStatus::Submitted, None).await
    }

    pub async fn record_submission(&self, intent_id: &str, tx: &SubmittedTx) -> Result<()> {
        self.set_intent_status(intent_id, PayoutStatus::Submitted, Some(tx)).await
    }

    pub async fn record_confirmations(&self, intent_id: &str, tx: &SubmittedTx) -> Result<()> {
        self.set_intent_status(intent_id, PayoutStatus::Submitted, Some(tx)).await
    }

    pub async fn mark_completed(&self, intent_id: &str, tx: &SubmittedTx) -> Result<()> {
        self.set_intent_status(intent_id, PayoutStatus::Completed, Some(tx)).await
    }

    pub async fn mark_failed(&self, intent_id: &str) -> Result<()> {
        self.set_intent_status(intent_id, PayoutStatus::Failed, None).await
    }

    async fn set_intent_status(
        &self,
        intent_id: &str,
        status: PayoutStatus,
        tx: Option<&SubmittedTx>,
    ) -> Result<()> {
        let tx_json = tx.map(to_json).transpose()?;
        sqlx::query("UPDATE payouts SET status = ?, submitted_tx_json = COALESCE(?, submitted_tx_json) WHERE payout_id = ?")
            .bind(status.to_string())
            .bind(&tx_json)
            .bind(intent_id)
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "UPDATE queue_items SET status = ?, submitted_tx_json = COALESCE(?, submitted_tx_json), \
             updated_at = ? WHERE payout_id = ?",
        )
        .bind(status.to_string())
        .bind(&tx_json)
        .bind(Utc::now())
        .bind(intent_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn intent_from_row(row: &SqliteRow) -> Result<PayoutIntent> {
    let corrupt = |e: String| BrokerError::Fatal(format!("corrupt payout row: {e}"));
    let amount: String = row.get("amount");
    let asset: String = row.get("asset_code");
    let purpose: String = row.get("purpose");
    let status: String = row.get("status");
    Ok(PayoutIntent {
        id: row.get("payout_id"),
        deal_id: row.get("deal_id"),
        chain_id: row.get("chain_id"),
        from_escrow: row.get("from_addr"),
        to_address: row.get("to_addr"),
        asset_code: asset.parse().map_err(corrupt)?,
        amount: Decimal::from_str(&amount).map_err(|e| corrupt(e.to_string()))?,
        purpose: purpose.parse().map_err(corrupt)?,
        status: status.parse().map_err(corrupt)?,
        min_confirmations: row.get::<i64, _>("min_confirmations") as u32,
        submitted_tx: row
            .get::<Option<String>, _>("submitted_tx_json")
            .map(|raw| from_json(&raw))
            .transpose()?,
        payout_group_id: row.get("payout_group_id"),
        created_at: row.get("created_at"),
    })
}
