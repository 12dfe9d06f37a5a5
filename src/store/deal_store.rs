use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::error::{BrokerError, Result};
use crate::model::{CommissionPlan, Deal, DealEvent, DealStage, Escrow, PartyDetails, Side};

use super::{from_json, to_json, Store};

/// Both sides' commission plans, stored as one JSON column.
#[derive(Debug, Default, Serialize, Deserialize)]
struct CommissionPlans {
    #[serde(skip_serializing_if = "Option::is_none")]
    a: Option<CommissionPlan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    b: Option<CommissionPlan>,
}

impl Store {
    pub async fn insert_deal(&self, deal: &Deal) -> Result<()> {
        let plans = CommissionPlans { a: deal.commission_a.clone(), b: deal.commission_b.clone() };
        sqlx::query(
            "INSERT INTO deals (id, name, stage, timeout_seconds, expires_at, spec_a_json, \
             spec_b_json, commission_plan_json, escrow_a_json, escrow_b_json, side_a_state_json, \
             side_b_state_json, events_json, gas_reimbursement_json, created_at, updated_at, \
             terminated_at, version) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&deal.id)
        .bind(&deal.name)
        .bind(deal.stage.to_string())
        .bind(deal.timeout_seconds as i64)
        .bind(deal.expires_at)
        .bind(to_json(&deal.spec_a)?)
        .bind(to_json(&deal.spec_b)?)
        .bind(to_json(&plans)?)
        .bind(deal.escrow_a.as_ref().map(to_json).transpose()?)
        .bind(deal.escrow_b.as_ref().map(to_json).transpose()?)
        .bind(to_json(&deal.side_a)?)
        .bind(to_json(&deal.side_b)?)
        .bind(to_json(&deal.events)?)
        .bind(deal.gas_reimbursement.as_ref().map(to_json).transpose()?)
        .bind(deal.created_at)
        .bind(deal.updated_at)
        .bind(deal.terminated_at)
        .bind(deal.version)
        .execute(&self.pool)
        .await?;
        self.upsert_party_rows(deal).await?;
        Ok(())
    }

    /// Version-checked write. On success the in-memory version is bumped to
    /// match the stored row.
    pub async fn save_deal(&self, deal: &mut Deal) -> Result<()> {
        deal.updated_at = Utc::now();
        let rows = self.update_deal_row(deal, None).await?;
        if rows == 0 {
            return Err(BrokerError::VersionConflict(deal.id.clone()));
        }
        deal.version += 1;
        self.upsert_party_rows(deal).await?;
        Ok(())
    }

    /// Version-checked write plus payout-intent persistence in the same
    /// transaction, so a stage transition and the intents it plans are
    /// atomic: a crash can never leave a SWAP deal without its payouts.
    pub async fn save_deal_with_payouts(
        &self,
        deal: &mut Deal,
        intents: &[crate::model::PayoutIntent],
    ) -> Result<()> {
        deal.updated_at = Utc::now();
        let mut tx = self.pool.begin().await?;
        let rows = self.update_deal_row(deal, Some(&mut tx)).await?;
        if rows == 0 {
            tx.rollback().await?;
            return Err(BrokerError::VersionConflict(deal.id.clone()));
        }
        for intent in intents {
            let escrow = deal
                .escrow(Side::A)
                .filter(|e| e.address == intent.from_escrow)
                .or_else(|| deal.escrow(Side::B).filter(|e| e.address == intent.from_escrow))
                .cloned()
                .unwrap_or(Escrow { address: intent.from_escrow.clone(), key_ref: String::new() });
            super::payout_store::insert_intent_tx(&mut tx, intent, &escrow).await?;
        }
        tx.commit().await?;
        deal.version += 1;
        self.upsert_party_rows(deal).await?;
        Ok(())
    }

    async fn update_deal_row(
        &self,
        deal: &Deal,
        tx: Option<&mut sqlx::Transaction<'_, sqlx::Sqlite>>,
    ) -> Result<u64> {
        let plans = CommissionPlans { a: deal.commission_a.clone(), b: deal.commission_b.clone() };
        let query = sqlx::query(
            "UPDATE deals SET name = ?, stage = ?, expires_at = ?, commission_plan_json = ?, \
             escrow_a_json = ?, escrow_b_json = ?, side_a_state_json = ?, side_b_state_json = ?, \
             events_json = ?, gas_reimbursement_json = ?, updated_at = ?, terminated_at = ?, \
             version = version + 1 \
             WHERE id = ? AND version = ?",
        )
        .bind(&deal.name)
        .bind(deal.stage.to_string())
        .bind(deal.expires_at)
        .bind(to_json(&plans)?)
        .bind(deal.escrow_a.as_ref().map(to_json).transpose()?)
        .bind(deal.escrow_b.as_ref().map(to_json).transpose()?)
        .bind(to_json(&deal.side_a)?)
        .bind(to_json(&deal.side_b)?)
        .bind(to_json(&deal.events)?)
        .bind(deal.gas_reimbursement.as_ref().map(to_json).transpose()?)
        .bind(deal.updated_at)
        .bind(deal.terminated_at)
        .bind(&deal.id)
        .bind(deal.version);
        let result = match tx {
            Some(tx) => query.execute(&mut **tx).await?,
            None => query.execute(&self.pool).await?,
        };
        Ok(result.rows_affected())
    }

    pub async fn load_deal(&self, deal_id: &str) -> Result<Deal> {
        self.try_load_deal(deal_id)
            .await?
            .ok_or_else(|| BrokerError::NotFound(deal_id.to_string()))
    }

    pub async fn try_load_deal(&self, deal_id: &str) -> Result<Option<Deal>> {
        let row = sqlx::query("SELECT * FROM deals WHERE id = ?")
            .bind(deal_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let mut deal = deal_from_row(&row)?;
                self.attach_parties(&mut deal).await?;
                Ok(Some(deal))
            }
        }
    }

    /// Deals the engine actively drives.
    pub async fn list_active_deals(&self) -> Result<Vec<Deal>> {
        let rows = sqlx::query(
            "SELECT * FROM deals WHERE stage IN ('CREATED', 'COLLECTION', 'WAITING', 'SWAP') \
             ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut deals = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut deal = deal_from_row(row)?;
            self.attach_parties(&mut deal).await?;
            deals.push(deal);
        }
        Ok(deals)
    }

    /// Terminal deals still inside the stray-deposit surveillance window.
    pub async fn list_deals_in_surveillance(
        &self,
        now: DateTime<Utc>,
        window_hours: u64,
    ) -> Result<Vec<Deal>> {
        let cutoff = now - Duration::hours(window_hours as i64);
        let rows = sqlx::query(
            "SELECT * FROM deals WHERE stage IN ('CLOSED', 'REVERTED') AND terminated_at > ? \
             ORDER BY terminated_at",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        let mut deals = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut deal = deal_from_row(row)?;
            self.attach_parties(&mut deal).await?;
            deals.push(deal);
        }
        Ok(deals)
    }

    async fn attach_parties(&self, deal: &mut Deal) -> Result<()> {
        let rows = sqlx::query(
            "SELECT party, payback_address, recipient_address, email, filled_at, locked \
             FROM party_details WHERE deal_id = ?",
        )
        .bind(&deal.id)
        .fetch_all(&self.pool)
        .await?;
        for row in rows {
            let party: String = row.get("party");
            let side: Side = party
                .parse()
                .map_err(|e: String| BrokerError::Fatal(format!("corrupt party row: {e}")))?;
            deal.set_party(
                side,
                PartyDetails {
                    payback_address: row.get("payback_address"),
                    recipient_address: row.get("recipient_address"),
                    email: row.get("email"),
                    filled_at: row.get("filled_at"),
                    locked: row.get::<i64, _>("locked") != 0,
                },
            );
        }
        Ok(())
    }

    async fn upsert_party_rows(&self, deal: &Deal) -> Result<()> {
        for side in Side::BOTH {
            let Some(details) = deal.party(side) else { continue };
            let escrow = deal.escrow(side);
            sqlx::query(
                "INSERT INTO party_details (deal_id, party, payback_address, recipient_address, \
                 email, filled_at, locked, escrow_address, escrow_key_ref) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT (deal_id, party) DO UPDATE SET \
                 payback_address = excluded.payback_address, \
                 recipient_address = excluded.recipient_address, \
                 email = excluded.email, locked = excluded.locked, \
                 escrow_address = excluded.escrow_address, \
                 escrow_key_ref = excluded.escrow_key_ref",
            )
            .bind(&deal.id)
            .bind(side.to_string())
            .bind(&details.payback_address)
            .bind(&details.recipient_address)
            .bind(&details.email)
            .bind(details.filled_at)
            .bind(details.locked as i64)
            .bind(escrow.map(|e| e.address.clone()))
            .bind(escrow.map(|e| e.key_ref.clone()))
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }
}

fn deal_from_row(row: &SqliteRow) -> Result<Deal> {
    let stage_raw: String = row.get("stage");
    let stage: DealStage = stage_raw
        .parse()
        .map_err(|e: String| BrokerError::Fatal(format!("corrupt deal row: {e}")))?;
    let plans: CommissionPlans = from_json(row.get::<String, _>("commission_plan_json").as_str())?;
    let events: Vec<DealEvent> = from_json(row.get::<String, _>("events_json").as_str())?;
    let event_seq = events.last().map(|e| e.seq).unwrap_or(0);
    let escrow_a = row
        .get::<Option<String>, _>("escrow_a_json")
        .map(|raw| from_json::<Escrow>(&raw))
        .transpose()?;
    let escrow_b = row
        .get::<Option<String>, _>("escrow_b_json")
        .map(|raw| from_json::<Escrow>(&raw))
        .transpose()?;
    let gas = row
        .get::<Option<String>, _>("gas_reimbursement_json")
        .map(|raw| from_json(&raw))
        .transpose()?;
    Ok(Deal {
        id: row.get("id"),
        name: row.get("name"),
        spec_a: from_json(row.get::<String, _>("spec_a_json").as_str())?,
        spec_b: from_json(row.get::<String, _>("spec_b_json").as_str())?,
        timeout_seconds: row.get::<i64, _>("timeout_seconds") as u64,
        stage,
        expires_at: row.get("expires_at"),
        party_a: None,
        party_b: None,
        escrow_a,
        escrow_b,
        commission_a: plans.a,
        commission_b: plans.b,
        side_a: from_json(row.get::<String, _>("side_a_state_json").as_str())?,
        side_b: from_json(row.get::<String, _>("side_b_state_json").as_str())?,
        events,
        event_seq,
        gas_reimbursement: gas,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        terminated_at: row.get("terminated_at"),
        version: row.get("version"),
    })
}
