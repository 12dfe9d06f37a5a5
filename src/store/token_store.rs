use chrono::{DateTime, Utc};
use sqlx::Row;

use crate::error::{BrokerError, Result};
use crate::model::Side;

use super::Store;

/// A party link token row: which deal and side it authorizes.
#[derive(Debug, Clone)]
pub struct TokenRecord {
    pub token: String,
    pub deal_id: String,
    pub party: Side,
    pub used_at: Option<DateTime<Utc>>,
}

impl Store {
    pub async fn insert_token(&self, token: &str, deal_id: &str, party: Side) -> Result<()> {
        sqlx::query("INSERT INTO tokens (token, deal_id, party, created_at) VALUES (?, ?, ?, ?)")
            .bind(token)
            .bind(deal_id)
            .bind(party.to_string())
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn lookup_token(&self, token: &str) -> Result<Option<TokenRecord>> {
        let row = sqlx::query("SELECT token, deal_id, party, used_at FROM tokens WHERE token = ?")
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let party: String = row.get("party");
                Ok(Some(TokenRecord {
                    token: row.get("token"),
                    deal_id: row.get("deal_id"),
                    party: party
                        .parse()
                        .map_err(|e: String| BrokerError::Fatal(format!("corrupt token row: {e}")))?,
                    used_at: row.get("used_at"),
                }))
            }
        }
    }

    /// Resolve a token for a specific deal, rejecting mismatches uniformly
    /// so a valid token for deal X cannot probe deal Y.
    pub async fn authorize(&self, token: &str, deal_id: &str) -> Result<TokenRecord> {
        match self.lookup_token(token).await? {
            Some(record) if record.deal_id == deal_id => Ok(record),
            _ => Err(BrokerError::InvalidToken),
        }
    }

    pub async fn mark_token_used(&self, token: &str) -> Result<()> {
        sqlx::query("UPDATE tokens SET used_at = ? WHERE token = ?")
            .bind(Utc::now())
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// A fresh 128-bit party token, hex encoded.
pub fn new_party_token() -> String {
    let bytes: [u8; 16] = rand::random();
    hex::encode(bytes)
}
