use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::Row;

use crate::error::{BrokerError, Result};
use crate::model::OracleQuote;

use super::Store;

impl Store {
    /// Append-only quote log; readers take the latest per `(chain, pair)`.
    pub async fn record_quote(&self, chain_id: &str, quote: &OracleQuote) -> Result<()> {
        sqlx::query(
            "INSERT INTO oracle_quotes (chain_id, pair, price, as_of, source) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(chain_id)
        .bind(&quote.pair)
        .bind(quote.price.to_string())
        .bind(quote.as_of)
        .bind(&quote.source)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn latest_quote(&self, chain_id: &str, pair: &str) -> Result<Option<OracleQuote>> {
        let row = sqlx::query(
            "SELECT pair, price, as_of, source FROM oracle_quotes \
             WHERE chain_id = ? AND pair = ? ORDER BY as_of DESC LIMIT 1",
        )
        .bind(chain_id)
        .bind(pair)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let price: String = row.get("price");
                Ok(Some(OracleQuote {
                    pair: row.get("pair"),
                    price: Decimal::from_str(&price)
                        .map_err(|e| BrokerError::Fatal(format!("corrupt quote row: {e}")))?,
                    as_of: row.get::<DateTime<Utc>, _>("as_of"),
                    source: row.get("source"),
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn latest_quote_wins() {
        let store = Store::in_memory().await.unwrap();
        assert!(store.latest_quote("ETH", "ETH/USD").await.unwrap().is_none());

        let older = OracleQuote {
            pair: "ETH/USD".into(),
            price: dec!(2000),
            as_of: Utc::now() - chrono::Duration::minutes(5),
            source: "MANUAL".into(),
        };
        let newer = OracleQuote {
            pair: "ETH/USD".into(),
            price: dec!(2100),
            as_of: Utc::now(),
            source: "MANUAL".into(),
        };
        store.record_quote("ETH", &older).await.unwrap();
        store.record_quote("ETH", &newer).await.unwrap();

        let latest = store.latest_quote("ETH", "ETH/USD").await.unwrap().unwrap();
        assert_eq!(latest.price, dec!(2100));
        // Other pairs are unaffected.
        assert!(store.latest_quote("ETH", "MATIC/USD").await.unwrap().is_none());
    }
}
