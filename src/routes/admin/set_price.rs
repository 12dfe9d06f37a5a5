use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::error::{BrokerError, Result};
use crate::model::OracleQuote;
use crate::routes::{parse_params, AppState};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Params {
    chain_id: String,
    pair: String,
    price: Decimal,
}

/// Operator-entered price, recorded with source MANUAL. Adapters use the
/// latest quote per `(chain, pair)` when freezing USD-fixed commissions.
pub async fn handle(state: &AppState, params: Value) -> Result<Value> {
    let params: Params = parse_params(params)?;
    if params.price <= Decimal::ZERO {
        return Err(BrokerError::InvalidInput(format!("price must be positive, got {}", params.price)));
    }
    if !params.pair.contains('/') {
        return Err(BrokerError::InvalidInput(format!("malformed pair: {}", params.pair)));
    }
    let quote = OracleQuote {
        pair: params.pair.clone(),
        price: params.price,
        as_of: Utc::now(),
        source: "MANUAL".into(),
    };
    state.service.store.record_quote(&params.chain_id, &quote).await?;
    info!(chain = %params.chain_id, pair = %params.pair, price = %params.price, "manual price recorded");
    Ok(json!({ "ok": true, "asOf": quote.as_of }))
}
