use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::error::{BrokerError, Result};
use crate::model::DealStage;
use crate::routes::{parse_params, AppState};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Params {
    deal_id: String,
    token: String,
}

/// A party may walk away only while the deal is still CREATED: no escrows
/// exist yet, so there is nothing to refund.
pub async fn handle(state: &AppState, params: Value) -> Result<Value> {
    let params: Params = parse_params(params)?;
    state.service.store.authorize(&params.token, &params.deal_id).await?;

    let rejection = state
        .service
        .mutate(&params.deal_id, |d| {
            if d.stage != DealStage::Created {
                d.push_event(format!("rejected cancellation in {}", d.stage));
                return Ok(Some(format!("cancellation is only possible in CREATED, not {}", d.stage)));
            }
            d.stage = DealStage::Reverted;
            d.terminated_at = Some(Utc::now());
            d.push_event("stage: REVERTED (cancelled by a party)");
            info!(deal = %d.id, "cancelled");
            Ok(None)
        })
        .await?;
    if let Some(reason) = rejection {
        return Err(BrokerError::InvalidTransition(reason));
    }
    Ok(json!({ "ok": true }))
}
