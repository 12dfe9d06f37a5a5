use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::{BrokerError, Result};
use crate::model::{DealStage, PartyDetails, Side};
use crate::routes::{parse_params, AppState};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Params {
    deal_id: String,
    party: Side,
    payback_address: String,
    recipient_address: String,
    email: Option<String>,
    token: String,
}

pub async fn handle(state: &AppState, params: Value) -> Result<Value> {
    let params: Params = parse_params(params)?;
    let record = state.service.store.authorize(&params.token, &params.deal_id).await.map_err(|e| {
        warn!(deal = %params.deal_id, "party token rejected");
        e
    })?;
    if record.party != params.party {
        warn!(deal = %params.deal_id, "token does not match the requested party");
        return Err(BrokerError::InvalidToken);
    }

    // Address validation needs the deal's chain layout before mutation.
    let deal = state.service.store.load_deal(&params.deal_id).await?;
    let side = params.party;
    let send_chain = state.service.registry.get(&deal.spec(side).chain_id)?;
    let recv_chain = state.service.registry.get(&deal.spec(side.other()).chain_id)?;
    if !send_chain.validate_address(&params.payback_address) {
        return Err(BrokerError::InvalidInput(format!(
            "payback address is not valid on {}",
            deal.spec(side).chain_id
        )));
    }
    if !recv_chain.validate_address(&params.recipient_address) {
        return Err(BrokerError::InvalidInput(format!(
            "recipient address is not valid on {}",
            deal.spec(side.other()).chain_id
        )));
    }

    // A rejection still appends its event, so the closure reports the
    // violation instead of erroring out of the save.
    let rejection = state
        .service
        .mutate(&params.deal_id, |d| {
            if d.stage != DealStage::Created {
                d.push_event(format!("rejected details change for side {side} in {}", d.stage));
                return Ok(Some(format!("details cannot change once the deal is in {}", d.stage)));
            }
            if d.party(side).is_some_and(|p| p.locked) {
                d.push_event(format!("rejected details change for locked side {side}"));
                return Ok(Some(format!("side {side} details are locked")));
            }
            d.set_party(
                side,
                PartyDetails {
                    payback_address: params.payback_address.clone(),
                    recipient_address: params.recipient_address.clone(),
                    email: params.email.clone(),
                    filled_at: Utc::now(),
                    locked: true,
                },
            );
            d.push_event(format!("side {side} details filled and locked"));
            info!(deal = %d.id, %side, "party details locked");
            Ok(None)
        })
        .await?;
    if let Some(reason) = rejection {
        return Err(BrokerError::InvalidTransition(reason));
    }
    state.service.store.mark_token_used(&params.token).await?;
    Ok(json!({ "ok": true }))
}
