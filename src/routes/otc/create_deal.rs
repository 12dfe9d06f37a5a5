use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::error::{BrokerError, Result};
use crate::model::{AssetSpec, Deal, Side};
use crate::routes::{parse_params, AppState};
use crate::store::new_party_token;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Params {
    side_a: AssetSpec,
    side_b: AssetSpec,
    timeout_seconds: i64,
    name: Option<String>,
}

pub async fn handle(state: &AppState, params: Value) -> Result<Value> {
    let params: Params = parse_params(params)?;
    validate_spec(state, &params.side_a)?;
    validate_spec(state, &params.side_b)?;
    if params.timeout_seconds <= 0 {
        return Err(BrokerError::InvalidInput("timeoutSeconds must be positive".into()));
    }

    let deal_id = Uuid::new_v4().simple().to_string();
    let name = params
        .name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| format!("Swap {}", &deal_id[..8]));
    let deal = Deal::new(
        deal_id.clone(),
        name.clone(),
        params.side_a,
        params.side_b,
        params.timeout_seconds as u64,
    );
    state.service.store.insert_deal(&deal).await?;

    let token_a = new_party_token();
    let token_b = new_party_token();
    state.service.store.insert_token(&token_a, &deal_id, Side::A).await?;
    state.service.store.insert_token(&token_b, &deal_id, Side::B).await?;

    let config = &state.service.config;
    info!(deal = %deal_id, %name, "deal created");
    Ok(json!({
        "dealId": deal_id,
        "dealName": name,
        "linkA": config.party_link(&deal_id, Side::A.letter(), &token_a),
        "linkB": config.party_link(&deal_id, Side::B.letter(), &token_b),
    }))
}

fn validate_spec(state: &AppState, spec: &AssetSpec) -> Result<()> {
    if !state.service.registry.contains(&spec.chain_id) {
        return Err(BrokerError::InvalidInput(format!("unknown chain: {}", spec.chain_id)));
    }
    if spec.amount <= Decimal::ZERO {
        return Err(BrokerError::InvalidInput(format!(
            "amount must be positive, got {}",
            spec.amount
        )));
    }
    if !spec.asset_code.token_address_valid() {
        return Err(BrokerError::InvalidInput(format!(
            "malformed token address in {}",
            spec.asset_code
        )));
    }
    let config = &state.service.config;
    if config.production_mode {
        if let Some(allowed) = &config.allowed_assets {
            let code = spec.asset_code.to_string();
            if !allowed.iter().any(|a| a.eq_ignore_ascii_case(&code)) {
                return Err(BrokerError::InvalidInput(format!(
                    "asset {code} is not enabled in this deployment"
                )));
            }
        }
        if let Some(settings) = config.chain(&spec.chain_id) {
            if let Some(max) = settings.max_amount {
                if spec.amount > max {
                    return Err(BrokerError::InvalidInput(format!(
                        "amount {} exceeds the {} limit for {}",
                        spec.amount, max, spec.chain_id
                    )));
                }
            }
        }
    }
    Ok(())
}
