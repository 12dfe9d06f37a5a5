//! Public deal projection. Status is addressable by deal id alone; it
//! carries no authority, so no token is required.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::engine::commission;
use crate::error::Result;
use crate::model::{Deal, PayoutIntent, Side};
use crate::routes::{parse_params, AppState};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Params {
    deal_id: String,
}

pub async fn handle(state: &AppState, params: Value) -> Result<Value> {
    let params: Params = parse_params(params)?;
    let deal = state.service.store.load_deal(&params.deal_id).await?;
    let payouts = state.service.store.load_intents_for_deal(&deal.id).await?;
    Ok(project(state, &deal, &payouts))
}

fn project(state: &AppState, deal: &Deal, payouts: &[PayoutIntent]) -> Value {
    json!({
        "stage": deal.stage,
        "timeoutSeconds": deal.timeout_seconds,
        "expiresAt": deal.expires_at,
        "instructions": {
            "sideA": side_instructions(state, deal, Side::A),
            "sideB": side_instructions(state, deal, Side::B),
        },
        "collection": {
            "sideA": {
                "deposits": deal.side_a.deposits,
                "collectedByAsset": deal.side_a.collected_by_asset,
            },
            "sideB": {
                "deposits": deal.side_b.deposits,
                "collectedByAsset": deal.side_b.collected_by_asset,
            },
        },
        "events": deal.events,
        "partyDetails": { "A": deal.party_a, "B": deal.party_b },
        "spec": { "A": deal.spec_a, "B": deal.spec_b },
        "commissionPlan": { "A": deal.commission_a, "B": deal.commission_b },
        "escrow": { "A": deal.escrow_a, "B": deal.escrow_b },
        "transactions": transactions(deal, payouts),
        "payouts": payouts,
        "rpcEndpoints": rpc_endpoints(state),
    })
}

/// What each side still has to send, and where. Empty until the escrows and
/// commission plans exist.
fn side_instructions(state: &AppState, deal: &Deal, side: Side) -> Vec<Value> {
    let (Some(escrow), Some(plan)) = (deal.escrow(side), deal.commission(side)) else {
        return Vec::new();
    };
    let Ok(settings) = state.service.registry.settings(&deal.spec(side).chain_id) else {
        return Vec::new();
    };
    commission::required_by_asset(deal.spec(side), plan, settings)
        .into_iter()
        .map(|(asset, amount)| {
            json!({ "assetCode": asset, "amount": amount, "to": escrow.address })
        })
        .collect()
}

/// Flat transaction history for display: every observed deposit and every
/// submitted payout, newest last.
fn transactions(deal: &Deal, payouts: &[PayoutIntent]) -> Vec<Value> {
    let mut txs = Vec::new();
    for side in Side::BOTH {
        for deposit in &deal.side_state(side).deposits {
            txs.push(json!({
                "direction": "in",
                "side": side,
                "txid": deposit.txid,
                "assetCode": deposit.asset_code,
                "amount": deposit.amount,
                "confirmations": deposit.confirmations,
                "status": deposit.status,
            }));
        }
    }
    for payout in payouts {
        if let Some(tx) = &payout.submitted_tx {
            txs.push(json!({
                "direction": "out",
                "purpose": payout.purpose,
                "txid": tx.txid,
                "additionalTxids": tx.additional_txids,
                "assetCode": payout.asset_code,
                "amount": payout.amount,
                "confirmations": tx.confirms,
                "status": payout.status,
            }));
        }
    }
    txs
}

fn rpc_endpoints(state: &AppState) -> Value {
    let mut endpoints = serde_json::Map::new();
    for settings in state.service.registry.known() {
        endpoints.insert(settings.chain_id.clone(), json!(settings.rpc_url));
    }
    Value::Object(endpoints)
}
