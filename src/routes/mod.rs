//! JSON-RPC 2.0 surface: one `POST /rpc` route, dispatching on the method
//! name to the per-method handler modules below.

pub mod admin;
pub mod otc;

use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::engine::DealService;
use crate::error::BrokerError;
use crate::mail::Mailer;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<DealService>,
    pub mailer: Arc<dyn Mailer>,
}

pub fn router(state: AppState) -> Router {
    Router::new().route("/rpc", post(handle_rpc)).with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    #[allow(dead_code)]
    pub jsonrpc: Option<String>,
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

async fn handle_rpc(State(state): State<AppState>, Json(request): Json<RpcRequest>) -> Json<Value> {
    let id = request.id.clone().unwrap_or(Value::Null);
    debug!(method = %request.method, "rpc call");
    let outcome = dispatch(&state, &request.method, request.params).await;
    let response = match outcome {
        Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
        Err(DispatchError::UnknownMethod) => json!({
            "jsonrpc": "2.0", "id": id,
            "error": RpcError { code: -32601, message: format!("method not found: {}", request.method) },
        }),
        Err(DispatchError::Broker(e)) => {
            warn!(method = %request.method, error = %e, "rpc call failed");
            json!({
                "jsonrpc": "2.0", "id": id,
                "error": RpcError { code: -32603, message: e.to_string() },
            })
        }
    };
    Json(response)
}

enum DispatchError {
    UnknownMethod,
    Broker(BrokerError),
}

impl From<BrokerError> for DispatchError {
    fn from(e: BrokerError) -> Self {
        DispatchError::Broker(e)
    }
}

async fn dispatch(state: &AppState, method: &str, params: Value) -> Result<Value, DispatchError> {
    let result = match method {
        "otc.createDeal" => otc::create_deal::handle(state, params).await,
        "otc.fillPartyDetails" => otc::fill_party_details::handle(state, params).await,
        "otc.status" => otc::status::handle(state, params).await,
        "otc.cancelDeal" => otc::cancel_deal::handle(state, params).await,
        "otc.sendInvite" => otc::send_invite::handle(state, params).await,
        "otc.getChainConfig" => otc::get_chain_config::handle(state, params).await,
        "admin.setPrice" => admin::set_price::handle(state, params).await,
        _ => return Err(DispatchError::UnknownMethod),
    };
    result.map_err(DispatchError::from)
}

/// Deserialize RPC params, mapping malformed input onto `InvalidInput`.
pub(crate) fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, BrokerError> {
    serde_json::from_value(params).map_err(|e| BrokerError::InvalidInput(e.to_string()))
}
