use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::ChainSettings;
use crate::error::{BrokerError, Result};
use crate::routes::{parse_params, AppState};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Params {
    chain_id: Option<String>,
}

/// Registry view for client live-data display: endpoint hints, confirmation
/// depths, explorer templates.
pub async fn handle(state: &AppState, params: Value) -> Result<Value> {
    let params: Params = parse_params(params)?;
    match params.chain_id {
        Some(chain_id) => {
            let settings = state
                .service
                .config
                .chain(&chain_id)
                .ok_or_else(|| BrokerError::InvalidInput(format!("unknown chain: {chain_id}")))?;
            Ok(chain_view(settings))
        }
        None => Ok(Value::Array(
            state.service.config.chains.iter().map(chain_view).collect(),
        )),
    }
}

fn chain_view(settings: &ChainSettings) -> Value {
    json!({
        "chainId": settings.chain_id,
        "displayName": settings.display_name,
        "nativeSymbol": settings.native_symbol,
        "minConfirmations": settings.min_confirmations,
        "rpcUrl": settings.rpc_url,
        "explorerTxUrl": settings.explorer_tx_url,
    })
}
