use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{BrokerError, Result};
use crate::model::Side;
use crate::routes::{parse_params, AppState};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Params {
    deal_id: String,
    #[allow(dead_code)]
    party: Side,
    email: String,
    link: String,
}

pub async fn handle(state: &AppState, params: Value) -> Result<Value> {
    let params: Params = parse_params(params)?;
    if !params.email.contains('@') {
        return Err(BrokerError::InvalidInput(format!("not an email address: {}", params.email)));
    }
    let deal = state.service.store.load_deal(&params.deal_id).await?;
    let sent = state.mailer.send_invite(&params.email, &params.link, &deal.name).await?;
    Ok(json!({ "sent": sent, "email": params.email }))
}
