//! Turns a deal's collected state into outbound transfer intents. Planning
//! is pure: intents are built here and persisted by the caller atomically
//! with the stage transition that produced them.
//!
//! Conservation rule: for one escrow, the per-asset sum of the planned
//! intents equals the confirmed balance at planning time. Surplus refunds
//! are computed as the remainder, which makes the rule hold by
//! construction; a negative remainder means the sufficiency guard was
//! violated and planning aborts.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use tracing::warn;
use uuid::Uuid;

use crate::config::ChainSettings;
use crate::error::{BrokerError, Result};
use crate::model::{
    AssetCode, Deal, PayoutIntent, PayoutPurpose, PayoutStatus, Side,
};

use super::commission;

/// Intents for one side at WAITING → SWAP: the trade payout, the operator
/// commission, an optional gas reimbursement, and a surplus refund per
/// asset with leftover value.
pub fn plan_side_swap(deal: &Deal, side: Side, settings: &ChainSettings) -> Result<Vec<PayoutIntent>> {
    let spec = deal.spec(side);
    let escrow = deal
        .escrow(side)
        .ok_or_else(|| BrokerError::Fatal(format!("deal {} side {side} has no escrow", deal.id)))?;
    let party = deal
        .party(side)
        .ok_or_else(|| BrokerError::Fatal(format!("deal {} side {side} has no party", deal.id)))?;
    let counterparty = deal
        .party(side.other())
        .ok_or_else(|| BrokerError::Fatal(format!("deal {} side {} has no party", deal.id, side.other())))?;
    let plan = deal
        .commission(side)
        .ok_or_else(|| BrokerError::Fatal(format!("deal {} side {side} has no commission plan", deal.id)))?;

    let group = Uuid::new_v4().simple().to_string();
    let confirmed = deal.side_state(side).confirmed_by_asset();
    let mut consumed: BTreeMap<AssetCode, Decimal> = BTreeMap::new();
    let mut intents = Vec::new();

    let mut push = |intent: PayoutIntent| {
        let mut intent = intent;
        intent.payout_group_id = Some(group.clone());
        intents.push(intent);
    };

    // 1. Trade amount to the counterparty's recipient.
    let swap_purpose = if spec.asset_code.is_erc20() && settings.broker_contract.is_some() {
        PayoutPurpose::BrokerSwap
    } else {
        PayoutPurpose::SwapPayout
    };
    push(PayoutIntent::new(
        &deal.id,
        &spec.chain_id,
        &escrow.address,
        &counterparty.recipient_address,
        spec.asset_code.clone(),
        spec.amount,
        swap_purpose,
        settings.min_confirmations,
    ));
    *consumed.entry(spec.asset_code.clone()).or_default() += spec.amount;

    // 2. Operator commission, per asset of the plan.
    for (asset, amount) in commission::operator_take(spec, plan, settings) {
        match settings.commission_address.as_deref() {
            Some(operator) => {
                push(PayoutIntent::new(
                    &deal.id,
                    &spec.chain_id,
                    &escrow.address,
                    operator,
                    asset.clone(),
                    amount,
                    PayoutPurpose::OpCommission,
                    settings.min_confirmations,
                ));
                *consumed.entry(asset).or_default() += amount;
            }
            None => {
                // Without a configured operator address the commission stays
                // with the surplus and goes back to the payer.
                warn!(deal = %deal.id, chain = %spec.chain_id, "no commission address, skipping commission payout");
            }
        }
    }

    // 3. Gas reimbursement for the nominated side: the collected buffer is
    // returned explicitly, clamped to what was actually deposited so the
    // escrow never pays out tank money as reimbursement.
    if let Some(gas) = &deal.gas_reimbursement {
        if gas.enabled && gas.escrow_side == side {
            let native = AssetCode::native(&settings.native_symbol);
            let available = confirmed.get(&native).copied().unwrap_or(Decimal::ZERO)
                - consumed.get(&native).copied().unwrap_or(Decimal::ZERO);
            let amount = settings.gas_buffer.min(available);
            if amount > Decimal::ZERO {
                push(PayoutIntent::new(
                    &deal.id,
                    &spec.chain_id,
                    &escrow.address,
                    &party.payback_address,
                    native.clone(),
                    amount,
                    PayoutPurpose::GasReimbursement,
                    settings.min_confirmations,
                ));
                *consumed.entry(native).or_default() += amount;
            }
        }
    }

    // 4. Whatever remains goes back to the payer, asset by asset. Assets
    // the deal never asked for (wrong-asset deposits) land here whole.
    for (asset, collected) in &confirmed {
        let spent = consumed.get(asset).copied().unwrap_or(Decimal::ZERO);
        if spent > *collected {
            return Err(BrokerError::Fatal(format!(
                "conservation violation on deal {} side {side}: {asset} consumed {spent} > collected {collected}",
                deal.id
            )));
        }
        let surplus = *collected - spent;
        if surplus > Decimal::ZERO {
            push(PayoutIntent::new(
                &deal.id,
                &spec.chain_id,
                &escrow.address,
                &party.payback_address,
                asset.clone(),
                surplus,
                PayoutPurpose::SurplusRefund,
                settings.min_confirmations,
            ));
        }
    }

    // Anything consumed must come from a confirmed balance.
    for asset in consumed.keys() {
        if !confirmed.contains_key(asset) {
            return Err(BrokerError::Fatal(format!(
                "conservation violation on deal {} side {side}: paying {asset} with no confirmed balance",
                deal.id
            )));
        }
    }
    Ok(intents)
}

/// Expiry: the entire confirmed balance of every asset back to the payer.
pub fn plan_side_timeout_refund(
    deal: &Deal,
    side: Side,
    settings: &ChainSettings,
) -> Vec<PayoutIntent> {
    let (Some(escrow), Some(party)) = (deal.escrow(side), deal.party(side)) else {
        return Vec::new();
    };
    let spec = deal.spec(side);
    let group = Uuid::new_v4().simple().to_string();
    deal.side_state(side)
        .confirmed_by_asset()
        .into_iter()
        .filter(|(_, amount)| *amount > Decimal::ZERO)
        .map(|(asset, amount)| {
            let mut intent = PayoutIntent::new(
                &deal.id,
                &spec.chain_id,
                &escrow.address,
                &party.payback_address,
                asset,
                amount,
                PayoutPurpose::TimeoutRefund,
                settings.min_confirmations,
            );
            intent.payout_group_id = Some(group.clone());
            intent
        })
        .collect()
}

/// Mid-swap failure: refund what has not verifiably left the escrow.
/// Completed intents are subtracted; submitted-but-unconfirmed ones too,
/// since their value may still land and must not be double-spent.
pub fn plan_failure_refunds(
    deal: &Deal,
    side: Side,
    settings: &ChainSettings,
    existing: &[PayoutIntent],
) -> Vec<PayoutIntent> {
    let (Some(escrow), Some(party)) = (deal.escrow(side), deal.party(side)) else {
        return Vec::new();
    };
    let spec = deal.spec(side);
    let mut remaining = deal.side_state(side).confirmed_by_asset();
    for intent in existing.iter().filter(|i| i.from_escrow == escrow.address) {
        let reserved = match intent.status {
            PayoutStatus::Completed | PayoutStatus::Submitted => intent.amount,
            PayoutStatus::Pending | PayoutStatus::Failed => Decimal::ZERO,
        };
        if let Some(balance) = remaining.get_mut(&intent.asset_code) {
            *balance = (*balance - reserved).max(Decimal::ZERO);
        }
    }
    remaining
        .into_iter()
        .filter(|(_, amount)| *amount > Decimal::ZERO)
        .map(|(asset, amount)| {
            PayoutIntent::new(
                &deal.id,
                &spec.chain_id,
                &escrow.address,
                &party.payback_address,
                asset,
                amount,
                PayoutPurpose::TimeoutRefund,
                settings.min_confirmations,
            )
        })
        .collect()
}

/// Post-termination surveillance: confirmed value not yet covered by any
/// intent (stray or late-confirming deposits) goes back to the payer.
/// Failed intents count as covered so a permanently unrefundable asset is
/// surfaced once instead of re-enqueued forever.
pub fn plan_surveillance_refunds(
    deal: &Deal,
    side: Side,
    settings: &ChainSettings,
    existing: &[PayoutIntent],
) -> Vec<PayoutIntent> {
    let (Some(escrow), Some(party)) = (deal.escrow(side), deal.party(side)) else {
        return Vec::new();
    };
    let spec = deal.spec(side);
    let mut remaining = deal.side_state(side).confirmed_by_asset();
    for intent in existing.iter().filter(|i| i.from_escrow == escrow.address) {
        if let Some(balance) = remaining.get_mut(&intent.asset_code) {
            *balance = (*balance - intent.amount).max(Decimal::ZERO);
        }
    }
    remaining
        .into_iter()
        .filter(|(_, amount)| *amount > Decimal::ZERO)
        .map(|(asset, amount)| {
            PayoutIntent::new(
                &deal.id,
                &spec.chain_id,
                &escrow.address,
                &party.payback_address,
                asset,
                amount,
                PayoutPurpose::SurplusRefund,
                settings.min_confirmations,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_chains;
    use crate::engine::commission::plan_for_side;
    use crate::model::{AssetSpec, Deposit, DepositStatus, Escrow, PartyDetails};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn confirmed_deposit(asset: AssetCode, amount: Decimal, txid: &str) -> Deposit {
        Deposit {
            asset_code: asset,
            amount,
            txid: txid.into(),
            block_height: Some(10),
            observed_at: Utc::now(),
            confirmations: 6,
            min_conf_required: 6,
            status: DepositStatus::Confirmed,
            is_synthetic: false,
            original_txid: None,
            resolution_status: None,
            resolution_attempts: 0,
            next_resolution_at: None,
        }
    }

    fn party(label: &str) -> PartyDetails {
        PartyDetails {
            payback_address: format!("{label}-payback"),
            recipient_address: format!("{label}-recipient"),
            email: None,
            filled_at: Utc::now(),
            locked: true,
        }
    }

    fn funded_deal(deposit_a: Decimal) -> (Deal, ChainSettings) {
        let mut settings = default_chains().into_iter().find(|c| c.chain_id == "ALPHA").unwrap();
        settings.commission_address = Some("operator-alpha".into());
        let mut deal = Deal::new(
            "d1".into(),
            "test".into(),
            AssetSpec::new("ALPHA", AssetCode::native("ALPHA"), dec!(10)),
            AssetSpec::new("ALPHA", AssetCode::native("ALPHA"), dec!(5)),
            3600,
        );
        deal.set_party(Side::A, party("a"));
        deal.set_party(Side::B, party("b"));
        deal.set_escrow(Side::A, Escrow { address: "esc-a".into(), key_ref: "k-a".into() });
        deal.set_escrow(Side::B, Escrow { address: "esc-b".into(), key_ref: "k-b".into() });
        let plan_a = plan_for_side(&deal.spec_a, &settings);
        let plan_b = plan_for_side(&deal.spec_b, &settings);
        deal.set_commission(Side::A, plan_a);
        deal.set_commission(Side::B, plan_b);
        deal.side_state_mut(Side::A)
            .deposits
            .push(confirmed_deposit(AssetCode::native("ALPHA"), deposit_a, "tx-a"));
        deal.side_a.recompute_collected();
        (deal, settings)
    }

    #[test]
    fn exact_funding_plans_swap_and_commission_only() {
        let (deal, settings) = funded_deal(dec!(10.03));
        let intents = plan_side_swap(&deal, Side::A, &settings).unwrap();
        assert_eq!(intents.len(), 2);
        assert_eq!(intents[0].purpose, PayoutPurpose::SwapPayout);
        assert_eq!(intents[0].amount, dec!(10));
        assert_eq!(intents[0].to_address, "b-recipient");
        assert_eq!(intents[1].purpose, PayoutPurpose::OpCommission);
        assert_eq!(intents[1].amount, dec!(0.03));
        assert_eq!(intents[1].to_address, "operator-alpha");
        assert!(intents.iter().all(|i| i.payout_group_id == intents[0].payout_group_id));
    }

    #[test]
    fn overpayment_becomes_a_surplus_refund() {
        let (deal, settings) = funded_deal(dec!(12));
        let intents = plan_side_swap(&deal, Side::A, &settings).unwrap();
        assert_eq!(intents.len(), 3);
        let surplus = intents.iter().find(|i| i.purpose == PayoutPurpose::SurplusRefund).unwrap();
        assert_eq!(surplus.amount, dec!(1.97));
        assert_eq!(surplus.to_address, "a-payback");

        // Conservation: planned sums equal the confirmed balance.
        let total: Decimal = intents.iter().map(|i| i.amount).sum();
        assert_eq!(total, dec!(12));
    }

    #[test]
    fn wrong_asset_deposits_are_refunded_whole() {
        let (mut deal, settings) = funded_deal(dec!(10.03));
        deal.side_state_mut(Side::A).deposits.push(confirmed_deposit(
            AssetCode::native("BETA"),
            dec!(7),
            "tx-beta",
        ));
        deal.side_a.recompute_collected();
        let intents = plan_side_swap(&deal, Side::A, &settings).unwrap();
        let beta = intents
            .iter()
            .find(|i| i.asset_code == AssetCode::native("BETA"))
            .unwrap();
        assert_eq!(beta.purpose, PayoutPurpose::SurplusRefund);
        assert_eq!(beta.amount, dec!(7));
    }

    #[test]
    fn missing_commission_address_leaves_value_in_surplus() {
        let (deal, mut settings) = funded_deal(dec!(10.03));
        settings.commission_address = None;
        let intents = plan_side_swap(&deal, Side::A, &settings).unwrap();
        assert_eq!(intents.len(), 2);
        let surplus = intents.iter().find(|i| i.purpose == PayoutPurpose::SurplusRefund).unwrap();
        assert_eq!(surplus.amount, dec!(0.03));
    }

    #[test]
    fn insufficient_balance_is_a_conservation_violation() {
        let (deal, settings) = funded_deal(dec!(4));
        assert!(matches!(
            plan_side_swap(&deal, Side::A, &settings),
            Err(BrokerError::Fatal(_))
        ));
    }

    #[test]
    fn timeout_refund_returns_entire_confirmed_balance() {
        let (deal, settings) = funded_deal(dec!(10.03));
        let refunds = plan_side_timeout_refund(&deal, Side::A, &settings);
        assert_eq!(refunds.len(), 1);
        assert_eq!(refunds[0].purpose, PayoutPurpose::TimeoutRefund);
        assert_eq!(refunds[0].amount, dec!(10.03));
        assert_eq!(refunds[0].to_address, "a-payback");

        // A side with no confirmed deposits gets nothing.
        assert!(plan_side_timeout_refund(&deal, Side::B, &settings).is_empty());
    }

    #[test]
    fn failure_refunds_skip_value_already_in_flight() {
        let (deal, settings) = funded_deal(dec!(10.03));
        let mut completed = PayoutIntent::new(
            "d1", "ALPHA", "esc-a", "b-recipient",
            AssetCode::native("ALPHA"), dec!(10),
            PayoutPurpose::SwapPayout, 6,
        );
        completed.status = PayoutStatus::Completed;
        let refunds = plan_failure_refunds(&deal, Side::A, &settings, &[completed]);
        assert_eq!(refunds.len(), 1);
        assert_eq!(refunds[0].amount, dec!(0.03));
    }

    #[test]
    fn surveillance_refunds_only_uncovered_value() {
        let (mut deal, settings) = funded_deal(dec!(10.03));
        deal.stage = crate::model::DealStage::Reverted;
        let covered = plan_side_timeout_refund(&deal, Side::A, &settings);
        // Everything already refunded: nothing to do.
        assert!(plan_surveillance_refunds(&deal, Side::A, &settings, &covered).is_empty());

        // A stray deposit confirming after termination is picked up.
        deal.side_state_mut(Side::A).deposits.push(confirmed_deposit(
            AssetCode::native("ALPHA"),
            dec!(2),
            "tx-late",
        ));
        let refunds = plan_surveillance_refunds(&deal, Side::A, &settings, &covered);
        assert_eq!(refunds.len(), 1);
        assert_eq!(refunds[0].amount, dec!(2));
        assert_eq!(refunds[0].purpose, PayoutPurpose::SurplusRefund);
    }
}
