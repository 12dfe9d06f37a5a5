//! Commission planning: what each side owes on top of the trade amount, and
//! the freezing of USD-fixed native commissions against an oracle quote.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::adapter::{AdapterError, ChainAdapter};
use crate::config::{ChainFlavor, ChainSettings};
use crate::error::{BrokerError, Result};
use crate::model::{
    AssetCode, AssetSpec, CommissionCurrency, CommissionMode, CommissionPlan,
};

/// Default operator commission: 0.30% of the trade amount, in-asset.
pub const DEFAULT_COMMISSION_BPS: u32 = 30;

/// Build the commission plan for one side. The uniform percent policy is
/// the default; a configured per-chain fixed USD amount switches the side to
/// a native-denominated commission frozen at COLLECTION entry.
pub fn plan_for_side(spec: &AssetSpec, settings: &ChainSettings) -> CommissionPlan {
    let erc20_fixed_fee = match &spec.asset_code {
        AssetCode::Erc20(_) => settings.erc20_fixed_fee,
        _ => None,
    };
    match settings.stable_fixed_usd {
        Some(usd) => CommissionPlan {
            mode: CommissionMode::FixedUsdNative,
            currency: CommissionCurrency::Native,
            percent_bps: None,
            usd_fixed: Some(usd),
            native_fixed: None,
            oracle_quote: None,
            erc20_fixed_fee,
        },
        None => CommissionPlan {
            mode: CommissionMode::PercentBps,
            currency: CommissionCurrency::Asset,
            percent_bps: Some(DEFAULT_COMMISSION_BPS),
            usd_fixed: None,
            native_fixed: None,
            oracle_quote: None,
            erc20_fixed_fee,
        },
    }
}

/// Commission owed on a trade amount under a percent plan.
pub fn percent_commission(trade_amount: Decimal, bps: u32) -> Decimal {
    (trade_amount * Decimal::from(bps) / dec!(10000)).normalize()
}

/// The operator's take per asset for one side, excluding gas buffers.
pub fn operator_take(
    spec: &AssetSpec,
    plan: &CommissionPlan,
    settings: &ChainSettings,
) -> BTreeMap<AssetCode, Decimal> {
    let mut take: BTreeMap<AssetCode, Decimal> = BTreeMap::new();
    match plan.currency {
        CommissionCurrency::Asset => {
            let bps = plan.percent_bps.unwrap_or(DEFAULT_COMMISSION_BPS);
            let commission = percent_commission(spec.amount, bps);
            if commission > Decimal::ZERO {
                *take.entry(spec.asset_code.clone()).or_default() += commission;
            }
        }
        CommissionCurrency::Native => {
            if let Some(native) = plan.native_fixed {
                *take.entry(AssetCode::native(&settings.native_symbol)).or_default() += native;
            }
        }
    }
    if let Some(fee) = plan.erc20_fixed_fee {
        *take.entry(spec.asset_code.clone()).or_default() += fee;
    }
    take
}

/// Everything a side must deposit before collection is sufficient: trade
/// amount plus commission, plus the configured ERC20 fixed fee, plus the
/// chain gas buffer when the escrow itself pays outbound gas for a native
/// EVM swap.
pub fn required_by_asset(
    spec: &AssetSpec,
    plan: &CommissionPlan,
    settings: &ChainSettings,
) -> BTreeMap<AssetCode, Decimal> {
    let mut required: BTreeMap<AssetCode, Decimal> = BTreeMap::new();
    *required.entry(spec.asset_code.clone()).or_default() += spec.amount;
    for (asset, amount) in operator_take(spec, plan, settings) {
        *required.entry(asset).or_default() += amount;
    }
    if spec.asset_code.is_native() && matches!(settings.flavor, ChainFlavor::Evm { .. }) {
        *required.entry(spec.asset_code.clone()).or_default() += settings.gas_buffer;
    }
    required
}

/// Freeze a FIXED_USD_NATIVE commission by pricing it through the chain's
/// oracle. Irreversible: once `native_fixed` is written the plan never
/// re-quotes. A transient quote failure surfaces as `OracleUnavailable`, so
/// the COLLECTION transition blocks and retries.
pub async fn freeze_native_commission(
    plan: &mut CommissionPlan,
    adapter: &dyn ChainAdapter,
) -> Result<()> {
    if !plan.needs_freezing() {
        return Ok(());
    }
    let usd = plan
        .usd_fixed
        .ok_or_else(|| BrokerError::Fatal("fixed USD plan without amount".into()))?;
    let priced = adapter.quote_native_for_usd(usd).await.map_err(|e| match e {
        AdapterError::Transient(msg) => BrokerError::OracleUnavailable(msg),
        other => BrokerError::from(other),
    })?;
    plan.native_fixed = Some(priced.native_amount);
    plan.oracle_quote = Some(priced.quote);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::mock::MockChain;
    use crate::config::default_chains;
    use rust_decimal_macros::dec;

    fn alpha_settings() -> ChainSettings {
        default_chains().into_iter().find(|c| c.chain_id == "ALPHA").unwrap()
    }

    fn eth_settings() -> ChainSettings {
        default_chains().into_iter().find(|c| c.chain_id == "ETH").unwrap()
    }

    #[test]
    fn default_commission_is_thirty_bps_in_asset() {
        let spec = AssetSpec::new("ALPHA", AssetCode::native("ALPHA"), dec!(10));
        let settings = alpha_settings();
        let plan = plan_for_side(&spec, &settings);
        assert_eq!(plan.mode, CommissionMode::PercentBps);
        assert_eq!(plan.percent_bps, Some(30));

        let required = required_by_asset(&spec, &plan, &settings);
        assert_eq!(required[&AssetCode::native("ALPHA")], dec!(10.03));
    }

    #[test]
    fn erc20_fee_and_percent_stack_on_the_token() {
        let token: AssetCode = "ERC20:0x00000000000000000000000000000000000000aa".parse().unwrap();
        let spec = AssetSpec::new("ETH", token.clone(), dec!(100));
        let mut settings = eth_settings();
        settings.erc20_fixed_fee = Some(dec!(1.5));
        let plan = plan_for_side(&spec, &settings);
        assert_eq!(plan.erc20_fixed_fee, Some(dec!(1.5)));

        let required = required_by_asset(&spec, &plan, &settings);
        // 100 + 0.30% + fixed fee; no gas buffer for token swaps.
        assert_eq!(required[&token], dec!(101.8));
        assert_eq!(required.len(), 1);
    }

    #[test]
    fn native_evm_swaps_collect_the_gas_buffer() {
        let spec = AssetSpec::new("ETH", AssetCode::native("ETH"), dec!(1));
        let settings = eth_settings();
        let plan = plan_for_side(&spec, &settings);
        let required = required_by_asset(&spec, &plan, &settings);
        assert_eq!(required[&AssetCode::native("ETH")], dec!(1.003) + settings.gas_buffer);
    }

    #[test]
    fn fixed_usd_plan_requires_native_entry_once_frozen() {
        let token: AssetCode = "ERC20:0x00000000000000000000000000000000000000bb".parse().unwrap();
        let spec = AssetSpec::new("ETH", token.clone(), dec!(500));
        let mut settings = eth_settings();
        settings.stable_fixed_usd = Some(dec!(5));
        let mut plan = plan_for_side(&spec, &settings);
        assert!(plan.needs_freezing());

        // Unfrozen: only the token requirement is known yet.
        let required = required_by_asset(&spec, &plan, &settings);
        assert_eq!(required.len(), 1);

        plan.native_fixed = Some(dec!(0.0025));
        let required = required_by_asset(&spec, &plan, &settings);
        assert_eq!(required[&token], dec!(500));
        assert_eq!(required[&AssetCode::native("ETH")], dec!(0.0025));
    }

    #[tokio::test]
    async fn freezing_records_quote_and_is_irreversible() {
        let chain = MockChain::new("ALPHA", "ALPHA", 6).with_price(dec!(2));
        let mut plan = CommissionPlan {
            mode: CommissionMode::FixedUsdNative,
            currency: CommissionCurrency::Native,
            percent_bps: None,
            usd_fixed: Some(dec!(5)),
            native_fixed: None,
            oracle_quote: None,
            erc20_fixed_fee: None,
        };
        freeze_native_commission(&mut plan, &chain).await.unwrap();
        assert_eq!(plan.native_fixed, Some(dec!(2.5)));
        let quote = plan.oracle_quote.clone().unwrap();
        assert_eq!(quote.pair, "ALPHA/USD");

        // A second freeze is a no-op even if the price moved.
        let repriced = MockChain::new("ALPHA", "ALPHA", 6).with_price(dec!(4));
        freeze_native_commission(&mut plan, &repriced).await.unwrap();
        assert_eq!(plan.native_fixed, Some(dec!(2.5)));
    }

    #[tokio::test]
    async fn unavailable_oracle_blocks_freezing() {
        let chain = MockChain::new("ALPHA", "ALPHA", 6).with_price(dec!(0));
        let mut plan = CommissionPlan {
            mode: CommissionMode::FixedUsdNative,
            currency: CommissionCurrency::Native,
            percent_bps: None,
            usd_fixed: Some(dec!(5)),
            native_fixed: None,
            oracle_quote: None,
            erc20_fixed_fee: None,
        };
        let err = freeze_native_commission(&mut plan, &chain).await.unwrap_err();
        assert!(matches!(err, BrokerError::OracleUnavailable(_)));
        assert!(plan.native_fixed.is_none());
    }
}
