//! The deal state machine. One engine task ticks over every active deal and
//! drives it forward; all mutations go through the per-deal lock in
//! `DealService`, and network work always happens on a snapshot before the
//! lock is taken.
//!
//! ```text
//! CREATED --(both parties locked)------------------> COLLECTION
//! COLLECTION --(all required deposits CONFIRMED)---> WAITING
//! COLLECTION --(expired, not fully collected)------> REVERTED  [refunds]
//! WAITING --(reorg broke sufficiency, not expired)-> COLLECTION
//! WAITING --(grace period elapsed)-----------------> SWAP      [payouts]
//! SWAP --(all blocking payouts COMPLETED)----------> CLOSED
//! SWAP --(non-retryable payout failure)------------> REVERTED  [refunds]
//! ```
//!
//! The expiry countdown runs in CREATED and COLLECTION, is suspended in
//! WAITING (a reorg demotion resumes it with the original deadline) and does
//! not exist in SWAP.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::adapter::{AdapterError, GasSubsidyOp};
use crate::error::{BrokerError, Result};
use crate::model::{
    CommissionPlan, Deal, DealStage, Escrow, GasReimbursementStatus, PayoutIntent, PayoutPurpose,
    PayoutStatus, Side,
};

use super::commission;
use super::gas_tank::GasTank;
use super::payout_planner;
use super::DealService;

pub struct DealEngine {
    service: Arc<DealService>,
    gas_tank: Arc<GasTank>,
}

impl DealEngine {
    pub fn new(service: Arc<DealService>, gas_tank: Arc<GasTank>) -> Self {
        DealEngine { service, gas_tank }
    }

    /// Main loop: recover on the first tick, then keep driving until the
    /// shutdown signal flips. Each tick finishes the transition it is in
    /// the middle of; nothing is torn down mid-write.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("deal engine started");
        let mut tick =
            tokio::time::interval(Duration::from_secs(self.service.config.poll_interval_seconds));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => self.tick().await,
                _ = shutdown.changed() => {
                    info!("deal engine stopping");
                    break;
                }
            }
        }
    }

    pub async fn tick(&self) {
        let deals = match self.service.store.list_active_deals().await {
            Ok(deals) => deals,
            Err(e) => {
                warn!(error = %e, "cannot list active deals");
                return;
            }
        };
        for deal in deals {
            if let Err(e) = self.drive(&deal.id).await {
                if e.is_retryable() {
                    debug!(deal = %deal.id, error = %e, "transition deferred");
                } else {
                    error!(deal = %deal.id, error = %e, "deal drive failed");
                }
            }
        }
    }

    /// Advance one deal by at most one transition.
    pub async fn drive(&self, deal_id: &str) -> Result<()> {
        let deal = self.service.store.load_deal(deal_id).await?;
        match deal.stage {
            DealStage::Created => self.drive_created(deal).await,
            DealStage::Collection => self.drive_collection(deal).await,
            DealStage::Waiting => self.drive_waiting(deal).await,
            DealStage::Swap => self.drive_swap(deal).await,
            DealStage::Closed | DealStage::Reverted => Ok(()),
        }
    }

    // -- CREATED ----------------------------------------------------------

    async fn drive_created(&self, deal: Deal) -> Result<()> {
        if !deal.both_parties_locked() {
            if deal.timed_out(Utc::now()) {
                self.service
                    .mutate(&deal.id, |d| {
                        if d.stage != DealStage::Created || d.both_parties_locked() {
                            return Ok(());
                        }
                        d.stage = DealStage::Reverted;
                        d.terminated_at = Some(Utc::now());
                        d.push_event("expired before both parties filled their details");
                        info!(deal = %d.id, "reverted: details never completed");
                        Ok(())
                    })
                    .await?;
            }
            return Ok(());
        }
        self.enter_collection(deal).await
    }

    /// COLLECTION entry: generate escrows, approve the broker for token
    /// sides, freeze USD-fixed commissions, then arm the expiry clock. All
    /// network work runs on the snapshot; the transition itself re-checks
    /// its preconditions under the lock.
    async fn enter_collection(&self, deal: Deal) -> Result<()> {
        let mut escrows: Vec<(Side, Escrow)> = Vec::new();
        let mut plans: Vec<(Side, CommissionPlan)> = Vec::new();

        for side in Side::BOTH {
            let spec = deal.spec(side);
            let settings = self.service.registry.settings(&spec.chain_id)?.clone();
            let adapter = self.service.registry.get(&spec.chain_id)?;

            let escrow = match adapter.generate_escrow(&spec.asset_code, &deal.id, side).await {
                Ok(escrow) => escrow,
                Err(AdapterError::Transient(msg)) => {
                    debug!(deal = %deal.id, %side, error = %msg, "escrow generation deferred");
                    return Ok(());
                }
                Err(AdapterError::Permanent(msg)) => {
                    return self.abort_setup(&deal.id, &msg).await;
                }
            };

            // Token sides on broker-driven chains get their one-time
            // allowance now, with the tank covering the approval gas.
            if let (Some(token), Some(ops)) = (spec.asset_code.token_address(), adapter.evm_ops()) {
                if settings.broker_contract.is_some() {
                    self.gas_tank
                        .ensure_escrow_gas(&adapter, &escrow.address, GasSubsidyOp::TokenApproval)
                        .await;
                    match ops.approve_broker_for_token(&escrow, token).await {
                        Ok(receipt) => {
                            debug!(deal = %deal.id, %side, txid = %receipt.txid, "broker approved");
                        }
                        Err(AdapterError::Transient(msg)) => {
                            debug!(deal = %deal.id, %side, error = %msg, "broker approval deferred");
                            return Ok(());
                        }
                        Err(AdapterError::Permanent(msg)) => {
                            return self.abort_setup(&deal.id, &msg).await;
                        }
                    }
                }
            }

            let mut plan = commission::plan_for_side(spec, &settings);
            match commission::freeze_native_commission(&mut plan, adapter.as_ref()).await {
                Ok(()) => {}
                Err(BrokerError::OracleUnavailable(msg)) => {
                    // The transition blocks until a quote exists; a deal
                    // that runs out its clock waiting is reverted unfunded.
                    if deal.timed_out(Utc::now()) {
                        return self.abort_setup(&deal.id, &format!("oracle unavailable: {msg}")).await;
                    }
                    debug!(deal = %deal.id, %side, error = %msg, "commission freeze deferred");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }

            escrows.push((side, escrow));
            plans.push((side, plan));
        }

        // Gas reimbursement applies to the first side settling on an EVM
        // chain; the collected buffer is returned explicitly at payout time.
        let gas_reimbursement = if self.service.config.gas_reimbursement_enabled {
            Side::BOTH
                .into_iter()
                .find(|side| {
                    self.service
                        .registry
                        .settings(&deal.spec(*side).chain_id)
                        .is_ok_and(|s| matches!(s.flavor, crate::config::ChainFlavor::Evm { .. }))
                })
                .map(|side| crate::model::GasReimbursement {
                    enabled: true,
                    escrow_side: side,
                    status: GasReimbursementStatus::PendingCalculation,
                })
        } else {
            None
        };

        let timeout_seconds = deal.timeout_seconds;
        self.service
            .mutate(&deal.id, move |d| {
                if d.stage != DealStage::Created || !d.both_parties_locked() {
                    return Ok(());
                }
                for (side, escrow) in escrows {
                    d.push_event(format!("side {side} escrow: {}", escrow.address));
                    d.set_escrow(side, escrow);
                }
                for (side, plan) in plans {
                    if let Some(native) = plan.native_fixed {
                        d.push_event(format!("side {side} commission frozen at {native} native"));
                    }
                    d.set_commission(side, plan);
                }
                d.gas_reimbursement = gas_reimbursement;
                d.expires_at = Some(Utc::now() + chrono::Duration::seconds(timeout_seconds as i64));
                d.stage = DealStage::Collection;
                d.push_event("stage: COLLECTION");
                info!(deal = %d.id, "entered COLLECTION");
                Ok(())
            })
            .await
    }

    async fn abort_setup(&self, deal_id: &str, reason: &str) -> Result<()> {
        let reason = reason.to_string();
        self.service
            .mutate(deal_id, move |d| {
                if !matches!(d.stage, DealStage::Created) {
                    return Ok(());
                }
                d.stage = DealStage::Reverted;
                d.terminated_at = Some(Utc::now());
                d.push_event(format!("setup failed: {reason}"));
                error!(deal = %d.id, %reason, "reverted during setup");
                Ok(())
            })
            .await
    }

    // -- COLLECTION -------------------------------------------------------

    async fn drive_collection(&self, deal: Deal) -> Result<()> {
        if self.both_sides_sufficient(&deal)? {
            return self
                .service
                .mutate(&deal.id, |d| {
                    if d.stage != DealStage::Collection {
                        return Ok(());
                    }
                    let now = Utc::now();
                    for side in Side::BOTH {
                        let locks = &mut d.side_state_mut(side).locks;
                        locks.trade_locked_at = Some(now);
                        locks.commission_locked_at = Some(now);
                    }
                    d.stage = DealStage::Waiting;
                    d.push_event("stage: WAITING (both sides fully collected)");
                    info!(deal = %d.id, "entered WAITING");
                    Ok(())
                })
                .await;
        }

        if deal.timed_out(Utc::now()) {
            let registry = Arc::clone(&self.service.registry);
            return self
                .service
                .mutate_with_payouts(&deal.id, |d| {
                    if d.stage != DealStage::Collection || !d.timed_out(Utc::now()) {
                        return Ok(((), Vec::new()));
                    }
                    let mut intents = Vec::new();
                    for side in Side::BOTH {
                        let settings = registry.settings(&d.spec(side).chain_id)?;
                        intents.extend(payout_planner::plan_side_timeout_refund(d, side, settings));
                    }
                    for intent in &intents {
                        d.push_event(format!(
                            "refund planned: {} {} to {}",
                            intent.amount, intent.asset_code, intent.to_address
                        ));
                    }
                    d.stage = DealStage::Reverted;
                    d.terminated_at = Some(Utc::now());
                    d.push_event("stage: REVERTED (collection timed out)");
                    info!(deal = %d.id, refunds = intents.len(), "reverted on timeout");
                    Ok(((), intents))
                })
                .await;
        }
        Ok(())
    }

    // -- WAITING ----------------------------------------------------------

    async fn drive_waiting(&self, deal: Deal) -> Result<()> {
        let now = Utc::now();
        if !self.both_sides_sufficient(&deal)? {
            let expired = deal.expires_at.is_some_and(|at| now >= at);
            if !expired {
                // Reorg rollback: the only sanctioned backwards transition.
                // The original deadline stays in force.
                return self
                    .service
                    .mutate(&deal.id, |d| {
                        if d.stage != DealStage::Waiting {
                            return Ok(());
                        }
                        for side in Side::BOTH {
                            d.side_state_mut(side).locks = Default::default();
                        }
                        d.stage = DealStage::Collection;
                        d.push_event("stage: COLLECTION (reorg invalidated a required deposit)");
                        warn!(deal = %d.id, "reorg rollback to COLLECTION");
                        Ok(())
                    })
                    .await;
            }
            // Deadline already passed while demoted: treat as timeout.
            let registry = Arc::clone(&self.service.registry);
            return self
                .service
                .mutate_with_payouts(&deal.id, |d| {
                    if d.stage != DealStage::Waiting {
                        return Ok(((), Vec::new()));
                    }
                    let mut intents = Vec::new();
                    for side in Side::BOTH {
                        let settings = registry.settings(&d.spec(side).chain_id)?;
                        intents.extend(payout_planner::plan_side_timeout_refund(d, side, settings));
                    }
                    d.stage = DealStage::Reverted;
                    d.terminated_at = Some(Utc::now());
                    d.push_event("stage: REVERTED (reorg after deadline)");
                    warn!(deal = %d.id, "reverted: reorg past deadline");
                    Ok(((), intents))
                })
                .await;
        }

        let anchor = Side::BOTH
            .iter()
            .filter_map(|s| deal.side_state(*s).locks.trade_locked_at)
            .max()
            .unwrap_or(now);
        let grace = chrono::Duration::seconds(self.service.config.swap_grace_seconds as i64);
        if now < anchor + grace {
            return Ok(());
        }
        self.enter_swap(deal).await
    }

    /// WAITING → SWAP: plan both sides' payouts and commit them atomically
    /// with the stage change.
    async fn enter_swap(&self, deal: Deal) -> Result<()> {
        let registry = Arc::clone(&self.service.registry);
        let sufficient = {
            // Re-derived inside the lock as well; this is the fast path out.
            self.both_sides_sufficient(&deal)?
        };
        if !sufficient {
            return Ok(());
        }
        self.service
            .mutate_with_payouts(&deal.id, |d| {
                if d.stage != DealStage::Waiting {
                    return Ok(((), Vec::new()));
                }
                for side in Side::BOTH {
                    let settings = registry.settings(&d.spec(side).chain_id)?;
                    let plan = d.commission(side).ok_or_else(|| {
                        BrokerError::Fatal(format!("deal {} side {side} lost its commission plan", d.id))
                    })?;
                    let required = commission::required_by_asset(d.spec(side), plan, settings);
                    let state = d.side_state(side);
                    if !required.iter().all(|(asset, req)| state.confirmed_amount(asset) >= *req) {
                        // A reorg landed between the check and the lock.
                        return Ok(((), Vec::new()));
                    }
                }
                let mut intents = Vec::new();
                for side in Side::BOTH {
                    let settings = registry.settings(&d.spec(side).chain_id)?;
                    intents.extend(payout_planner::plan_side_swap(d, side, settings)?);
                }
                for intent in &intents {
                    d.push_event(format!(
                        "payout planned ({}): {} {} to {}",
                        intent.purpose, intent.amount, intent.asset_code, intent.to_address
                    ));
                }
                if let Some(gas) = &mut d.gas_reimbursement {
                    if gas.enabled && gas.status == GasReimbursementStatus::PendingCalculation {
                        gas.status = GasReimbursementStatus::Calculated;
                    }
                }
                d.stage = DealStage::Swap;
                d.push_event("stage: SWAP");
                info!(deal = %d.id, payouts = intents.len(), "entered SWAP");
                Ok(((), intents))
            })
            .await
    }

    // -- SWAP -------------------------------------------------------------

    async fn drive_swap(&self, deal: Deal) -> Result<()> {
        let intents = self.service.store.load_intents_for_deal(&deal.id).await?;
        if intents.is_empty() {
            return Err(BrokerError::Fatal(format!("deal {} is in SWAP with no payouts", deal.id)));
        }
        let blocking: Vec<&PayoutIntent> =
            intents.iter().filter(|i| i.purpose.blocks_close()).collect();

        if blocking.iter().any(|i| i.status == PayoutStatus::Failed) {
            return self.revert_after_swap_failure(&deal, &intents).await;
        }
        if !blocking.iter().all(|i| i.status == PayoutStatus::Completed) {
            return Ok(());
        }

        // All value has verifiably moved; sweep residual escrow gas back to
        // the tank and close.
        let sweeps = self.plan_tank_sweeps(&deal, &intents).await;
        self.service
            .mutate_with_payouts(&deal.id, |d| {
                if d.stage != DealStage::Swap {
                    return Ok(((), Vec::new()));
                }
                d.stage = DealStage::Closed;
                d.terminated_at = Some(Utc::now());
                if let Some(gas) = &mut d.gas_reimbursement {
                    if gas.status == GasReimbursementStatus::Calculated {
                        gas.status = GasReimbursementStatus::Reimbursed;
                    }
                }
                d.push_event("stage: CLOSED (all payouts confirmed)");
                info!(deal = %d.id, "closed");
                Ok(((), sweeps))
            })
            .await
    }

    /// Residual native balance on EVM escrows above the dust threshold,
    /// minus anything still owed to in-flight intents, goes back to the
    /// operator tank.
    async fn plan_tank_sweeps(&self, deal: &Deal, intents: &[PayoutIntent]) -> Vec<PayoutIntent> {
        let mut sweeps = Vec::new();
        for side in Side::BOTH {
            let spec = deal.spec(side);
            let Ok(settings) = self.service.registry.settings(&spec.chain_id) else { continue };
            let Ok(adapter) = self.service.registry.get(&spec.chain_id) else { continue };
            let Some(ops) = adapter.evm_ops() else { continue };
            let Some(tank_address) = ops.tank_address() else { continue };
            let Some(escrow) = deal.escrow(side) else { continue };

            let balance = match ops.native_balance(&escrow.address).await {
                Ok(balance) => balance,
                Err(e) => {
                    debug!(deal = %deal.id, %side, error = %e, "balance check for sweep failed");
                    continue;
                }
            };
            let native = crate::model::AssetCode::native(&settings.native_symbol);
            let reserved: Decimal = intents
                .iter()
                .filter(|i| {
                    i.from_escrow == escrow.address
                        && i.asset_code == native
                        && matches!(i.status, PayoutStatus::Pending | PayoutStatus::Submitted)
                })
                .map(|i| i.amount)
                .sum();
            let residue = balance - reserved;
            if GasTank::worth_reclaiming(residue, settings.dust_threshold) {
                sweeps.push(PayoutIntent::new(
                    &deal.id,
                    &spec.chain_id,
                    &escrow.address,
                    &tank_address,
                    native,
                    residue,
                    PayoutPurpose::GasRefundToTank,
                    settings.min_confirmations,
                ));
            }
        }
        sweeps
    }

    async fn revert_after_swap_failure(&self, deal: &Deal, intents: &[PayoutIntent]) -> Result<()> {
        let registry = Arc::clone(&self.service.registry);
        let existing = intents.to_vec();
        self.service
            .mutate_with_payouts(&deal.id, |d| {
                if d.stage != DealStage::Swap {
                    return Ok(((), Vec::new()));
                }
                let mut refunds = Vec::new();
                for side in Side::BOTH {
                    let settings = registry.settings(&d.spec(side).chain_id)?;
                    refunds.extend(payout_planner::plan_failure_refunds(d, side, settings, &existing));
                }
                for refund in &refunds {
                    d.push_event(format!(
                        "refund planned after failure: {} {} to {}",
                        refund.amount, refund.asset_code, refund.to_address
                    ));
                }
                d.stage = DealStage::Reverted;
                d.terminated_at = Some(Utc::now());
                d.push_event("stage: REVERTED (payout failed permanently)");
                error!(deal = %d.id, "reverted after permanent payout failure");
                Ok(((), refunds))
            })
            .await
    }

    // -- guards -----------------------------------------------------------

    fn both_sides_sufficient(&self, deal: &Deal) -> Result<bool> {
        for side in Side::BOTH {
            let Some(plan) = deal.commission(side) else { return Ok(false) };
            let settings = self.service.registry.settings(&deal.spec(side).chain_id)?;
            let required = commission::required_by_asset(deal.spec(side), plan, settings);
            let state = deal.side_state(side);
            let sufficient =
                required.iter().all(|(asset, req)| state.confirmed_amount(asset) >= *req);
            if !sufficient {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
