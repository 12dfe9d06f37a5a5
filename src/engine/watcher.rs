//! Per-escrow deposit watching. One polling task per active escrow
//! reconciles what the chain reports into the deal's deposit ledger: new
//! credits are appended, confirmation counts refreshed, vanished
//! transactions orphaned, and synthetic placeholders resolved to their real
//! originating transfers on a bounded retry schedule.
//!
//! Watchers outlive the deal by the surveillance window: stray or
//! late-confirming deposits observed after termination are refunded to the
//! payback address.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adapter::RawDeposit;
use crate::error::Result;
use crate::model::{Deal, Deposit, DepositStatus, ResolutionStatus, Side, SideState};
use crate::model::deposit::deposit_sort_key;

use super::{payout_planner, DealService};

/// Retry schedule for synthetic-txid resolution; after the last step the
/// entry is marked failed and left in place. Total budget 15 minutes.
pub const RESOLUTION_SCHEDULE_SECONDS: [u64; 5] = [30, 60, 120, 300, 600];

/// Delay before the next resolution attempt, `None` once the budget is
/// exhausted.
pub fn next_resolution_delay(attempts_made: u32) -> Option<Duration> {
    RESOLUTION_SCHEDULE_SECONDS
        .get(attempts_made as usize)
        .map(|s| Duration::from_secs(*s))
}

/// Fold one poll's raw deposits into the side ledger. `refreshed` carries
/// confirmation counts fetched for known transactions the listing did not
/// return. Returns the user-visible event messages this poll produced.
pub fn reconcile_deposits(
    state: &mut SideState,
    raw: &[RawDeposit],
    refreshed: &HashMap<String, i64>,
    min_conf_required: u32,
    now: DateTime<Utc>,
) -> Vec<String> {
    let mut events = Vec::new();

    for observed in raw {
        match state.deposit_mut(&observed.txid) {
            Some(existing) => {
                let was = existing.status;
                existing.amount = observed.amount;
                existing.apply_confirmations(observed.confirmations, observed.block_height);
                emit_status_change(&mut events, existing, was);
            }
            None => {
                let mut deposit = Deposit {
                    asset_code: observed.asset_code.clone(),
                    amount: observed.amount,
                    txid: observed.txid.clone(),
                    block_height: observed.block_height,
                    observed_at: now,
                    confirmations: 0,
                    min_conf_required,
                    status: DepositStatus::Unconfirmed,
                    is_synthetic: observed.synthetic,
                    original_txid: None,
                    resolution_status: None,
                    resolution_attempts: 0,
                    next_resolution_at: observed
                        .synthetic
                        .then(|| now + chrono::Duration::seconds(RESOLUTION_SCHEDULE_SECONDS[0] as i64)),
                };
                deposit.apply_confirmations(observed.confirmations, observed.block_height);
                events.push(format!(
                    "deposit observed: {} {} ({}{})",
                    deposit.amount,
                    deposit.asset_code,
                    deposit.txid,
                    if deposit.is_synthetic { ", synthetic" } else { "" },
                ));
                if deposit.status == DepositStatus::Confirmed {
                    events.push(format!(
                        "deposit confirmed: {} {} ({})",
                        deposit.amount, deposit.asset_code, deposit.txid
                    ));
                }
                state.deposits.push(deposit);
            }
        }
    }

    for (txid, confirmations) in refreshed {
        if let Some(existing) = state.deposit_mut(txid) {
            let was = existing.status;
            existing.apply_confirmations(*confirmations, None);
            emit_status_change(&mut events, existing, was);
        }
    }

    state.deposits.sort_by_key(deposit_sort_key);
    state.recompute_collected();
    events
}

fn emit_status_change(events: &mut Vec<String>, deposit: &Deposit, was: DepositStatus) {
    if deposit.status == was {
        return;
    }
    match deposit.status {
        DepositStatus::Confirmed => events.push(format!(
            "deposit confirmed: {} {} ({})",
            deposit.amount, deposit.asset_code, deposit.txid
        )),
        DepositStatus::Orphaned => events.push(format!(
            "deposit orphaned by reorg: {} {} ({})",
            deposit.amount, deposit.asset_code, deposit.txid
        )),
        _ => {}
    }
}

/// Keeps one polling task alive per watched escrow; re-synced every tick
/// against the set of active and recently terminated deals.
pub struct WatcherSupervisor {
    service: Arc<DealService>,
    tasks: tokio::sync::Mutex<HashMap<(String, Side), JoinHandle<()>>>,
}

impl WatcherSupervisor {
    pub fn new(service: Arc<DealService>) -> Self {
        WatcherSupervisor { service, tasks: tokio::sync::Mutex::new(HashMap::new()) }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("deposit watcher supervisor started");
        let mut tick =
            tokio::time::interval(Duration::from_secs(self.service.config.poll_interval_seconds));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.sync(&shutdown).await {
                        warn!(error = %e, "watcher sync failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("deposit watcher supervisor stopping");
                    break;
                }
            }
        }
    }

    /// Spawn watchers for escrows that need one, drop finished handles.
    pub async fn sync(&self, shutdown: &watch::Receiver<bool>) -> Result<()> {
        let now = Utc::now();
        let mut deals = self.service.store.list_active_deals().await?;
        deals.extend(
            self.service
                .store
                .list_deals_in_surveillance(now, self.service.config.surveillance_hours)
                .await?,
        );

        let mut tasks = self.tasks.lock().await;
        tasks.retain(|_, handle| !handle.is_finished());
        for deal in deals {
            for side in Side::BOTH {
                if deal.escrow(side).is_none() {
                    continue;
                }
                let key = (deal.id.clone(), side);
                if tasks.contains_key(&key) {
                    continue;
                }
                let service = Arc::clone(&self.service);
                let deal_id = deal.id.clone();
                let shutdown = shutdown.clone();
                debug!(deal = %deal_id, %side, "watcher spawned");
                tasks.insert(key, tokio::spawn(watch_escrow(service, deal_id, side, shutdown)));
            }
        }
        Ok(())
    }
}

/// The per-escrow polling loop.
pub async fn watch_escrow(
    service: Arc<DealService>,
    deal_id: String,
    side: Side,
    shutdown: watch::Receiver<bool>,
) {
    let poll = Duration::from_secs(service.config.poll_interval_seconds);
    let mut consecutive_failures = 0u32;
    loop {
        if *shutdown.borrow() {
            return;
        }
        match poll_escrow_once(&service, &deal_id, side).await {
            Ok(false) => {
                debug!(deal = %deal_id, %side, "watcher retired");
                return;
            }
            Ok(true) => {
                consecutive_failures = 0;
                tokio::time::sleep(poll).await;
            }
            Err(e) => {
                // Exponential backoff on adapter trouble; the ledger is
                // only ever behind, never wrong.
                consecutive_failures += 1;
                let delay = (5u64 << consecutive_failures.min(4)).min(60);
                debug!(deal = %deal_id, %side, error = %e, delay, "watch poll failed, backing off");
                tokio::time::sleep(Duration::from_secs(delay)).await;
            }
        }
    }
}

/// One reconciliation poll for one escrow. Returns whether the watcher
/// should keep running. The watch loop drives this on its cadence; tests
/// call it directly to step a deal deterministically.
pub async fn poll_escrow_once(
    service: &Arc<DealService>,
    deal_id: &str,
    side: Side,
) -> Result<bool> {
    let now = Utc::now();
    let Some(deal) = service.store.try_load_deal(deal_id).await? else {
        return Ok(false);
    };
    let in_surveillance = deal.in_surveillance_window(now, service.config.surveillance_hours);
    if !deal.stage.is_active() && !in_surveillance {
        return Ok(false);
    }
    let Some(escrow) = deal.escrow(side).cloned() else {
        return Ok(true);
    };

    let spec = deal.spec(side);
    let adapter = service.registry.get(&spec.chain_id)?;
    let settings = service.registry.settings(&spec.chain_id)?.clone();

    // 1. What does the chain say right now?
    let raw = tokio::time::timeout(adapter.call_timeout(), adapter.list_deposits(&escrow, None))
        .await
        .map_err(|_| crate::error::BrokerError::AdapterTransient("listDeposits timed out".into()))?
        .map_err(crate::error::BrokerError::from)?;

    // 2. Refresh known transactions the listing no longer mentions; a
    // previously mined tx the adapter now reports absent is a reorg.
    let stale: Vec<String> = deal
        .side_state(side)
        .deposits
        .iter()
        .filter(|d| d.status != DepositStatus::Orphaned)
        .filter(|d| !raw.iter().any(|r| r.txid == d.txid))
        .map(|d| d.txid.clone())
        .collect();
    let lookups = futures::future::join_all(
        stale.iter().map(|txid| adapter.tx_confirmations(txid)),
    )
    .await;
    let mut refreshed = HashMap::new();
    for (txid, lookup) in stale.into_iter().zip(lookups) {
        match lookup {
            Ok(confirmations) => {
                refreshed.insert(txid, confirmations);
            }
            Err(e) => debug!(deal = %deal_id, %txid, error = %e, "confirmation refresh failed"),
        }
    }

    // 3. Try to resolve due synthetic placeholders outside the deal lock.
    let mut resolutions: HashMap<String, Option<String>> = HashMap::new();
    for deposit in deal.side_state(side).deposits.iter().filter(|d| d.resolution_outstanding()) {
        if deposit.next_resolution_at.is_some_and(|at| at > now) {
            continue;
        }
        match adapter.resolve_deposit_txid(&escrow, &deposit.txid).await {
            Ok(found) => {
                resolutions.insert(deposit.txid.clone(), found);
            }
            Err(e) => debug!(deal = %deal_id, txid = %deposit.txid, error = %e, "resolution attempt failed"),
        }
    }

    // 4. Existing intents are needed to compute surveillance residues.
    let existing_intents = if in_surveillance {
        service.store.load_intents_for_deal(deal_id).await?
    } else {
        Vec::new()
    };

    // 5. Apply under the deal lock.
    let min_conf = settings.min_confirmations;
    let settings_for_plan = settings.clone();
    let (deposits_after, retired) = service
        .mutate_with_payouts(deal_id, move |d: &mut Deal| {
            let state = d.side_state_mut(side);
            let events = reconcile_deposits(state, &raw, &refreshed, min_conf, now);
            let retired = apply_resolutions(state, &resolutions, now);

            for message in events {
                d.push_event(message);
            }
            for (placeholder, real) in &retired {
                d.push_event(format!("deposit resolved: {placeholder} -> {real}"));
            }

            // Stray value observed after termination goes straight back.
            let refunds = if !d.stage.is_active() {
                let settings = &settings_for_plan;
                let refunds =
                    payout_planner::plan_surveillance_refunds(d, side, settings, &existing_intents);
                for refund in &refunds {
                    d.push_event(format!(
                        "stray deposit refund planned: {} {} to {}",
                        refund.amount, refund.asset_code, refund.to_address
                    ));
                }
                refunds
            } else {
                Vec::new()
            };

            let snapshot = d.side_state(side).deposits.clone();
            let retired_placeholders: Vec<String> =
                retired.into_iter().map(|(placeholder, _)| placeholder).collect();
            Ok(((snapshot, retired_placeholders), refunds))
        })
        .await?;

    // 6. Write-through projection rows, outside the lock.
    for deposit in &deposits_after {
        service.store.upsert_deposit_row(deal_id, side, deposit).await?;
    }
    for placeholder in &retired {
        service.store.delete_deposit_row(deal_id, side, placeholder).await?;
    }
    Ok(true)
}

/// Rewrite resolved placeholders, advance the retry clock on misses, and
/// mark entries failed once the budget is spent. Returns the
/// `(placeholder, real)` pairs that were rewritten.
fn apply_resolutions(
    state: &mut SideState,
    resolutions: &HashMap<String, Option<String>>,
    now: DateTime<Utc>,
) -> Vec<(String, String)> {
    let mut retired = Vec::new();
    for deposit in state.deposits.iter_mut() {
        let Some(outcome) = resolutions.get(&deposit.txid) else { continue };
        match outcome {
            Some(real) => {
                retired.push((deposit.txid.clone(), real.clone()));
                deposit.original_txid = Some(real.clone());
                deposit.txid = real.clone();
                deposit.resolution_status = Some(ResolutionStatus::Resolved);
                deposit.next_resolution_at = None;
            }
            None => {
                deposit.resolution_attempts += 1;
                match next_resolution_delay(deposit.resolution_attempts) {
                    Some(delay) => {
                        deposit.next_resolution_at =
                            Some(now + chrono::Duration::from_std(delay).unwrap_or_default());
                    }
                    None => {
                        deposit.resolution_status = Some(ResolutionStatus::Failed);
                        deposit.next_resolution_at = None;
                    }
                }
            }
        }
    }
    retired
}
