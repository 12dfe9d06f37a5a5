//! Outbound submission queue. Intents for the same `(chain, escrow)` key
//! are processed strictly in queue order by a single worker task, and each
//! intent's SUBMITTED → COMPLETED life finishes before the next one is
//! handed out — which is what bounds every escrow to at most one in-flight
//! transaction.
//!
//! At-most-once submission: the intent flips to SUBMITTED *before* the
//! adapter call, so a crash mid-call leaves a SUBMITTED row without a txid.
//! On restart that row is resubmitted under the same intent id and the
//! adapter's own ledger deduplicates, returning the original txid.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::adapter::{AdapterError, ChainAdapter, TransferOrder};
use crate::error::Result;
use crate::model::{PayoutStatus, SubmittedTx};
use crate::store::QueueItem;

use super::gas_tank::GasTank;
use super::DealService;

/// Retry backoff for transient submission failures, capped at 15 minutes.
const BACKOFF_SECONDS: [u64; 5] = [5, 15, 45, 120, 300];
const BACKOFF_CAP_SECONDS: u64 = 900;

pub fn backoff_delay(attempt: u32) -> Duration {
    let seconds = BACKOFF_SECONDS
        .get(attempt as usize)
        .copied()
        .unwrap_or(BACKOFF_CAP_SECONDS)
        .min(BACKOFF_CAP_SECONDS);
    Duration::from_secs(seconds)
}

pub struct PayoutQueue {
    service: Arc<DealService>,
    gas_tank: Arc<GasTank>,
    workers: tokio::sync::Mutex<HashMap<(String, String), JoinHandle<()>>>,
}

enum Step {
    /// The head item reached a terminal status; move on immediately.
    Advanced,
    /// Waiting on confirmations; poll again shortly.
    Waiting,
    /// Transient trouble; back off before retrying.
    Retry,
}

impl PayoutQueue {
    pub fn new(service: Arc<DealService>, gas_tank: Arc<GasTank>) -> Self {
        PayoutQueue { service, gas_tank, workers: tokio::sync::Mutex::new(HashMap::new()) }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("payout queue started");
        let mut tick =
            tokio::time::interval(Duration::from_secs(self.service.config.poll_interval_seconds));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.sync(&shutdown).await {
                        warn!(error = %e, "payout queue sync failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("payout queue stopping");
                    break;
                }
            }
        }
    }

    /// One synchronous pass over every queue with work: submit each head
    /// and advance confirmations, stopping a queue at the first item that
    /// has to wait. The workers do this continuously; tests call it
    /// directly to step the queue deterministically.
    pub async fn pump(&self) -> Result<()> {
        for (chain_id, from_addr) in self.service.store.queue_keys_with_work().await? {
            let adapter = self.service.registry.get(&chain_id)?;
            loop {
                let Some(item) = self.service.store.next_queue_item(&chain_id, &from_addr).await?
                else {
                    break;
                };
                match process_item(&self.service, &self.gas_tank, &adapter, &item).await? {
                    Step::Advanced => continue,
                    Step::Waiting | Step::Retry => break,
                }
            }
        }
        Ok(())
    }

    /// One submitter task per escrow queue with outstanding work.
    pub async fn sync(&self, shutdown: &watch::Receiver<bool>) -> Result<()> {
        let keys = self.service.store.queue_keys_with_work().await?;
        let mut workers = self.workers.lock().await;
        workers.retain(|_, handle| !handle.is_finished());
        for (chain_id, from_addr) in keys {
            let key = (chain_id.clone(), from_addr.clone());
            if workers.contains_key(&key) {
                continue;
            }
            let service = Arc::clone(&self.service);
            let gas_tank = Arc::clone(&self.gas_tank);
            let shutdown = shutdown.clone();
            debug!(chain = %chain_id, escrow = %from_addr, "payout worker spawned");
            workers.insert(
                key,
                tokio::spawn(run_key(service, gas_tank, chain_id, from_addr, shutdown)),
            );
        }
        Ok(())
    }
}

/// Serialized submitter for one `(chain, escrow)` queue. Exits when the
/// queue drains; the supervisor respawns it when new work appears.
pub async fn run_key(
    service: Arc<DealService>,
    gas_tank: Arc<GasTank>,
    chain_id: String,
    from_addr: String,
    shutdown: watch::Receiver<bool>,
) {
    let poll = Duration::from_secs(service.config.poll_interval_seconds);
    let mut retry_attempt = 0u32;
    loop {
        if *shutdown.borrow() {
            return;
        }
        let item = match service.store.next_queue_item(&chain_id, &from_addr).await {
            Ok(Some(item)) => item,
            Ok(None) => return,
            Err(e) => {
                warn!(chain = %chain_id, escrow = %from_addr, error = %e, "queue read failed");
                tokio::time::sleep(poll).await;
                continue;
            }
        };
        let adapter = match service.registry.get(&chain_id) {
            Ok(adapter) => adapter,
            Err(e) => {
                error!(chain = %chain_id, error = %e, "no adapter for queued payout");
                return;
            }
        };
        match process_item(&service, &gas_tank, &adapter, &item).await {
            Ok(Step::Advanced) => retry_attempt = 0,
            Ok(Step::Waiting) => {
                retry_attempt = 0;
                tokio::time::sleep(poll).await;
            }
            Ok(Step::Retry) | Err(_) => {
                let delay = backoff_delay(retry_attempt);
                retry_attempt = retry_attempt.saturating_add(1);
                debug!(
                    chain = %chain_id, escrow = %from_addr, intent = %item.intent.id,
                    delay_seconds = delay.as_secs(), "submission backoff"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn process_item(
    service: &Arc<DealService>,
    gas_tank: &Arc<GasTank>,
    adapter: &Arc<dyn ChainAdapter>,
    item: &QueueItem,
) -> Result<Step> {
    let intent = &item.intent;
    match (&intent.status, &intent.submitted_tx) {
        // Tracked on-chain: advance on confirmations, resubmit on reorg.
        (PayoutStatus::Submitted, Some(tx)) => {
            let confirmations = adapter
                .tx_confirmations(&tx.txid)
                .await
                .map_err(crate::error::BrokerError::from)?;
            if confirmations < 0 {
                warn!(intent = %intent.id, txid = %tx.txid, "payout tx reorged out, resubmitting");
                return submit(service, gas_tank, adapter, item).await;
            }
            let mut tx = tx.clone();
            tx.confirms = confirmations;
            if confirmations >= intent.min_confirmations as i64 {
                service.store.mark_completed(&intent.id, &tx).await?;
                append_deal_event(
                    service,
                    &intent.deal_id,
                    format!("payout completed ({}): {} ({} confirmations)", intent.purpose, tx.txid, confirmations),
                )
                .await;
                info!(intent = %intent.id, txid = %tx.txid, "payout completed");
                Ok(Step::Advanced)
            } else {
                service.store.record_confirmations(&intent.id, &tx).await?;
                Ok(Step::Waiting)
            }
        }
        // PENDING, or SUBMITTED with no recorded tx (crash mid-submission):
        // both go through the idempotent submit path.
        _ => submit(service, gas_tank, adapter, item).await,
    }
}

async fn submit(
    service: &Arc<DealService>,
    gas_tank: &Arc<GasTank>,
    adapter: &Arc<dyn ChainAdapter>,
    item: &QueueItem,
) -> Result<Step> {
    let intent = &item.intent;

    // Direct token transfers are signed by the escrow itself, which may
    // hold no gas yet.
    if intent.asset_code.is_erc20() && !intent.purpose.is_broker_call() {
        gas_tank
            .ensure_escrow_gas(adapter, &item.from.address, crate::adapter::GasSubsidyOp::TokenTransfer)
            .await;
    }

    // Record the attempt before touching the network.
    service.store.mark_submitting(&intent.id).await?;

    let order = TransferOrder {
        intent_id: intent.id.clone(),
        from_address: item.from.address.clone(),
        key_ref: item.from.key_ref.clone(),
        to_address: intent.to_address.clone(),
        asset_code: intent.asset_code.clone(),
        amount: intent.amount,
        purpose: intent.purpose,
    };
    let submitted = tokio::time::timeout(adapter.call_timeout(), adapter.submit_transfer(&order))
        .await
        .map_err(|_| AdapterError::transient("submitTransfer timed out"))
        .and_then(|r| r);

    match submitted {
        Ok(receipt) => {
            let mut tx = SubmittedTx {
                txid: receipt.txid.clone(),
                submitted_at: Utc::now(),
                confirms: 0,
                required_confirms: intent.min_confirmations,
                additional_txids: receipt.additional_txids.clone(),
            };
            // Broker calls carry child transfers worth surfacing; a miss
            // here never blocks completion, it only skips the enrichment.
            if intent.purpose.is_broker_call() {
                if let Some(ops) = adapter.evm_ops() {
                    match ops.get_internal_transactions(&receipt.txid).await {
                        Ok(children) if !children.is_empty() => {
                            append_deal_event(
                                service,
                                &intent.deal_id,
                                format!("broker call {} produced {} internal transfers", receipt.txid, children.len()),
                            )
                            .await;
                        }
                        Ok(_) => {}
                        Err(e) => debug!(txid = %receipt.txid, error = %e, "internal tx retrieval failed"),
                    }
                }
            }
            tx.confirms = 0;
            service.store.record_submission(&intent.id, &tx).await?;
            append_deal_event(
                service,
                &intent.deal_id,
                format!("payout submitted ({}): {} {} to {} ({})", intent.purpose, intent.amount, intent.asset_code, intent.to_address, receipt.txid),
            )
            .await;
            info!(intent = %intent.id, txid = %receipt.txid, "payout submitted");
            Ok(Step::Waiting)
        }
        Err(AdapterError::Transient(msg)) => {
            debug!(intent = %intent.id, error = %msg, "transient submission failure");
            Ok(Step::Retry)
        }
        Err(AdapterError::Permanent(msg)) => {
            service.store.mark_failed(&intent.id).await?;
            append_deal_event(
                service,
                &intent.deal_id,
                format!("payout failed permanently ({}): {msg}", intent.purpose),
            )
            .await;
            error!(intent = %intent.id, error = %msg, "payout failed permanently");
            Ok(Step::Advanced)
        }
    }
}

/// Payout progress is part of the deal's user-visible history; failures to
/// append never fail the payout itself.
async fn append_deal_event(service: &Arc<DealService>, deal_id: &str, message: String) {
    let result = service
        .mutate(deal_id, |d| {
            d.push_event(message);
            Ok(())
        })
        .await;
    if let Err(e) = result {
        debug!(deal = %deal_id, error = %e, "could not append payout event");
    }
}
