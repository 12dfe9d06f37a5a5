//! The settlement engine: deal state machine, commission and payout
//! planning, deposit watching, the outbound submission queue and the gas
//! tank coordinator.

pub mod commission;
pub mod deal_engine;
pub mod gas_tank;
pub mod payout_planner;
pub mod payout_queue;
pub mod watcher;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::adapter::registry::ChainRegistry;
use crate::config::Config;
use crate::error::Result;
use crate::model::{Deal, PayoutIntent};
use crate::store::Store;

/// One mutex per deal. Every state mutation for a deal happens under its
/// mutex, which makes the owner-task model explicit: whoever holds the lock
/// is the deal's owner for that mutation.
#[derive(Default)]
pub struct DealLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl DealLocks {
    pub fn lock_for(&self, deal_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock().unwrap();
        map.entry(deal_id.to_string()).or_default().clone()
    }
}

/// Shared context for everything that reads or mutates deals: the engine,
/// the deposit watchers, the payout queue and the RPC handlers.
///
/// Mutations follow the lock-read-apply-save discipline: take the deal lock,
/// load a fresh row, apply the closure, persist with a version check. The
/// deal lock is never held across a network call; adapter work happens
/// before `mutate` and its results are applied conditionally inside.
pub struct DealService {
    pub store: Store,
    pub registry: Arc<ChainRegistry>,
    pub config: Arc<Config>,
    locks: DealLocks,
}

impl DealService {
    pub fn new(store: Store, registry: Arc<ChainRegistry>, config: Arc<Config>) -> Self {
        DealService { store, registry, config, locks: DealLocks::default() }
    }

    pub async fn mutate<T>(
        &self,
        deal_id: &str,
        f: impl FnOnce(&mut Deal) -> Result<T>,
    ) -> Result<T> {
        let lock = self.locks.lock_for(deal_id);
        let _guard = lock.lock().await;
        let mut deal = self.store.load_deal(deal_id).await?;
        let out = f(&mut deal)?;
        self.store.save_deal(&mut deal).await?;
        Ok(out)
    }

    /// Like `mutate`, but the closure also plans payout intents that must
    /// commit atomically with the deal write (stage transitions).
    pub async fn mutate_with_payouts<T>(
        &self,
        deal_id: &str,
        f: impl FnOnce(&mut Deal) -> Result<(T, Vec<PayoutIntent>)>,
    ) -> Result<T> {
        let lock = self.locks.lock_for(deal_id);
        let _guard = lock.lock().await;
        let mut deal = self.store.load_deal(deal_id).await?;
        let (out, intents) = f(&mut deal)?;
        self.store.save_deal_with_payouts(&mut deal, &intents).await?;
        Ok(out)
    }
}
