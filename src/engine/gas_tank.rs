//! Gas tank coordination: before an ERC20 approval or transfer must be
//! signed by a freshly generated escrow that holds no native coin, the
//! operator tank fronts the gas. Funding operations contend on the tank
//! wallet's nonce, so they are serialized per chain.
//!
//! The subsidy is best-effort. If the tank is missing or fails, the escrow
//! operation is still attempted (and will fail if underfunded); the deal
//! proceeds without the subsidy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::adapter::{ChainAdapter, GasSubsidyOp};

const FUNDING_CONFIRMATION_POLLS: u32 = 30;

#[derive(Default)]
pub struct GasTank {
    chain_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl GasTank {
    pub fn new() -> Self {
        GasTank::default()
    }

    fn lock_for(&self, chain_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.chain_locks.lock().unwrap();
        map.entry(chain_id.to_string()).or_default().clone()
    }

    /// Top the escrow up to the estimated cost of `op` and wait for the
    /// funding transfer to reach one confirmation.
    pub async fn ensure_escrow_gas(
        &self,
        adapter: &Arc<dyn ChainAdapter>,
        escrow_address: &str,
        op: GasSubsidyOp,
    ) {
        let Some(ops) = adapter.evm_ops() else { return };
        if !ops.tank_enabled() {
            debug!(chain = %adapter.chain_id(), "gas tank disabled, escrow pays its own gas");
            return;
        }

        let lock = self.lock_for(adapter.chain_id());
        let _guard = lock.lock().await;

        let estimate = match ops.estimate_gas_subsidy(op).await {
            Ok(estimate) => estimate,
            Err(e) => {
                warn!(chain = %adapter.chain_id(), error = %e, "gas estimate failed, skipping subsidy");
                return;
            }
        };
        let balance = match ops.native_balance(escrow_address).await {
            Ok(balance) => balance,
            Err(e) => {
                warn!(chain = %adapter.chain_id(), error = %e, "escrow balance check failed, skipping subsidy");
                return;
            }
        };
        if balance >= estimate {
            return;
        }

        let top_up = estimate - balance;
        let receipt = match ops.fund_from_tank(escrow_address, top_up).await {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!(
                    chain = %adapter.chain_id(), escrow = %escrow_address, error = %e,
                    "tank funding failed, operation proceeds unsubsidized"
                );
                return;
            }
        };
        debug!(chain = %adapter.chain_id(), escrow = %escrow_address, amount = %top_up, txid = %receipt.txid, "escrow gas funded");

        // The dependent operation needs the funds spendable first.
        for _ in 0..FUNDING_CONFIRMATION_POLLS {
            match adapter.tx_confirmations(&receipt.txid).await {
                Ok(confs) if confs >= 1 => return,
                Ok(_) => {}
                Err(e) => {
                    warn!(chain = %adapter.chain_id(), txid = %receipt.txid, error = %e, "funding confirmation poll failed");
                }
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
        warn!(chain = %adapter.chain_id(), txid = %receipt.txid, "funding still unconfirmed, proceeding anyway");
    }

    /// Whether the residual balance is worth sweeping back.
    pub fn worth_reclaiming(residue: Decimal, dust_threshold: Decimal) -> bool {
        residue > dust_threshold
    }
}
