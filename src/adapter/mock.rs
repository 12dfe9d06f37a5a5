//! In-process simulated chain. Backs the ALPHA demo chain and every
//! integration test: deposits, confirmations, reorgs and submission faults
//! are all operator-controlled.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sha3::{Digest, Keccak256};

use crate::model::{AssetCode, Escrow, OracleQuote, Side};

use super::{
    AdapterError, ChainAdapter, EvmOps, GasSubsidyOp, InternalTransfer, NativeQuote, RawDeposit,
    TransferOrder, TransferReceipt,
};

#[derive(Debug, Clone)]
struct MockCredit {
    txid: String,
    asset_code: AssetCode,
    amount: Decimal,
    block_height: Option<u64>,
    synthetic: bool,
    resolvable_to: Option<String>,
    /// Operator gas subsidy: counts toward the balance, but is not a party
    /// deposit and never shows up in the deposit listing.
    from_tank: bool,
}

#[derive(Default)]
struct MockState {
    credits: HashMap<String, Vec<MockCredit>>,
    confirmations: HashMap<String, i64>,
    submissions: HashMap<String, TransferReceipt>,
    transfers: Vec<TransferOrder>,
    approvals: Vec<(String, String)>,
    internal_txs: HashMap<String, Vec<InternalTransfer>>,
    tank_fundings: Vec<(String, Decimal)>,
    fail_next_submit: Option<AdapterError>,
    next_seq: u64,
}

pub struct MockChain {
    chain_id: String,
    native_symbol: String,
    min_confirmations: u32,
    native_usd_price: Mutex<Decimal>,
    /// When set the chain reports EVM capability extras, including a tank.
    evm_mode: bool,
    tank_enabled: bool,
    /// UTXO-style chain: one logical payout lands as several transactions.
    split_payouts: bool,
    state: Mutex<MockState>,
}

impl MockChain {
    pub fn new(chain_id: &str, native_symbol: &str, min_confirmations: u32) -> Self {
        MockChain {
            chain_id: chain_id.to_string(),
            native_symbol: native_symbol.to_string(),
            min_confirmations,
            native_usd_price: Mutex::new(dec!(2)),
            evm_mode: false,
            tank_enabled: false,
            split_payouts: false,
            state: Mutex::new(MockState::default()),
        }
    }

    /// Simulated EVM chain: exposes the capability extras and a gas tank.
    pub fn new_evm(chain_id: &str, native_symbol: &str, min_confirmations: u32) -> Self {
        let mut chain = Self::new(chain_id, native_symbol, min_confirmations);
        chain.evm_mode = true;
        chain.tank_enabled = true;
        chain
    }

    pub fn with_price(self, usd_price: Decimal) -> Self {
        *self.native_usd_price.lock().unwrap() = usd_price;
        self
    }

    /// Emulates a UTXO chain where one logical payout spans transactions.
    pub fn with_split_payouts(mut self) -> Self {
        self.split_payouts = true;
        self
    }

    pub fn without_tank(mut self) -> Self {
        self.tank_enabled = false;
        self
    }

    pub fn set_usd_price(&self, usd_price: Decimal) {
        *self.native_usd_price.lock().unwrap() = usd_price;
    }

    fn next_txid(state: &mut MockState, prefix: &str) -> String {
        state.next_seq += 1;
        format!("{prefix}-{:04}", state.next_seq)
    }

    // -- test/operator controls ------------------------------------------

    /// Credit the address and return the minted txid. `block_height = None`
    /// leaves the tx in the mempool (0 confirmations).
    pub fn credit(
        &self,
        address: &str,
        asset: AssetCode,
        amount: Decimal,
        block_height: Option<u64>,
    ) -> String {
        let mut state = self.state.lock().unwrap();
        let txid = Self::next_txid(&mut state, "tx");
        state.confirmations.insert(txid.clone(), if block_height.is_some() { 1 } else { 0 });
        state.credits.entry(address.to_string()).or_default().push(MockCredit {
            txid: txid.clone(),
            asset_code: asset,
            amount,
            block_height,
            synthetic: false,
            resolvable_to: None,
            from_tank: false,
        });
        txid
    }

    /// Credit visible only as a balance: reported with a deterministic
    /// placeholder txid until `make_resolvable` supplies the real one.
    pub fn credit_synthetic(&self, address: &str, asset: AssetCode, amount: Decimal) -> String {
        let placeholder = synthetic_txid(address, &asset, amount);
        let mut state = self.state.lock().unwrap();
        state.confirmations.insert(placeholder.clone(), 1);
        state.credits.entry(address.to_string()).or_default().push(MockCredit {
            txid: placeholder.clone(),
            asset_code: asset,
            amount,
            block_height: Some(1),
            synthetic: true,
            resolvable_to: None,
            from_tank: false,
        });
        placeholder
    }

    pub fn make_resolvable(&self, placeholder_txid: &str, real_txid: &str) {
        let mut state = self.state.lock().unwrap();
        let conf = state.confirmations.get(placeholder_txid).copied().unwrap_or(1);
        state.confirmations.insert(real_txid.to_string(), conf);
        for credits in state.credits.values_mut() {
            for c in credits.iter_mut().filter(|c| c.txid == placeholder_txid) {
                c.resolvable_to = Some(real_txid.to_string());
            }
        }
    }

    pub fn set_confirmations(&self, txid: &str, confirmations: i64) {
        let mut state = self.state.lock().unwrap();
        state.confirmations.insert(txid.to_string(), confirmations);
    }

    /// Bring every known transaction to the given depth.
    pub fn confirm_all(&self, confirmations: i64) {
        let mut state = self.state.lock().unwrap();
        for conf in state.confirmations.values_mut() {
            if *conf >= 0 {
                *conf = confirmations;
            }
        }
        for credits in state.credits.values_mut() {
            for c in credits.iter_mut() {
                if c.block_height.is_none() {
                    c.block_height = Some(1);
                }
            }
        }
    }

    /// Drop the transaction from the chain, as a reorg would.
    pub fn reorg_out(&self, txid: &str) {
        self.set_confirmations(txid, -1);
    }

    pub fn fail_next_submit(&self, err: AdapterError) {
        self.state.lock().unwrap().fail_next_submit = Some(err);
    }

    pub fn set_internal_transactions(&self, txid: &str, transfers: Vec<InternalTransfer>) {
        self.state.lock().unwrap().internal_txs.insert(txid.to_string(), transfers);
    }

    /// Every outbound order the chain has accepted, in submission order.
    pub fn submitted_transfers(&self) -> Vec<TransferOrder> {
        self.state.lock().unwrap().transfers.clone()
    }

    pub fn receipt_for_intent(&self, intent_id: &str) -> Option<TransferReceipt> {
        self.state.lock().unwrap().submissions.get(intent_id).cloned()
    }

    pub fn approvals(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().approvals.clone()
    }

    pub fn tank_fundings(&self) -> Vec<(String, Decimal)> {
        self.state.lock().unwrap().tank_fundings.clone()
    }
}

/// Deterministic placeholder id for a balance-only observation.
pub fn synthetic_txid(address: &str, asset: &AssetCode, amount: Decimal) -> String {
    let mut hasher = Keccak256::new();
    hasher.update(address.as_bytes());
    hasher.update(asset.to_string().as_bytes());
    hasher.update(amount.to_string().as_bytes());
    format!("synthetic-{}", hex::encode(&hasher.finalize()[..8]))
}

#[async_trait]
impl ChainAdapter for MockChain {
    fn chain_id(&self) -> &str {
        &self.chain_id
    }

    fn min_confirmations(&self) -> u32 {
        self.min_confirmations
    }

    fn validate_address(&self, address: &str) -> bool {
        address.len() >= 4
            && address.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }

    async fn generate_escrow(
        &self,
        _asset: &AssetCode,
        deal_id: &str,
        side: Side,
    ) -> Result<Escrow, AdapterError> {
        let mut hasher = Keccak256::new();
        hasher.update(self.chain_id.as_bytes());
        hasher.update(deal_id.as_bytes());
        hasher.update(side.letter().as_bytes());
        let digest = hasher.finalize();
        Ok(Escrow {
            address: format!("{}-esc-{}", self.chain_id.to_lowercase(), hex::encode(&digest[..10])),
            key_ref: format!("{}/{}/{}", self.chain_id, deal_id, side.letter()),
        })
    }

    async fn list_deposits(
        &self,
        escrow: &Escrow,
        _since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawDeposit>, AdapterError> {
        let state = self.state.lock().unwrap();
        let Some(credits) = state.credits.get(&escrow.address) else {
            return Ok(Vec::new());
        };
        Ok(credits
            .iter()
            .filter(|c| !c.from_tank)
            .map(|c| RawDeposit {
                txid: c.txid.clone(),
                asset_code: c.asset_code.clone(),
                amount: c.amount,
                block_height: c.block_height,
                confirmations: state.confirmations.get(&c.txid).copied().unwrap_or(0),
                synthetic: c.synthetic,
            })
            .collect())
    }

    async fn tx_confirmations(&self, txid: &str) -> Result<i64, AdapterError> {
        let state = self.state.lock().unwrap();
        Ok(state.confirmations.get(txid).copied().unwrap_or(-1))
    }

    async fn submit_transfer(&self, order: &TransferOrder) -> Result<TransferReceipt, AdapterError> {
        let mut state = self.state.lock().unwrap();
        // Submission ledger: replays of the same intent return the original
        // receipt without touching the chain again.
        if let Some(receipt) = state.submissions.get(&order.intent_id) {
            return Ok(receipt.clone());
        }
        if let Some(err) = state.fail_next_submit.take() {
            return Err(err);
        }
        let txid = Self::next_txid(&mut state, "payout");
        state.confirmations.insert(txid.clone(), 0);
        let additional_txids = if self.split_payouts {
            let extra = Self::next_txid(&mut state, "payout");
            state.confirmations.insert(extra.clone(), 0);
            vec![extra]
        } else {
            Vec::new()
        };
        let receipt = TransferReceipt { txid, additional_txids };
        state.submissions.insert(order.intent_id.clone(), receipt.clone());
        state.transfers.push(order.clone());
        Ok(receipt)
    }

    async fn quote_native_for_usd(&self, usd_amount: Decimal) -> Result<NativeQuote, AdapterError> {
        let price = *self.native_usd_price.lock().unwrap();
        if price <= Decimal::ZERO {
            return Err(AdapterError::transient("no price available"));
        }
        let native_amount = (usd_amount / price).round_dp(8);
        Ok(NativeQuote {
            native_amount,
            quote: OracleQuote {
                pair: format!("{}/USD", self.native_symbol),
                price,
                as_of: Utc::now(),
                source: "mock".into(),
            },
        })
    }

    async fn resolve_deposit_txid(
        &self,
        escrow: &Escrow,
        synthetic_txid: &str,
    ) -> Result<Option<String>, AdapterError> {
        let mut state = self.state.lock().unwrap();
        let Some(credits) = state.credits.get_mut(&escrow.address) else {
            return Ok(None);
        };
        for c in credits.iter_mut().filter(|c| c.txid == synthetic_txid) {
            if let Some(real) = c.resolvable_to.take() {
                c.txid = real.clone();
                c.synthetic = false;
                return Ok(Some(real));
            }
        }
        Ok(None)
    }

    fn evm_ops(&self) -> Option<&dyn EvmOps> {
        if self.evm_mode { Some(self) } else { None }
    }
}

#[async_trait]
impl EvmOps for MockChain {
    async fn approve_broker_for_token(
        &self,
        escrow: &Escrow,
        token_addr: &str,
    ) -> Result<TransferReceipt, AdapterError> {
        let mut state = self.state.lock().unwrap();
        state.approvals.push((escrow.address.clone(), token_addr.to_string()));
        let txid = Self::next_txid(&mut state, "approve");
        state.confirmations.insert(txid.clone(), 1);
        Ok(TransferReceipt { txid, additional_txids: Vec::new() })
    }

    async fn get_internal_transactions(
        &self,
        txid: &str,
    ) -> Result<Vec<InternalTransfer>, AdapterError> {
        Ok(self.state.lock().unwrap().internal_txs.get(txid).cloned().unwrap_or_default())
    }

    async fn native_balance(&self, address: &str) -> Result<Decimal, AdapterError> {
        let state = self.state.lock().unwrap();
        let balance = state
            .credits
            .get(address)
            .map(|credits| {
                credits
                    .iter()
                    .filter(|c| c.asset_code.is_native())
                    .filter(|c| state.confirmations.get(&c.txid).copied().unwrap_or(0) >= 0)
                    .map(|c| c.amount)
                    .sum()
            })
            .unwrap_or(Decimal::ZERO);
        Ok(balance)
    }

    fn tank_enabled(&self) -> bool {
        self.tank_enabled
    }

    fn tank_address(&self) -> Option<String> {
        self.tank_enabled.then(|| format!("tank-{}", self.chain_id.to_lowercase()))
    }

    async fn estimate_gas_subsidy(&self, op: GasSubsidyOp) -> Result<Decimal, AdapterError> {
        Ok(match op {
            GasSubsidyOp::TokenApproval => dec!(0.002),
            GasSubsidyOp::TokenTransfer => dec!(0.004),
        })
    }

    async fn fund_from_tank(
        &self,
        to_address: &str,
        amount: Decimal,
    ) -> Result<TransferReceipt, AdapterError> {
        let mut state = self.state.lock().unwrap();
        state.tank_fundings.push((to_address.to_string(), amount));
        let txid = Self::next_txid(&mut state, "tank");
        state.confirmations.insert(txid.clone(), 1);
        state.credits.entry(to_address.to_string()).or_default().push(MockCredit {
            txid: txid.clone(),
            asset_code: AssetCode::native(&self.native_symbol),
            amount,
            block_height: Some(1),
            synthetic: false,
            resolvable_to: None,
            from_tank: true,
        });
        Ok(TransferReceipt { txid, additional_txids: Vec::new() })
    }
}
