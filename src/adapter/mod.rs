pub mod evm;
pub mod mock;
pub mod registry;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::error::BrokerError;
use crate::model::{AssetCode, Escrow, OracleQuote, PayoutPurpose, Side};

/// Adapter failures carry their own transient/permanent classification; the
/// core only branches on the kind and never second-guesses it.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Permanent(String),
}

impl AdapterError {
    pub fn transient(msg: impl Into<String>) -> Self {
        AdapterError::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        AdapterError::Permanent(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, AdapterError::Transient(_))
    }
}

impl From<AdapterError> for BrokerError {
    fn from(e: AdapterError) -> Self {
        match e {
            AdapterError::Transient(msg) => BrokerError::AdapterTransient(msg),
            AdapterError::Permanent(msg) => BrokerError::AdapterPermanent(msg),
        }
    }
}

/// A credit to an escrow as the chain reports it. `block_height = None`
/// means the transaction is still in the mempool. Synthetic entries carry a
/// deterministic placeholder txid minted by the adapter for balances whose
/// originating transfer has not been identified yet.
#[derive(Debug, Clone)]
pub struct RawDeposit {
    pub txid: String,
    pub asset_code: AssetCode,
    pub amount: Decimal,
    pub block_height: Option<u64>,
    pub confirmations: i64,
    pub synthetic: bool,
}

/// One logical outbound transfer handed to an adapter. `intent_id` is the
/// idempotency key: resubmitting the same id must return the original txid.
#[derive(Debug, Clone)]
pub struct TransferOrder {
    pub intent_id: String,
    pub from_address: String,
    pub key_ref: String,
    pub to_address: String,
    pub asset_code: AssetCode,
    pub amount: Decimal,
    pub purpose: PayoutPurpose,
}

/// Result of a submission. UTXO chains may implement one logical payout
/// with several transactions; the first is the primary txid tracked for
/// confirmations.
#[derive(Debug, Clone)]
pub struct TransferReceipt {
    pub txid: String,
    pub additional_txids: Vec<String>,
}

/// A child transfer observed inside a broker-contract call.
#[derive(Debug, Clone)]
pub struct InternalTransfer {
    pub to_address: String,
    pub asset_code: AssetCode,
    pub amount: Decimal,
}

/// A USD→native conversion, with the quote that produced it (recorded so a
/// frozen commission can always be traced back to its price).
#[derive(Debug, Clone)]
pub struct NativeQuote {
    pub native_amount: Decimal,
    pub quote: OracleQuote,
}

/// The capability contract every integrated chain exposes. The core is
/// polymorphic over this set and holds no chain-specific logic.
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    fn chain_id(&self) -> &str;

    /// Confirmation depth this chain requires before value is trusted.
    fn min_confirmations(&self) -> u32;

    /// Per-call timeout for this chain's RPC operations.
    fn call_timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    /// Pure syntactic address check.
    fn validate_address(&self, address: &str) -> bool;

    /// Deterministic per `(deal_id, side)`; never reused across deals.
    async fn generate_escrow(
        &self,
        asset: &AssetCode,
        deal_id: &str,
        side: Side,
    ) -> Result<Escrow, AdapterError>;

    /// Observed credits to the escrow, with confirmations relative to the
    /// current tip. May include synthetic entries when transfer history is
    /// unavailable but a balance is present.
    async fn list_deposits(
        &self,
        escrow: &Escrow,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawDeposit>, AdapterError>;

    /// `-1` if the tx is absent (reorg), `0` if in the mempool, `>= 1` once
    /// mined.
    async fn tx_confirmations(&self, txid: &str) -> Result<i64, AdapterError>;

    /// Idempotent over `order.intent_id`; the adapter keeps its own
    /// submission ledger.
    async fn submit_transfer(&self, order: &TransferOrder) -> Result<TransferReceipt, AdapterError>;

    /// Price a USD amount in the chain's native coin, recording the quote.
    async fn quote_native_for_usd(&self, usd_amount: Decimal) -> Result<NativeQuote, AdapterError>;

    /// Try to find the real originating transfer behind a synthetic deposit.
    /// `Ok(None)` means not discoverable yet.
    async fn resolve_deposit_txid(
        &self,
        escrow: &Escrow,
        synthetic_txid: &str,
    ) -> Result<Option<String>, AdapterError>;

    /// EVM capability extras, when this chain has them.
    fn evm_ops(&self) -> Option<&dyn EvmOps> {
        None
    }
}

/// Extras only EVM chains expose: broker-contract token allowances, internal
/// transfer retrieval, and the operator gas tank.
#[async_trait]
pub trait EvmOps: Send + Sync {
    /// One-time allowance letting the broker contract move tokens on the
    /// escrow's behalf.
    async fn approve_broker_for_token(
        &self,
        escrow: &Escrow,
        token_addr: &str,
    ) -> Result<TransferReceipt, AdapterError>;

    /// Child transfers emitted by a broker-contract call. May be empty until
    /// the node has indexed the trace.
    async fn get_internal_transactions(
        &self,
        txid: &str,
    ) -> Result<Vec<InternalTransfer>, AdapterError>;

    async fn native_balance(&self, address: &str) -> Result<Decimal, AdapterError>;

    /// Whether an operator tank wallet is configured for this chain.
    fn tank_enabled(&self) -> bool;

    /// Address of the operator tank wallet, when configured.
    fn tank_address(&self) -> Option<String>;

    /// `gas_units * gas_price * safety_factor` for the given operation.
    async fn estimate_gas_subsidy(&self, op: GasSubsidyOp) -> Result<Decimal, AdapterError>;

    /// Native transfer from the operator tank to an escrow.
    async fn fund_from_tank(
        &self,
        to_address: &str,
        amount: Decimal,
    ) -> Result<TransferReceipt, AdapterError>;
}

/// The escrow operation a gas subsidy is being sized for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GasSubsidyOp {
    TokenApproval,
    TokenTransfer,
}
