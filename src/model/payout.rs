use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::asset::AssetCode;

/// Why an outbound transfer exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayoutPurpose {
    /// The trade amount, paid to the counterparty's recipient address.
    SwapPayout,
    /// Operator commission.
    OpCommission,
    /// Full refund of a side's confirmed balance after expiry.
    TimeoutRefund,
    /// Overpayment / stray value returned to the payback address.
    SurplusRefund,
    /// Party-facing gas reimbursement.
    GasReimbursement,
    /// Residual escrow gas swept back to the operator tank.
    GasRefundToTank,
    /// Swap executed through a broker contract call (EVM token moves).
    BrokerSwap,
    /// Refund executed through a broker contract call.
    BrokerRefund,
}

impl PayoutPurpose {
    /// Purposes that must COMPLETE before a deal may close.
    pub fn blocks_close(self) -> bool {
        matches!(
            self,
            PayoutPurpose::SwapPayout | PayoutPurpose::OpCommission | PayoutPurpose::BrokerSwap
        )
    }

    /// Purposes executed via a broker contract, for which child transfers
    /// are surfaced after submission.
    pub fn is_broker_call(self) -> bool {
        matches!(self, PayoutPurpose::BrokerSwap | PayoutPurpose::BrokerRefund)
    }
}

impl std::fmt::Display for PayoutPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PayoutPurpose::SwapPayout => "SWAP_PAYOUT",
            PayoutPurpose::OpCommission => "OP_COMMISSION",
            PayoutPurpose::TimeoutRefund => "TIMEOUT_REFUND",
            PayoutPurpose::SurplusRefund => "SURPLUS_REFUND",
            PayoutPurpose::GasReimbursement => "GAS_REIMBURSEMENT",
            PayoutPurpose::GasRefundToTank => "GAS_REFUND_TO_TANK",
            PayoutPurpose::BrokerSwap => "BROKER_SWAP",
            PayoutPurpose::BrokerRefund => "BROKER_REFUND",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for PayoutPurpose {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SWAP_PAYOUT" => Ok(PayoutPurpose::SwapPayout),
            "OP_COMMISSION" => Ok(PayoutPurpose::OpCommission),
            "TIMEOUT_REFUND" => Ok(PayoutPurpose::TimeoutRefund),
            "SURPLUS_REFUND" => Ok(PayoutPurpose::SurplusRefund),
            "GAS_REIMBURSEMENT" => Ok(PayoutPurpose::GasReimbursement),
            "GAS_REFUND_TO_TANK" => Ok(PayoutPurpose::GasRefundToTank),
            "BROKER_SWAP" => Ok(PayoutPurpose::BrokerSwap),
            "BROKER_REFUND" => Ok(PayoutPurpose::BrokerRefund),
            other => Err(format!("unknown payout purpose: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayoutStatus {
    Pending,
    Submitted,
    Completed,
    Failed,
}

impl std::fmt::Display for PayoutStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PayoutStatus::Pending => "PENDING",
            PayoutStatus::Submitted => "SUBMITTED",
            PayoutStatus::Completed => "COMPLETED",
            PayoutStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for PayoutStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(PayoutStatus::Pending),
            "SUBMITTED" => Ok(PayoutStatus::Submitted),
            "COMPLETED" => Ok(PayoutStatus::Completed),
            "FAILED" => Ok(PayoutStatus::Failed),
            other => Err(format!("unknown payout status: {other}")),
        }
    }
}

/// On-chain submission record for one intent. UTXO chains may implement a
/// single logical payout with several transactions; the extra txids ride in
/// `additional_txids`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmittedTx {
    pub txid: String,
    pub submitted_at: DateTime<Utc>,
    pub confirms: i64,
    pub required_confirms: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_txids: Vec<String>,
}

/// A planned outbound transfer. Persisted before any submission attempt so
/// that a crash between persist and submit is recoverable: the queue retries
/// under the same intent id and the adapter's submission ledger deduplicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutIntent {
    pub id: String,
    pub deal_id: String,
    pub chain_id: String,
    pub from_escrow: String,
    pub to_address: String,
    pub asset_code: AssetCode,
    pub amount: Decimal,
    pub purpose: PayoutPurpose,
    pub status: PayoutStatus,
    pub min_confirmations: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submitted_tx: Option<SubmittedTx>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payout_group_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PayoutIntent {
    pub fn new(
        deal_id: &str,
        chain_id: &str,
        from_escrow: &str,
        to_address: &str,
        asset_code: AssetCode,
        amount: Decimal,
        purpose: PayoutPurpose,
        min_confirmations: u32,
    ) -> Self {
        PayoutIntent {
            id: uuid::Uuid::new_v4().simple().to_string(),
            deal_id: deal_id.to_string(),
            chain_id: chain_id.to_string(),
            from_escrow: from_escrow.to_string(),
            to_address: to_address.to_string(),
            asset_code,
            amount,
            purpose,
            status: PayoutStatus::Pending,
            min_confirmations,
            submitted_tx: None,
            payout_group_id: None,
            created_at: Utc::now(),
        }
    }

    /// Serialization key of the submission queue this intent belongs to.
    pub fn queue_key(&self) -> (String, String) {
        (self.chain_id.clone(), self.from_escrow.clone())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, PayoutStatus::Completed | PayoutStatus::Failed)
    }
}
