use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::asset::{AssetCode, AssetSpec};
use super::deposit::Deposit;

/// Deal lifecycle stage. Progression is monotonic with a single sanctioned
/// exception: a chain reorg that invalidates a required deposit demotes
/// WAITING back to COLLECTION.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DealStage {
    Created,
    Collection,
    Waiting,
    Swap,
    Closed,
    Reverted,
}

impl DealStage {
    /// Stages in which the deal is actively driven by the engine.
    pub fn is_active(self) -> bool {
        !matches!(self, DealStage::Closed | DealStage::Reverted)
    }

    /// Stages in which the expiry countdown runs. Suspended in WAITING,
    /// removed entirely in SWAP and the terminal stages.
    pub fn timer_runs(self) -> bool {
        matches!(self, DealStage::Created | DealStage::Collection)
    }
}

impl fmt::Display for DealStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DealStage::Created => "CREATED",
            DealStage::Collection => "COLLECTION",
            DealStage::Waiting => "WAITING",
            DealStage::Swap => "SWAP",
            DealStage::Closed => "CLOSED",
            DealStage::Reverted => "REVERTED",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for DealStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(DealStage::Created),
            "COLLECTION" => Ok(DealStage::Collection),
            "WAITING" => Ok(DealStage::Waiting),
            "SWAP" => Ok(DealStage::Swap),
            "CLOSED" => Ok(DealStage::Closed),
            "REVERTED" => Ok(DealStage::Reverted),
            other => Err(format!("unknown stage: {other}")),
        }
    }
}

/// The two parties of a deal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Side {
    A,
    B,
}

impl Side {
    pub const BOTH: [Side; 2] = [Side::A, Side::B];

    pub fn other(self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }

    pub fn letter(self) -> &'static str {
        match self {
            Side::A => "a",
            Side::B => "b",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::A => f.write_str("A"),
            Side::B => f.write_str("B"),
        }
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "A" | "a" => Ok(Side::A),
            "B" | "b" => Ok(Side::B),
            other => Err(format!("unknown party: {other}")),
        }
    }
}

/// Addresses a party supplies before collection can begin. The payback
/// address lives on the party's own send chain, the recipient address on the
/// counterparty's chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartyDetails {
    pub payback_address: String,
    pub recipient_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub filled_at: DateTime<Utc>,
    pub locked: bool,
}

/// A broker-generated escrow account. `key_ref` is an opaque handle into the
/// chain adapter's signing-material store; the core never sees key bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Escrow {
    pub address: String,
    pub key_ref: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommissionMode {
    PercentBps,
    FixedUsdNative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommissionCurrency {
    Asset,
    Native,
}

/// A price quote recorded when a FIXED_USD_NATIVE commission is frozen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OracleQuote {
    pub pair: String,
    pub price: Decimal,
    pub as_of: DateTime<Utc>,
    pub source: String,
}

/// Per-side commission requirement. For FIXED_USD_NATIVE the native amount
/// is frozen once at COLLECTION entry together with the oracle quote used;
/// that write is irreversible for the deal's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommissionPlan {
    pub mode: CommissionMode,
    pub currency: CommissionCurrency,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent_bps: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usd_fixed: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub native_fixed: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oracle_quote: Option<OracleQuote>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub erc20_fixed_fee: Option<Decimal>,
}

impl CommissionPlan {
    /// Whether the plan still needs an oracle quote before collection can be
    /// entered.
    pub fn needs_freezing(&self) -> bool {
        self.mode == CommissionMode::FixedUsdNative && self.native_fixed.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SideLocks {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trade_locked_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commission_locked_at: Option<DateTime<Utc>>,
}

/// Everything observed and derived for one side of the deal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SideState {
    pub deposits: Vec<Deposit>,
    pub collected_by_asset: BTreeMap<AssetCode, Decimal>,
    pub locks: SideLocks,
}

impl SideState {
    /// Recompute the per-asset collected sums from the non-orphaned ledger.
    pub fn recompute_collected(&mut self) {
        let mut sums: BTreeMap<AssetCode, Decimal> = BTreeMap::new();
        for d in self.deposits.iter().filter(|d| d.counts_toward_collected()) {
            *sums.entry(d.asset_code.clone()).or_default() += d.amount;
        }
        self.collected_by_asset = sums;
    }

    /// Per-asset sums of CONFIRMED deposits.
    pub fn confirmed_by_asset(&self) -> BTreeMap<AssetCode, Decimal> {
        let mut sums: BTreeMap<AssetCode, Decimal> = BTreeMap::new();
        for d in self.deposits.iter().filter(|d| d.is_confirmed()) {
            *sums.entry(d.asset_code.clone()).or_default() += d.amount;
        }
        sums
    }

    /// Sum of CONFIRMED deposits of the given asset.
    pub fn confirmed_amount(&self, asset: &AssetCode) -> Decimal {
        self.deposits
            .iter()
            .filter(|d| d.is_confirmed() && &d.asset_code == asset)
            .map(|d| d.amount)
            .sum()
    }

    pub fn deposit_mut(&mut self, txid: &str) -> Option<&mut Deposit> {
        self.deposits.iter_mut().find(|d| d.txid == txid)
    }

    pub fn has_confirmed_deposits(&self) -> bool {
        self.deposits.iter().any(|d| d.is_confirmed())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GasReimbursementStatus {
    PendingCalculation,
    Calculated,
    Reimbursed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GasReimbursement {
    pub enabled: bool,
    pub escrow_side: Side,
    pub status: GasReimbursementStatus,
}

/// Append-only, per-deal ordered event. `seq` is a monotonic counter owned
/// by the deal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DealEvent {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub message: String,
}

/// The unit of work: one two-sided cross-chain swap.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deal {
    pub id: String,
    pub name: String,
    pub spec_a: AssetSpec,
    pub spec_b: AssetSpec,
    pub timeout_seconds: u64,
    pub stage: DealStage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub party_a: Option<PartyDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub party_b: Option<PartyDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escrow_a: Option<Escrow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escrow_b: Option<Escrow>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commission_a: Option<CommissionPlan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commission_b: Option<CommissionPlan>,
    pub side_a: SideState,
    pub side_b: SideState,
    pub events: Vec<DealEvent>,
    pub event_seq: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_reimbursement: Option<GasReimbursement>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Terminal-transition instant; anchors the 24h surveillance window.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminated_at: Option<DateTime<Utc>>,
    pub version: i64,
}

impl Deal {
    pub fn new(id: String, name: String, spec_a: AssetSpec, spec_b: AssetSpec, timeout_seconds: u64) -> Self {
        let now = Utc::now();
        Deal {
            id,
            name,
            spec_a,
            spec_b,
            timeout_seconds,
            stage: DealStage::Created,
            expires_at: None,
            party_a: None,
            party_b: None,
            escrow_a: None,
            escrow_b: None,
            commission_a: None,
            commission_b: None,
            side_a: SideState::default(),
            side_b: SideState::default(),
            events: Vec::new(),
            event_seq: 0,
            gas_reimbursement: None,
            created_at: now,
            updated_at: now,
            terminated_at: None,
            version: 0,
        }
    }

    pub fn spec(&self, side: Side) -> &AssetSpec {
        match side {
            Side::A => &self.spec_a,
            Side::B => &self.spec_b,
        }
    }

    pub fn party(&self, side: Side) -> Option<&PartyDetails> {
        match side {
            Side::A => self.party_a.as_ref(),
            Side::B => self.party_b.as_ref(),
        }
    }

    pub fn set_party(&mut self, side: Side, details: PartyDetails) {
        match side {
            Side::A => self.party_a = Some(details),
            Side::B => self.party_b = Some(details),
        }
    }

    pub fn escrow(&self, side: Side) -> Option<&Escrow> {
        match side {
            Side::A => self.escrow_a.as_ref(),
            Side::B => self.escrow_b.as_ref(),
        }
    }

    pub fn set_escrow(&mut self, side: Side, escrow: Escrow) {
        match side {
            Side::A => self.escrow_a = Some(escrow),
            Side::B => self.escrow_b = Some(escrow),
        }
    }

    pub fn commission(&self, side: Side) -> Option<&CommissionPlan> {
        match side {
            Side::A => self.commission_a.as_ref(),
            Side::B => self.commission_b.as_ref(),
        }
    }

    pub fn commission_mut(&mut self, side: Side) -> Option<&mut CommissionPlan> {
        match side {
            Side::A => self.commission_a.as_mut(),
            Side::B => self.commission_b.as_mut(),
        }
    }

    pub fn set_commission(&mut self, side: Side, plan: CommissionPlan) {
        match side {
            Side::A => self.commission_a = Some(plan),
            Side::B => self.commission_b = Some(plan),
        }
    }

    pub fn side_state(&self, side: Side) -> &SideState {
        match side {
            Side::A => &self.side_a,
            Side::B => &self.side_b,
        }
    }

    pub fn side_state_mut(&mut self, side: Side) -> &mut SideState {
        match side {
            Side::A => &mut self.side_a,
            Side::B => &mut self.side_b,
        }
    }

    /// Both parties have filled and locked their details; the gate for
    /// COLLECTION entry.
    pub fn both_parties_locked(&self) -> bool {
        self.party_a.as_ref().is_some_and(|p| p.locked) && self.party_b.as_ref().is_some_and(|p| p.locked)
    }

    /// Whether the expiry countdown has elapsed. In CREATED (before
    /// `expires_at` is set) the countdown runs from creation; in WAITING and
    /// later the timer never fires.
    pub fn timed_out(&self, now: DateTime<Utc>) -> bool {
        if !self.stage.timer_runs() {
            return false;
        }
        let deadline = self
            .expires_at
            .unwrap_or_else(|| self.created_at + Duration::seconds(self.timeout_seconds as i64));
        now >= deadline
    }

    /// Append to the deal's ordered event log.
    pub fn push_event(&mut self, message: impl Into<String>) {
        self.event_seq += 1;
        self.events.push(DealEvent {
            seq: self.event_seq,
            at: Utc::now(),
            message: message.into(),
        });
    }

    /// Whether the deal is inside the post-termination surveillance window.
    pub fn in_surveillance_window(&self, now: DateTime<Utc>, window_hours: u64) -> bool {
        match (self.stage.is_active(), self.terminated_at) {
            (true, _) => false,
            (false, Some(t)) => now < t + Duration::hours(window_hours as i64),
            (false, None) => false,
        }
    }
}
