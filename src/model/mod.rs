pub mod asset;
pub mod deal;
pub mod deposit;
pub mod payout;

pub use asset::{AssetCode, AssetSpec};
pub use deal::{
    CommissionCurrency, CommissionMode, CommissionPlan, Deal, DealEvent, DealStage, Escrow,
    GasReimbursement, GasReimbursementStatus, OracleQuote, PartyDetails, Side, SideLocks, SideState,
};
pub use deposit::{Deposit, DepositStatus, ResolutionStatus};
pub use payout::{PayoutIntent, PayoutPurpose, PayoutStatus, SubmittedTx};
