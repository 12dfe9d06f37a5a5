use std::env;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Which family of chain an adapter speaks. The core only branches on this
/// to pick capability extras (EVM broker calls, UTXO multi-tx payouts);
/// everything else goes through the common `ChainAdapter` contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainFlavor {
    /// EVM chain driven over JSON-RPC; numeric id used for signing.
    Evm { chain_numeric_id: u64 },
    /// UTXO chain; payouts may span several transactions.
    Utxo,
    /// In-process simulated chain (tests and the ALPHA demo chain).
    Mock,
}

/// Static per-chain parameters. Compiled-in defaults, overridable per
/// deployment through `{CHAIN}_RPC`, `{CHAIN}_ERC20_FEE`,
/// `{CHAIN}_COMMISSION_ADDRESS`, `{CHAIN}_STABLE_FIXED_USD` and
/// `{CHAIN}_MAX_AMOUNT`.
#[derive(Debug, Clone)]
pub struct ChainSettings {
    pub chain_id: String,
    pub display_name: String,
    pub native_symbol: String,
    pub flavor: ChainFlavor,
    /// Confirmation depth required before a deposit or payout counts.
    pub min_confirmations: u32,
    /// Extra native amount collected when the escrow itself pays outbound
    /// gas for a native-asset swap.
    pub gas_buffer: Decimal,
    /// Residual native balance below this is not worth sweeping back.
    pub dust_threshold: Decimal,
    pub rpc_url: String,
    pub explorer_tx_url: Option<String>,
    pub erc20_fixed_fee: Option<Decimal>,
    pub commission_address: Option<String>,
    /// Per-asset fixed USD commission (stablecoin deployments); presence
    /// switches the side's plan to FIXED_USD_NATIVE.
    pub stable_fixed_usd: Option<Decimal>,
    pub max_amount: Option<Decimal>,
    /// Broker contract that moves approved tokens on escrows' behalf; when
    /// set, ERC20 payouts go through it instead of escrow-signed transfers.
    pub broker_contract: Option<String>,
}

impl ChainSettings {
    fn with_env_overrides(mut self) -> Self {
        let key = |suffix: &str| format!("{}_{}", self.chain_id, suffix);
        if let Ok(url) = env::var(key("RPC")) {
            self.rpc_url = url;
        }
        self.erc20_fixed_fee = env_decimal(&key("ERC20_FEE")).or(self.erc20_fixed_fee);
        self.stable_fixed_usd = env_decimal(&key("STABLE_FIXED_USD")).or(self.stable_fixed_usd);
        self.max_amount = env_decimal(&key("MAX_AMOUNT")).or(self.max_amount);
        if let Ok(addr) = env::var(key("COMMISSION_ADDRESS")) {
            self.commission_address = Some(addr);
        }
        if let Ok(addr) = env::var(key("BROKER_CONTRACT")) {
            self.broker_contract = Some(addr);
        }
        self
    }
}

/// Process configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub base_url: String,
    pub bind_addr: String,
    pub database_url: String,
    /// Master seed for deterministic escrow key derivation (hex or
    /// passphrase). Without it escrow keys are not recoverable across
    /// restarts.
    pub escrow_master_seed: Option<String>,
    pub tank_wallet_key: Option<String>,
    pub email_enabled: bool,
    pub mail_webhook_url: Option<String>,
    pub production_mode: bool,
    /// Allow-list of asset codes accepted in production mode, e.g.
    /// `ALPHA,ETH,ERC20:0x...`; `None` accepts everything the registry knows.
    pub allowed_assets: Option<Vec<String>>,
    /// When set, deals with an EVM side carry a gas-reimbursement plan: the
    /// collected gas buffer is returned explicitly instead of as surplus.
    pub gas_reimbursement_enabled: bool,
    /// Grace period between full confirmation on both sides and SWAP entry.
    pub swap_grace_seconds: u64,
    /// Engine tick and watcher poll cadence.
    pub poll_interval_seconds: u64,
    /// Post-termination stray-deposit surveillance window.
    pub surveillance_hours: u64,
    pub chains: Vec<ChainSettings>,
}

impl Config {
    pub fn from_env() -> Self {
        Config {
            base_url: env::var("BASE_URL").unwrap_or_else(|_| "http://localhost:8080".to_string()),
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            database_url: env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:otc.db?mode=rwc".to_string()),
            escrow_master_seed: env::var("ESCROW_MASTER_SEED").ok().filter(|s| !s.is_empty()),
            tank_wallet_key: env::var("TANK_WALLET_PRIVATE_KEY").ok().filter(|k| !k.is_empty()),
            email_enabled: env_bool("EMAIL_ENABLED"),
            mail_webhook_url: env::var("MAIL_WEBHOOK_URL").ok().filter(|u| !u.is_empty()),
            production_mode: env_bool("PRODUCTION_MODE"),
            allowed_assets: env::var("ALLOWED_ASSETS").ok().map(|v| {
                v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect()
            }),
            gas_reimbursement_enabled: env_bool("GAS_REIMBURSEMENT_ENABLED"),
            swap_grace_seconds: env_u64("SWAP_GRACE_SECONDS").unwrap_or(30),
            poll_interval_seconds: env_u64("POLL_INTERVAL_SECONDS").unwrap_or(7),
            surveillance_hours: env_u64("SURVEILLANCE_HOURS").unwrap_or(24),
            chains: default_chains().into_iter().map(ChainSettings::with_env_overrides).collect(),
        }
    }

    pub fn chain(&self, chain_id: &str) -> Option<&ChainSettings> {
        self.chains.iter().find(|c| c.chain_id == chain_id)
    }

    /// Party link of the §6 format: `BASE_URL/d/{dealId}/{a|b}/{token}`.
    pub fn party_link(&self, deal_id: &str, side_letter: &str, token: &str) -> String {
        format!("{}/d/{}/{}/{}", self.base_url.trim_end_matches('/'), deal_id, side_letter, token)
    }
}

/// Built-in chain table. ALPHA is the simulated demo chain; the EVM entries
/// are live networks reachable through their `{CHAIN}_RPC` endpoints.
pub fn default_chains() -> Vec<ChainSettings> {
    vec![
        ChainSettings {
            chain_id: "ALPHA".into(),
            display_name: "Alphanet".into(),
            native_symbol: "ALPHA".into(),
            flavor: ChainFlavor::Mock,
            min_confirmations: 6,
            gas_buffer: Decimal::ZERO,
            dust_threshold: dec!(0.00001),
            rpc_url: "mock://alpha".into(),
            explorer_tx_url: None,
            erc20_fixed_fee: None,
            commission_address: None,
            stable_fixed_usd: None,
            max_amount: None,
            broker_contract: None,
        },
        ChainSettings {
            chain_id: "ETH".into(),
            display_name: "Ethereum".into(),
            native_symbol: "ETH".into(),
            flavor: ChainFlavor::Evm { chain_numeric_id: 1 },
            min_confirmations: 12,
            gas_buffer: dec!(0.002),
            dust_threshold: dec!(0.0001),
            rpc_url: "https://eth.llamarpc.com".into(),
            explorer_tx_url: Some("https://etherscan.io/tx/{txid}".into()),
            erc20_fixed_fee: None,
            commission_address: None,
            stable_fixed_usd: None,
            max_amount: None,
            broker_contract: None,
        },
        ChainSettings {
            chain_id: "MATIC".into(),
            display_name: "Polygon".into(),
            native_symbol: "MATIC".into(),
            flavor: ChainFlavor::Evm { chain_numeric_id: 137 },
            min_confirmations: 30,
            gas_buffer: dec!(0.1),
            dust_threshold: dec!(0.01),
            rpc_url: "https://polygon-rpc.com".into(),
            explorer_tx_url: Some("https://polygonscan.com/tx/{txid}".into()),
            erc20_fixed_fee: None,
            commission_address: None,
            stable_fixed_usd: None,
            max_amount: None,
            broker_contract: None,
        },
    ]
}

fn env_bool(key: &str) -> bool {
    env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_decimal(key: &str) -> Option<Decimal> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}
