//! EVM chain adapter over `ethers`. One instance per configured EVM chain.
//!
//! Escrow keys are derived deterministically from the process master seed,
//! so a restart regenerates the same signing material from the persisted
//! `key_ref` alone. Submissions are recorded in the adapter's own ledger
//! table before broadcast, which makes `submit_transfer` idempotent over the
//! intent id: a replay re-broadcasts the identical signed transaction and
//! therefore yields the identical txid.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::abi::Token;
use ethers::prelude::*;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::utils::{keccak256, to_checksum};
use lazy_static::lazy_static;
use regex::Regex;
use rust_decimal::Decimal;
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

use crate::config::ChainSettings;
use crate::model::{AssetCode, Escrow, OracleQuote, Side};

use super::{
    AdapterError, ChainAdapter, EvmOps, GasSubsidyOp, InternalTransfer, NativeQuote, RawDeposit,
    TransferOrder, TransferReceipt,
};

lazy_static! {
    static ref HEX_ADDRESS: Regex = Regex::new("^0x[0-9a-fA-F]{40}$").unwrap();
}

const NATIVE_DECIMALS: u32 = 18;
/// Gas-unit envelopes for subsidy sizing.
const APPROVE_GAS_UNITS: u64 = 60_000;
const TOKEN_TRANSFER_GAS_UNITS: u64 = 90_000;
const SUBSIDY_SAFETY_FACTOR: u64 = 2;
/// How far back the transfer-log scan reaches on the first poll.
const LOG_SCAN_LOOKBACK_BLOCKS: u64 = 5_000;

fn map_provider_err(e: ProviderError) -> AdapterError {
    AdapterError::transient(format!("rpc error: {e}"))
}

pub struct EvmChain {
    settings: ChainSettings,
    chain_numeric_id: u64,
    provider: Provider<Http>,
    escrow_seed: [u8; 32],
    tank_wallet: Option<LocalWallet>,
    pool: SqlitePool,
    /// Token decimals cache; initialized empty, filled on first use.
    token_decimals: Mutex<HashMap<String, u32>>,
    /// Block height at which each synthetic balance observation was first
    /// made, so its confirmation count can age with the chain head.
    synthetic_seen: Mutex<HashMap<String, u64>>,
    /// Native amounts the tank has fronted per escrow; subtracted from
    /// balance observations so subsidies never read as party deposits.
    tank_funded: Mutex<HashMap<String, Decimal>>,
}

impl EvmChain {
    pub fn new(
        settings: ChainSettings,
        chain_numeric_id: u64,
        escrow_seed: [u8; 32],
        tank_wallet_key: Option<&str>,
        pool: SqlitePool,
    ) -> Result<Self, AdapterError> {
        let provider = Provider::<Http>::try_from(settings.rpc_url.as_str())
            .map_err(|e| AdapterError::permanent(format!("bad RPC url: {e}")))?
            .interval(Duration::from_millis(2_000));
        let tank_wallet = match tank_wallet_key {
            Some(key) => Some(
                LocalWallet::from_str(key.trim_start_matches("0x"))
                    .map_err(|e| AdapterError::permanent(format!("bad tank key: {e}")))?
                    .with_chain_id(chain_numeric_id),
            ),
            None => None,
        };
        Ok(EvmChain {
            settings,
            chain_numeric_id,
            provider,
            escrow_seed,
            tank_wallet,
            pool,
            token_decimals: Mutex::new(HashMap::new()),
            synthetic_seen: Mutex::new(HashMap::new()),
            tank_funded: Mutex::new(HashMap::new()),
        })
    }

    /// First-observation height for a synthetic placeholder, recording the
    /// current head on first sight.
    fn synthetic_observed_at(&self, placeholder: &str, latest: u64) -> u64 {
        *self
            .synthetic_seen
            .lock()
            .unwrap()
            .entry(placeholder.to_string())
            .or_insert(latest)
    }

    /// Derivation path recorded as the opaque `key_ref`.
    fn key_path(&self, deal_id: &str, side: Side) -> String {
        format!("evm/{}/{}/{}", self.settings.chain_id, deal_id, side.letter())
    }

    /// Rebuild the signing key from a `key_ref`. Deterministic in the master
    /// seed, so restarts recover every escrow wallet.
    fn wallet_for_key_ref(&self, key_ref: &str) -> Result<LocalWallet, AdapterError> {
        for counter in 0u8..=255 {
            let mut material = Vec::with_capacity(self.escrow_seed.len() + key_ref.len() + 1);
            material.extend_from_slice(&self.escrow_seed);
            material.extend_from_slice(key_ref.as_bytes());
            material.push(counter);
            let digest = keccak256(&material);
            if let Ok(key) = k256::ecdsa::SigningKey::from_slice(&digest) {
                return Ok(LocalWallet::from(key).with_chain_id(self.chain_numeric_id));
            }
        }
        Err(AdapterError::permanent(format!("cannot derive key for {key_ref}")))
    }

    async fn latest_block(&self) -> Result<u64, AdapterError> {
        Ok(self.provider.get_block_number().await.map_err(map_provider_err)?.as_u64())
    }

    async fn token_decimals(&self, token: &str) -> Result<u32, AdapterError> {
        if let Some(d) = self.token_decimals.lock().unwrap().get(token) {
            return Ok(*d);
        }
        let token_addr = parse_address(token)?;
        // decimals() selector.
        let data = selector("decimals()").to_vec();
        let tx = TransactionRequest::new().to(token_addr).data(data);
        let out = self
            .provider
            .call(&TypedTransaction::Legacy(tx), None)
            .await
            .map_err(map_provider_err)?;
        let decimals = if out.len() >= 32 { out[31] as u32 } else { 18 };
        self.token_decimals.lock().unwrap().insert(token.to_string(), decimals);
        Ok(decimals)
    }

    async fn escrow_record(&self, address: &str) -> Result<Option<(AssetCode, u64)>, AdapterError> {
        let row = sqlx::query(
            "SELECT asset_code, first_seen_block FROM adapter_escrows WHERE chain_id = ? AND address = ?",
        )
        .bind(&self.settings.chain_id)
        .bind(address)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AdapterError::transient(format!("escrow ledger read: {e}")))?;
        match row {
            None => Ok(None),
            Some(row) => {
                let asset: String = row.get("asset_code");
                let first_seen: i64 = row.get("first_seen_block");
                let code = asset
                    .parse::<AssetCode>()
                    .map_err(|e| AdapterError::permanent(format!("corrupt escrow ledger: {e}")))?;
                Ok(Some((code, first_seen as u64)))
            }
        }
    }

    async fn erc20_transfer_logs(
        &self,
        token: &str,
        escrow_address: &str,
        from_block: u64,
        latest: u64,
    ) -> Result<Vec<RawDeposit>, AdapterError> {
        let token_addr = parse_address(token)?;
        let escrow_addr = parse_address(escrow_address)?;
        let transfer_topic = H256::from(keccak256("Transfer(address,address,uint256)".as_bytes()));
        let filter = Filter::new()
            .address(token_addr)
            .topic0(transfer_topic)
            .topic2(H256::from(escrow_addr))
            .from_block(from_block)
            .to_block(latest);
        let logs = self.provider.get_logs(&filter).await.map_err(map_provider_err)?;
        let decimals = self.token_decimals(token).await?;

        let mut deposits = Vec::with_capacity(logs.len());
        for log in logs {
            let Some(txid) = log.transaction_hash else { continue };
            let amount_raw = word_to_u256(log.data.as_ref());
            let amount = from_base_units(amount_raw, decimals)?;
            let block = log.block_number.map(|b| b.as_u64());
            deposits.push(RawDeposit {
                txid: format!("{txid:#x}"),
                asset_code: AssetCode::Erc20(token.to_string()),
                amount,
                block_height: block,
                confirmations: block.map(|b| latest.saturating_sub(b) as i64 + 1).unwrap_or(0),
                synthetic: false,
            });
        }
        Ok(deposits)
    }

    async fn erc20_balance(&self, token: &str, address: &str) -> Result<Decimal, AdapterError> {
        let token_addr = parse_address(token)?;
        let holder = parse_address(address)?;
        let mut data = selector("balanceOf(address)").to_vec();
        data.extend(ethers::abi::encode(&[Token::Address(holder)]));
        let tx = TransactionRequest::new().to(token_addr).data(data);
        let out = self
            .provider
            .call(&TypedTransaction::Legacy(tx), None)
            .await
            .map_err(map_provider_err)?;
        let raw = word_to_u256(out.as_ref());
        from_base_units(raw, self.token_decimals(token).await?)
    }

    /// Build, sign and persist an outbound transaction for an order, then
    /// broadcast it. The signed bytes go into the submission ledger before
    /// the broadcast so a crash in between is replayable.
    async fn sign_and_send(
        &self,
        order: &TransferOrder,
        wallet: &LocalWallet,
        to: Address,
        value: U256,
        data: Vec<u8>,
    ) -> Result<TransferReceipt, AdapterError> {
        let from = wallet.address();
        let nonce = self
            .provider
            .get_transaction_count(from, Some(BlockNumber::Pending.into()))
            .await
            .map_err(map_provider_err)?;
        let gas_price = self.provider.get_gas_price().await.map_err(map_provider_err)?;
        let gas_limit = if data.is_empty() { 21_000u64 } else { 120_000u64 };

        let request = Eip1559TransactionRequest::new()
            .from(from)
            .to(to)
            .value(value)
            .data(data)
            .nonce(nonce)
            .gas(gas_limit)
            .max_fee_per_gas(gas_price * 2)
            .max_priority_fee_per_gas(gas_price / 10 + U256::one())
            .chain_id(self.chain_numeric_id);
        let tx: TypedTransaction = request.into();
        let signature = wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| AdapterError::permanent(format!("signing failed: {e}")))?;
        let raw = tx.rlp_signed(&signature);
        let txid = format!("{:#x}", H256::from(keccak256(&raw)));

        sqlx::query(
            "INSERT INTO adapter_submissions (chain_id, intent_id, txid, raw_tx, submitted_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&self.settings.chain_id)
        .bind(&order.intent_id)
        .bind(&txid)
        .bind(hex::encode(&raw))
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| AdapterError::transient(format!("submission ledger write: {e}")))?;

        self.broadcast(&raw.0).await?;
        Ok(TransferReceipt { txid, additional_txids: Vec::new() })
    }

    async fn broadcast(&self, raw: &[u8]) -> Result<(), AdapterError> {
        match self.provider.send_raw_transaction(Bytes::from(raw.to_vec())).await {
            Ok(pending) => {
                debug!(chain = %self.settings.chain_id, txid = %format!("{:#x}", pending.tx_hash()), "broadcast");
                Ok(())
            }
            Err(e) => {
                let msg = e.to_string();
                // A replayed ledger entry is already in the pool or mined.
                if msg.contains("already known") || msg.contains("nonce too low") {
                    Ok(())
                } else {
                    Err(map_provider_err(e))
                }
            }
        }
    }

    /// Replay path: a previously signed submission for this intent.
    async fn replay_submission(
        &self,
        intent_id: &str,
    ) -> Result<Option<TransferReceipt>, AdapterError> {
        let row = sqlx::query(
            "SELECT txid, raw_tx FROM adapter_submissions WHERE chain_id = ? AND intent_id = ?",
        )
        .bind(&self.settings.chain_id)
        .bind(intent_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AdapterError::transient(format!("submission ledger read: {e}")))?;
        let Some(row) = row else { return Ok(None) };
        let txid: String = row.get("txid");
        let raw_hex: String = row.get("raw_tx");

        // Only re-broadcast if the chain does not know the tx yet.
        if self.tx_confirmations(&txid).await? < 0 {
            let raw = hex::decode(&raw_hex)
                .map_err(|e| AdapterError::permanent(format!("corrupt ledger entry: {e}")))?;
            self.broadcast(&raw).await?;
        }
        Ok(Some(TransferReceipt { txid, additional_txids: Vec::new() }))
    }
}

#[async_trait]
impl ChainAdapter for EvmChain {
    fn chain_id(&self) -> &str {
        &self.settings.chain_id
    }

    fn min_confirmations(&self) -> u32 {
        self.settings.min_confirmations
    }

    fn validate_address(&self, address: &str) -> bool {
        HEX_ADDRESS.is_match(address)
    }

    async fn generate_escrow(
        &self,
        asset: &AssetCode,
        deal_id: &str,
        side: Side,
    ) -> Result<Escrow, AdapterError> {
        let key_ref = self.key_path(deal_id, side);
        let wallet = self.wallet_for_key_ref(&key_ref)?;
        let address = to_checksum(&wallet.address(), None);
        let first_seen = self.latest_block().await.unwrap_or(0);
        sqlx::query(
            "INSERT OR IGNORE INTO adapter_escrows \
             (chain_id, address, key_ref, asset_code, deal_id, side, first_seen_block) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&self.settings.chain_id)
        .bind(&address)
        .bind(&key_ref)
        .bind(asset.to_string())
        .bind(deal_id)
        .bind(side.to_string())
        .bind(first_seen as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| AdapterError::transient(format!("escrow ledger write: {e}")))?;
        Ok(Escrow { address, key_ref })
    }

    async fn list_deposits(
        &self,
        escrow: &Escrow,
        _since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawDeposit>, AdapterError> {
        let latest = self.latest_block().await?;
        let (asset, first_seen) = self
            .escrow_record(&escrow.address)
            .await?
            .unwrap_or((AssetCode::native(&self.settings.native_symbol), latest));

        match &asset {
            AssetCode::Erc20(token) => {
                let from_block = first_seen.saturating_sub(LOG_SCAN_LOOKBACK_BLOCKS);
                let mut deposits =
                    self.erc20_transfer_logs(token, &escrow.address, from_block, latest).await?;
                // Balance above what the log scan accounts for becomes a
                // synthetic entry until the real transfer is discovered.
                let balance = self.erc20_balance(token, &escrow.address).await?;
                let seen: Decimal = deposits.iter().map(|d| d.amount).sum();
                if balance > seen {
                    let residue = balance - seen;
                    let placeholder = super::mock::synthetic_txid(&escrow.address, &asset, residue);
                    let observed = self.synthetic_observed_at(&placeholder, latest);
                    deposits.push(RawDeposit {
                        txid: placeholder,
                        asset_code: asset.clone(),
                        amount: residue,
                        block_height: Some(observed),
                        confirmations: latest.saturating_sub(observed) as i64 + 1,
                        synthetic: true,
                    });
                }
                Ok(deposits)
            }
            _ => {
                // Native coin: nodes cannot enumerate inbound transfers, so
                // the balance is observed synthetically, minus whatever the
                // tank has fronted for gas.
                let mut balance = self.native_balance(&escrow.address).await?;
                if let Some(fronted) = self.tank_funded.lock().unwrap().get(&escrow.address) {
                    balance -= *fronted;
                }
                if balance <= Decimal::ZERO {
                    return Ok(Vec::new());
                }
                let placeholder = super::mock::synthetic_txid(&escrow.address, &asset, balance);
                let observed = self.synthetic_observed_at(&placeholder, latest);
                Ok(vec![RawDeposit {
                    txid: placeholder,
                    asset_code: asset,
                    amount: balance,
                    block_height: Some(observed),
                    confirmations: latest.saturating_sub(observed) as i64 + 1,
                    synthetic: true,
                }])
            }
        }
    }

    async fn tx_confirmations(&self, txid: &str) -> Result<i64, AdapterError> {
        if txid.starts_with("synthetic-") {
            // Synthetic observations age with the chain head from the block
            // at which the balance was first seen.
            let latest = self.latest_block().await?;
            return Ok(match self.synthetic_seen.lock().unwrap().get(txid) {
                Some(observed) => latest.saturating_sub(*observed) as i64 + 1,
                None => 0,
            });
        }
        let hash = parse_txid(txid)?;
        let tx = self.provider.get_transaction(hash).await.map_err(map_provider_err)?;
        match tx {
            None => Ok(-1),
            Some(tx) => match tx.block_number {
                None => Ok(0),
                Some(bn) => {
                    let latest = self.latest_block().await?;
                    Ok(latest.saturating_sub(bn.as_u64()) as i64 + 1)
                }
            },
        }
    }

    async fn submit_transfer(&self, order: &TransferOrder) -> Result<TransferReceipt, AdapterError> {
        if let Some(receipt) = self.replay_submission(&order.intent_id).await? {
            return Ok(receipt);
        }
        let wallet = self.wallet_for_key_ref(&order.key_ref)?;
        let to = parse_address(&order.to_address)?;

        match (&order.asset_code, order.purpose.is_broker_call()) {
            (AssetCode::Native(_), _) => {
                let value = to_base_units(order.amount, NATIVE_DECIMALS)?;
                self.sign_and_send(order, &wallet, to, value, Vec::new()).await
            }
            (AssetCode::Erc20(token), false) => {
                let decimals = self.token_decimals(token).await?;
                let raw_amount = to_base_units(order.amount, decimals)?;
                let mut data = selector("transfer(address,uint256)").to_vec();
                data.extend(ethers::abi::encode(&[Token::Address(to), Token::Uint(raw_amount)]));
                let token_addr = parse_address(token)?;
                self.sign_and_send(order, &wallet, token_addr, U256::zero(), data).await
            }
            (AssetCode::Erc20(token), true) => {
                // Routed through the broker contract, spending the one-time
                // allowance issued at escrow setup.
                let broker = self.settings.broker_contract.as_deref().ok_or_else(|| {
                    AdapterError::permanent("broker payout requested but no broker contract configured")
                })?;
                let decimals = self.token_decimals(token).await?;
                let raw_amount = to_base_units(order.amount, decimals)?;
                let mut data = selector("execute(address,address,address,uint256)").to_vec();
                data.extend(ethers::abi::encode(&[
                    Token::Address(parse_address(token)?),
                    Token::Address(parse_address(&order.from_address)?),
                    Token::Address(to),
                    Token::Uint(raw_amount),
                ]));
                let broker_addr = parse_address(broker)?;
                self.sign_and_send(order, &wallet, broker_addr, U256::zero(), data).await
            }
            (AssetCode::Spl(_), _) => {
                Err(AdapterError::permanent("SPL assets are not held on an EVM chain"))
            }
        }
    }

    async fn quote_native_for_usd(&self, usd_amount: Decimal) -> Result<NativeQuote, AdapterError> {
        let pair = format!("{}/USD", self.settings.native_symbol);
        let row = sqlx::query(
            "SELECT price, as_of, source FROM oracle_quotes \
             WHERE chain_id = ? AND pair = ? ORDER BY as_of DESC LIMIT 1",
        )
        .bind(&self.settings.chain_id)
        .bind(&pair)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AdapterError::transient(format!("oracle read: {e}")))?;
        let Some(row) = row else {
            return Err(AdapterError::transient(format!("no recorded price for {pair}")));
        };
        let price: String = row.get("price");
        let price = Decimal::from_str(&price)
            .map_err(|e| AdapterError::permanent(format!("corrupt quote: {e}")))?;
        if price <= Decimal::ZERO {
            return Err(AdapterError::permanent(format!("non-positive price for {pair}")));
        }
        Ok(NativeQuote {
            native_amount: (usd_amount / price).round_dp(8),
            quote: OracleQuote {
                pair,
                price,
                as_of: row.get("as_of"),
                source: row.get("source"),
            },
        })
    }

    async fn resolve_deposit_txid(
        &self,
        escrow: &Escrow,
        synthetic_txid: &str,
    ) -> Result<Option<String>, AdapterError> {
        let Some((AssetCode::Erc20(token), first_seen)) = self.escrow_record(&escrow.address).await?
        else {
            // Native balances have no discoverable originating transfer.
            return Ok(None);
        };
        let latest = self.latest_block().await?;
        let from_block = first_seen.saturating_sub(LOG_SCAN_LOOKBACK_BLOCKS);
        let logs = self
            .erc20_transfer_logs(&token, &escrow.address, from_block, latest)
            .await?;
        // The placeholder encodes the observed amount; the first real
        // transfer matching it resolves the entry.
        Ok(logs
            .iter()
            .find(|d| synthetic_txid == super::mock::synthetic_txid(&escrow.address, &d.asset_code, d.amount))
            .map(|d| d.txid.clone()))
    }

    fn evm_ops(&self) -> Option<&dyn EvmOps> {
        Some(self)
    }
}

#[async_trait]
impl EvmOps for EvmChain {
    async fn approve_broker_for_token(
        &self,
        escrow: &Escrow,
        token_addr: &str,
    ) -> Result<TransferReceipt, AdapterError> {
        let broker = self.settings.broker_contract.as_deref().ok_or_else(|| {
            AdapterError::permanent("no broker contract configured for this chain")
        })?;
        let wallet = self.wallet_for_key_ref(&escrow.key_ref)?;
        let mut data = selector("approve(address,uint256)").to_vec();
        data.extend(ethers::abi::encode(&[
            Token::Address(parse_address(broker)?),
            Token::Uint(U256::MAX),
        ]));
        let order = TransferOrder {
            intent_id: format!("approve-{}-{}", self.settings.chain_id, escrow.address),
            from_address: escrow.address.clone(),
            key_ref: escrow.key_ref.clone(),
            to_address: token_addr.to_string(),
            asset_code: AssetCode::Erc20(token_addr.to_string()),
            amount: Decimal::ZERO,
            purpose: crate::model::PayoutPurpose::BrokerSwap,
        };
        if let Some(receipt) = self.replay_submission(&order.intent_id).await? {
            return Ok(receipt);
        }
        self.sign_and_send(&order, &wallet, parse_address(token_addr)?, U256::zero(), data).await
    }

    async fn get_internal_transactions(
        &self,
        txid: &str,
    ) -> Result<Vec<InternalTransfer>, AdapterError> {
        let hash = parse_txid(txid)?;
        let traces = self.provider.trace_transaction(hash).await.map_err(map_provider_err)?;
        let mut transfers = Vec::new();
        for trace in traces {
            if let ethers::types::Action::Call(call) = trace.action {
                if call.value > U256::zero() {
                    transfers.push(InternalTransfer {
                        to_address: to_checksum(&call.to, None),
                        asset_code: AssetCode::native(&self.settings.native_symbol),
                        amount: from_base_units(call.value, NATIVE_DECIMALS)?,
                    });
                }
            }
        }
        Ok(transfers)
    }

    async fn native_balance(&self, address: &str) -> Result<Decimal, AdapterError> {
        let addr = parse_address(address)?;
        let balance = self.provider.get_balance(addr, None).await.map_err(map_provider_err)?;
        from_base_units(balance, NATIVE_DECIMALS)
    }

    fn tank_enabled(&self) -> bool {
        self.tank_wallet.is_some()
    }

    fn tank_address(&self) -> Option<String> {
        self.tank_wallet.as_ref().map(|w| to_checksum(&w.address(), None))
    }

    async fn estimate_gas_subsidy(&self, op: GasSubsidyOp) -> Result<Decimal, AdapterError> {
        let gas_units = match op {
            GasSubsidyOp::TokenApproval => APPROVE_GAS_UNITS,
            GasSubsidyOp::TokenTransfer => TOKEN_TRANSFER_GAS_UNITS,
        };
        let gas_price = self.provider.get_gas_price().await.map_err(map_provider_err)?;
        let wei = gas_price * U256::from(gas_units) * U256::from(SUBSIDY_SAFETY_FACTOR);
        from_base_units(wei, NATIVE_DECIMALS)
    }

    async fn fund_from_tank(
        &self,
        to_address: &str,
        amount: Decimal,
    ) -> Result<TransferReceipt, AdapterError> {
        let wallet = self
            .tank_wallet
            .as_ref()
            .ok_or_else(|| AdapterError::permanent("gas tank wallet not configured"))?
            .clone();
        let order = TransferOrder {
            intent_id: format!("tank-{}-{}-{}", self.settings.chain_id, to_address, amount),
            from_address: to_checksum(&wallet.address(), None),
            key_ref: "tank".into(),
            to_address: to_address.to_string(),
            asset_code: AssetCode::native(&self.settings.native_symbol),
            amount,
            purpose: crate::model::PayoutPurpose::GasReimbursement,
        };
        if let Some(receipt) = self.replay_submission(&order.intent_id).await? {
            return Ok(receipt);
        }
        let value = to_base_units(amount, NATIVE_DECIMALS)?;
        match self.sign_and_send(&order, &wallet, parse_address(to_address)?, value, Vec::new()).await
        {
            Ok(receipt) => {
                *self.tank_funded.lock().unwrap().entry(to_address.to_string()).or_default() +=
                    amount;
                Ok(receipt)
            }
            Err(e) => {
                warn!(chain = %self.settings.chain_id, to = %to_address, error = %e, "tank funding failed");
                Err(e)
            }
        }
    }
}

fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Decode one ABI word defensively; nodes occasionally pad or truncate.
fn word_to_u256(bytes: &[u8]) -> U256 {
    if bytes.len() >= 32 {
        U256::from_big_endian(&bytes[bytes.len() - 32..])
    } else {
        U256::from_big_endian(bytes)
    }
}

fn parse_address(s: &str) -> Result<Address, AdapterError> {
    Address::from_str(s).map_err(|e| AdapterError::permanent(format!("bad address {s}: {e}")))
}

fn parse_txid(s: &str) -> Result<H256, AdapterError> {
    H256::from_str(s).map_err(|e| AdapterError::permanent(format!("bad txid {s}: {e}")))
}

/// Scale a decimal amount into base units, rejecting precision the token
/// cannot represent.
pub fn to_base_units(amount: Decimal, decimals: u32) -> Result<U256, AdapterError> {
    let normalized = amount.normalize();
    if normalized.scale() > decimals {
        return Err(AdapterError::permanent(format!(
            "amount {amount} has more precision than {decimals} decimals"
        )));
    }
    let mantissa = normalized.mantissa();
    if mantissa < 0 {
        return Err(AdapterError::permanent(format!("negative amount {amount}")));
    }
    let scale_up = 10i128
        .checked_pow(decimals - normalized.scale())
        .ok_or_else(|| AdapterError::permanent("scale overflow".to_string()))?;
    let base = mantissa
        .checked_mul(scale_up)
        .ok_or_else(|| AdapterError::permanent(format!("amount {amount} overflows base units")))?;
    Ok(U256::from(base as u128))
}

/// Base units back into a decimal amount.
pub fn from_base_units(raw: U256, decimals: u32) -> Result<Decimal, AdapterError> {
    if raw > U256::from(u128::MAX) {
        return Err(AdapterError::permanent("amount exceeds supported range".to_string()));
    }
    let v = raw.as_u128();
    if v > i128::MAX as u128 {
        return Err(AdapterError::permanent("amount exceeds supported range".to_string()));
    }
    Ok(Decimal::from_i128_with_scale(v as i128, decimals).normalize())
}
