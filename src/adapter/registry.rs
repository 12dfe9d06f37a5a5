//! Per-chain adapter lookup. The registry is built once at startup from the
//! chain table and handed around as `Arc<ChainRegistry>`; tests build theirs
//! with injected mock chains.

use std::collections::HashMap;
use std::sync::Arc;

use rand::RngCore;
use sha3::{Digest, Keccak256};
use sqlx::SqlitePool;
use tracing::warn;

use crate::config::{ChainFlavor, ChainSettings, Config};
use crate::error::{BrokerError, Result};

use super::evm::EvmChain;
use super::mock::MockChain;
use super::ChainAdapter;

pub struct ChainRegistry {
    adapters: HashMap<String, Arc<dyn ChainAdapter>>,
    settings: HashMap<String, ChainSettings>,
}

impl ChainRegistry {
    pub fn empty() -> Self {
        ChainRegistry { adapters: HashMap::new(), settings: HashMap::new() }
    }

    pub fn from_config(config: &Config, pool: SqlitePool) -> Result<Self> {
        let seed = escrow_seed(config);
        let mut registry = ChainRegistry::empty();
        for chain in &config.chains {
            match chain.flavor {
                ChainFlavor::Mock => {
                    let adapter = MockChain::new(
                        &chain.chain_id,
                        &chain.native_symbol,
                        chain.min_confirmations,
                    );
                    registry.insert(chain.clone(), Arc::new(adapter));
                }
                ChainFlavor::Evm { chain_numeric_id } => {
                    let adapter = EvmChain::new(
                        chain.clone(),
                        chain_numeric_id,
                        seed,
                        config.tank_wallet_key.as_deref(),
                        pool.clone(),
                    )
                    .map_err(BrokerError::from)?;
                    registry.insert(chain.clone(), Arc::new(adapter));
                }
                ChainFlavor::Utxo => {
                    // No UTXO adapter ships in this build; the chain stays
                    // visible in configuration but rejects deals.
                    warn!(chain = %chain.chain_id, "no adapter available, chain disabled");
                }
            }
        }
        Ok(registry)
    }

    pub fn insert(&mut self, settings: ChainSettings, adapter: Arc<dyn ChainAdapter>) {
        self.settings.insert(settings.chain_id.clone(), settings);
        self.adapters.insert(adapter.chain_id().to_string(), adapter);
    }

    pub fn get(&self, chain_id: &str) -> Result<Arc<dyn ChainAdapter>> {
        self.adapters
            .get(chain_id)
            .cloned()
            .ok_or_else(|| BrokerError::InvalidInput(format!("unknown chain: {chain_id}")))
    }

    pub fn settings(&self, chain_id: &str) -> Result<&ChainSettings> {
        self.settings
            .get(chain_id)
            .ok_or_else(|| BrokerError::InvalidInput(format!("unknown chain: {chain_id}")))
    }

    pub fn known(&self) -> impl Iterator<Item = &ChainSettings> {
        self.settings.values()
    }

    pub fn contains(&self, chain_id: &str) -> bool {
        self.adapters.contains_key(chain_id)
    }
}

/// 32-byte escrow derivation seed. Hex seeds are used verbatim; anything
/// else is hashed down. A missing seed gets a random one, which keeps the
/// process working but makes escrow keys unrecoverable after a restart.
fn escrow_seed(config: &Config) -> [u8; 32] {
    match config.escrow_master_seed.as_deref() {
        Some(s) => {
            if let Ok(bytes) = hex::decode(s.trim_start_matches("0x")) {
                if bytes.len() == 32 {
                    let mut seed = [0u8; 32];
                    seed.copy_from_slice(&bytes);
                    return seed;
                }
            }
            Keccak256::digest(s.as_bytes()).into()
        }
        None => {
            warn!("ESCROW_MASTER_SEED not set; escrow keys will not survive a restart");
            let mut seed = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut seed);
            seed
        }
    }
}
