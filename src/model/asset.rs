use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// An asset held on some chain: either the chain's native coin (referred to
/// by symbol) or a typed token reference carrying the contract address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AssetCode {
    /// Native coin, e.g. `ALPHA`, `ETH`, `MATIC`.
    Native(String),
    /// ERC20 token on an EVM chain, keyed by contract address.
    Erc20(String),
    /// SPL token, keyed by mint address.
    Spl(String),
}

impl AssetCode {
    pub fn native(symbol: &str) -> Self {
        AssetCode::Native(symbol.to_uppercase())
    }

    pub fn is_native(&self) -> bool {
        matches!(self, AssetCode::Native(_))
    }

    pub fn is_erc20(&self) -> bool {
        matches!(self, AssetCode::Erc20(_))
    }

    /// Contract/mint address for token assets, `None` for native coins.
    pub fn token_address(&self) -> Option<&str> {
        match self {
            AssetCode::Native(_) => None,
            AssetCode::Erc20(addr) | AssetCode::Spl(addr) => Some(addr),
        }
    }

    /// Syntactic check of the embedded token address: 20-byte hex for
    /// ERC20 contracts, 32-byte base58 for SPL mints.
    pub fn token_address_valid(&self) -> bool {
        match self {
            AssetCode::Native(_) => true,
            AssetCode::Erc20(addr) => {
                addr.len() == 42
                    && addr.starts_with("0x")
                    && addr[2..].chars().all(|c| c.is_ascii_hexdigit())
            }
            AssetCode::Spl(addr) => {
                bs58::decode(addr).into_vec().map(|bytes| bytes.len() == 32).unwrap_or(false)
            }
        }
    }
}

impl fmt::Display for AssetCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssetCode::Native(sym) => write!(f, "{sym}"),
            AssetCode::Erc20(addr) => write!(f, "ERC20:{addr}"),
            AssetCode::Spl(addr) => write!(f, "SPL:{addr}"),
        }
    }
}

impl FromStr for AssetCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty asset code".into());
        }
        if let Some(addr) = s.strip_prefix("ERC20:") {
            if addr.is_empty() {
                return Err("ERC20 asset code without contract address".into());
            }
            return Ok(AssetCode::Erc20(addr.to_lowercase()));
        }
        if let Some(addr) = s.strip_prefix("SPL:") {
            if addr.is_empty() {
                return Err("SPL asset code without mint address".into());
            }
            return Ok(AssetCode::Spl(addr.to_string()));
        }
        if !s.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(format!("malformed asset code: {s}"));
        }
        Ok(AssetCode::Native(s.to_uppercase()))
    }
}

impl Serialize for AssetCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for AssetCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One side's quoted leg of a swap: what asset, on which chain, how much.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetSpec {
    pub chain_id: String,
    pub asset_code: AssetCode,
    pub amount: Decimal,
}

impl AssetSpec {
    pub fn new(chain_id: &str, asset_code: AssetCode, amount: Decimal) -> Self {
        Self { chain_id: chain_id.to_string(), asset_code, amount }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn parses_native_symbols() {
        assert_eq!("ALPHA".parse::<AssetCode>().unwrap(), AssetCode::Native("ALPHA".into()));
        assert_eq!("eth".parse::<AssetCode>().unwrap(), AssetCode::Native("ETH".into()));
    }

    #[test]
    fn parses_token_references() {
        let erc20 = "ERC20:0xAbCd000000000000000000000000000000000001".parse::<AssetCode>().unwrap();
        assert_eq!(
            erc20,
            AssetCode::Erc20("0xabcd000000000000000000000000000000000001".into())
        );
        assert!(erc20.is_erc20());

        let spl = "SPL:Es9vMFrzaCERmJfrF4H2FYD4KCoNkY11McCe8BenwNYB".parse::<AssetCode>().unwrap();
        assert_eq!(spl.token_address(), Some("Es9vMFrzaCERmJfrF4H2FYD4KCoNkY11McCe8BenwNYB"));
    }

    #[test]
    fn rejects_malformed_codes() {
        assert!("".parse::<AssetCode>().is_err());
        assert!("ERC20:".parse::<AssetCode>().is_err());
        assert!("AL PHA".parse::<AssetCode>().is_err());
    }

    #[test]
    fn token_address_validation() {
        assert!("ALPHA".parse::<AssetCode>().unwrap().token_address_valid());
        assert!("ERC20:0x00000000000000000000000000000000000000aa"
            .parse::<AssetCode>()
            .unwrap()
            .token_address_valid());
        assert!(!"ERC20:0x1234".parse::<AssetCode>().unwrap().token_address_valid());
        assert!(!"ERC20:no-prefix".parse::<AssetCode>().unwrap().token_address_valid());
        // A real USDC mint is 32 bytes of base58.
        assert!("SPL:EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v"
            .parse::<AssetCode>()
            .unwrap()
            .token_address_valid());
        assert!(!"SPL:tooshort".parse::<AssetCode>().unwrap().token_address_valid());
    }

    #[test]
    fn display_round_trips() {
        for s in ["ALPHA", "ERC20:0xabc0000000000000000000000000000000000002", "SPL:So11111111111111111111111111111111111111112"] {
            let code: AssetCode = s.parse().unwrap();
            assert_eq!(code.to_string().parse::<AssetCode>().unwrap(), code);
        }
    }

    #[test]
    fn asset_spec_serializes_camel_case() {
        let spec = AssetSpec::new("C1", AssetCode::native("ALPHA"), dec!(10));
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["chainId"], "C1");
        assert_eq!(json["assetCode"], "ALPHA");
        assert_eq!(json["amount"], "10");
    }
}
