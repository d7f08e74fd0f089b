// ===============================
// src/tokens.rs
// ===============================
//
// Token directory: symbol -> {address, decimals}.
// - Built-in Base mainnet table as a typed enum.
// - Optional JSON token list (TOKEN_LIST_FILE) adds/overrides entries at startup.
// - Lookups are case-insensitive; everything is validated once, at load.
//
use std::fs;
use std::str::FromStr;

use ahash::AHashMap as HashMap;
use serde::Deserialize;
use thiserror::Error;

use crate::domain::{Address, TokenDescriptor};
use crate::error::UnknownToken;

pub const MAX_DECIMALS: u8 = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Asset {
    // stables
    Usdc,
    // eth
    Weth,
    OEthB,
    WstEth,
    // btc
    CbBtc,
    Lbtc,
    // sol
    USol,
    // alts
    Aero,
    Virtual,
    // memes
    Aixbt,
}

impl Asset {
    pub const ALL: [Asset; 10] = [
        Asset::Usdc,
        Asset::Weth,
        Asset::OEthB,
        Asset::WstEth,
        Asset::CbBtc,
        Asset::Lbtc,
        Asset::USol,
        Asset::Aero,
        Asset::Virtual,
        Asset::Aixbt,
    ];

    pub fn symbol(self) -> &'static str {
        match self {
            Asset::Usdc => "USDC",
            Asset::Weth => "WETH",
            Asset::OEthB => "OETHb",
            Asset::WstEth => "wstETH",
            Asset::CbBtc => "cbBTC",
            Asset::Lbtc => "LBTC",
            Asset::USol => "uSOL",
            Asset::Aero => "AERO",
            Asset::Virtual => "VIRTUAL",
            Asset::Aixbt => "AIXBT",
        }
    }

    fn base_address(self) -> &'static str {
        match self {
            Asset::Usdc => "0x833589fcd6edb6e08f4c7c32d4f71b54bda02913",
            Asset::Weth => "0x4200000000000000000000000000000000000006",
            Asset::OEthB => "0xdbfefd2e8460a6ee4955a68582f85708baea60a3",
            Asset::WstEth => "0xc1cba3fcea344f92d9239c08c0568f6f2f0ee452",
            Asset::CbBtc => "0xcbb7c0000ab88b473b1f5afd9ef808440eed33bf",
            Asset::Lbtc => "0xecac9c5f704e954931349da37f60e39f515c11c1",
            Asset::USol => "0x9b8df6e244526ab5f6e6400d331db28c8fdddb55",
            Asset::Aero => "0x940181a94a35a4569e4529a3cdfb74e38fd98631",
            Asset::Virtual => "0x0b3e328455c4059eeb9e3f84b5543f74e24e7e1b",
            Asset::Aixbt => "0x4f9fd6be4a90f2620860d680c0d4d5fb53d1a825",
        }
    }

    pub fn decimals(self) -> u8 {
        match self {
            Asset::Usdc => 6,
            Asset::CbBtc | Asset::Lbtc => 8,
            _ => 18,
        }
    }
}

impl FromStr for Asset {
    type Err = UnknownToken;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Asset::ALL
            .into_iter()
            .find(|a| a.symbol().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| UnknownToken(s.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum TokenListError {
    #[error("failed to read token list {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid token list JSON {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("token {symbol}: invalid address {value:?}")]
    BadAddress { symbol: String, value: String },
    #[error("token {symbol}: decimals {decimals} exceed {max}", max = MAX_DECIMALS)]
    BadDecimals { symbol: String, decimals: u8 },
    #[error("sell token {0} is not in the directory")]
    MissingStablecoin(String),
}

#[derive(Deserialize)]
struct TokenEntry {
    symbol: String,
    address: String,
    decimals: u8,
}

#[derive(Debug, Clone)]
pub struct TokenDirectory {
    by_symbol: HashMap<String, TokenDescriptor>,
    stablecoin: String,
}

impl TokenDirectory {
    /// Built-in Base mainnet table with USDC as the sell token.
    pub fn base_mainnet() -> Result<Self, TokenListError> {
        let mut dir = Self {
            by_symbol: HashMap::new(),
            stablecoin: Asset::Usdc.symbol().to_ascii_lowercase(),
        };
        for asset in Asset::ALL {
            dir.insert(asset.symbol(), asset.base_address(), asset.decimals())?;
        }
        Ok(dir)
    }

    /// Merge a JSON list `[{symbol, address, decimals}]` over the current entries.
    pub fn with_token_list(mut self, path: &str) -> Result<Self, TokenListError> {
        let raw = fs::read_to_string(path).map_err(|source| TokenListError::Io {
            path: path.to_string(),
            source,
        })?;
        self.merge_json(&raw).map_err(|e| match e {
            TokenListError::Json { source, .. } => TokenListError::Json {
                path: path.to_string(),
                source,
            },
            other => other,
        })?;
        Ok(self)
    }

    fn merge_json(&mut self, raw: &str) -> Result<(), TokenListError> {
        let entries: Vec<TokenEntry> =
            serde_json::from_str(raw).map_err(|source| TokenListError::Json {
                path: String::new(),
                source,
            })?;
        for e in entries {
            self.insert(&e.symbol, &e.address, e.decimals)?;
        }
        Ok(())
    }

    fn insert(&mut self, symbol: &str, address: &str, decimals: u8) -> Result<(), TokenListError> {
        if decimals > MAX_DECIMALS {
            return Err(TokenListError::BadDecimals {
                symbol: symbol.to_string(),
                decimals,
            });
        }
        let address = address.parse::<Address>().map_err(|_| TokenListError::BadAddress {
            symbol: symbol.to_string(),
            value: address.to_string(),
        })?;
        self.by_symbol.insert(
            symbol.trim().to_ascii_lowercase(),
            TokenDescriptor {
                symbol: symbol.trim().to_string(),
                address,
                decimals,
            },
        );
        Ok(())
    }

    pub fn lookup(&self, symbol: &str) -> Result<&TokenDescriptor, UnknownToken> {
        self.by_symbol
            .get(&symbol.trim().to_ascii_lowercase())
            .ok_or_else(|| UnknownToken(symbol.to_string()))
    }

    /// The token every allocation sells.
    pub fn stablecoin(&self) -> Result<&TokenDescriptor, TokenListError> {
        self.by_symbol
            .get(&self.stablecoin)
            .ok_or_else(|| TokenListError::MissingStablecoin(self.stablecoin.clone()))
    }

    /// Entries sorted by symbol (CLI listing).
    pub fn entries(&self) -> Vec<&TokenDescriptor> {
        let mut v: Vec<_> = self.by_symbol.values().collect();
        v.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        v
    }
}
