// ===============================
// src/domain.rs
// ===============================
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Token amount in base units. ERC-20 values above `u128::MAX` saturate on decode.
pub type Amount = u128;

// ---- Address ----
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(pub [u8; 20]);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid address {0:?}: expected 0x followed by 40 hex characters")]
pub struct AddressParseError(pub String);

impl Address {
    pub const ZERO: Address = Address([0u8; 20]);

    /// ABI word: address left-padded to 32 bytes, hex without prefix.
    pub fn to_abi_word(&self) -> String {
        format!("{:0>64}", hex::encode(self.0))
    }
}

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let body = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .ok_or_else(|| AddressParseError(s.to_string()))?;
        if body.len() != 40 {
            return Err(AddressParseError(s.to_string()));
        }
        let mut out = [0u8; 20];
        hex::decode_to_slice(body, &mut out).map_err(|_| AddressParseError(s.to_string()))?;
        Ok(Address(out))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Amounts travel as decimal strings on the wire (JSON numbers lose precision past 2^53).
pub mod amount_str {
    use super::Amount;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Amount, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(v)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Amount, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ---- Tokens ----
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenDescriptor {
    pub symbol: String,
    pub address: Address,
    pub decimals: u8,
}

// ---- Allocation request ----
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationItem {
    pub asset_symbol: String,
    pub fraction: f64,
    #[serde(default)]
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationRequest {
    /// Unsigned integer string in base units of the sell token.
    #[serde(default)]
    pub total_amount: String,
    #[serde(default)]
    pub items: Vec<AllocationItem>,
}

// ---- Order book ----
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapQuote {
    pub quote_id: Option<i64>,
    pub from_token: Address,
    pub to_token: Address,
    /// Sell amount net of the protocol fee, as quoted.
    pub sell_amount: Amount,
    pub fee_amount: Amount,
    pub buy_amount_estimate: Amount,
    pub valid_to: u32,
    /// Full app-data JSON document sent with the quote.
    pub app_data: String,
    /// bytes32 hash of `app_data`, as returned by the order book.
    pub app_data_hash: String,
}

/// Order fields covered by the EIP-712 signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderParameters {
    pub sell_token: Address,
    pub buy_token: Address,
    pub receiver: Address,
    #[serde(with = "amount_str")]
    pub sell_amount: Amount,
    #[serde(with = "amount_str")]
    pub buy_amount: Amount,
    pub valid_to: u32,
    pub app_data: String,
    #[serde(with = "amount_str")]
    pub fee_amount: Amount,
    pub kind: String,
    pub partially_fillable: bool,
    pub sell_token_balance: String,
    pub buy_token_balance: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedOrder {
    pub order: OrderParameters,
    pub signature: String,
    pub owner: Address,
    pub quote_id: Option<i64>,
    pub app_data_document: String,
}

// ---- Results ----
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapResult {
    pub asset_symbol: String,
    pub allocation_fraction: f64,
    #[serde(with = "amount_str")]
    pub sell_amount: Amount,
    #[serde(with = "amount_str")]
    pub buy_amount_estimate: Amount,
    pub order_id: String,
    pub rationale: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStage {
    QuoteRequested,
    QuoteReceived,
    OrderSigned,
    OrderSubmitted,
    Completed,
    Failed,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::QuoteRequested => "quote_requested",
            PipelineStage::QuoteReceived => "quote_received",
            PipelineStage::OrderSigned => "order_signed",
            PipelineStage::OrderSubmitted => "order_submitted",
            PipelineStage::Completed => "completed",
            PipelineStage::Failed => "failed",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-item result of a batch, in allocation order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemOutcome {
    Completed(SwapResult),
    Failed {
        #[serde(rename = "assetSymbol")]
        asset_symbol: String,
        /// Last stage reached before the failure.
        stage: PipelineStage,
        error: String,
    },
    Skipped {
        #[serde(rename = "assetSymbol")]
        asset_symbol: String,
    },
}

// ---- Audit trail ----
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    BatchStarted {
        ts_ms: i64,
        batch_id: String,
        signer: Address,
        #[serde(with = "amount_str")]
        total_amount: Amount,
        items: usize,
    },
    Approval {
        ts_ms: i64,
        batch_id: String,
        token: Address,
        tx_hash: String,
        confirmed: bool,
    },
    ItemCompleted {
        ts_ms: i64,
        batch_id: String,
        result: SwapResult,
    },
    ItemFailed {
        ts_ms: i64,
        batch_id: String,
        asset_symbol: String,
        stage: PipelineStage,
        error: String,
    },
    BatchFinished {
        ts_ms: i64,
        batch_id: String,
        completed: usize,
        failed: usize,
        skipped: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_parses_and_prints_lowercase() {
        let a: Address = "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913".parse().unwrap();
        assert_eq!(a.to_string(), "0x833589fcd6edb6e08f4c7c32d4f71b54bda02913");
        assert_eq!(a.to_abi_word().len(), 64);
        assert!(a.to_abi_word().starts_with("000000000000000000000000833589"));
    }

    #[test]
    fn address_rejects_bad_input() {
        assert!("833589fcd6edb6e08f4c7c32d4f71b54bda02913".parse::<Address>().is_err());
        assert!("0x1234".parse::<Address>().is_err());
        assert!("0xzz3589fcd6edb6e08f4c7c32d4f71b54bda02913".parse::<Address>().is_err());
    }

    #[test]
    fn request_uses_camel_case_and_defaults() {
        let req: AllocationRequest = serde_json::from_str(
            r#"{"totalAmount":"10000000","items":[{"assetSymbol":"WETH","fraction":1.0}]}"#,
        )
        .unwrap();
        assert_eq!(req.total_amount, "10000000");
        assert_eq!(req.items[0].rationale, "");

        let empty: AllocationRequest = serde_json::from_str("{}").unwrap();
        assert!(empty.total_amount.is_empty());
        assert!(empty.items.is_empty());
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let o = ItemOutcome::Failed {
            asset_symbol: "AERO".into(),
            stage: PipelineStage::QuoteReceived,
            error: "signer rejected".into(),
        };
        let v = serde_json::to_value(&o).unwrap();
        assert_eq!(v["status"], "failed");
        assert_eq!(v["assetSymbol"], "AERO");
        assert_eq!(v["stage"], "QUOTE_RECEIVED");
    }
}
