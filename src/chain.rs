// ===============================
// src/chain.rs
// ===============================
//
// Read-only chain access over JSON-RPC (eth_call / eth_getTransactionReceipt)
// plus the ERC-20 calldata the allowance gate needs.
//
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::trace;

use crate::domain::{Address, Amount};
use crate::error::ClientError;

const BALANCE_OF_SELECTOR: &str = "70a08231";
const ALLOWANCE_SELECTOR: &str = "dd62ed3e";
const APPROVE_SELECTOR: &str = "095ea7b3";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptStatus {
    Success,
    Reverted,
}

#[async_trait]
pub trait ChainReader: Send + Sync {
    async fn balance_of(&self, token: Address, owner: Address) -> Result<Amount, ClientError>;

    async fn allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> Result<Amount, ClientError>;

    /// `None` while the transaction is not mined yet.
    async fn transaction_receipt(&self, tx_hash: &str)
        -> Result<Option<ReceiptStatus>, ClientError>;
}

// ---- ERC-20 calldata ----
pub fn encode_balance_of(owner: Address) -> String {
    format!("0x{BALANCE_OF_SELECTOR}{}", owner.to_abi_word())
}

pub fn encode_allowance(owner: Address, spender: Address) -> String {
    format!(
        "0x{ALLOWANCE_SELECTOR}{}{}",
        owner.to_abi_word(),
        spender.to_abi_word()
    )
}

/// `approve(spender, amount)`; `None` approves `2^256 - 1`.
pub fn encode_approve(spender: Address, amount: Option<Amount>) -> String {
    let word = match amount {
        Some(a) => format!("{a:064x}"),
        None => "f".repeat(64),
    };
    format!("0x{APPROVE_SELECTOR}{}{word}", spender.to_abi_word())
}

/// Inverse of `encode_approve` (used by the paper signer).
pub fn decode_approve(data: &str) -> Option<(Address, Amount)> {
    let body = data.strip_prefix("0x")?.strip_prefix(APPROVE_SELECTOR)?;
    if body.len() != 128 || !body.is_ascii() {
        return None;
    }
    let spender = format!("0x{}", &body[24..64]).parse().ok()?;
    let amount = decode_uint(&body[64..]).ok()?;
    Some((spender, amount))
}

/// ABI uint256 word -> Amount, saturating at `u128::MAX`.
pub fn decode_uint(raw: &str) -> Result<Amount, ClientError> {
    let s = raw.strip_prefix("0x").unwrap_or(raw);
    if s.is_empty() {
        return Err(ClientError::Decode("empty return data".into()));
    }
    let digits = s.trim_start_matches('0');
    if digits.is_empty() {
        return Ok(0);
    }
    if digits.len() > 32 {
        if digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Ok(Amount::MAX);
        }
        return Err(ClientError::Decode(format!("not a hex word: {raw}")));
    }
    Amount::from_str_radix(digits, 16)
        .map_err(|_| ClientError::Decode(format!("not a hex word: {raw}")))
}

// ---- JSON-RPC client ----
#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug)]
pub struct RpcChainReader {
    http: reqwest::Client,
    rpc_url: String,
    timeout: Duration,
    next_id: AtomicU64,
}

impl RpcChainReader {
    pub fn new(http: reqwest::Client, rpc_url: String, timeout: Duration) -> Self {
        Self {
            http,
            rpc_url,
            timeout,
            next_id: AtomicU64::new(1),
        }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        trace!(%method, id, "rpc call");

        let rsp = self
            .http
            .post(&self.rpc_url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await?;
        let status = rsp.status();
        if !status.is_success() {
            return Err(ClientError::Status {
                endpoint: method.to_string(),
                status: status.as_u16(),
                body: rsp.text().await.unwrap_or_default(),
            });
        }
        let parsed: RpcResponse = rsp.json().await?;
        if let Some(e) = parsed.error {
            return Err(ClientError::Rpc {
                code: e.code,
                message: e.message,
            });
        }
        Ok(parsed.result.unwrap_or(Value::Null))
    }

    async fn eth_call(&self, to: Address, data: String) -> Result<Amount, ClientError> {
        let v = self
            .call("eth_call", json!([{ "to": to, "data": data }, "latest"]))
            .await?;
        let word = v
            .as_str()
            .ok_or_else(|| ClientError::Decode(format!("eth_call result is not a string: {v}")))?;
        decode_uint(word)
    }
}

#[async_trait]
impl ChainReader for RpcChainReader {
    async fn balance_of(&self, token: Address, owner: Address) -> Result<Amount, ClientError> {
        self.eth_call(token, encode_balance_of(owner)).await
    }

    async fn allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> Result<Amount, ClientError> {
        self.eth_call(token, encode_allowance(owner, spender)).await
    }

    async fn transaction_receipt(
        &self,
        tx_hash: &str,
    ) -> Result<Option<ReceiptStatus>, ClientError> {
        let v = self
            .call("eth_getTransactionReceipt", json!([tx_hash]))
            .await?;
        if v.is_null() {
            return Ok(None);
        }
        match v.get("status").and_then(|s| s.as_str()) {
            Some("0x1") => Ok(Some(ReceiptStatus::Success)),
            Some("0x0") => Ok(Some(ReceiptStatus::Reverted)),
            other => Err(ClientError::Decode(format!("receipt status {other:?}"))),
        }
    }
}
