// ===============================
// src/signer.rs
// ===============================
//
// Custodial signer (Privy server wallets). Keys never leave the service; we
// only ask it to sign EIP-712 payloads and to send transactions.
//
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::domain::Address;
use crate::error::ClientError;

/// Wallet the service trades from: signer, sender and settlement receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignerIdentity {
    pub wallet_id: String,
    pub address: Address,
}

/// EIP-712 payload in the shape the signing service expects.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypedData {
    pub domain: Value,
    pub types: Value,
    pub primary_type: String,
    pub message: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionRequest {
    pub to: Address,
    /// Hex quantity, e.g. `0x0`.
    pub value: String,
    pub data: String,
    pub chain_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletInfo {
    pub id: String,
    pub address: String,
    pub chain_type: String,
}

pub fn evm_caip2(chain_id: u64) -> String {
    format!("eip155:{chain_id}")
}

#[async_trait]
pub trait WalletSigner: Send + Sync {
    async fn sign_typed_data(
        &self,
        wallet_id: &str,
        typed_data: &TypedData,
    ) -> Result<String, ClientError>;

    /// Returns the transaction hash.
    async fn send_transaction(
        &self,
        wallet_id: &str,
        caip2: &str,
        tx: &TransactionRequest,
    ) -> Result<String, ClientError>;
}

#[derive(Debug, Clone)]
pub struct PrivySigner {
    http: reqwest::Client,
    api_url: String,
    app_id: String,
    app_secret: String,
    timeout: Duration,
}

#[derive(Deserialize)]
struct RpcEnvelope {
    data: Value,
}

impl PrivySigner {
    pub fn new(
        http: reqwest::Client,
        api_url: String,
        app_id: String,
        app_secret: String,
        timeout: Duration,
    ) -> Self {
        Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            app_id,
            app_secret,
            timeout,
        }
    }

    fn request(&self, url: String) -> reqwest::RequestBuilder {
        self.http
            .post(url)
            .timeout(self.timeout)
            .basic_auth(&self.app_id, Some(&self.app_secret))
            .header("privy-app-id", &self.app_id)
    }

    async fn send_json(
        &self,
        endpoint: &str,
        req: reqwest::RequestBuilder,
        body: &Value,
    ) -> Result<Value, ClientError> {
        let rsp = req.json(body).send().await?;
        let status = rsp.status();
        if !status.is_success() {
            return Err(ClientError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                body: rsp.text().await.unwrap_or_default(),
            });
        }
        Ok(rsp.json::<Value>().await?)
    }

    async fn wallet_rpc(
        &self,
        wallet_id: &str,
        body: Value,
        idempotency_key: Option<String>,
    ) -> Result<Value, ClientError> {
        let url = format!(
            "{}/v1/wallets/{}/rpc",
            self.api_url,
            urlencoding::encode(wallet_id)
        );
        let mut req = self.request(url);
        if let Some(key) = idempotency_key {
            req = req.header("privy-idempotency-key", key);
        }
        let v = self.send_json("wallet rpc", req, &body).await?;
        let env: RpcEnvelope = serde_json::from_value(v)
            .map_err(|e| ClientError::Decode(format!("wallet rpc envelope: {e}")))?;
        Ok(env.data)
    }

    /// Creates a server wallet (`chain_type` = "ethereum" | "solana").
    pub async fn create_wallet(&self, chain_type: &str) -> Result<WalletInfo, ClientError> {
        let url = format!("{}/v1/wallets", self.api_url);
        let v = self
            .send_json(
                "create wallet",
                self.request(url),
                &json!({ "chain_type": chain_type }),
            )
            .await?;
        serde_json::from_value(v).map_err(|e| ClientError::Decode(format!("wallet: {e}")))
    }
}

/// Key for one send attempt: the transaction content plus the attempt nonce.
/// Two sends of identical calldata never share a key.
pub fn idempotency_key(
    wallet_id: &str,
    caip2: &str,
    tx: &TransactionRequest,
    attempt: u64,
) -> String {
    let mut h = Sha256::new();
    h.update(wallet_id.as_bytes());
    h.update(caip2.as_bytes());
    h.update(tx.to.0);
    h.update(tx.value.as_bytes());
    h.update(tx.data.as_bytes());
    h.update(tx.chain_id.to_be_bytes());
    h.update(attempt.to_be_bytes());
    hex::encode(h.finalize())
}

/// Fresh key per `send_transaction` call.
pub fn attempt_key(wallet_id: &str, caip2: &str, tx: &TransactionRequest) -> String {
    idempotency_key(wallet_id, caip2, tx, rand::random::<u64>())
}

fn data_field(data: &Value, field: &str) -> Result<String, ClientError> {
    data.get(field)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| ClientError::Decode(format!("missing `{field}` in signer response")))
}

#[async_trait]
impl WalletSigner for PrivySigner {
    async fn sign_typed_data(
        &self,
        wallet_id: &str,
        typed_data: &TypedData,
    ) -> Result<String, ClientError> {
        debug!(%wallet_id, primary_type = %typed_data.primary_type, "sign typed data");
        let body = json!({
            "method": "eth_signTypedData_v4",
            "params": { "typed_data": typed_data },
        });
        let data = self.wallet_rpc(wallet_id, body, None).await?;
        data_field(&data, "signature")
    }

    async fn send_transaction(
        &self,
        wallet_id: &str,
        caip2: &str,
        tx: &TransactionRequest,
    ) -> Result<String, ClientError> {
        debug!(%wallet_id, %caip2, to = %tx.to, "send transaction");
        let body = json!({
            "method": "eth_sendTransaction",
            "caip2": caip2,
            "params": { "transaction": tx },
        });
        let key = attempt_key(wallet_id, caip2, tx);
        let data = self.wallet_rpc(wallet_id, body, Some(key)).await?;
        data_field(&data, "hash")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(data: &str) -> TransactionRequest {
        TransactionRequest {
            to: "0x833589fcd6edb6e08f4c7c32d4f71b54bda02913".parse().unwrap(),
            value: "0x0".into(),
            data: data.into(),
            chain_id: 8453,
        }
    }

    #[test]
    fn caip2_for_base() {
        assert_eq!(evm_caip2(8453), "eip155:8453");
    }

    #[test]
    fn idempotency_key_tracks_content_and_attempt() {
        let a = idempotency_key("w1", "eip155:8453", &tx("0xabc"), 1);
        assert_eq!(a, idempotency_key("w1", "eip155:8453", &tx("0xabc"), 1));
        assert_ne!(a, idempotency_key("w1", "eip155:8453", &tx("0xabd"), 1));
        assert_ne!(a, idempotency_key("w2", "eip155:8453", &tx("0xabc"), 1));
        assert_ne!(a, idempotency_key("w1", "eip155:8453", &tx("0xabc"), 2));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn repeated_exact_approval_gets_a_new_key_each_batch() {
        let spender: Address = "0xc92e8bdf79f0507f65a392b0ab4667716bfe0110".parse().unwrap();
        let approve = tx(&crate::chain::encode_approve(spender, Some(10_000_000)));
        let first_batch = attempt_key("w1", "eip155:8453", &approve);
        let second_batch = attempt_key("w1", "eip155:8453", &approve);
        assert_ne!(first_batch, second_batch);
    }

    #[test]
    fn transaction_serializes_for_the_signer() {
        let v = serde_json::to_value(tx("0x")).unwrap();
        assert_eq!(v["chain_id"], 8453);
        assert_eq!(v["to"], "0x833589fcd6edb6e08f4c7c32d4f71b54bda02913");
    }
}
