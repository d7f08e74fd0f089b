// ===============================
// src/orderbook.rs
// ===============================
//
// CoW Protocol order book (batch auctions):
// - POST /api/v1/quote   : sell-side quote (sellAmountBeforeFee)
// - POST /api/v1/orders  : signed order -> order UID
// Orders are signed as EIP-712 `Order` under the "Gnosis Protocol" v2 domain.
//
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::domain::{amount_str, Address, Amount, OrderParameters, SignedOrder, SwapQuote};
use crate::error::ClientError;
use crate::signer::TypedData;
use crate::splitter::{apply_bps, BPS_DENOMINATOR};

pub const ORDER_KIND_SELL: &str = "sell";
pub const TOKEN_BALANCE_ERC20: &str = "erc20";
pub const SIGNING_SCHEME_EIP712: &str = "eip712";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteRequest {
    pub sell_token: Address,
    pub buy_token: Address,
    pub sell_amount: Amount,
    pub from: Address,
    pub receiver: Address,
}

#[async_trait]
pub trait OrderBookClient: Send + Sync {
    async fn get_quote(&self, request: &QuoteRequest) -> Result<SwapQuote, ClientError>;

    /// Returns the order UID.
    async fn submit(&self, order: &SignedOrder) -> Result<String, ClientError>;
}

/// App-data document attached to every order.
pub fn app_data_document(app_code: &str) -> String {
    json!({ "appCode": app_code, "metadata": {}, "version": "1.1.0" }).to_string()
}

impl OrderParameters {
    /// Fee-less sell order from a quote: the quoted fee is folded back into
    /// the sell amount, and the buy amount is cut by `slippage_bps`.
    pub fn from_quote(quote: &SwapQuote, receiver: Address, slippage_bps: u32) -> Self {
        let keep_bps = BPS_DENOMINATOR.saturating_sub(slippage_bps as u128);
        Self {
            sell_token: quote.from_token,
            buy_token: quote.to_token,
            receiver,
            sell_amount: quote.sell_amount.saturating_add(quote.fee_amount),
            buy_amount: apply_bps(quote.buy_amount_estimate, keep_bps),
            valid_to: quote.valid_to,
            app_data: quote.app_data_hash.clone(),
            fee_amount: 0,
            kind: ORDER_KIND_SELL.to_string(),
            partially_fillable: false,
            sell_token_balance: TOKEN_BALANCE_ERC20.to_string(),
            buy_token_balance: TOKEN_BALANCE_ERC20.to_string(),
        }
    }
}

pub fn order_typed_data(chain_id: u64, settlement: Address, order: &OrderParameters) -> TypedData {
    TypedData {
        domain: json!({
            "name": "Gnosis Protocol",
            "version": "v2",
            "chainId": chain_id,
            "verifyingContract": settlement,
        }),
        types: json!({
            "EIP712Domain": [
                { "name": "name", "type": "string" },
                { "name": "version", "type": "string" },
                { "name": "chainId", "type": "uint256" },
                { "name": "verifyingContract", "type": "address" },
            ],
            "Order": [
                { "name": "sellToken", "type": "address" },
                { "name": "buyToken", "type": "address" },
                { "name": "receiver", "type": "address" },
                { "name": "sellAmount", "type": "uint256" },
                { "name": "buyAmount", "type": "uint256" },
                { "name": "validTo", "type": "uint32" },
                { "name": "appData", "type": "bytes32" },
                { "name": "feeAmount", "type": "uint256" },
                { "name": "kind", "type": "string" },
                { "name": "partiallyFillable", "type": "bool" },
                { "name": "sellTokenBalance", "type": "string" },
                { "name": "buyTokenBalance", "type": "string" },
            ],
        }),
        primary_type: "Order".to_string(),
        message: json!({
            "sellToken": order.sell_token,
            "buyToken": order.buy_token,
            "receiver": order.receiver,
            "sellAmount": order.sell_amount.to_string(),
            "buyAmount": order.buy_amount.to_string(),
            "validTo": order.valid_to,
            "appData": order.app_data,
            "feeAmount": order.fee_amount.to_string(),
            "kind": order.kind,
            "partiallyFillable": order.partially_fillable,
            "sellTokenBalance": order.sell_token_balance,
            "buyTokenBalance": order.buy_token_balance,
        }),
    }
}

// ---- Wire models ----
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CowQuoteBody<'a> {
    sell_token: Address,
    buy_token: Address,
    from: Address,
    receiver: Address,
    #[serde(with = "amount_str")]
    sell_amount_before_fee: Amount,
    kind: &'static str,
    app_data: &'a str,
    signing_scheme: &'static str,
    partially_fillable: bool,
    sell_token_balance: &'static str,
    buy_token_balance: &'static str,
    price_quality: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CowQuoteResponse {
    quote: CowQuote,
    #[serde(default)]
    id: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CowQuote {
    sell_amount: String,
    buy_amount: String,
    #[serde(default)]
    fee_amount: Option<String>,
    valid_to: u32,
    app_data: String,
    #[serde(default)]
    app_data_hash: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CowOrderBody<'a> {
    #[serde(flatten)]
    order: &'a OrderParameters,
    app_data_hash: &'a str,
    signing_scheme: &'static str,
    signature: &'a str,
    from: Address,
    #[serde(skip_serializing_if = "Option::is_none")]
    quote_id: Option<i64>,
}

fn parse_amount(field: &str, raw: &str) -> Result<Amount, ClientError> {
    raw.parse()
        .map_err(|_| ClientError::Decode(format!("{field} is not a base-unit integer: {raw:?}")))
}

fn is_bytes32(s: &str) -> bool {
    s.strip_prefix("0x")
        .map(|h| h.len() == 64 && h.bytes().all(|b| b.is_ascii_hexdigit()))
        .unwrap_or(false)
}

#[derive(Debug, Clone)]
pub struct CowOrderBook {
    http: reqwest::Client,
    api_url: String,
    app_data: String,
    timeout: Duration,
}

impl CowOrderBook {
    pub fn new(http: reqwest::Client, api_url: String, app_code: &str, timeout: Duration) -> Self {
        Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            app_data: app_data_document(app_code),
            timeout,
        }
    }

    async fn post(&self, path: &str, body: &impl Serialize) -> Result<Value, ClientError> {
        let url = format!("{}{}", self.api_url, path);
        let rsp = self
            .http
            .post(&url)
            .timeout(self.timeout)
            .json(body)
            .send()
            .await?;
        let status = rsp.status();
        if !status.is_success() {
            // {"errorType": "...", "description": "..."}
            return Err(ClientError::Status {
                endpoint: path.to_string(),
                status: status.as_u16(),
                body: rsp.text().await.unwrap_or_default(),
            });
        }
        Ok(rsp.json::<Value>().await?)
    }

    fn to_swap_quote(&self, req: &QuoteRequest, rsp: CowQuoteResponse) -> Result<SwapQuote, ClientError> {
        let q = rsp.quote;
        let app_data_hash = match q.app_data_hash {
            Some(h) => h,
            None if is_bytes32(&q.app_data) => q.app_data.clone(),
            None => return Err(ClientError::Decode("quote carries no appData hash".into())),
        };
        let buy = parse_amount("buyAmount", &q.buy_amount)?;
        if buy == 0 {
            return Err(ClientError::Rejected("quote returned zero buy amount".into()));
        }
        Ok(SwapQuote {
            quote_id: rsp.id,
            from_token: req.sell_token,
            to_token: req.buy_token,
            sell_amount: parse_amount("sellAmount", &q.sell_amount)?,
            fee_amount: match q.fee_amount.as_deref() {
                Some(f) => parse_amount("feeAmount", f)?,
                None => 0,
            },
            buy_amount_estimate: buy,
            valid_to: q.valid_to,
            app_data: self.app_data.clone(),
            app_data_hash,
        })
    }
}

#[async_trait]
impl OrderBookClient for CowOrderBook {
    async fn get_quote(&self, request: &QuoteRequest) -> Result<SwapQuote, ClientError> {
        let body = CowQuoteBody {
            sell_token: request.sell_token,
            buy_token: request.buy_token,
            from: request.from,
            receiver: request.receiver,
            sell_amount_before_fee: request.sell_amount,
            kind: ORDER_KIND_SELL,
            app_data: &self.app_data,
            signing_scheme: SIGNING_SCHEME_EIP712,
            partially_fillable: false,
            sell_token_balance: TOKEN_BALANCE_ERC20,
            buy_token_balance: TOKEN_BALANCE_ERC20,
            price_quality: "verified",
        };
        debug!(sell = %request.sell_token, buy = %request.buy_token, amount = %request.sell_amount, "cow quote");
        let v = self.post("/api/v1/quote", &body).await?;
        let rsp: CowQuoteResponse =
            serde_json::from_value(v).map_err(|e| ClientError::Decode(format!("quote: {e}")))?;
        self.to_swap_quote(request, rsp)
    }

    async fn submit(&self, signed: &SignedOrder) -> Result<String, ClientError> {
        let order = OrderParameters {
            app_data: signed.app_data_document.clone(),
            ..signed.order.clone()
        };
        let body = CowOrderBody {
            order: &order,
            app_data_hash: &signed.order.app_data,
            signing_scheme: SIGNING_SCHEME_EIP712,
            signature: &signed.signature,
            from: signed.owner,
            quote_id: signed.quote_id,
        };
        let v = self.post("/api/v1/orders", &body).await?;
        v.as_str()
            .map(str::to_string)
            .ok_or_else(|| ClientError::Decode(format!("order uid is not a string: {v}")))
    }
}
