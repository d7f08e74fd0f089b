// ===============================
// src/mock.rs (paper collaborators)
// ===============================
//
// In-process stand-ins for the chain, the order book and the custodial
// signer. Used by EXECUTION_MODE=mock and by the unit tests:
// - PaperChain      : balances / allowances / receipts in memory
// - PaperOrderBook  : fixed-rate quotes, fake order UIDs
// - PaperSigner     : hash "signatures", approvals applied to PaperChain
// Every collaborator counts its calls and can fail on the N-th call.
//
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::time::sleep;

use crate::allowance::AllowanceGate;
use crate::chain::{decode_approve, ChainReader, ReceiptStatus};
use crate::config::Settings;
use crate::domain::{Address, Amount, SignedOrder, SwapQuote};
use crate::error::ClientError;
use crate::orchestrator::{Orchestrator, SignerLocks};
use crate::orderbook::{OrderBookClient, QuoteRequest};
use crate::pipeline::SwapPipeline;
use crate::signer::{TransactionRequest, TypedData, WalletSigner};
use crate::splitter::apply_bps;
use crate::tokens::{Asset, TokenDirectory, TokenListError};

fn sha256_hex(parts: &[&[u8]]) -> String {
    let mut h = Sha256::new();
    for p in parts {
        h.update(p);
    }
    hex::encode(h.finalize())
}

/// 1-based call counter with an optional failing call.
#[derive(Debug, Default)]
struct CallGate {
    calls: AtomicUsize,
    fail_at: Option<usize>,
}

impl CallGate {
    fn hit(&self, what: &str) -> Result<usize, ClientError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_at == Some(n) {
            return Err(ClientError::Rejected(format!("paper {what} #{n} rejected")));
        }
        Ok(n)
    }

    fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

// ---- Chain ----
#[derive(Debug, Default)]
struct ChainState {
    balances: HashMap<(Address, Address), Amount>,
    allowances: HashMap<(Address, Address, Address), Amount>,
    // hash -> (polls left before mined, final status)
    receipts: HashMap<String, (usize, ReceiptStatus)>,
    tx_count: u64,
}

#[derive(Debug, Default)]
pub struct PaperChain {
    state: Mutex<ChainState>,
    reads: AtomicUsize,
    receipt_polls: AtomicUsize,
    mined_after_polls: usize,
    revert_approvals: bool,
}

impl PaperChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_balance(self, token: Address, owner: Address, amount: Amount) -> Self {
        self.lock().balances.insert((token, owner), amount);
        self
    }

    pub fn with_allowance(self, token: Address, owner: Address, spender: Address, amount: Amount) -> Self {
        self.lock().allowances.insert((token, owner, spender), amount);
        self
    }

    /// Receipts stay pending for `polls` lookups.
    pub fn mined_after(mut self, polls: usize) -> Self {
        self.mined_after_polls = polls;
        self
    }

    pub fn reverting_approvals(mut self) -> Self {
        self.revert_approvals = true;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChainState> {
        // state is plain data; a poisoned lock still holds a usable snapshot
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn allowance_of(&self, token: Address, owner: Address, spender: Address) -> Amount {
        self.lock()
            .allowances
            .get(&(token, owner, spender))
            .copied()
            .unwrap_or(0)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn receipt_polls(&self) -> usize {
        self.receipt_polls.load(Ordering::SeqCst)
    }

    /// Applies an ERC-20 approve sent by `from`; returns the tx hash.
    pub fn apply_transaction(&self, from: Address, tx: &TransactionRequest) -> String {
        let mut st = self.lock();
        st.tx_count += 1;
        let hash = format!(
            "0x{}",
            sha256_hex(&[&st.tx_count.to_be_bytes(), &from.0, tx.data.as_bytes()])
        );
        let status = if self.revert_approvals {
            ReceiptStatus::Reverted
        } else {
            if let Some((spender, amount)) = decode_approve(&tx.data) {
                st.allowances.insert((tx.to, from, spender), amount);
            }
            ReceiptStatus::Success
        };
        st.receipts
            .insert(hash.clone(), (self.mined_after_polls, status));
        hash
    }
}

#[async_trait]
impl ChainReader for PaperChain {
    async fn balance_of(&self, token: Address, owner: Address) -> Result<Amount, ClientError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.lock().balances.get(&(token, owner)).copied().unwrap_or(0))
    }

    async fn allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> Result<Amount, ClientError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.allowance_of(token, owner, spender))
    }

    async fn transaction_receipt(
        &self,
        tx_hash: &str,
    ) -> Result<Option<ReceiptStatus>, ClientError> {
        self.receipt_polls.fetch_add(1, Ordering::SeqCst);
        let mut st = self.lock();
        match st.receipts.get_mut(tx_hash) {
            None => Ok(None),
            Some((0, status)) => Ok(Some(*status)),
            Some((left, _)) => {
                *left -= 1;
                Ok(None)
            }
        }
    }
}

// ---- Order book ----
#[derive(Debug)]
pub struct PaperOrderBook {
    // buy token -> (numerator, denominator) in base units per sell base unit
    rates: HashMap<Address, (u128, u128)>,
    fee_bps: u128,
    latency: Option<Duration>,
    quotes: CallGate,
    submits: CallGate,
    submitted: Mutex<Vec<SignedOrder>>,
}

impl Default for PaperOrderBook {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperOrderBook {
    pub fn new() -> Self {
        Self {
            rates: HashMap::new(),
            fee_bps: 10,
            latency: None,
            quotes: CallGate::default(),
            submits: CallGate::default(),
            submitted: Mutex::new(Vec::new()),
        }
    }

    /// Rates from rough USD reference prices, selling a 6-decimal stablecoin.
    pub fn with_reference_prices(mut self, dir: &TokenDirectory) -> Self {
        for asset in Asset::ALL {
            let Some(price_micros) = reference_price_micros(asset) else {
                continue;
            };
            if let Ok(t) = dir.lookup(asset.symbol()) {
                self.rates
                    .insert(t.address, (10u128.pow(t.decimals as u32), price_micros));
            }
        }
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn fail_quote_at(mut self, n: usize) -> Self {
        self.quotes.fail_at = Some(n);
        self
    }

    pub fn fail_submit_at(mut self, n: usize) -> Self {
        self.submits.fail_at = Some(n);
        self
    }

    pub fn quote_calls(&self) -> usize {
        self.quotes.count()
    }

    pub fn submit_calls(&self) -> usize {
        self.submits.count()
    }

    pub fn submitted(&self) -> Vec<SignedOrder> {
        self.submitted
            .lock()
            .map(|v| v.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }
}

fn reference_price_micros(asset: Asset) -> Option<u128> {
    match asset {
        Asset::Usdc => None,
        Asset::Weth | Asset::OEthB => Some(2_500_000_000),
        Asset::WstEth => Some(3_000_000_000),
        Asset::CbBtc | Asset::Lbtc => Some(60_000_000_000),
        Asset::USol => Some(150_000_000),
        Asset::Aero => Some(1_000_000),
        Asset::Virtual => Some(2_000_000),
        Asset::Aixbt => Some(200_000),
    }
}

#[async_trait]
impl OrderBookClient for PaperOrderBook {
    async fn get_quote(&self, request: &QuoteRequest) -> Result<SwapQuote, ClientError> {
        if let Some(d) = self.latency {
            sleep(d).await;
        }
        let n = self.quotes.hit("quote")?;
        let fee = apply_bps(request.sell_amount, self.fee_bps);
        let net = request.sell_amount - fee;
        let (num, den) = self.rates.get(&request.buy_token).copied().unwrap_or((1, 1));
        let buy = net.saturating_mul(num) / den;
        if buy == 0 {
            return Err(ClientError::Rejected("sell amount too small to quote".into()));
        }
        let app_data = r#"{"appCode":"paper","metadata":{},"version":"1.1.0"}"#.to_string();
        Ok(SwapQuote {
            quote_id: Some(n as i64),
            from_token: request.sell_token,
            to_token: request.buy_token,
            sell_amount: net,
            fee_amount: fee,
            buy_amount_estimate: buy,
            valid_to: (Utc::now().timestamp() + 1_800) as u32,
            app_data_hash: format!("0x{}", sha256_hex(&[app_data.as_bytes()])),
            app_data,
        })
    }

    async fn submit(&self, order: &SignedOrder) -> Result<String, ClientError> {
        if let Some(d) = self.latency {
            sleep(d).await;
        }
        let n = self.submits.hit("submit")?;
        // uid = digest(32) ++ owner(20) ++ validTo(4)
        let digest = sha256_hex(&[order.signature.as_bytes(), &n.to_be_bytes()]);
        let uid = format!(
            "0x{}{}{:08x}",
            digest,
            hex::encode(order.owner.0),
            order.order.valid_to
        );
        if let Ok(mut v) = self.submitted.lock() {
            v.push(order.clone());
        }
        Ok(uid)
    }
}

// ---- Signer ----
#[derive(Debug, Default)]
pub struct PaperSigner {
    chain: Option<(Arc<PaperChain>, Address)>,
    signs: CallGate,
    sends: CallGate,
    sent: Mutex<Vec<TransactionRequest>>,
}

impl PaperSigner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transactions sent through this signer land on `chain` from `owner`.
    pub fn attached_to(mut self, chain: Arc<PaperChain>, owner: Address) -> Self {
        self.chain = Some((chain, owner));
        self
    }

    pub fn fail_sign_at(mut self, n: usize) -> Self {
        self.signs.fail_at = Some(n);
        self
    }

    pub fn fail_send_at(mut self, n: usize) -> Self {
        self.sends.fail_at = Some(n);
        self
    }

    pub fn sign_calls(&self) -> usize {
        self.signs.count()
    }

    pub fn send_calls(&self) -> usize {
        self.sends.count()
    }

    pub fn sent(&self) -> Vec<TransactionRequest> {
        self.sent
            .lock()
            .map(|v| v.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }
}

#[async_trait]
impl WalletSigner for PaperSigner {
    async fn sign_typed_data(
        &self,
        wallet_id: &str,
        typed_data: &TypedData,
    ) -> Result<String, ClientError> {
        self.signs.hit("sign")?;
        let payload = serde_json::to_vec(typed_data)
            .map_err(|e| ClientError::Decode(format!("typed data: {e}")))?;
        let d = sha256_hex(&[wallet_id.as_bytes(), &payload]);
        // 65 bytes: r ++ s ++ v
        Ok(format!("0x{d}{d}1b"))
    }

    async fn send_transaction(
        &self,
        _wallet_id: &str,
        _caip2: &str,
        tx: &TransactionRequest,
    ) -> Result<String, ClientError> {
        self.sends.hit("send")?;
        if let Ok(mut v) = self.sent.lock() {
            v.push(tx.clone());
        }
        match &self.chain {
            Some((chain, owner)) => Ok(chain.apply_transaction(*owner, tx)),
            None => Ok(format!("0x{}", sha256_hex(&[tx.data.as_bytes()]))),
        }
    }
}

// ---- Wiring (EXECUTION_MODE=mock) ----
pub struct PaperStack {
    pub chain: Arc<PaperChain>,
    pub book: Arc<PaperOrderBook>,
    pub signer: Arc<PaperSigner>,
}

/// Full orchestrator over paper collaborators, with the signer funded in the sell token.
pub fn paper_orchestrator(
    settings: &Settings,
    dir: Arc<TokenDirectory>,
) -> Result<(Orchestrator, PaperStack), TokenListError> {
    let owner = settings.identity.address;
    let usdc = dir.stablecoin()?.address;
    let chain = Arc::new(PaperChain::new().with_balance(usdc, owner, settings.mock_balance));
    let signer = Arc::new(PaperSigner::new().attached_to(chain.clone(), owner));
    let book = Arc::new(
        PaperOrderBook::new()
            .with_reference_prices(&dir)
            .with_latency(settings.mock_latency),
    );

    let gate = AllowanceGate::new(
        chain.clone(),
        signer.clone(),
        settings.identity.clone(),
        settings.chain_id,
    )
    .with_approval_policy(settings.approval)
    .with_confirmation(settings.confirmation);
    let pipeline = SwapPipeline::new(
        book.clone(),
        signer.clone(),
        settings.identity.clone(),
        settings.pipeline_config(),
    );
    let orch = Orchestrator::new(
        dir,
        gate,
        pipeline,
        SignerLocks::default(),
        settings.orchestrator_config(),
    )?;
    Ok((orch, PaperStack { chain, book, signer }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::encode_approve;

    #[tokio::test]
    async fn approvals_land_on_the_paper_chain() {
        let token: Address = "0x833589fcd6edb6e08f4c7c32d4f71b54bda02913".parse().unwrap();
        let owner: Address = "0x1111111111111111111111111111111111111111".parse().unwrap();
        let spender: Address = "0x2222222222222222222222222222222222222222".parse().unwrap();
        let chain = Arc::new(PaperChain::new().mined_after(1));
        let signer = PaperSigner::new().attached_to(chain.clone(), owner);
        let tx = TransactionRequest {
            to: token,
            value: "0x0".into(),
            data: encode_approve(spender, Some(500)),
            chain_id: 8453,
        };
        let hash = signer.send_transaction("w", "eip155:8453", &tx).await.unwrap();
        assert_eq!(chain.allowance(token, owner, spender).await.unwrap(), 500);
        assert_eq!(chain.transaction_receipt(&hash).await.unwrap(), None);
        assert_eq!(
            chain.transaction_receipt(&hash).await.unwrap(),
            Some(ReceiptStatus::Success)
        );
    }

    #[tokio::test]
    async fn reference_prices_scale_by_decimals() {
        let dir = TokenDirectory::base_mainnet().unwrap();
        let book = PaperOrderBook::new().with_reference_prices(&dir);
        let usdc = dir.stablecoin().unwrap().address;
        let cbbtc = dir.lookup("cbBTC").unwrap().address;
        let q = book
            .get_quote(&QuoteRequest {
                sell_token: usdc,
                buy_token: cbbtc,
                sell_amount: 60_000_000_000,
                from: Address::ZERO,
                receiver: Address::ZERO,
            })
            .await
            .unwrap();
        // 60k USDC minus 0.1% fee at 60k/BTC -> 0.999 BTC in sats
        assert_eq!(q.buy_amount_estimate, 99_900_000);
        assert_eq!(q.sell_amount + q.fee_amount, 60_000_000_000);
    }
}
