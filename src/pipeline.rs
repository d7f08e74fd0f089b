// ===============================
// src/pipeline.rs
// ===============================
//
// Per-asset state machine:
//
//   QuoteRequested -> QuoteReceived -> OrderSigned -> OrderSubmitted -> Completed
//          \______________\_______________\________________\--------> Failed
//
// Each transition is attempted exactly once; no retries.
//
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::domain::{
    Address, Amount, OrderParameters, PipelineStage, SignedOrder, SwapQuote, SwapResult,
    TokenDescriptor,
};
use crate::error::PipelineError;
use crate::guard::BatchGuard;
use crate::metrics::{PIPELINE_TRANSITIONS, QUOTE_TO_SUBMIT_MS};
use crate::orderbook::{order_typed_data, OrderBookClient, QuoteRequest};
use crate::signer::{SignerIdentity, WalletSigner};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub chain_id: u64,
    pub settlement: Address,
    pub slippage_bps: u32,
}

/// One allocation item, already split and resolved.
#[derive(Debug, Clone)]
pub struct SwapJob {
    pub asset: TokenDescriptor,
    pub fraction: f64,
    pub rationale: String,
    pub sell_amount: Amount,
}

#[derive(Debug)]
pub struct StageFailure {
    /// Last stage reached before the failing transition.
    pub stage: PipelineStage,
    pub error: PipelineError,
}

enum PipelineState {
    QuoteRequested,
    QuoteReceived(SwapQuote),
    OrderSigned { quote: SwapQuote, order: SignedOrder },
    OrderSubmitted { quote: SwapQuote, uid: String },
    Completed(SwapResult),
    Failed(StageFailure),
}

impl PipelineState {
    fn stage(&self) -> PipelineStage {
        match self {
            PipelineState::QuoteRequested => PipelineStage::QuoteRequested,
            PipelineState::QuoteReceived(_) => PipelineStage::QuoteReceived,
            PipelineState::OrderSigned { .. } => PipelineStage::OrderSigned,
            PipelineState::OrderSubmitted { .. } => PipelineStage::OrderSubmitted,
            PipelineState::Completed(_) => PipelineStage::Completed,
            PipelineState::Failed(_) => PipelineStage::Failed,
        }
    }
}

pub struct SwapPipeline {
    order_book: Arc<dyn OrderBookClient>,
    signer: Arc<dyn WalletSigner>,
    identity: SignerIdentity,
    cfg: PipelineConfig,
}

impl SwapPipeline {
    pub fn new(
        order_book: Arc<dyn OrderBookClient>,
        signer: Arc<dyn WalletSigner>,
        identity: SignerIdentity,
        cfg: PipelineConfig,
    ) -> Self {
        Self {
            order_book,
            signer,
            identity,
            cfg,
        }
    }

    pub fn identity(&self) -> &SignerIdentity {
        &self.identity
    }

    /// Drives one job to `Completed` or `Failed`.
    pub async fn run(
        &self,
        sell_token: &TokenDescriptor,
        job: &SwapJob,
        guard: &BatchGuard,
    ) -> Result<SwapResult, StageFailure> {
        let started = Instant::now();
        let mut state = PipelineState::QuoteRequested;
        loop {
            let from = state.stage();
            state = self.step(state, sell_token, job, guard).await;
            let to = state.stage();
            let outcome = if to == PipelineStage::Failed { "err" } else { "ok" };
            PIPELINE_TRANSITIONS
                .with_label_values(&[from.as_str(), outcome])
                .inc();

            match state {
                PipelineState::Completed(result) => {
                    QUOTE_TO_SUBMIT_MS.observe(started.elapsed().as_secs_f64() * 1_000.0);
                    return Ok(result);
                }
                PipelineState::Failed(failure) => {
                    warn!(asset = %job.asset.symbol, stage = %failure.stage, error = %failure.error, "pipeline failed");
                    return Err(failure);
                }
                _ => {}
            }
        }
    }

    async fn step(
        &self,
        state: PipelineState,
        sell_token: &TokenDescriptor,
        job: &SwapJob,
        guard: &BatchGuard,
    ) -> PipelineState {
        let asset = job.asset.symbol.clone();
        let stage = state.stage();
        let fail = |error: PipelineError| PipelineState::Failed(StageFailure { stage, error });
        let interrupted = |interrupt| PipelineError::Interrupted {
            asset: asset.clone(),
            interrupt,
        };

        match state {
            PipelineState::QuoteRequested => {
                let req = QuoteRequest {
                    sell_token: sell_token.address,
                    buy_token: job.asset.address,
                    sell_amount: job.sell_amount,
                    from: self.identity.address,
                    receiver: self.identity.address,
                };
                match guard.run(self.order_book.get_quote(&req)).await {
                    Ok(Ok(quote)) => {
                        info!(%asset, sell = %job.sell_amount, buy_est = %quote.buy_amount_estimate, "quote received");
                        PipelineState::QuoteReceived(quote)
                    }
                    Ok(Err(source)) => fail(PipelineError::Quote { asset: asset.clone(), source }),
                    Err(i) => fail(interrupted(i)),
                }
            }
            PipelineState::QuoteReceived(quote) => {
                let order =
                    OrderParameters::from_quote(&quote, self.identity.address, self.cfg.slippage_bps);
                let typed = order_typed_data(self.cfg.chain_id, self.cfg.settlement, &order);
                let signing = self
                    .signer
                    .sign_typed_data(&self.identity.wallet_id, &typed);
                match guard.run(signing).await {
                    Ok(Ok(signature)) => {
                        info!(%asset, "order signed");
                        let signed = SignedOrder {
                            order,
                            signature,
                            owner: self.identity.address,
                            quote_id: quote.quote_id,
                            app_data_document: quote.app_data.clone(),
                        };
                        PipelineState::OrderSigned { quote, order: signed }
                    }
                    Ok(Err(source)) => fail(PipelineError::Signing { asset: asset.clone(), source }),
                    Err(i) => fail(interrupted(i)),
                }
            }
            PipelineState::OrderSigned { quote, order } => {
                match guard.run(self.order_book.submit(&order)).await {
                    Ok(Ok(uid)) => {
                        info!(%asset, order_uid = %uid, "order submitted");
                        PipelineState::OrderSubmitted { quote, uid }
                    }
                    Ok(Err(source)) => {
                        fail(PipelineError::Submission { asset: asset.clone(), source })
                    }
                    Err(i) => fail(interrupted(i)),
                }
            }
            PipelineState::OrderSubmitted { quote, uid } => PipelineState::Completed(SwapResult {
                asset_symbol: asset.clone(),
                allocation_fraction: job.fraction,
                sell_amount: job.sell_amount,
                buy_amount_estimate: quote.buy_amount_estimate,
                order_id: uid,
                rationale: job.rationale.clone(),
            }),
            terminal @ (PipelineState::Completed(_) | PipelineState::Failed(_)) => terminal,
        }
    }
}
