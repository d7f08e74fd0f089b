// ===============================
// src/orchestrator.rs
// ===============================
//
// One batch:
//   validate -> resolve symbols -> split -> allowance gate (once, full amount)
//   -> pipeline per item, in order -> BatchReport
//
// Batches for the same signer are serialized through `SignerLocks`.
//
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ahash::AHashMap as HashMap;
use chrono::Utc;
use rand::Rng;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::allowance::{AllowanceGate, AllowanceOutcome};
use crate::domain::{
    Address, Amount, AllocationRequest, AuditEvent, ItemOutcome, PipelineStage, SwapResult,
    TokenDescriptor,
};
use crate::error::{ItemFailure, OrchestratorError};
use crate::guard::BatchGuard;
use crate::metrics::{BATCHES, DUST};
use crate::pipeline::{SwapJob, SwapPipeline};
use crate::recorder::AuditSink;
use crate::splitter::{split_all, RemainderPolicy};
use crate::tokens::{TokenDirectory, TokenListError};
use crate::validator::{parse_total_amount, AllocationValidator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// First failed item skips the rest.
    #[default]
    StopOnFailure,
    ContinueOnFailure,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub remainder: RemainderPolicy,
    pub failure: FailurePolicy,
    pub batch_deadline: Option<Duration>,
    /// Allowance spender (the settlement vault relayer).
    pub spender: Address,
}

/// Per-signer async locks. Clones share the registry.
#[derive(Debug, Clone, Default)]
pub struct SignerLocks {
    inner: Arc<Mutex<HashMap<Address, Arc<tokio::sync::Mutex<()>>>>>,
}

impl SignerLocks {
    pub fn lock_for(&self, signer: Address) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(signer).or_default().clone()
    }
}

#[derive(Debug, Clone)]
pub struct BatchReport {
    pub batch_id: String,
    pub total_amount: Amount,
    pub split_amounts: Vec<Amount>,
    pub unspent: Amount,
    pub allowance: AllowanceOutcome,
    /// One per item, in request order.
    pub outcomes: Vec<ItemOutcome>,
}

impl BatchReport {
    pub fn is_complete(&self) -> bool {
        self.outcomes
            .iter()
            .all(|o| matches!(o, ItemOutcome::Completed(_)))
    }

    /// (completed, failed, skipped)
    pub fn counts(&self) -> (usize, usize, usize) {
        self.outcomes.iter().fold((0, 0, 0), |(c, f, s), o| match o {
            ItemOutcome::Completed(_) => (c + 1, f, s),
            ItemOutcome::Failed { .. } => (c, f + 1, s),
            ItemOutcome::Skipped { .. } => (c, f, s + 1),
        })
    }

    pub fn completed(&self) -> Vec<&SwapResult> {
        self.outcomes
            .iter()
            .filter_map(|o| match o {
                ItemOutcome::Completed(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    pub fn first_failure(&self) -> Option<ItemFailure> {
        self.outcomes.iter().find_map(|o| match o {
            ItemOutcome::Failed {
                asset_symbol,
                stage,
                error,
            } => Some(ItemFailure {
                asset_symbol: asset_symbol.clone(),
                stage: *stage,
                error: error.clone(),
            }),
            _ => None,
        })
    }

    /// All-or-nothing view: every result, or the first failure.
    pub fn into_results(self) -> Result<Vec<SwapResult>, ItemFailure> {
        if let Some(f) = self.first_failure() {
            return Err(f);
        }
        Ok(self
            .outcomes
            .into_iter()
            .filter_map(|o| match o {
                ItemOutcome::Completed(r) => Some(r),
                _ => None,
            })
            .collect())
    }

    pub fn summary(&self) -> Value {
        let allowance = match &self.allowance {
            AllowanceOutcome::Sufficient { balance, allowance } => json!({
                "status": "sufficient",
                "balance": balance.to_string(),
                "allowance": allowance.to_string(),
            }),
            AllowanceOutcome::Approved { tx_hash, confirmed } => json!({
                "status": "approved",
                "txHash": tx_hash,
                "confirmed": confirmed,
            }),
        };
        json!({
            "batchId": self.batch_id,
            "totalAmount": self.total_amount.to_string(),
            "splitAmounts": self.split_amounts.iter().map(|a| a.to_string()).collect::<Vec<_>>(),
            "unspent": self.unspent.to_string(),
            "allowance": allowance,
            "outcomes": self.outcomes,
        })
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub struct Orchestrator {
    directory: Arc<TokenDirectory>,
    sell_token: TokenDescriptor,
    validator: AllocationValidator,
    gate: AllowanceGate,
    pipeline: SwapPipeline,
    locks: SignerLocks,
    cfg: OrchestratorConfig,
    audit: Option<AuditSink>,
}

impl Orchestrator {
    pub fn new(
        directory: Arc<TokenDirectory>,
        gate: AllowanceGate,
        pipeline: SwapPipeline,
        locks: SignerLocks,
        cfg: OrchestratorConfig,
    ) -> Result<Self, TokenListError> {
        let sell_token = directory.stablecoin()?.clone();
        Ok(Self {
            validator: AllocationValidator::new(sell_token.symbol.clone()),
            directory,
            sell_token,
            gate,
            pipeline,
            locks,
            cfg,
            audit: None,
        })
    }

    pub fn with_audit(mut self, sink: AuditSink) -> Self {
        self.audit = Some(sink);
        self
    }

    pub fn directory(&self) -> &TokenDirectory {
        &self.directory
    }

    fn record(&self, ev: AuditEvent) {
        if let Some(sink) = &self.audit {
            sink.record(ev);
        }
    }

    pub async fn execute(&self, req: &AllocationRequest) -> Result<BatchReport, OrchestratorError> {
        self.execute_with_cancel(req, CancellationToken::new()).await
    }

    pub async fn execute_with_cancel(
        &self,
        req: &AllocationRequest,
        cancel: CancellationToken,
    ) -> Result<BatchReport, OrchestratorError> {
        let result = self.run_batch(req, cancel).await;
        let label = match &result {
            Ok(r) if r.is_complete() => "completed",
            Ok(r) if r.counts().0 > 0 => "partial",
            Ok(_) => "failed",
            Err(e) if e.is_client_error() => "rejected",
            Err(_) => "failed",
        };
        BATCHES.with_label_values(&[label]).inc();
        result
    }

    async fn run_batch(
        &self,
        req: &AllocationRequest,
        cancel: CancellationToken,
    ) -> Result<BatchReport, OrchestratorError> {
        // ---- 1) Validate + resolve: no network yet ----
        self.validator.validate(req)?;
        let total = parse_total_amount(&req.total_amount)?;
        let assets = req
            .items
            .iter()
            .map(|item| self.directory.lookup(&item.asset_symbol).cloned())
            .collect::<Result<Vec<_>, _>>()?;

        // ---- 2) Split ----
        let fractions: Vec<f64> = req.items.iter().map(|i| i.fraction).collect();
        let plan = split_all(total, &fractions, self.cfg.remainder);
        DUST.inc_by(u64::try_from(plan.unspent).unwrap_or(u64::MAX));

        // ---- 3) One batch per signer at a time ----
        let guard = BatchGuard::new(cancel, self.cfg.batch_deadline);
        let signer = self.pipeline.identity().address;
        let lock = self.locks.lock_for(signer);
        let _held = guard.run(lock.lock()).await?;

        let batch_id = format!("BATCH-{}-{}", now_ms(), rand::thread_rng().gen::<u32>());
        info!(%batch_id, %signer, %total, items = req.items.len(), unspent = %plan.unspent, "batch started");
        self.record(AuditEvent::BatchStarted {
            ts_ms: now_ms(),
            batch_id: batch_id.clone(),
            signer,
            total_amount: total,
            items: req.items.len(),
        });

        // ---- 4) Allowance gate against the full amount ----
        let allowance = match self
            .gate
            .ensure_spendable(self.sell_token.address, self.cfg.spender, total, &guard)
            .await
        {
            Ok(a) => a,
            Err(e) => {
                warn!(%batch_id, error = %e, "allowance gate failed");
                self.record(AuditEvent::BatchFinished {
                    ts_ms: now_ms(),
                    batch_id,
                    completed: 0,
                    failed: 0,
                    skipped: req.items.len(),
                });
                return Err(e.into());
            }
        };
        if let AllowanceOutcome::Approved { tx_hash, confirmed } = &allowance {
            self.record(AuditEvent::Approval {
                ts_ms: now_ms(),
                batch_id: batch_id.clone(),
                token: self.sell_token.address,
                tx_hash: tx_hash.clone(),
                confirmed: *confirmed,
            });
        }

        // ---- 5) Pipelines, strictly in order ----
        let mut outcomes = Vec::with_capacity(req.items.len());
        let mut halted = false;
        for ((item, asset), amount) in req.items.iter().zip(assets).zip(plan.amounts.iter().copied()) {
            if halted {
                outcomes.push(ItemOutcome::Skipped {
                    asset_symbol: asset.symbol.clone(),
                });
                continue;
            }

            let outcome = if amount == 0 {
                ItemOutcome::Failed {
                    asset_symbol: asset.symbol.clone(),
                    stage: PipelineStage::QuoteRequested,
                    error: format!("allocation {} of {total} rounds to zero", item.fraction),
                }
            } else {
                let job = SwapJob {
                    asset,
                    fraction: item.fraction,
                    rationale: item.rationale.clone(),
                    sell_amount: amount,
                };
                match self.pipeline.run(&self.sell_token, &job, &guard).await {
                    Ok(result) => ItemOutcome::Completed(result),
                    Err(failure) => ItemOutcome::Failed {
                        asset_symbol: job.asset.symbol.clone(),
                        stage: failure.stage,
                        error: failure.error.to_string(),
                    },
                }
            };

            match &outcome {
                ItemOutcome::Completed(result) => {
                    self.record(AuditEvent::ItemCompleted {
                        ts_ms: now_ms(),
                        batch_id: batch_id.clone(),
                        result: result.clone(),
                    });
                }
                ItemOutcome::Failed {
                    asset_symbol,
                    stage,
                    error,
                } => {
                    warn!(%batch_id, asset = %asset_symbol, %stage, %error, "item failed");
                    self.record(AuditEvent::ItemFailed {
                        ts_ms: now_ms(),
                        batch_id: batch_id.clone(),
                        asset_symbol: asset_symbol.clone(),
                        stage: *stage,
                        error: error.clone(),
                    });
                    halted = self.cfg.failure == FailurePolicy::StopOnFailure
                        || guard.check().is_err();
                }
                ItemOutcome::Skipped { .. } => {}
            }
            outcomes.push(outcome);
        }

        let report = BatchReport {
            batch_id,
            total_amount: total,
            split_amounts: plan.amounts,
            unspent: plan.unspent,
            allowance,
            outcomes,
        };
        let (completed, failed, skipped) = report.counts();
        info!(batch_id = %report.batch_id, completed, failed, skipped, "batch finished");
        self.record(AuditEvent::BatchFinished {
            ts_ms: now_ms(),
            batch_id: report.batch_id.clone(),
            completed,
            failed,
            skipped,
        });
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AllocationItem;
    use crate::error::AllowanceError;
    use crate::guard::Interrupt;
    use crate::mock::{PaperChain, PaperOrderBook, PaperSigner};
    use crate::pipeline::PipelineConfig;
    use crate::signer::SignerIdentity;
    use tokio::sync::mpsc;

    struct Rig {
        orch: Orchestrator,
        chain: Arc<PaperChain>,
        book: Arc<PaperOrderBook>,
        signer: Arc<PaperSigner>,
    }

    fn owner() -> Address {
        "0x1111111111111111111111111111111111111111".parse().unwrap()
    }

    fn relayer() -> Address {
        "0xc92e8bdf79f0507f65a392b0ab4667716bfe0110".parse().unwrap()
    }

    fn rig_with(
        balance: Amount,
        book: PaperOrderBook,
        signer: PaperSigner,
        failure: FailurePolicy,
        deadline: Option<Duration>,
    ) -> Rig {
        let dir = Arc::new(TokenDirectory::base_mainnet().unwrap());
        let usdc = dir.stablecoin().unwrap().address;
        let chain = Arc::new(PaperChain::new().with_balance(usdc, owner(), balance));
        let signer = Arc::new(signer.attached_to(chain.clone(), owner()));
        let book = Arc::new(book.with_reference_prices(&dir));
        let identity = SignerIdentity {
            wallet_id: "wallet-1".into(),
            address: owner(),
        };
        let gate = AllowanceGate::new(chain.clone(), signer.clone(), identity.clone(), 8453);
        let pipeline = SwapPipeline::new(
            book.clone(),
            signer.clone(),
            identity,
            PipelineConfig {
                chain_id: 8453,
                settlement: "0x9008d19f58aabd9ed0d60971565aa8510560ab41".parse().unwrap(),
                slippage_bps: 50,
            },
        );
        let orch = Orchestrator::new(
            dir,
            gate,
            pipeline,
            SignerLocks::default(),
            OrchestratorConfig {
                remainder: RemainderPolicy::Strand,
                failure,
                batch_deadline: deadline,
                spender: relayer(),
            },
        )
        .unwrap();
        Rig {
            orch,
            chain,
            book,
            signer,
        }
    }

    fn rig(balance: Amount) -> Rig {
        rig_with(
            balance,
            PaperOrderBook::new(),
            PaperSigner::new(),
            FailurePolicy::StopOnFailure,
            None,
        )
    }

    fn request(total: &str, items: &[(&str, f64)]) -> AllocationRequest {
        AllocationRequest {
            total_amount: total.into(),
            items: items
                .iter()
                .map(|(s, f)| AllocationItem {
                    asset_symbol: s.to_string(),
                    fraction: *f,
                    rationale: format!("{s} thesis"),
                })
                .collect(),
        }
    }

    fn three() -> AllocationRequest {
        request("10000000", &[("WETH", 0.5), ("cbBTC", 0.3), ("AERO", 0.2)])
    }

    #[tokio::test]
    async fn three_items_complete_in_request_order() {
        let r = rig(50_000_000);
        let report = r.orch.execute(&three()).await.unwrap();
        assert!(report.is_complete());
        assert_eq!(report.split_amounts, vec![5_000_000, 3_000_000, 2_000_000]);
        assert_eq!(report.unspent, 0);
        assert!(matches!(report.allowance, AllowanceOutcome::Approved { .. }));

        let results = report.into_results().unwrap();
        let symbols: Vec<&str> = results.iter().map(|x| x.asset_symbol.as_str()).collect();
        assert_eq!(symbols, vec!["WETH", "cbBTC", "AERO"]);
        assert_eq!(results[1].sell_amount, 3_000_000);
        assert_eq!(results[2].rationale, "AERO thesis");
        assert_eq!(r.book.submit_calls(), 3);
    }

    #[tokio::test]
    async fn single_third_strands_the_remainder() {
        let r = rig(50_000_000);
        // 0.3333 alone does not sum to 1, so pair it with the rest
        let report = r
            .orch
            .execute(&request("10000000", &[("WETH", 0.3333), ("AERO", 0.6667)]))
            .await
            .unwrap();
        assert_eq!(report.split_amounts, vec![3_333_000, 6_667_000]);
        assert_eq!(report.unspent, 0);

        let odd = r
            .orch
            .execute(&request("10000001", &[("WETH", 0.3333), ("AERO", 0.6667)]))
            .await
            .unwrap();
        assert_eq!(odd.split_amounts.iter().sum::<Amount>() + odd.unspent, 10_000_001);
        assert!(odd.unspent <= 1);
    }

    #[tokio::test]
    async fn sum_just_above_one_sells_no_more_than_the_total() {
        let r = rig(10_000_000);
        let report = r
            .orch
            .execute(&request("10000000", &[("WETH", 0.5), ("AERO", 0.50009999999)]))
            .await
            .unwrap();
        assert!(report.is_complete());
        assert_eq!(report.split_amounts, vec![5_000_000, 5_000_000]);
        assert_eq!(report.unspent, 0);
        let sold: Amount = r.book.submitted().iter().map(|o| o.order.sell_amount).sum();
        assert_eq!(sold, 10_000_000);
    }

    #[tokio::test]
    async fn unknown_token_fails_before_any_network_call() {
        let r = rig(50_000_000);
        let err = r
            .orch
            .execute(&request("10000000", &[("WETH", 0.5), ("DOGE", 0.5)]))
            .await
            .unwrap_err();
        assert!(err.is_client_error());
        assert_eq!(err.to_string(), "token info not found for symbol: DOGE");
        assert_eq!(r.chain.reads(), 0);
        assert_eq!(r.book.quote_calls(), 0);
    }

    #[tokio::test]
    async fn invalid_request_is_a_client_error() {
        let r = rig(50_000_000);
        let err = r
            .orch
            .execute(&request("10000000", &[("WETH", 0.5), ("AERO", 0.4)]))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
        assert!(err.is_client_error());
        assert_eq!(r.chain.reads(), 0);
    }

    #[tokio::test]
    async fn insufficient_balance_aborts_before_order_activity() {
        let r = rig(100);
        let err = r
            .orch
            .execute(&request("150", &[("WETH", 1.0)]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Allowance(AllowanceError::InsufficientBalance {
                balance: 100,
                required: 150,
                ..
            })
        ));
        assert!(!err.is_client_error());
        assert_eq!(r.book.quote_calls(), 0);
        assert_eq!(r.signer.sign_calls(), 0);
        assert_eq!(r.book.submit_calls(), 0);
        assert_eq!(r.signer.send_calls(), 0);
    }

    #[tokio::test]
    async fn signing_failure_on_second_item_skips_the_third() {
        let r = rig_with(
            50_000_000,
            PaperOrderBook::new(),
            PaperSigner::new().fail_sign_at(2),
            FailurePolicy::StopOnFailure,
            None,
        );
        let report = r.orch.execute(&three()).await.unwrap();
        assert!(!report.is_complete());
        assert!(matches!(report.outcomes[0], ItemOutcome::Completed(_)));
        assert!(matches!(
            &report.outcomes[1],
            ItemOutcome::Failed { asset_symbol, stage: PipelineStage::QuoteReceived, .. } if asset_symbol == "cbBTC"
        ));
        assert!(matches!(&report.outcomes[2], ItemOutcome::Skipped { asset_symbol } if asset_symbol == "AERO"));
        assert_eq!(report.counts(), (1, 1, 1));
        assert_eq!(r.book.quote_calls(), 2);
        assert_eq!(r.book.submit_calls(), 1);

        let failure = report.into_results().unwrap_err();
        assert_eq!(failure.asset_symbol, "cbBTC");
        assert!(failure.error.contains("signing failed for cbBTC"));
    }

    #[tokio::test]
    async fn continue_policy_runs_every_item() {
        let r = rig_with(
            50_000_000,
            PaperOrderBook::new(),
            PaperSigner::new().fail_sign_at(2),
            FailurePolicy::ContinueOnFailure,
            None,
        );
        let report = r.orch.execute(&three()).await.unwrap();
        assert_eq!(report.counts(), (2, 1, 0));
        assert!(matches!(report.outcomes[2], ItemOutcome::Completed(_)));
        assert_eq!(r.book.quote_calls(), 3);
    }

    #[tokio::test]
    async fn dust_sized_item_fails_without_a_quote() {
        let r = rig(50_000_000);
        let report = r
            .orch
            .execute(&request("1", &[("WETH", 0.5), ("AERO", 0.5)]))
            .await
            .unwrap();
        assert!(matches!(
            report.outcomes[0],
            ItemOutcome::Failed { stage: PipelineStage::QuoteRequested, .. }
        ));
        assert!(matches!(report.outcomes[1], ItemOutcome::Skipped { .. }));
        assert_eq!(r.book.quote_calls(), 0);
    }

    #[tokio::test]
    async fn cancelled_batch_fails_before_the_gate() {
        let r = rig(50_000_000);
        let token = CancellationToken::new();
        token.cancel();
        let err = r.orch.execute_with_cancel(&three(), token).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Interrupted(Interrupt::Cancelled)));
        assert_eq!(r.chain.reads(), 0);
    }

    #[tokio::test]
    async fn deadline_mid_batch_fails_the_running_item_and_skips_the_rest() {
        let r = rig_with(
            50_000_000,
            PaperOrderBook::new().with_latency(Duration::from_millis(60)),
            PaperSigner::new(),
            FailurePolicy::ContinueOnFailure,
            Some(Duration::from_millis(100)),
        );
        let report = r.orch.execute(&three()).await.unwrap();
        assert!(matches!(
            &report.outcomes[0],
            ItemOutcome::Failed { stage: PipelineStage::OrderSigned, error, .. } if error.contains("deadline")
        ));
        assert!(matches!(report.outcomes[1], ItemOutcome::Skipped { .. }));
        assert!(matches!(report.outcomes[2], ItemOutcome::Skipped { .. }));
    }

    #[tokio::test]
    async fn batches_for_one_signer_do_not_interleave() {
        let r = rig_with(
            50_000_000,
            PaperOrderBook::new().with_latency(Duration::from_millis(5)),
            PaperSigner::new(),
            FailurePolicy::StopOnFailure,
            None,
        );
        let a = request("2000000", &[("WETH", 0.5), ("cbBTC", 0.5)]);
        let b = request("2000000", &[("AERO", 0.5), ("VIRTUAL", 0.5)]);
        let (ra, rb) = tokio::join!(r.orch.execute(&a), r.orch.execute(&b));
        assert!(ra.unwrap().is_complete());
        assert!(rb.unwrap().is_complete());

        let dir = r.orch.directory();
        let batch_of = |addr: Address| {
            if addr == dir.lookup("WETH").unwrap().address || addr == dir.lookup("cbBTC").unwrap().address {
                'a'
            } else {
                'b'
            }
        };
        let order: Vec<char> = r
            .book
            .submitted()
            .iter()
            .map(|o| batch_of(o.order.buy_token))
            .collect();
        assert_eq!(order.len(), 4);
        assert_eq!(order[0], order[1]);
        assert_eq!(order[2], order[3]);
        assert_ne!(order[1], order[2]);
    }

    #[tokio::test]
    async fn audit_trail_covers_the_batch() {
        let (tx, mut rx) = mpsc::channel(32);
        let r = rig(50_000_000);
        let orch = r.orch.with_audit(AuditSink::new(tx));
        orch.execute(&three()).await.unwrap();
        drop(orch);

        let mut kinds = Vec::new();
        while let Some(ev) = rx.recv().await {
            kinds.push(serde_json::to_value(&ev).unwrap()["event"].as_str().unwrap().to_string());
        }
        assert_eq!(
            kinds,
            vec![
                "batch_started",
                "approval",
                "item_completed",
                "item_completed",
                "item_completed",
                "batch_finished"
            ]
        );
    }

    #[test]
    fn signer_locks_share_one_mutex_per_address() {
        let locks = SignerLocks::default();
        let a = locks.lock_for(owner());
        let b = locks.clone().lock_for(owner());
        let c = locks.lock_for(relayer());
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
