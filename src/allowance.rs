// ===============================
// src/allowance.rs
// ===============================
//
// Pre-trade gate, run once per batch against the full sell amount:
//   balance >= required  else InsufficientBalance
//   allowance(spender) >= required  else approve(spender, ..) via the signer
//
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::chain::{encode_approve, ChainReader, ReceiptStatus};
use crate::domain::{Address, Amount};
use crate::error::AllowanceError;
use crate::guard::BatchGuard;
use crate::metrics::APPROVALS;
use crate::signer::{evm_caip2, SignerIdentity, TransactionRequest, WalletSigner};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApprovalPolicy {
    /// approve(2^256 - 1): one approval for all future batches.
    #[default]
    Unlimited,
    /// approve(required)
    Exact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfirmationPolicy {
    /// Return as soon as the approval is accepted by the signer.
    #[default]
    FireAndForget,
    WaitForReceipt {
        timeout: Duration,
        poll_interval: Duration,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowanceOutcome {
    Sufficient { balance: Amount, allowance: Amount },
    Approved { tx_hash: String, confirmed: bool },
}

pub struct AllowanceGate {
    chain: Arc<dyn ChainReader>,
    signer: Arc<dyn WalletSigner>,
    identity: SignerIdentity,
    chain_id: u64,
    approval: ApprovalPolicy,
    confirmation: ConfirmationPolicy,
}

impl AllowanceGate {
    pub fn new(
        chain: Arc<dyn ChainReader>,
        signer: Arc<dyn WalletSigner>,
        identity: SignerIdentity,
        chain_id: u64,
    ) -> Self {
        Self {
            chain,
            signer,
            identity,
            chain_id,
            approval: ApprovalPolicy::default(),
            confirmation: ConfirmationPolicy::default(),
        }
    }

    pub fn with_approval_policy(mut self, approval: ApprovalPolicy) -> Self {
        self.approval = approval;
        self
    }

    pub fn with_confirmation(mut self, confirmation: ConfirmationPolicy) -> Self {
        self.confirmation = confirmation;
        self
    }

    /// Makes sure the signer holds and has approved `required` of `token` for `spender`.
    pub async fn ensure_spendable(
        &self,
        token: Address,
        spender: Address,
        required: Amount,
        guard: &BatchGuard,
    ) -> Result<AllowanceOutcome, AllowanceError> {
        let owner = self.identity.address;
        let result = self.check_and_approve(token, owner, spender, required, guard).await;
        let label = match &result {
            Ok(AllowanceOutcome::Sufficient { .. }) => "sufficient",
            Ok(AllowanceOutcome::Approved { confirmed: true, .. }) => "confirmed",
            Ok(AllowanceOutcome::Approved { .. }) => "approved",
            Err(_) => "failed",
        };
        APPROVALS.with_label_values(&[label]).inc();
        result
    }

    async fn check_and_approve(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
        required: Amount,
        guard: &BatchGuard,
    ) -> Result<AllowanceOutcome, AllowanceError> {
        let balance = guard
            .run(self.chain.balance_of(token, owner))
            .await?
            .map_err(AllowanceError::Read)?;
        if balance < required {
            warn!(%token, %owner, %balance, %required, "insufficient balance");
            return Err(AllowanceError::InsufficientBalance {
                token,
                balance,
                required,
            });
        }

        let allowance = guard
            .run(self.chain.allowance(token, owner, spender))
            .await?
            .map_err(AllowanceError::Read)?;
        if allowance >= required {
            debug!(%token, %allowance, %required, "allowance sufficient");
            return Ok(AllowanceOutcome::Sufficient { balance, allowance });
        }

        let amount = match self.approval {
            ApprovalPolicy::Unlimited => None,
            ApprovalPolicy::Exact => Some(required),
        };
        let tx = TransactionRequest {
            to: token,
            value: "0x0".to_string(),
            data: encode_approve(spender, amount),
            chain_id: self.chain_id,
        };
        info!(%token, %spender, %allowance, %required, policy = ?self.approval, "sending approval");
        let tx_hash = guard
            .run(self.signer.send_transaction(
                &self.identity.wallet_id,
                &evm_caip2(self.chain_id),
                &tx,
            ))
            .await?
            .map_err(AllowanceError::ApprovalFailed)?;
        info!(%tx_hash, "approval sent");

        match self.confirmation {
            ConfirmationPolicy::FireAndForget => Ok(AllowanceOutcome::Approved {
                tx_hash,
                confirmed: false,
            }),
            ConfirmationPolicy::WaitForReceipt {
                timeout,
                poll_interval,
            } => {
                self.wait_for_receipt(&tx_hash, timeout, poll_interval, guard)
                    .await?;
                Ok(AllowanceOutcome::Approved {
                    tx_hash,
                    confirmed: true,
                })
            }
        }
    }

    async fn wait_for_receipt(
        &self,
        tx_hash: &str,
        timeout: Duration,
        poll_interval: Duration,
        guard: &BatchGuard,
    ) -> Result<(), AllowanceError> {
        let started = Instant::now();
        loop {
            match guard.run(self.chain.transaction_receipt(tx_hash)).await? {
                Ok(Some(ReceiptStatus::Success)) => {
                    info!(%tx_hash, "approval mined");
                    return Ok(());
                }
                Ok(Some(ReceiptStatus::Reverted)) => {
                    return Err(AllowanceError::ApprovalReverted {
                        tx_hash: tx_hash.to_string(),
                    });
                }
                Ok(None) => {}
                // transient: keep polling until the timeout
                Err(e) => debug!(%tx_hash, error = %e, "receipt poll failed"),
            }
            if started.elapsed() >= timeout {
                return Err(AllowanceError::ApprovalTimeout {
                    tx_hash: tx_hash.to_string(),
                    waited_secs: timeout.as_secs(),
                });
            }
            guard.run(sleep(poll_interval)).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{PaperChain, PaperSigner};

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    fn usdc() -> Address {
        addr("0x833589fcd6edb6e08f4c7c32d4f71b54bda02913")
    }

    fn owner() -> Address {
        addr("0x1111111111111111111111111111111111111111")
    }

    fn relayer() -> Address {
        addr("0xc92e8bdf79f0507f65a392b0ab4667716bfe0110")
    }

    fn gate(chain: Arc<PaperChain>, signer: Arc<PaperSigner>) -> AllowanceGate {
        AllowanceGate::new(
            chain,
            signer,
            SignerIdentity {
                wallet_id: "wallet-1".into(),
                address: owner(),
            },
            8453,
        )
    }

    fn wait(timeout_ms: u64) -> ConfirmationPolicy {
        ConfirmationPolicy::WaitForReceipt {
            timeout: Duration::from_millis(timeout_ms),
            poll_interval: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn sufficient_allowance_sends_nothing() {
        let chain = Arc::new(
            PaperChain::new()
                .with_balance(usdc(), owner(), 200)
                .with_allowance(usdc(), owner(), relayer(), 200),
        );
        let signer = Arc::new(PaperSigner::new().attached_to(chain.clone(), owner()));
        let out = gate(chain, signer.clone())
            .ensure_spendable(usdc(), relayer(), 150, &BatchGuard::unbounded())
            .await
            .unwrap();
        assert_eq!(out, AllowanceOutcome::Sufficient { balance: 200, allowance: 200 });
        assert_eq!(signer.send_calls(), 0);
    }

    #[tokio::test]
    async fn balance_below_required_fails_before_allowance_read() {
        let chain = Arc::new(PaperChain::new().with_balance(usdc(), owner(), 100));
        let signer = Arc::new(PaperSigner::new().attached_to(chain.clone(), owner()));
        let err = gate(chain.clone(), signer.clone())
            .ensure_spendable(usdc(), relayer(), 150, &BatchGuard::unbounded())
            .await
            .unwrap_err();
        match err {
            AllowanceError::InsufficientBalance { balance, required, .. } => {
                assert_eq!((balance, required), (100, 150));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(chain.reads(), 1);
        assert_eq!(signer.send_calls(), 0);
    }

    #[tokio::test]
    async fn short_allowance_is_approved_unlimited_by_default() {
        let chain = Arc::new(
            PaperChain::new()
                .with_balance(usdc(), owner(), 1_000)
                .with_allowance(usdc(), owner(), relayer(), 10),
        );
        let signer = Arc::new(PaperSigner::new().attached_to(chain.clone(), owner()));
        let out = gate(chain.clone(), signer.clone())
            .ensure_spendable(usdc(), relayer(), 500, &BatchGuard::unbounded())
            .await
            .unwrap();
        assert!(matches!(out, AllowanceOutcome::Approved { confirmed: false, .. }));
        assert_eq!(chain.allowance_of(usdc(), owner(), relayer()), Amount::MAX);
        let sent = signer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, usdc());
        assert_eq!(sent[0].chain_id, 8453);
        assert_eq!(chain.receipt_polls(), 0);
    }

    #[tokio::test]
    async fn exact_policy_approves_the_required_amount() {
        let chain = Arc::new(PaperChain::new().with_balance(usdc(), owner(), 1_000));
        let signer = Arc::new(PaperSigner::new().attached_to(chain.clone(), owner()));
        gate(chain.clone(), signer)
            .with_approval_policy(ApprovalPolicy::Exact)
            .ensure_spendable(usdc(), relayer(), 500, &BatchGuard::unbounded())
            .await
            .unwrap();
        assert_eq!(chain.allowance_of(usdc(), owner(), relayer()), 500);
    }

    #[tokio::test]
    async fn waits_until_the_approval_is_mined() {
        let chain = Arc::new(
            PaperChain::new()
                .with_balance(usdc(), owner(), 1_000)
                .mined_after(2),
        );
        let signer = Arc::new(PaperSigner::new().attached_to(chain.clone(), owner()));
        let out = gate(chain.clone(), signer)
            .with_confirmation(wait(2_000))
            .ensure_spendable(usdc(), relayer(), 500, &BatchGuard::unbounded())
            .await
            .unwrap();
        assert!(matches!(out, AllowanceOutcome::Approved { confirmed: true, .. }));
        assert_eq!(chain.receipt_polls(), 3);
    }

    #[tokio::test]
    async fn reverted_approval_is_an_error() {
        let chain = Arc::new(
            PaperChain::new()
                .with_balance(usdc(), owner(), 1_000)
                .reverting_approvals(),
        );
        let signer = Arc::new(PaperSigner::new().attached_to(chain.clone(), owner()));
        let err = gate(chain, signer)
            .with_confirmation(wait(2_000))
            .ensure_spendable(usdc(), relayer(), 500, &BatchGuard::unbounded())
            .await
            .unwrap_err();
        assert!(matches!(err, AllowanceError::ApprovalReverted { .. }));
    }

    #[tokio::test]
    async fn unmined_approval_times_out() {
        let chain = Arc::new(PaperChain::new().with_balance(usdc(), owner(), 1_000));
        // detached signer: the hash never shows up on the paper chain
        let signer = Arc::new(PaperSigner::new());
        let err = gate(chain, signer)
            .with_confirmation(wait(30))
            .ensure_spendable(usdc(), relayer(), 500, &BatchGuard::unbounded())
            .await
            .unwrap_err();
        assert!(matches!(err, AllowanceError::ApprovalTimeout { .. }));
    }

    #[tokio::test]
    async fn signer_rejection_surfaces_as_approval_failure() {
        let chain = Arc::new(PaperChain::new().with_balance(usdc(), owner(), 1_000));
        let signer = Arc::new(
            PaperSigner::new()
                .attached_to(chain.clone(), owner())
                .fail_send_at(1),
        );
        let err = gate(chain, signer)
            .ensure_spendable(usdc(), relayer(), 500, &BatchGuard::unbounded())
            .await
            .unwrap_err();
        assert!(matches!(err, AllowanceError::ApprovalFailed(_)));
    }
}
