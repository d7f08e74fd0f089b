// ===============================
// src/error.rs
// ===============================
use thiserror::Error;

use crate::domain::{Address, Amount, PipelineStage};
use crate::guard::Interrupt;

/// Caller input is malformed. No side effects have happened.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("totalAmount is required")]
    MissingAmount,
    #[error("totalAmount must be an unsigned integer in base units, got {0:?}")]
    NonNumericAmount(String),
    #[error("totalAmount must not be negative, got {0:?}")]
    NegativeAmount(String),
    #[error("totalAmount must be greater than zero")]
    ZeroAmount,
    #[error("totalAmount {0:?} does not fit in 128 bits")]
    AmountOverflow(String),
    #[error("allocation must contain at least one item")]
    EmptyItems,
    #[error("assets ({assets}), allocations ({fractions}) and analysis ({rationales}) length mismatch")]
    LengthMismatch {
        assets: usize,
        fractions: usize,
        rationales: usize,
    },
    #[error("allocation for {symbol} must be in (0, 1], got {fraction}")]
    FractionOutOfRange { symbol: String, fraction: f64 },
    #[error("allocations must sum to 1 (got {0})")]
    SumMismatch(f64),
    #[error("cannot allocate into the sell token {0}")]
    SellTokenTarget(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("token info not found for symbol: {0}")]
pub struct UnknownToken(pub String);

/// Transport or protocol failure from one of the external collaborators.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("http transport: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{endpoint} returned {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },
    #[error("json-rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("unexpected response: {0}")]
    Decode(String),
    #[error("rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum AllowanceError {
    #[error("insufficient {token} balance: have {balance}, need {required}")]
    InsufficientBalance {
        token: Address,
        balance: Amount,
        required: Amount,
    },
    #[error("on-chain read failed: {0}")]
    Read(#[source] ClientError),
    #[error("approval submission failed: {0}")]
    ApprovalFailed(#[source] ClientError),
    #[error("approval transaction {tx_hash} reverted")]
    ApprovalReverted { tx_hash: String },
    #[error("approval transaction {tx_hash} not mined after {waited_secs}s")]
    ApprovalTimeout { tx_hash: String, waited_secs: u64 },
    #[error(transparent)]
    Interrupted(#[from] Interrupt),
}

/// Failure of one asset's quote -> sign -> submit run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("quote failed for {asset}: {source}")]
    Quote {
        asset: String,
        #[source]
        source: ClientError,
    },
    #[error("signing failed for {asset}: {source}")]
    Signing {
        asset: String,
        #[source]
        source: ClientError,
    },
    #[error("submission failed for {asset}: {source}")]
    Submission {
        asset: String,
        #[source]
        source: ClientError,
    },
    #[error("{asset}: {interrupt}")]
    Interrupted { asset: String, interrupt: Interrupt },
}

/// Batch-level failure: nothing was sent to the order book.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    UnknownToken(#[from] UnknownToken),
    #[error(transparent)]
    Allowance(#[from] AllowanceError),
    #[error(transparent)]
    Interrupted(#[from] Interrupt),
}

impl OrchestratorError {
    /// Caller-side problems map to 4xx.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Validation(_) | OrchestratorError::UnknownToken(_)
        )
    }
}

/// First failed item of a batch, for callers that want all-or-nothing results.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("swap failed for {asset_symbol} at {stage}: {error}")]
pub struct ItemFailure {
    pub asset_symbol: String,
    pub stage: PipelineStage,
    pub error: String,
}
