// ===============================
// src/guard.rs
// ===============================
//
// Cancellation + overall deadline for one batch. Every network await in the
// gate and the pipeline goes through `BatchGuard::run`.
//
use std::future::Future;

use thiserror::Error;
use tokio::time::{sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Interrupt {
    #[error("batch cancelled")]
    Cancelled,
    #[error("batch deadline exceeded")]
    DeadlineExceeded,
}

#[derive(Debug, Clone)]
pub struct BatchGuard {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl BatchGuard {
    pub fn new(cancel: CancellationToken, budget: Option<Duration>) -> Self {
        Self {
            cancel,
            deadline: budget.map(|d| Instant::now() + d),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(CancellationToken::new(), None)
    }

    pub fn check(&self) -> Result<(), Interrupt> {
        if self.cancel.is_cancelled() {
            return Err(Interrupt::Cancelled);
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Err(Interrupt::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Interrupt> {
        self.check()?;
        let deadline = async {
            match self.deadline {
                Some(d) => sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Interrupt::Cancelled),
            _ = deadline => Err(Interrupt::DeadlineExceeded),
            out = fut => Ok(out),
        }
    }
}
