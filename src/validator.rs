// ===============================
// src/validator.rs
// ===============================
use crate::domain::{AllocationItem, AllocationRequest, Amount};
use crate::error::ValidationError;

/// Absolute tolerance on `sum(fractions) == 1`.
pub const SUM_TOLERANCE: f64 = 1e-4;

/// Structural/numeric checks on an allocation. Pure: no lookups, no I/O.
#[derive(Debug, Clone)]
pub struct AllocationValidator {
    sell_symbol: String,
    tolerance: f64,
}

impl AllocationValidator {
    pub fn new(sell_symbol: impl Into<String>) -> Self {
        Self {
            sell_symbol: sell_symbol.into(),
            tolerance: SUM_TOLERANCE,
        }
    }

    pub fn validate<'a>(
        &self,
        request: &'a AllocationRequest,
    ) -> Result<&'a AllocationRequest, ValidationError> {
        parse_total_amount(&request.total_amount)?;

        if request.items.is_empty() {
            return Err(ValidationError::EmptyItems);
        }

        for item in &request.items {
            if !item.fraction.is_finite() || item.fraction <= 0.0 || item.fraction > 1.0 {
                return Err(ValidationError::FractionOutOfRange {
                    symbol: item.asset_symbol.clone(),
                    fraction: item.fraction,
                });
            }
            if item.asset_symbol.trim().eq_ignore_ascii_case(&self.sell_symbol) {
                return Err(ValidationError::SellTokenTarget(item.asset_symbol.clone()));
            }
        }

        let sum: f64 = request.items.iter().map(|i| i.fraction).sum();
        if (sum - 1.0).abs() > self.tolerance {
            return Err(ValidationError::SumMismatch(sum));
        }

        Ok(request)
    }
}

/// Base-unit integer string -> Amount.
pub fn parse_total_amount(raw: &str) -> Result<Amount, ValidationError> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(ValidationError::MissingAmount);
    }
    if let Some(rest) = s.strip_prefix('-') {
        if !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ValidationError::NegativeAmount(raw.to_string()));
        }
    }
    if !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ValidationError::NonNumericAmount(raw.to_string()));
    }
    let amount: Amount = s
        .parse()
        .map_err(|_| ValidationError::AmountOverflow(raw.to_string()))?;
    if amount == 0 {
        return Err(ValidationError::ZeroAmount);
    }
    Ok(amount)
}

/// Builds a request from the legacy parallel-array shape
/// (`assets`, `allocations`, `analysis`).
pub fn from_parallel(
    total_amount: String,
    assets: Vec<String>,
    fractions: Vec<f64>,
    rationales: Vec<String>,
) -> Result<AllocationRequest, ValidationError> {
    if assets.len() != fractions.len() || assets.len() != rationales.len() {
        return Err(ValidationError::LengthMismatch {
            assets: assets.len(),
            fractions: fractions.len(),
            rationales: rationales.len(),
        });
    }
    let items = assets
        .into_iter()
        .zip(fractions)
        .zip(rationales)
        .map(|((asset_symbol, fraction), rationale)| AllocationItem {
            asset_symbol,
            fraction,
            rationale,
        })
        .collect();
    Ok(AllocationRequest {
        total_amount,
        items,
    })
}
