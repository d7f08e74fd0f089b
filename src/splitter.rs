// ===============================
// src/splitter.rs
// ===============================
//
// Fraction -> basis points -> integer base units. No floating point amount
// ever leaves this module.
//
use crate::domain::Amount;

pub const BPS_DENOMINATOR: u128 = 10_000;

// 0.29 * 10_000 == 2899.9999999999995 in f64; nudge before flooring.
const BPS_EPSILON: f64 = 1e-6;

/// What happens to the rounding remainder of a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RemainderPolicy {
    /// Leave the dust unspent in the signer's balance.
    #[default]
    Strand,
    /// Add the rounding dust to the last item.
    AssignToLast,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitPlan {
    pub amounts: Vec<Amount>,
    /// `total - sum(amounts)`: what stays unspent.
    pub unspent: Amount,
}

pub fn fraction_to_bps(fraction: f64) -> u128 {
    if !fraction.is_finite() || fraction <= 0.0 {
        return 0;
    }
    ((fraction * BPS_DENOMINATOR as f64 + BPS_EPSILON).floor() as u128).min(BPS_DENOMINATOR)
}

/// `floor(amount * bps / 10_000)` without overflowing for any `u128` amount.
pub fn apply_bps(amount: Amount, bps: u128) -> Amount {
    let bps = bps.min(BPS_DENOMINATOR);
    let q = amount / BPS_DENOMINATOR;
    let r = amount % BPS_DENOMINATOR;
    q * bps + r * bps / BPS_DENOMINATOR
}

pub fn split(total: Amount, fraction: f64) -> Amount {
    apply_bps(total, fraction_to_bps(fraction))
}

/// Splits `total` by `fractions`. The bps of all items are capped at 10_000
/// together, so the amounts never add up to more than `total` even when the
/// fractions sum slightly above 1.
pub fn split_all(total: Amount, fractions: &[f64], policy: RemainderPolicy) -> SplitPlan {
    let mut bps_left = BPS_DENOMINATOR;
    let bps: Vec<u128> = fractions
        .iter()
        .map(|f| {
            let b = fraction_to_bps(*f).min(bps_left);
            bps_left -= b;
            b
        })
        .collect();
    let mut amounts: Vec<Amount> = bps.iter().map(|b| apply_bps(total, *b)).collect();
    let assigned: Amount = amounts.iter().sum();

    if policy == RemainderPolicy::AssignToLast {
        let total_bps: u128 = bps.iter().sum();
        let target = apply_bps(total, total_bps);
        if let Some(last) = amounts.last_mut() {
            *last += target.saturating_sub(assigned);
        }
    }

    let spent: Amount = amounts.iter().sum();
    SplitPlan {
        unspent: total.saturating_sub(spent),
        amounts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_bps_leave_no_dust() {
        let plan = split_all(10_000_000, &[0.5, 0.3, 0.2], RemainderPolicy::Strand);
        assert_eq!(plan.amounts, vec![5_000_000, 3_000_000, 2_000_000]);
        assert_eq!(plan.unspent, 0);
    }

    #[test]
    fn single_partial_fraction_is_not_redistributed() {
        assert_eq!(split(10_000_000, 0.3333), 3_333_000);
        let plan = split_all(10_000_000, &[0.3333], RemainderPolicy::Strand);
        assert_eq!(plan.unspent, 6_667_000);
    }

    #[test]
    fn float_representation_does_not_drop_a_bp() {
        assert_eq!(fraction_to_bps(0.29), 2900);
        assert_eq!(fraction_to_bps(0.57), 5700);
        assert_eq!(fraction_to_bps(0.12345), 1234);
    }

    #[test]
    fn full_fraction_returns_total() {
        for total in [0u128, 1, 9_999, 10_001, 123_456_789, u128::MAX] {
            assert_eq!(split(total, 1.0), total);
        }
    }

    #[test]
    fn split_never_exceeds_total() {
        for total in [1u128, 7, 10_000, 999_999_999, u128::MAX / 3] {
            for f in [0.0001, 0.1, 0.3333, 0.5, 0.9999, 1.0] {
                assert!(split(total, f) <= total);
            }
        }
    }

    #[test]
    fn stranded_dust_is_bounded_by_item_count() {
        let fractions = [0.3333, 0.3333, 0.3334];
        for total in [1u128, 2, 10, 9_999, 10_001, 1_234_567] {
            let plan = split_all(total, &fractions, RemainderPolicy::Strand);
            let sum: u128 = plan.amounts.iter().sum();
            assert!(sum <= total);
            assert!(total - sum <= (fractions.len() as u128) - 1, "total={total}");
            assert_eq!(plan.unspent, total - sum);
        }
    }

    #[test]
    fn assign_to_last_sweeps_rounding_dust() {
        let plan = split_all(10_001, &[0.3333, 0.3333, 0.3334], RemainderPolicy::AssignToLast);
        assert_eq!(plan.amounts.iter().sum::<u128>(), 10_001);
        assert_eq!(plan.unspent, 0);
        assert_eq!(plan.amounts[0], 3_333);
    }

    #[test]
    fn assign_to_last_keeps_allocation_shortfall() {
        // fractions sum to 0.9999: only rounding dust moves, not the missing bp.
        let plan = split_all(10_000_000, &[0.5, 0.4999], RemainderPolicy::AssignToLast);
        assert_eq!(plan.amounts, vec![5_000_000, 4_999_000]);
        assert_eq!(plan.unspent, 1_000);
    }

    #[test]
    fn fractions_summing_above_one_never_overspend() {
        // accepted by the 1e-4 tolerance, but 5000 + 5001 bps
        let fractions = [0.5, 0.50009999999];
        let plan = split_all(10_000_000, &fractions, RemainderPolicy::Strand);
        assert_eq!(plan.amounts, vec![5_000_000, 5_000_000]);
        assert_eq!(plan.unspent, 0);

        let plan = split_all(10_000_000, &fractions, RemainderPolicy::AssignToLast);
        assert_eq!(plan.amounts.iter().sum::<u128>(), 10_000_000);
        assert_eq!(plan.unspent, 0);

        for total in [1u128, 3, 10_001, 999_999_999, u128::MAX] {
            for policy in [RemainderPolicy::Strand, RemainderPolicy::AssignToLast] {
                let plan = split_all(total, &[0.3334, 0.3334, 0.33329999999], policy);
                let sum: u128 = plan.amounts.iter().sum();
                assert!(sum <= total, "total={total} policy={policy:?}");
                assert_eq!(plan.unspent, total - sum);
            }
        }
    }

    #[test]
    fn splitting_is_deterministic() {
        assert_eq!(split(987_654_321, 0.4242), split(987_654_321, 0.4242));
    }
}
