//! Slab-based refund calculation.
//!
//! The calculator is a pure function of the fare, the departure instant, the
//! reference instant and the operator's [`RefundRules`]. Callers persist the
//! result; nothing here touches storage or the clock.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{Deductions, RefundBreakdown, RefundResult, RefundRules, RefundSlab};

/// Convenience fee attributed in the breakdown, independent of `fees.convenience`.
pub const CONVENIENCE_FEE_PERCENTAGE: f64 = 5.0;

/// Cancellations at least this far ahead attribute every deduction to convenience.
pub const FULL_CONVENIENCE_WINDOW_HOURS: f64 = 24.0;

pub const FALLBACK_SLAB_LABEL: &str = "Less than 3 hours";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RefundError {
    #[error("booking amount must not be negative (got {0})")]
    NegativeAmount(f64),
    #[error("booking amount must be a finite number")]
    NonFiniteAmount,
    #[error("refund rules must contain at least one slab")]
    EmptySlabs,
}

/// Signed hours from `now` until `departure_time`.
pub fn hours_between(departure_time: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (departure_time - now).num_milliseconds() as f64 / (1000.0 * 60.0 * 60.0)
}

pub fn calculate_refund(
    amount: f64,
    departure_time: DateTime<Utc>,
    now: DateTime<Utc>,
    rules: &RefundRules,
) -> Result<RefundResult, RefundError> {
    if !amount.is_finite() {
        return Err(RefundError::NonFiniteAmount);
    }
    if amount < 0.0 {
        return Err(RefundError::NegativeAmount(amount));
    }
    if rules.slabs.is_empty() {
        return Err(RefundError::EmptySlabs);
    }

    let hours_remaining = hours_between(departure_time, now);
    let applied_slab = select_slab(&rules.slabs, hours_remaining);

    // Fraction first; `amount * pct` overflows for fares near `f64::MAX`.
    let refund_amount = amount * (applied_slab.refund_percentage / 100.0);
    let deduction_total = amount - refund_amount;
    let deductions = attribute_deductions(amount, deduction_total, hours_remaining);

    Ok(RefundResult {
        refund_amount,
        deduction_total,
        breakdown: RefundBreakdown {
            original_fare: amount,
            refund_amount,
            deductions,
            applied_slab: applied_slab.label.clone(),
            time_diff_hrs: (hours_remaining * 10.0).round() / 10.0,
        },
        applied_slab,
    })
}

/// Highest `hours_before` that `hours_remaining` still satisfies.
///
/// The sort is stable, so slabs sharing a threshold keep their input order
/// and the first of them wins.
fn select_slab(slabs: &[RefundSlab], hours_remaining: f64) -> RefundSlab {
    let mut ordered = slabs.iter().collect::<Vec<_>>();
    ordered.sort_by(|a, b| b.hours_before.total_cmp(&a.hours_before));

    ordered
        .into_iter()
        .find(|slab| slab.hours_before <= hours_remaining)
        .or_else(|| slabs.iter().find(|slab| slab.hours_before == 0.0))
        .cloned()
        .unwrap_or_else(|| RefundSlab::new(0.0, 0.0, FALLBACK_SLAB_LABEL))
}

fn attribute_deductions(amount: f64, deduction_total: f64, hours_remaining: f64) -> Deductions {
    if hours_remaining >= FULL_CONVENIENCE_WINDOW_HOURS {
        return Deductions {
            convenience: deduction_total,
            cancellation: 0.0,
        };
    }

    let convenience_fee = amount * (CONVENIENCE_FEE_PERCENTAGE / 100.0);
    // Capped so the two parts always add up to the deduction total.
    Deductions {
        convenience: convenience_fee.min(deduction_total.max(0.0)),
        cancellation: (deduction_total - convenience_fee).max(0.0),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::models::RefundFees;

    const EPSILON: f64 = 1e-9;

    fn four_slab_rules() -> RefundRules {
        RefundRules {
            slabs: vec![
                RefundSlab::new(24.0, 95.0, "More than 24 hours"),
                RefundSlab::new(12.0, 75.0, "12-24 hours"),
                RefundSlab::new(3.0, 50.0, "3-12 hours"),
                RefundSlab::new(0.0, 0.0, "Less than 3 hours"),
            ],
            fees: RefundFees::default(),
        }
    }

    fn quote(amount: f64, hours: f64, rules: &RefundRules) -> RefundResult {
        let now = Utc::now();
        let departure = now + Duration::milliseconds((hours * 3_600_000.0) as i64);
        calculate_refund(amount, departure, now, rules).expect("valid inputs should quote")
    }

    #[test]
    fn thirty_hours_out_applies_the_24_hour_slab() {
        let result = quote(1000.0, 30.0, &four_slab_rules());
        assert_eq!(result.applied_slab.label, "More than 24 hours");
        assert!((result.refund_amount - 950.0).abs() < EPSILON);
        assert!((result.deduction_total - 50.0).abs() < EPSILON);
        assert!((result.breakdown.deductions.convenience - 50.0).abs() < EPSILON);
        assert_eq!(result.breakdown.deductions.cancellation, 0.0);
        assert_eq!(result.breakdown.time_diff_hrs, 30.0);
    }

    #[test]
    fn ten_hours_out_applies_the_3_hour_slab() {
        let result = quote(1000.0, 10.0, &four_slab_rules());
        assert_eq!(result.applied_slab.hours_before, 3.0);
        assert!((result.refund_amount - 500.0).abs() < EPSILON);
        assert!((result.deduction_total - 500.0).abs() < EPSILON);
        assert!((result.breakdown.deductions.convenience - 50.0).abs() < EPSILON);
        assert!((result.breakdown.deductions.cancellation - 450.0).abs() < EPSILON);
    }

    #[test]
    fn one_hour_out_applies_the_zero_hour_slab() {
        let result = quote(1000.0, 1.0, &four_slab_rules());
        assert_eq!(result.applied_slab.hours_before, 0.0);
        assert_eq!(result.refund_amount, 0.0);
        assert!((result.deduction_total - 1000.0).abs() < EPSILON);
        assert!((result.breakdown.deductions.cancellation - 950.0).abs() < EPSILON);
    }

    #[test]
    fn departed_booking_falls_back_to_zero_refund() {
        let result = quote(500.0, -5.0, &four_slab_rules());
        assert_eq!(result.refund_amount, 0.0);
        assert!((result.deduction_total - 500.0).abs() < EPSILON);
        assert_eq!(result.breakdown.time_diff_hrs, -5.0);
    }

    #[test]
    fn synthetic_slab_when_no_zero_threshold_exists() {
        let rules = RefundRules {
            slabs: vec![RefundSlab::new(48.0, 75.0, "48 hours early")],
            fees: RefundFees::default(),
        };
        let result = quote(800.0, 10.0, &rules);
        assert_eq!(result.applied_slab.label, FALLBACK_SLAB_LABEL);
        assert_eq!(result.refund_amount, 0.0);
    }

    #[test]
    fn threshold_is_inclusive() {
        let rules = four_slab_rules();
        let now = Utc::now();
        for slab in &rules.slabs {
            let departure = now + Duration::hours(slab.hours_before as i64);
            let result = calculate_refund(1000.0, departure, now, &rules).unwrap();
            assert_eq!(result.applied_slab.label, slab.label);
        }
    }

    #[test]
    fn slab_order_in_the_document_does_not_matter() {
        let mut rules = four_slab_rules();
        rules.slabs.reverse();
        let result = quote(1000.0, 13.0, &rules);
        assert_eq!(result.applied_slab.refund_percentage, 75.0);
    }

    #[test]
    fn tied_thresholds_keep_document_order() {
        let rules = RefundRules {
            slabs: vec![
                RefundSlab::new(12.0, 60.0, "first"),
                RefundSlab::new(12.0, 70.0, "second"),
                RefundSlab::new(0.0, 0.0, "none"),
            ],
            fees: RefundFees::default(),
        };
        assert_eq!(quote(100.0, 20.0, &rules).applied_slab.label, "first");
    }

    #[test]
    fn configured_convenience_fee_is_not_used() {
        let mut rules = four_slab_rules();
        rules.fees.convenience = 20.0;
        let result = quote(1000.0, 10.0, &rules);
        assert!((result.breakdown.deductions.convenience - 50.0).abs() < EPSILON);
    }

    #[test]
    fn small_deduction_inside_24_hours_is_all_convenience() {
        let rules = RefundRules {
            slabs: vec![RefundSlab::new(0.0, 98.0, "Flexible")],
            fees: RefundFees::default(),
        };
        let result = quote(1000.0, 5.0, &rules);
        let deductions = &result.breakdown.deductions;
        assert!((deductions.convenience - 20.0).abs() < EPSILON);
        assert_eq!(deductions.cancellation, 0.0);
    }

    #[test]
    fn amounts_balance_across_the_timeline() {
        let rules = four_slab_rules();
        for amount in [0.0, 1.0, 99.99, 500.0, 1234.56, 10_000.0] {
            for hours in -48..=96 {
                let result = quote(amount, hours as f64 + 0.25, &rules);
                let parts = &result.breakdown.deductions;
                assert!((result.refund_amount + result.deduction_total - amount).abs() < 1e-6);
                assert!((parts.convenience + parts.cancellation - result.deduction_total).abs() < 1e-6);
                assert!(result.refund_amount >= 0.0 && result.refund_amount <= amount + 1e-9);
            }
        }
    }

    #[test]
    fn largest_fares_stay_finite_and_balanced() {
        let rules = RefundRules::standard();
        for amount in [1e300, 1e308, f64::MAX] {
            for hours in [30.0, 10.0, 1.0, -5.0] {
                let result = quote(amount, hours, &rules);
                let parts = &result.breakdown.deductions;
                assert!(result.refund_amount.is_finite());
                assert!(result.deduction_total.is_finite());
                assert!(parts.convenience.is_finite() && parts.cancellation.is_finite());
                assert!(result.refund_amount >= 0.0 && result.refund_amount <= amount);
                let sum = result.refund_amount + result.deduction_total;
                assert!(((sum - amount) / amount).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn later_cancellation_never_refunds_more() {
        let rules = four_slab_rules();
        let mut previous = f64::MIN;
        for quarter_hours in -40..=400 {
            let result = quote(750.0, quarter_hours as f64 / 4.0, &rules);
            assert!(result.refund_amount >= previous);
            previous = result.refund_amount;
        }
    }

    #[test]
    fn rejects_bad_inputs() {
        let now = Utc::now();
        let rules = four_slab_rules();
        assert_eq!(
            calculate_refund(-1.0, now, now, &rules),
            Err(RefundError::NegativeAmount(-1.0))
        );
        assert_eq!(
            calculate_refund(f64::NAN, now, now, &rules),
            Err(RefundError::NonFiniteAmount)
        );
        let empty = RefundRules {
            slabs: Vec::new(),
            fees: RefundFees::default(),
        };
        assert_eq!(
            calculate_refund(100.0, now, now, &empty),
            Err(RefundError::EmptySlabs)
        );
    }
}
