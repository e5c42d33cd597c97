//! Proportional distribution of an amount across one plan group.
//!
//! Every plan but the last receives `amount × target / total`; the last plan
//! receives whatever is left. The split therefore always adds up to `amount`
//! exactly, at the price of the last plan absorbing the rounding.

use crate::decimal::Decimal4;
use crate::error::{EngineError, Result};
use crate::plan::UserDepositPlan;
use log::debug;

/// Portion of an amount attributed to one plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanShare {
    pub plan_id: i64,
    pub user_id: i64,
    pub portfolio_id: i64,
    pub portfolio_reference: String,
    pub amount: Decimal4,
}

/// Splits `amount` across `plans` in proportion to their targets.
///
/// Only plans receiving a non-zero share appear in the result, in plan order.
/// Distribution stops as soon as nothing is left to hand out.
pub fn distribute(amount: Decimal4, plans: &[UserDepositPlan]) -> Result<Vec<PlanShare>> {
    if amount.is_negative() {
        return Err(EngineError::InvalidInput(format!(
            "cannot distribute negative amount {}",
            amount
        )));
    }
    if plans.is_empty() {
        return Err(EngineError::PreconditionViolation(
            "cannot distribute across an empty plan group".to_string(),
        ));
    }
    if amount.is_zero() {
        return Ok(Vec::new());
    }

    let total = Decimal4::checked_sum(plans.iter().map(|plan| plan.target_amount))
        .ok_or_else(|| EngineError::overflow("sum of plan targets"))?;
    if !total.is_positive() {
        return Err(EngineError::PreconditionViolation(format!(
            "plan group targets sum to {}, cannot split {} proportionally",
            total, amount
        )));
    }

    let last = plans.len() - 1;
    let mut remainder = amount;
    let mut shares = Vec::with_capacity(plans.len());

    for (i, plan) in plans.iter().enumerate() {
        let allocated = if i == last {
            remainder
        } else {
            amount
                .share(plan.target_amount, total)
                .ok_or_else(|| {
                    EngineError::InvalidInput(format!(
                        "amount {} overflows proportional split",
                        amount
                    ))
                })?
                .min(remainder)
        };

        remainder -= allocated;

        debug!(
            "Allocated {} to '{}' deposit plan {}, remainder {}",
            allocated, plan.portfolio_reference, plan.id, remainder
        );

        if allocated.is_positive() {
            shares.push(PlanShare {
                plan_id: plan.id,
                user_id: plan.user_id,
                portfolio_id: plan.portfolio_id,
                portfolio_reference: plan.portfolio_reference.clone(),
                amount: allocated,
            });
        }

        if !remainder.is_positive() {
            break;
        }
    }

    Ok(shares)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::PlanKind;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal4 {
        Decimal4::from_str(s).unwrap()
    }

    fn plan(id: i64, target: &str) -> UserDepositPlan {
        UserDepositPlan {
            id,
            user_id: 1,
            portfolio_id: id * 10,
            portfolio_reference: format!("portfolio-{}", id),
            kind: PlanKind::OneTime,
            target_amount: dec(target),
        }
    }

    fn total(shares: &[PlanShare]) -> Decimal4 {
        shares.iter().map(|s| s.amount).sum()
    }

    #[test]
    fn test_thirty_seventy_split() {
        let shares = distribute(dec("100"), &[plan(1, "300"), plan(2, "700")]).unwrap();

        assert_eq!(shares.len(), 2);
        assert_eq!(shares[0].amount, dec("30"));
        assert_eq!(shares[0].portfolio_id, 10);
        assert_eq!(shares[1].amount, dec("70"));
        assert_eq!(total(&shares), dec("100"));
    }

    #[test]
    fn test_last_plan_absorbs_rounding() {
        let plans = [plan(1, "1"), plan(2, "1"), plan(3, "1")];
        let shares = distribute(dec("100"), &plans).unwrap();

        assert_eq!(shares[0].amount, dec("33.3333"));
        assert_eq!(shares[1].amount, dec("33.3333"));
        assert_eq!(shares[2].amount, dec("33.3334"));
        assert_eq!(total(&shares), dec("100"));
    }

    #[test]
    fn test_conservation_for_awkward_amounts() {
        let plans = [plan(1, "10000"), plan(2, "500"), plan(3, "0.0007"), plan(4, "13")];
        for amount in ["0.0001", "0.0003", "1", "10501.37", "3000050025", "7.7777"] {
            let shares = distribute(dec(amount), &plans).unwrap();
            assert_eq!(total(&shares), dec(amount), "amount {}", amount);
        }
    }

    #[test]
    fn test_single_plan_takes_everything() {
        let shares = distribute(dec("12.3456"), &[plan(1, "5")]).unwrap();
        assert_eq!(shares.len(), 1);
        assert_eq!(shares[0].amount, dec("12.3456"));
    }

    #[test]
    fn test_zero_target_plan_gets_no_deposit() {
        let shares = distribute(dec("50"), &[plan(1, "0"), plan(2, "10")]).unwrap();
        assert_eq!(shares.len(), 1);
        assert_eq!(shares[0].plan_id, 2);
        assert_eq!(shares[0].amount, dec("50"));
    }

    #[test]
    fn test_stops_once_remainder_is_exhausted() {
        // The first share already rounds to the whole amount.
        let shares = distribute(dec("0.0001"), &[plan(1, "999"), plan(2, "1")]).unwrap();
        assert_eq!(total(&shares), dec("0.0001"));
        assert!(shares.iter().all(|s| s.amount.is_positive()));
    }

    #[test]
    fn test_zero_amount_distributes_nothing() {
        assert!(distribute(Decimal4::ZERO, &[plan(1, "5")]).unwrap().is_empty());
    }

    #[test]
    fn test_zero_total_is_precondition_violation() {
        let err = distribute(dec("10"), &[plan(1, "0"), plan(2, "0")]).unwrap_err();
        assert!(matches!(err, EngineError::PreconditionViolation(_)));
    }

    #[test]
    fn test_empty_group_is_precondition_violation() {
        let err = distribute(dec("10"), &[]).unwrap_err();
        assert!(matches!(err, EngineError::PreconditionViolation(_)));
    }

    #[test]
    fn test_negative_amount_is_invalid_input() {
        let err = distribute(dec("-1"), &[plan(1, "5")]).unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[test]
    fn test_same_inputs_same_split() {
        let plans = [plan(1, "3"), plan(2, "7"), plan(3, "11")];
        let first = distribute(dec("99.99"), &plans).unwrap();
        let second = distribute(dec("99.99"), &plans).unwrap();
        assert_eq!(first, second);
    }
}
