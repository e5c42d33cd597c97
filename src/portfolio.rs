//! Users, portfolios and the per-user portfolio balance.
//!
//! `UserPortfolio::fund` is the only shared mutable balance in the system and
//! it only ever grows.

use crate::decimal::Decimal4;
use crate::error::{EngineError, Result};
use serde::Serialize;
use std::collections::BTreeMap;

/// New fund per portfolio reference id.
pub type PortfolioFunds = BTreeMap<String, Decimal4>;

/// An account holder, identified externally by `reference_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub reference_id: String,
}

/// A constituent of a portfolio. Not used by allocation beyond display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Asset {
    pub name: String,
    pub class: String,
}

impl Asset {
    pub fn new(name: impl Into<String>, class: impl Into<String>) -> Self {
        Asset {
            name: name.into(),
            class: class.into(),
        }
    }
}

/// An investable portfolio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Portfolio {
    pub id: i64,
    pub reference_id: String,
    pub name: String,
    pub assets: Vec<Asset>,
}

/// A user's membership in a portfolio, carrying the funded balance.
///
/// # Invariants
///
/// - `fund` is never negative
/// - `fund` only increases, and only by credited allocations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPortfolio {
    pub id: i64,
    pub user_id: i64,
    pub portfolio_id: i64,
    pub fund: Decimal4,
}

impl UserPortfolio {
    /// Creates a membership with the given opening balance.
    pub fn new(id: i64, user_id: i64, portfolio_id: i64, fund: Decimal4) -> Result<Self> {
        if fund.is_negative() {
            return Err(EngineError::InvalidInput(format!(
                "opening fund {} for portfolio {} is negative",
                fund, portfolio_id
            )));
        }
        Ok(UserPortfolio {
            id,
            user_id,
            portfolio_id,
            fund,
        })
    }

    /// Credits an allocation to the balance and returns the new fund.
    ///
    /// Only strictly positive amounts are accepted.
    pub fn credit(&mut self, amount: Decimal4) -> Result<Decimal4> {
        if !amount.is_positive() {
            return Err(EngineError::InvalidInput(format!(
                "credit of {} to portfolio {} is not positive",
                amount, self.portfolio_id
            )));
        }
        self.fund = self.fund.checked_add(amount).ok_or_else(|| {
            EngineError::overflow(format!(
                "fund {} of portfolio {} plus {}",
                self.fund, self.portfolio_id, amount
            ))
        })?;
        Ok(self.fund)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal4 {
        Decimal4::from_str(s).unwrap()
    }

    #[test]
    fn test_new_membership_keeps_opening_fund() {
        let membership = UserPortfolio::new(1, 2, 3, dec("12.5")).unwrap();
        assert_eq!(membership.user_id, 2);
        assert_eq!(membership.portfolio_id, 3);
        assert_eq!(membership.fund.to_string(), "12.5000");
    }

    #[test]
    fn test_negative_opening_fund_rejected() {
        let err = UserPortfolio::new(1, 2, 3, dec("-1")).unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[test]
    fn test_credit_increases_fund() {
        let mut membership = UserPortfolio::new(1, 1, 1, Decimal4::ZERO).unwrap();
        assert_eq!(membership.credit(dec("10.0")).unwrap(), dec("10"));
        assert_eq!(membership.credit(dec("0.0001")).unwrap(), dec("10.0001"));
    }

    #[test]
    fn test_credit_rejects_non_positive_amounts() {
        let mut membership = UserPortfolio::new(1, 1, 1, dec("5")).unwrap();

        assert!(membership.credit(Decimal4::ZERO).is_err());
        assert!(membership.credit(dec("-2")).is_err());
        assert_eq!(membership.fund, dec("5"));
    }
}
