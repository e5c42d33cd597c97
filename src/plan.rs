//! Deposit plans and their classification into priority groups.

use crate::decimal::Decimal4;
use crate::error::{EngineError, Result};
use std::fmt;
use std::str::FromStr;

/// The kind of standing deposit instruction.
///
/// The waterfall has one fill step per kind, so adding a variant here is a
/// change to the allocation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlanKind {
    /// Funded once up to its target; filled first.
    OneTime,

    /// Recurring instruction; filled after one-time plans.
    Monthly,
}

impl PlanKind {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanKind::OneTime => "onetime",
            PlanKind::Monthly => "monthly",
        }
    }
}

impl fmt::Display for PlanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "onetime" | "one-time" | "one_time" => Ok(PlanKind::OneTime),
            "monthly" => Ok(PlanKind::Monthly),
            other => Err(EngineError::InvalidInput(format!(
                "unknown plan kind '{}'",
                other
            ))),
        }
    }
}

/// A user's standing instruction to fund a portfolio up to `target_amount`.
///
/// `portfolio_reference` is carried alongside the row id so that allocation
/// results can be keyed by the portfolio's external identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserDepositPlan {
    pub id: i64,
    pub user_id: i64,
    pub portfolio_id: i64,
    pub portfolio_reference: String,
    pub kind: PlanKind,
    pub target_amount: Decimal4,
}

/// A user's plans partitioned by priority, input order preserved in each group.
#[derive(Debug, Clone, Default)]
pub struct PlanGroups {
    one_time: Vec<UserDepositPlan>,
    monthly: Vec<UserDepositPlan>,
}

impl PlanGroups {
    /// Partitions plans into one-time and monthly groups.
    ///
    /// Fails if there is nothing to fund or a plan carries a negative target.
    pub fn classify(plans: Vec<UserDepositPlan>) -> Result<Self> {
        let mut groups = PlanGroups::default();

        for plan in plans {
            if plan.target_amount.is_negative() {
                return Err(EngineError::PreconditionViolation(format!(
                    "deposit plan {} has negative target {}",
                    plan.id, plan.target_amount
                )));
            }
            match plan.kind {
                PlanKind::OneTime => groups.one_time.push(plan),
                PlanKind::Monthly => groups.monthly.push(plan),
            }
        }

        if groups.is_empty() {
            return Err(EngineError::PreconditionViolation(
                "no deposit plans to fund".to_string(),
            ));
        }

        Ok(groups)
    }

    pub fn one_time(&self) -> &[UserDepositPlan] {
        &self.one_time
    }

    pub fn monthly(&self) -> &[UserDepositPlan] {
        &self.monthly
    }

    /// Plans of the given kind.
    pub fn group(&self, kind: PlanKind) -> &[UserDepositPlan] {
        match kind {
            PlanKind::OneTime => &self.one_time,
            PlanKind::Monthly => &self.monthly,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.one_time.is_empty() && self.monthly.is_empty()
    }

    /// All plans, one-time group first.
    pub fn iter(&self) -> impl Iterator<Item = &UserDepositPlan> {
        self.one_time.iter().chain(self.monthly.iter())
    }
}
