//! Priority waterfall: decides how much of one transaction goes to each plan group.
//!
//! 1. Fill the one-time group's shortfall.
//! 2. Fill the monthly group's shortfall from what is left.
//! 3. Split any leftover evenly between the groups (a lone group takes all of it).
//!
//! Each step hands its amount to the proportional distributor.

use crate::decimal::Decimal4;
use crate::distributor::{distribute, PlanShare};
use crate::error::{EngineError, Result};
use crate::plan::{PlanGroups, PlanKind, UserDepositPlan};
use log::debug;
use std::collections::HashMap;

/// Target, funded balance and shortfall of one plan group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupState {
    pub target: Decimal4,
    pub funded: Decimal4,
    /// `target - funded`, never below zero.
    pub shortfall: Decimal4,
}

impl GroupState {
    /// Measures a group against current balances keyed by portfolio id.
    ///
    /// A portfolio shared by several plans counts once per plan.
    pub fn measure(plans: &[UserDepositPlan], funds: &HashMap<i64, Decimal4>) -> Result<Self> {
        let mut target = Decimal4::ZERO;
        let mut funded = Decimal4::ZERO;

        for plan in plans {
            let fund = *funds.get(&plan.portfolio_id).ok_or_else(|| {
                EngineError::not_found("User portfolio", &plan.portfolio_reference)
            })?;
            target = target
                .checked_add(plan.target_amount)
                .ok_or_else(|| EngineError::overflow("sum of plan targets"))?;
            funded = funded
                .checked_add(fund)
                .ok_or_else(|| EngineError::overflow("sum of plan funds"))?;
        }

        let shortfall = target
            .checked_sub(funded)
            .ok_or_else(|| EngineError::overflow("group shortfall"))?
            .max(Decimal4::ZERO);
        Ok(GroupState {
            target,
            funded,
            shortfall,
        })
    }
}

/// Allocation outcome of one transaction.
///
/// Shares are merged per plan so that each plan yields at most one deposit,
/// and kept in the order plans were first funded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Allocation {
    shares: Vec<PlanShare>,
}

impl Allocation {
    fn add(&mut self, share: PlanShare) {
        match self.shares.iter_mut().find(|s| s.plan_id == share.plan_id) {
            Some(existing) => existing.amount += share.amount,
            None => self.shares.push(share),
        }
    }

    fn extend(&mut self, shares: Vec<PlanShare>) {
        for share in shares {
            self.add(share);
        }
    }

    /// Per-plan amounts, one entry per funded plan.
    pub fn shares(&self) -> &[PlanShare] {
        &self.shares
    }

    /// Sum of everything allocated.
    pub fn total(&self) -> Result<Decimal4> {
        Decimal4::checked_sum(self.shares.iter().map(|s| s.amount))
            .ok_or_else(|| EngineError::overflow("allocation total"))
    }

    /// Amount per portfolio as `(portfolio_id, portfolio_reference, amount)`,
    /// in first-funded order.
    pub fn by_portfolio(&self) -> Vec<(i64, String, Decimal4)> {
        let mut totals: Vec<(i64, String, Decimal4)> = Vec::new();
        for share in &self.shares {
            match totals.iter_mut().find(|(id, _, _)| *id == share.portfolio_id) {
                Some((_, _, amount)) => *amount += share.amount,
                None => totals.push((
                    share.portfolio_id,
                    share.portfolio_reference.clone(),
                    share.amount,
                )),
            }
        }
        totals
    }

    /// Amount allocated to one portfolio reference, zero if untouched.
    pub fn portfolio_amount(&self, portfolio_reference: &str) -> Decimal4 {
        self.shares
            .iter()
            .filter(|s| s.portfolio_reference == portfolio_reference)
            .map(|s| s.amount)
            .sum()
    }
}

/// Allocates one transaction amount across the plan groups.
///
/// `funds` must hold the current balance of every portfolio referenced by a
/// plan, read inside the same unit of work that will apply the result.
pub fn allocate(
    amount: Decimal4,
    groups: &PlanGroups,
    funds: &HashMap<i64, Decimal4>,
) -> Result<Allocation> {
    if !amount.is_positive() {
        return Err(EngineError::InvalidInput(format!(
            "transaction amount {} is not positive",
            amount
        )));
    }
    if groups.is_empty() {
        return Err(EngineError::PreconditionViolation(
            "no deposit plans to fund".to_string(),
        ));
    }

    let one_time = GroupState::measure(groups.one_time(), funds)?;
    let monthly = GroupState::measure(groups.monthly(), funds)?;

    let mut allocation = Allocation::default();
    let mut remaining = amount;

    for (kind, state) in [(PlanKind::OneTime, one_time), (PlanKind::Monthly, monthly)] {
        let fill = remaining.min(state.shortfall);
        if fill.is_positive() {
            debug!(
                "Depositing {} to {} plans (shortfall {})",
                fill, kind, state.shortfall
            );
            allocation.extend(distribute(fill, groups.group(kind))?);
            remaining -= fill;
        }
    }

    if remaining.is_positive() {
        split_leftover(remaining, groups, &mut allocation)?;
    }

    Ok(allocation)
}

/// Both groups are funded to target: half of the leftover each, the monthly
/// group taking the exact complement.
fn split_leftover(
    leftover: Decimal4,
    groups: &PlanGroups,
    allocation: &mut Allocation,
) -> Result<()> {
    let one_time = groups.one_time();
    let monthly = groups.monthly();

    match (one_time.is_empty(), monthly.is_empty()) {
        (false, false) => {
            let half = leftover.half();
            debug!(
                "Equally splitting {}: {} to onetime plans, {} to monthly plans",
                leftover,
                half,
                leftover - half
            );
            allocation.extend(distribute(half, one_time)?);
            allocation.extend(distribute(leftover - half, monthly)?);
        }
        (false, true) => {
            debug!("Depositing leftover {} to onetime plans", leftover);
            allocation.extend(distribute(leftover, one_time)?);
        }
        (true, false) => {
            debug!("Depositing leftover {} to monthly plans", leftover);
            allocation.extend(distribute(leftover, monthly)?);
        }
        (true, true) => {
            return Err(EngineError::PreconditionViolation(
                "no deposit plans to fund".to_string(),
            ))
        }
    }

    Ok(())
}
