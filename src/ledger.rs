//! Ledger applier: makes one transaction's allocation durable.
//!
//! Must run inside the unit of work that read the balances the allocation was
//! computed from; every write below is conditional on that state.

use crate::error::{EngineError, Result};
use crate::portfolio::PortfolioFunds;
use crate::store::UnitOfWork;
use crate::transaction::{Deposit, Transaction};
use crate::waterfall::Allocation;
use log::debug;

/// Records deposits, credits portfolios and flags the transaction processed.
///
/// Returns the new fund of every credited portfolio. Any error leaves the
/// unit of work to roll back.
pub fn apply(
    uow: &mut dyn UnitOfWork,
    transaction: &Transaction,
    allocation: &Allocation,
) -> Result<PortfolioFunds> {
    let allocated = allocation.total()?;
    if allocated != transaction.amount {
        return Err(EngineError::Unbalanced {
            transaction: transaction.reference_id.clone(),
            expected: transaction.amount,
            allocated,
        });
    }

    for share in allocation.shares() {
        if share.user_id != transaction.user_id {
            return Err(EngineError::PreconditionViolation(format!(
                "plan {} belongs to user {}, transaction {} to user {}",
                share.plan_id, share.user_id, transaction.reference_id, transaction.user_id
            )));
        }
        uow.insert_deposit(&Deposit {
            transaction_id: transaction.id,
            plan_id: share.plan_id,
            amount: share.amount,
        })?;
    }

    let mut funds = PortfolioFunds::new();
    for (portfolio_id, portfolio_reference, amount) in allocation.by_portfolio() {
        let current = uow.portfolio_fund(transaction.user_id, portfolio_id)?;
        let updated = uow.increment_fund(transaction.user_id, portfolio_id, current, amount)?;
        debug!(
            "Credited {} to '{}': {} -> {}",
            amount, portfolio_reference, current, updated
        );
        funds.insert(portfolio_reference, updated);
    }

    uow.mark_processed(transaction.id)?;
    Ok(funds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decimal::Decimal4;
    use crate::plan::{PlanGroups, PlanKind};
    use crate::portfolio::User;
    use crate::store::{Deadline, MemoryStore, Onboarding, Store};
    use crate::waterfall::allocate;
    use std::collections::HashMap;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal4 {
        Decimal4::from_str(s).unwrap()
    }

    struct Fixture {
        store: MemoryStore,
        user: User,
        groups: PlanGroups,
        funds: HashMap<i64, Decimal4>,
    }

    fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let user = store.add_user("user-1").unwrap();
        let a = store.add_portfolio("portfolio-a", "A", &[]).unwrap();
        let b = store.add_portfolio("portfolio-b", "B", &[]).unwrap();
        store.add_user_portfolio(&user, &a, Decimal4::ZERO).unwrap();
        store.add_user_portfolio(&user, &b, dec("20")).unwrap();
        store
            .add_deposit_plan(&user, &a, PlanKind::OneTime, dec("300"))
            .unwrap();
        store
            .add_deposit_plan(&user, &b, PlanKind::OneTime, dec("700"))
            .unwrap();

        let groups = PlanGroups::classify(store.deposit_plans(&user).unwrap()).unwrap();
        let funds = HashMap::from([(a.id, Decimal4::ZERO), (b.id, dec("20"))]);
        Fixture {
            store,
            user,
            groups,
            funds,
        }
    }

    #[test]
    fn test_apply_credits_and_flags_transaction() {
        let f = fixture();
        let tx = f.store.create_transactions(&f.user, &[dec("100")]).unwrap().remove(0);
        let allocation = allocate(tx.amount, &f.groups, &f.funds).unwrap();

        let funds = f
            .store
            .run_unit_of_work(Deadline::none(), |uow| apply(uow, &tx, &allocation))
            .unwrap();

        // Shortfall is 980; 100 splits 30/70.
        assert_eq!(funds["portfolio-a"], dec("30"));
        assert_eq!(funds["portfolio-b"], dec("90"));

        let deposits = f.store.deposits_for(tx.id).unwrap();
        assert_eq!(deposits.len(), 2);
        assert_eq!(deposits.iter().map(|d| d.amount).sum::<Decimal4>(), dec("100"));
        assert!(f.store.pending_transactions(&f.user).unwrap().is_empty());
    }

    #[test]
    fn test_unbalanced_allocation_is_rejected() {
        let f = fixture();
        let tx = f.store.create_transactions(&f.user, &[dec("100")]).unwrap().remove(0);
        let allocation = allocate(dec("99"), &f.groups, &f.funds).unwrap();

        let err = f
            .store
            .run_unit_of_work(Deadline::none(), |uow| apply(uow, &tx, &allocation))
            .unwrap_err();

        assert!(matches!(err, EngineError::Unbalanced { .. }));
        assert!(f.store.deposits_for(tx.id).unwrap().is_empty());
        assert_eq!(f.store.pending_transactions(&f.user).unwrap().len(), 1);
    }

    #[test]
    fn test_foreign_plan_is_rejected() {
        let f = fixture();
        let stranger = f.store.add_user("user-2").unwrap();
        let tx = f
            .store
            .create_transactions(&stranger, &[dec("100")])
            .unwrap()
            .remove(0);
        let allocation = allocate(tx.amount, &f.groups, &f.funds).unwrap();

        let err = f
            .store
            .run_unit_of_work(Deadline::none(), |uow| apply(uow, &tx, &allocation))
            .unwrap_err();

        assert!(matches!(err, EngineError::PreconditionViolation(_)));
        assert_eq!(
            f.store.portfolio_funds(&f.user).unwrap()["portfolio-b"],
            dec("20")
        );
    }
}
