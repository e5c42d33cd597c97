//! Persistence contracts consumed by the engine.
//!
//! [`Store`] covers plain reads and record creation; every balance mutation
//! goes through a [`UnitOfWork`], which only exists inside
//! [`Store::run_unit_of_work`] and commits or rolls back as a whole.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::decimal::Decimal4;
use crate::error::{PersistenceError, Result};
use crate::plan::{PlanKind, UserDepositPlan};
use crate::portfolio::{Asset, Portfolio, PortfolioFunds, User, UserPortfolio};
use crate::transaction::{Deposit, Transaction};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Optional point in time after which a unit of work must not commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// No deadline.
    pub fn none() -> Self {
        Deadline(None)
    }

    /// Deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Deadline(Some(Instant::now() + timeout))
    }

    /// Deadline from an optional timeout; `None` means unbounded.
    pub fn from_timeout(timeout: Option<Duration>) -> Self {
        timeout.map(Deadline::after).unwrap_or_default()
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.0, Some(at) if Instant::now() >= at)
    }

    /// Fails with `DeadlineExceeded` once the deadline has passed.
    pub fn check(&self) -> std::result::Result<(), PersistenceError> {
        if self.is_expired() {
            Err(PersistenceError::DeadlineExceeded)
        } else {
            Ok(())
        }
    }
}

/// Operations available inside one atomic unit of work.
pub trait UnitOfWork {
    /// Re-reads a transaction row.
    fn transaction(&mut self, transaction_id: i64) -> Result<Transaction>;

    /// Current fund of a user's portfolio membership.
    fn portfolio_fund(&mut self, user_id: i64, portfolio_id: i64) -> Result<Decimal4>;

    /// Appends a deposit row; a second row for the same transaction and plan is a conflict.
    fn insert_deposit(&mut self, deposit: &Deposit) -> Result<()>;

    /// Adds `amount` to the fund, provided it still equals `expected`.
    ///
    /// Returns the new fund.
    fn increment_fund(
        &mut self,
        user_id: i64,
        portfolio_id: i64,
        expected: Decimal4,
        amount: Decimal4,
    ) -> Result<Decimal4>;

    /// Flags the transaction processed; fails if it already was.
    fn mark_processed(&mut self, transaction_id: i64) -> Result<()>;
}

/// Storage collaborator of the engine.
pub trait Store {
    /// Looks a user up by external reference.
    fn find_user(&self, reference_id: &str) -> Result<User>;

    /// The user's deposit plans in creation order (possibly empty).
    fn deposit_plans(&self, user: &User) -> Result<Vec<UserDepositPlan>>;

    /// Persists one unprocessed transaction per amount, in order.
    fn create_transactions(&self, user: &User, amounts: &[Decimal4]) -> Result<Vec<Transaction>>;

    /// The user's transactions that were never processed, oldest first.
    fn pending_transactions(&self, user: &User) -> Result<Vec<Transaction>>;

    /// Current fund of every portfolio the user holds.
    fn portfolio_funds(&self, user: &User) -> Result<PortfolioFunds>;

    /// Deposit rows recorded for a transaction.
    fn deposits_for(&self, transaction_id: i64) -> Result<Vec<Deposit>>;

    /// Runs `work` atomically: everything it wrote is committed if it returns
    /// `Ok` before `deadline`, nothing otherwise.
    fn run_unit_of_work<T, F>(&self, deadline: Deadline, work: F) -> Result<T>
    where
        F: FnOnce(&mut dyn UnitOfWork) -> Result<T>;
}

/// Record creation used by onboarding and seeding.
pub trait Onboarding {
    fn add_user(&self, reference_id: &str) -> Result<User>;

    fn add_portfolio(&self, reference_id: &str, name: &str, assets: &[Asset]) -> Result<Portfolio>;

    fn add_user_portfolio(
        &self,
        user: &User,
        portfolio: &Portfolio,
        fund: Decimal4,
    ) -> Result<UserPortfolio>;

    fn add_deposit_plan(
        &self,
        user: &User,
        portfolio: &Portfolio,
        kind: PlanKind,
        target_amount: Decimal4,
    ) -> Result<UserDepositPlan>;
}

impl<S: Store> Store for Arc<S> {
    fn find_user(&self, reference_id: &str) -> Result<User> {
        (**self).find_user(reference_id)
    }

    fn deposit_plans(&self, user: &User) -> Result<Vec<UserDepositPlan>> {
        (**self).deposit_plans(user)
    }

    fn create_transactions(&self, user: &User, amounts: &[Decimal4]) -> Result<Vec<Transaction>> {
        (**self).create_transactions(user, amounts)
    }

    fn pending_transactions(&self, user: &User) -> Result<Vec<Transaction>> {
        (**self).pending_transactions(user)
    }

    fn portfolio_funds(&self, user: &User) -> Result<PortfolioFunds> {
        (**self).portfolio_funds(user)
    }

    fn deposits_for(&self, transaction_id: i64) -> Result<Vec<Deposit>> {
        (**self).deposits_for(transaction_id)
    }

    fn run_unit_of_work<T, F>(&self, deadline: Deadline, work: F) -> Result<T>
    where
        F: FnOnce(&mut dyn UnitOfWork) -> Result<T>,
    {
        (**self).run_unit_of_work(deadline, work)
    }
}

impl<O: Onboarding> Onboarding for Arc<O> {
    fn add_user(&self, reference_id: &str) -> Result<User> {
        (**self).add_user(reference_id)
    }

    fn add_portfolio(&self, reference_id: &str, name: &str, assets: &[Asset]) -> Result<Portfolio> {
        (**self).add_portfolio(reference_id, name, assets)
    }

    fn add_user_portfolio(
        &self,
        user: &User,
        portfolio: &Portfolio,
        fund: Decimal4,
    ) -> Result<UserPortfolio> {
        (**self).add_user_portfolio(user, portfolio, fund)
    }

    fn add_deposit_plan(
        &self,
        user: &User,
        portfolio: &Portfolio,
        kind: PlanKind,
        target_amount: Decimal4,
    ) -> Result<UserDepositPlan> {
        (**self).add_deposit_plan(user, portfolio, kind, target_amount)
    }
}
