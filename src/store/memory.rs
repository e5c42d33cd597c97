//! In-process store.
//!
//! The whole state sits behind one mutex. A unit of work runs against a clone
//! of the state and the clone replaces the original only when the work
//! succeeds before its deadline, so units of work are serializable and a
//! failure leaves nothing behind.
//!
//! Every unit of work copies all records, so a batch slows down as the store
//! grows. Meant for tests and short-lived runs; use [`super::SqliteStore`]
//! for anything long-lived.

use super::{Deadline, Onboarding, Store, UnitOfWork};
use crate::decimal::Decimal4;
use crate::error::{EngineError, Result};
use crate::plan::{PlanKind, UserDepositPlan};
use crate::portfolio::{Asset, Portfolio, PortfolioFunds, User, UserPortfolio};
use crate::transaction::{Deposit, Transaction, TransactionKind};
use log::warn;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
struct MemoryState {
    last_id: i64,
    users: Vec<User>,
    portfolios: Vec<Portfolio>,
    user_portfolios: Vec<UserPortfolio>,
    plans: Vec<UserDepositPlan>,
    transactions: Vec<Transaction>,
    deposits: Vec<Deposit>,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn membership_mut(&mut self, user_id: i64, portfolio_id: i64) -> Result<&mut UserPortfolio> {
        self.user_portfolios
            .iter_mut()
            .find(|m| m.user_id == user_id && m.portfolio_id == portfolio_id)
            .ok_or_else(|| {
                EngineError::not_found(
                    "User portfolio",
                    format!("user {} portfolio {}", user_id, portfolio_id),
                )
            })
    }

    fn transaction_mut(&mut self, transaction_id: i64) -> Result<&mut Transaction> {
        self.transactions
            .iter_mut()
            .find(|t| t.id == transaction_id)
            .ok_or_else(|| EngineError::not_found("Transaction", transaction_id))
    }
}

/// Store keeping every record in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the state, recovering it from a panicked holder.
    ///
    /// Units of work only swap their clone in on success, so a panic leaves
    /// the last committed state behind.
    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("Recovering memory store after a panicked unit of work");
            poisoned.into_inner()
        })
    }
}

struct MemoryUnit<'a> {
    state: &'a mut MemoryState,
}

impl UnitOfWork for MemoryUnit<'_> {
    fn transaction(&mut self, transaction_id: i64) -> Result<Transaction> {
        self.state.transaction_mut(transaction_id).map(|t| t.clone())
    }

    fn portfolio_fund(&mut self, user_id: i64, portfolio_id: i64) -> Result<Decimal4> {
        self.state
            .membership_mut(user_id, portfolio_id)
            .map(|m| m.fund)
    }

    fn insert_deposit(&mut self, deposit: &Deposit) -> Result<()> {
        let duplicate = self.state.deposits.iter().any(|d| {
            d.transaction_id == deposit.transaction_id && d.plan_id == deposit.plan_id
        });
        if duplicate {
            return Err(EngineError::conflict(format!(
                "deposit for transaction {} and plan {} already recorded",
                deposit.transaction_id, deposit.plan_id
            )));
        }
        self.state.deposits.push(deposit.clone());
        Ok(())
    }

    fn increment_fund(
        &mut self,
        user_id: i64,
        portfolio_id: i64,
        expected: Decimal4,
        amount: Decimal4,
    ) -> Result<Decimal4> {
        let membership = self.state.membership_mut(user_id, portfolio_id)?;
        if membership.fund != expected {
            return Err(EngineError::conflict(format!(
                "fund of portfolio {} changed from {} to {}",
                portfolio_id, expected, membership.fund
            )));
        }
        membership.credit(amount)
    }

    fn mark_processed(&mut self, transaction_id: i64) -> Result<()> {
        let transaction = self.state.transaction_mut(transaction_id)?;
        if transaction.processed {
            return Err(EngineError::conflict(format!(
                "transaction {} already processed",
                transaction.reference_id
            )));
        }
        transaction.processed = true;
        Ok(())
    }
}

impl Store for MemoryStore {
    fn find_user(&self, reference_id: &str) -> Result<User> {
        self.lock()
            .users
            .iter()
            .find(|u| u.reference_id == reference_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("User", reference_id))
    }

    fn deposit_plans(&self, user: &User) -> Result<Vec<UserDepositPlan>> {
        Ok(self
            .lock()
            .plans
            .iter()
            .filter(|p| p.user_id == user.id)
            .cloned()
            .collect())
    }

    fn create_transactions(&self, user: &User, amounts: &[Decimal4]) -> Result<Vec<Transaction>> {
        let mut state = self.lock();
        if !state.users.iter().any(|u| u.id == user.id) {
            return Err(EngineError::not_found("User", &user.reference_id));
        }

        let mut created = Vec::with_capacity(amounts.len());
        for &amount in amounts {
            let transaction = Transaction {
                id: state.next_id(),
                reference_id: Uuid::new_v4().to_string(),
                user_id: user.id,
                kind: TransactionKind::Deposit,
                amount,
                processed: false,
            };
            state.transactions.push(transaction.clone());
            created.push(transaction);
        }
        Ok(created)
    }

    fn pending_transactions(&self, user: &User) -> Result<Vec<Transaction>> {
        Ok(self
            .lock()
            .transactions
            .iter()
            .filter(|t| t.user_id == user.id && !t.processed)
            .cloned()
            .collect())
    }

    fn portfolio_funds(&self, user: &User) -> Result<PortfolioFunds> {
        let state = self.lock();
        let mut funds = PortfolioFunds::new();
        for membership in state.user_portfolios.iter().filter(|m| m.user_id == user.id) {
            let portfolio = state
                .portfolios
                .iter()
                .find(|p| p.id == membership.portfolio_id)
                .ok_or_else(|| EngineError::not_found("Portfolio", membership.portfolio_id))?;
            funds.insert(portfolio.reference_id.clone(), membership.fund);
        }
        Ok(funds)
    }

    fn deposits_for(&self, transaction_id: i64) -> Result<Vec<Deposit>> {
        Ok(self
            .lock()
            .deposits
            .iter()
            .filter(|d| d.transaction_id == transaction_id)
            .cloned()
            .collect())
    }

    fn run_unit_of_work<T, F>(&self, deadline: Deadline, work: F) -> Result<T>
    where
        F: FnOnce(&mut dyn UnitOfWork) -> Result<T>,
    {
        let mut state = self.lock();
        deadline.check()?;

        let mut working = state.clone();
        let result = work(&mut MemoryUnit {
            state: &mut working,
        })
        .and_then(|value| {
            deadline.check()?;
            Ok(value)
        });

        match result {
            Ok(value) => {
                *state = working;
                Ok(value)
            }
            Err(e) => {
                warn!("Unit of work rolled back: {}", e);
                Err(e)
            }
        }
    }
}

impl Onboarding for MemoryStore {
    fn add_user(&self, reference_id: &str) -> Result<User> {
        let mut state = self.lock();
        if state.users.iter().any(|u| u.reference_id == reference_id) {
            return Err(EngineError::conflict(format!(
                "user {} already exists",
                reference_id
            )));
        }
        let user = User {
            id: state.next_id(),
            reference_id: reference_id.to_string(),
        };
        state.users.push(user.clone());
        Ok(user)
    }

    fn add_portfolio(&self, reference_id: &str, name: &str, assets: &[Asset]) -> Result<Portfolio> {
        let mut state = self.lock();
        if state.portfolios.iter().any(|p| p.reference_id == reference_id) {
            return Err(EngineError::conflict(format!(
                "portfolio {} already exists",
                reference_id
            )));
        }
        let portfolio = Portfolio {
            id: state.next_id(),
            reference_id: reference_id.to_string(),
            name: name.to_string(),
            assets: assets.to_vec(),
        };
        state.portfolios.push(portfolio.clone());
        Ok(portfolio)
    }

    fn add_user_portfolio(
        &self,
        user: &User,
        portfolio: &Portfolio,
        fund: Decimal4,
    ) -> Result<UserPortfolio> {
        let mut state = self.lock();
        let exists = state
            .user_portfolios
            .iter()
            .any(|m| m.user_id == user.id && m.portfolio_id == portfolio.id);
        if exists {
            return Err(EngineError::conflict(format!(
                "user {} already holds portfolio {}",
                user.reference_id, portfolio.reference_id
            )));
        }
        let id = state.next_id();
        let membership = UserPortfolio::new(id, user.id, portfolio.id, fund)?;
        state.user_portfolios.push(membership.clone());
        Ok(membership)
    }

    fn add_deposit_plan(
        &self,
        user: &User,
        portfolio: &Portfolio,
        kind: PlanKind,
        target_amount: Decimal4,
    ) -> Result<UserDepositPlan> {
        if target_amount.is_negative() {
            return Err(EngineError::InvalidInput(format!(
                "plan target {} is negative",
                target_amount
            )));
        }
        let mut state = self.lock();
        let exists = state.plans.iter().any(|p| {
            p.user_id == user.id && p.portfolio_id == portfolio.id && p.kind == kind
        });
        if exists {
            return Err(EngineError::conflict(format!(
                "user {} already has a {} plan for portfolio {}",
                user.reference_id, kind, portfolio.reference_id
            )));
        }
        let plan = UserDepositPlan {
            id: state.next_id(),
            user_id: user.id,
            portfolio_id: portfolio.id,
            portfolio_reference: portfolio.reference_id.clone(),
            kind,
            target_amount,
        };
        state.plans.push(plan.clone());
        Ok(plan)
    }
}
