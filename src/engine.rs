//! Deposit allocation engine.
//!
//! Turns a batch of requested amounts for one user into transactions and
//! applies each of them in its own unit of work: re-read the transaction,
//! read balances, run the waterfall, write the ledger.

use crate::decimal::Decimal4;
use crate::error::{EngineError, Result};
use crate::ledger;
use crate::plan::PlanGroups;
use crate::portfolio::{PortfolioFunds, User};
use crate::store::{Deadline, Store};
use crate::transaction::{positive_amounts, Transaction, TransactionKind};
use crate::waterfall;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::time::Duration;

/// Result of applying one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionOutcome {
    /// Allocation committed; new fund per credited portfolio.
    Applied {
        transaction: String,
        funds: PortfolioFunds,
    },

    /// The transaction had already been processed; nothing was written.
    Skipped { transaction: String },
}

impl TransactionOutcome {
    pub fn transaction(&self) -> &str {
        match self {
            TransactionOutcome::Applied { transaction, .. }
            | TransactionOutcome::Skipped { transaction } => transaction,
        }
    }
}

/// Result of one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// One entry per transaction, in processing order.
    pub outcomes: Vec<TransactionOutcome>,

    /// Latest fund of every portfolio credited by the batch.
    pub funds: PortfolioFunds,
}

impl BatchOutcome {
    fn record(&mut self, outcome: TransactionOutcome) {
        if let TransactionOutcome::Applied { funds, .. } = &outcome {
            self.funds
                .extend(funds.iter().map(|(k, v)| (k.clone(), *v)));
        }
        self.outcomes.push(outcome);
    }

    pub fn applied(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, TransactionOutcome::Applied { .. }))
            .count()
    }
}

/// Allocates deposits for users of a [`Store`].
///
/// The engine holds no balances itself; concurrent engines over the same
/// store are safe as long as the store serializes units of work.
pub struct AllocationEngine<S: Store> {
    store: S,
    unit_of_work_timeout: Option<Duration>,
}

impl<S: Store> AllocationEngine<S> {
    /// Creates an engine whose units of work are unbounded in time.
    pub fn new(store: S) -> Self {
        AllocationEngine {
            store,
            unit_of_work_timeout: None,
        }
    }

    /// Bounds every unit of work; one that overruns is rolled back.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.unit_of_work_timeout = timeout;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Creates transactions for the positive `amounts` and allocates each one.
    ///
    /// Returns an empty outcome without touching the store when no amount is
    /// positive. Plans are loaded and classified before any transaction is
    /// written, so a user without usable plans leaves nothing behind.
    ///
    /// Stops at the first failing transaction; transactions applied before it
    /// stay committed and the failing one stays unprocessed. Retry it with
    /// [`AllocationEngine::resume_pending`]; resubmitting the amount creates a
    /// second transaction.
    pub fn process_funds(
        &self,
        user_reference: &str,
        amounts: &[Decimal4],
    ) -> Result<BatchOutcome> {
        let valid = positive_amounts(amounts);
        if valid.is_empty() {
            info!("No valid fund(s) for user {}", user_reference);
            return Ok(BatchOutcome::default());
        }

        let user = self.store.find_user(user_reference)?;
        let groups = self.plan_groups(&user)?;
        let transactions = self.store.create_transactions(&user, &valid)?;

        info!(
            "Processing {} deposit(s) for user {}",
            transactions.len(),
            user.reference_id
        );
        let outcome = self.apply_all(&user, &groups, &transactions)?;
        info!(
            "Completed {} deposit(s) for user {}",
            outcome.applied(),
            user.reference_id
        );
        Ok(outcome)
    }

    /// Re-drives every unprocessed transaction of the user.
    pub fn resume_pending(&self, user_reference: &str) -> Result<BatchOutcome> {
        let user = self.store.find_user(user_reference)?;
        let pending = self.store.pending_transactions(&user)?;
        if pending.is_empty() {
            debug!("No pending transactions for user {}", user.reference_id);
            return Ok(BatchOutcome::default());
        }

        info!(
            "Resuming {} pending transaction(s) for user {}",
            pending.len(),
            user.reference_id
        );
        let groups = self.plan_groups(&user)?;
        self.apply_all(&user, &groups, &pending)
    }

    fn plan_groups(&self, user: &User) -> Result<PlanGroups> {
        PlanGroups::classify(self.store.deposit_plans(user)?)
    }

    fn apply_all(
        &self,
        user: &User,
        groups: &PlanGroups,
        transactions: &[Transaction],
    ) -> Result<BatchOutcome> {
        let mut batch = BatchOutcome::default();
        for transaction in transactions {
            let outcome = self
                .process_transaction(user, groups, transaction)
                .map_err(|e| EngineError::Transaction {
                    user: user.reference_id.clone(),
                    transaction: transaction.reference_id.clone(),
                    source: Box::new(e),
                })?;
            batch.record(outcome);
        }
        Ok(batch)
    }

    /// Applies one transaction in its own unit of work.
    ///
    /// The transaction row and every plan balance are read inside the unit of
    /// work, so the shortfall and the credit see the same state.
    pub fn process_transaction(
        &self,
        user: &User,
        groups: &PlanGroups,
        transaction: &Transaction,
    ) -> Result<TransactionOutcome> {
        let deadline = Deadline::from_timeout(self.unit_of_work_timeout);

        self.store.run_unit_of_work(deadline, |uow| {
            let current = uow.transaction(transaction.id)?;
            if current.user_id != user.id {
                return Err(EngineError::PreconditionViolation(format!(
                    "transaction {} does not belong to user {}",
                    current.reference_id, user.reference_id
                )));
            }
            if current.processed {
                warn!(
                    "Transaction {} already processed, skipping",
                    current.reference_id
                );
                return Ok(TransactionOutcome::Skipped {
                    transaction: current.reference_id,
                });
            }
            if current.kind != TransactionKind::Deposit {
                return Err(EngineError::InvalidInput(format!(
                    "transaction {} is a {}, only deposits are allocated",
                    current.reference_id, current.kind
                )));
            }
            if !current.amount.is_positive() {
                return Err(EngineError::InvalidInput(format!(
                    "transaction {} amount {} is not positive",
                    current.reference_id, current.amount
                )));
            }

            let mut balances = HashMap::new();
            for plan in groups.iter() {
                if !balances.contains_key(&plan.portfolio_id) {
                    let fund = uow.portfolio_fund(user.id, plan.portfolio_id)?;
                    balances.insert(plan.portfolio_id, fund);
                }
            }

            debug!(
                "Allocating transaction {} of {} for user {}",
                current.reference_id, current.amount, user.reference_id
            );
            let allocation = waterfall::allocate(current.amount, groups, &balances)?;
            let funds = ledger::apply(uow, &current, &allocation)?;

            Ok(TransactionOutcome::Applied {
                transaction: current.reference_id,
                funds,
            })
        })
    }

    /// Current fund per portfolio for the user.
    pub fn portfolio_funds(&self, user_reference: &str) -> Result<PortfolioFunds> {
        let user = self.store.find_user(user_reference)?;
        self.store.portfolio_funds(&user)
    }

    /// Sum of the user's funds across all portfolios.
    pub fn total_funds(&self, user_reference: &str) -> Result<Decimal4> {
        let funds = self.portfolio_funds(user_reference)?;
        Decimal4::checked_sum(funds.into_values()).ok_or_else(|| {
            EngineError::overflow(format!("total funds of user {}", user_reference))
        })
    }
}
