//! SQLite store.
//!
//! Each handle owns one connection. Units of work run as `BEGIN IMMEDIATE`
//! transactions, so the write lock is held from the first balance read to the
//! commit and concurrent handles on the same database file queue behind it.
//! Money is stored as 4-place TEXT.

use super::{Deadline, Onboarding, Store, UnitOfWork};
use crate::config::{Config, DatabaseLocation};
use crate::decimal::Decimal4;
use crate::error::{EngineError, PersistenceError, Result};
use crate::plan::{PlanKind, UserDepositPlan};
use crate::portfolio::{Asset, Portfolio, PortfolioFunds, User, UserPortfolio};
use crate::transaction::{Deposit, Transaction, TransactionKind};
use log::{debug, warn};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

const SCHEMA: &str = include_str!("schema.sql");
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

impl ToSql for Decimal4 {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.to_string()))
    }
}

impl FromSql for Decimal4 {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        Decimal4::from_str(text).map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

fn kind_from_sql<K>(text: String) -> rusqlite::Result<K>
where
    K: FromStr<Err = EngineError>,
{
    K::from_str(&text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Maps constraint violations to write conflicts, everything else to SQLite failures.
fn constraint_conflict(err: rusqlite::Error, message: impl FnOnce() -> String) -> EngineError {
    match err {
        rusqlite::Error::SqliteFailure(ref failure, _)
            if failure.code == ErrorCode::ConstraintViolation =>
        {
            EngineError::conflict(message())
        }
        other => other.into(),
    }
}

fn transaction_from_row(row: &Row<'_>) -> rusqlite::Result<Transaction> {
    Ok(Transaction {
        id: row.get(0)?,
        reference_id: row.get(1)?,
        user_id: row.get(2)?,
        amount: row.get(3)?,
        processed: row.get(4)?,
        kind: kind_from_sql(row.get(5)?)?,
    })
}

const TRANSACTION_COLUMNS: &str = "id, reference_id, user_id, amount, processed, kind";

/// Store backed by a SQLite database.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (creating if needed) a database file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        // WAL is unavailable on some filesystems; the default journal still works.
        match conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        }) {
            Ok(mode) => debug!("Journal mode: {}", mode),
            Err(e) => warn!("Cannot enable WAL journal: {}", e),
        }
        Self::with_connection(conn)
    }

    /// Opens a private in-memory database.
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    /// Opens the configured database and applies the schema when asked to.
    pub fn connect(config: &Config) -> Result<Self> {
        let store = match &config.database {
            DatabaseLocation::Memory => Self::in_memory()?,
            DatabaseLocation::File(path) => Self::open(path)?,
        };
        if config.auto_migrate {
            store.migrate()?;
        }
        Ok(store)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    /// Creates any missing tables.
    pub fn migrate(&self) -> Result<()> {
        self.lock()?.execute_batch(SCHEMA)?;
        debug!("Database schema is up to date");
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| EngineError::Persistence(PersistenceError::Poisoned))
    }
}

struct SqliteUnit<'a> {
    conn: &'a Connection,
}

impl UnitOfWork for SqliteUnit<'_> {
    fn transaction(&mut self, transaction_id: i64) -> Result<Transaction> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM transactions WHERE id = ?1",
                    TRANSACTION_COLUMNS
                ),
                params![transaction_id],
                transaction_from_row,
            )
            .optional()?
            .ok_or_else(|| EngineError::not_found("Transaction", transaction_id))
    }

    fn portfolio_fund(&mut self, user_id: i64, portfolio_id: i64) -> Result<Decimal4> {
        self.conn
            .query_row(
                "SELECT fund FROM user_portfolios WHERE user_id = ?1 AND portfolio_id = ?2",
                params![user_id, portfolio_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| {
                EngineError::not_found(
                    "User portfolio",
                    format!("user {} portfolio {}", user_id, portfolio_id),
                )
            })
    }

    fn insert_deposit(&mut self, deposit: &Deposit) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO deposits (transaction_id, plan_id, amount) VALUES (?1, ?2, ?3)",
                params![deposit.transaction_id, deposit.plan_id, deposit.amount],
            )
            .map_err(|e| {
                constraint_conflict(e, || {
                    format!(
                        "deposit for transaction {} and plan {} rejected",
                        deposit.transaction_id, deposit.plan_id
                    )
                })
            })?;
        Ok(())
    }

    fn increment_fund(
        &mut self,
        user_id: i64,
        portfolio_id: i64,
        expected: Decimal4,
        amount: Decimal4,
    ) -> Result<Decimal4> {
        if !amount.is_positive() {
            return Err(EngineError::InvalidInput(format!(
                "credit of {} to portfolio {} is not positive",
                amount, portfolio_id
            )));
        }
        let updated = expected.checked_add(amount).ok_or_else(|| {
            EngineError::overflow(format!(
                "fund {} of portfolio {} plus {}",
                expected, portfolio_id, amount
            ))
        })?;
        let changed = self.conn.execute(
            "UPDATE user_portfolios SET fund = ?1, updated_at = CURRENT_TIMESTAMP \
             WHERE user_id = ?2 AND portfolio_id = ?3 AND fund = ?4",
            params![updated, user_id, portfolio_id, expected],
        )?;
        if changed == 0 {
            return Err(EngineError::conflict(format!(
                "fund of portfolio {} for user {} is no longer {}",
                portfolio_id, user_id, expected
            )));
        }
        Ok(updated)
    }

    fn mark_processed(&mut self, transaction_id: i64) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE transactions SET processed = 1 WHERE id = ?1 AND processed = 0",
            params![transaction_id],
        )?;
        if changed == 0 {
            return Err(EngineError::conflict(format!(
                "transaction {} missing or already processed",
                transaction_id
            )));
        }
        Ok(())
    }
}

impl Store for SqliteStore {
    fn find_user(&self, reference_id: &str) -> Result<User> {
        self.lock()?
            .query_row(
                "SELECT id, reference_id FROM users WHERE reference_id = ?1",
                params![reference_id],
                |row| {
                    Ok(User {
                        id: row.get(0)?,
                        reference_id: row.get(1)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| EngineError::not_found("User", reference_id))
    }

    fn deposit_plans(&self, user: &User) -> Result<Vec<UserDepositPlan>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT d.id, d.user_id, d.portfolio_id, p.reference_id, d.kind, d.target_amount \
             FROM user_deposit_plans d JOIN portfolios p ON p.id = d.portfolio_id \
             WHERE d.user_id = ?1 ORDER BY d.id",
        )?;
        let plans = stmt
            .query_map(params![user.id], |row| {
                Ok(UserDepositPlan {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    portfolio_id: row.get(2)?,
                    portfolio_reference: row.get(3)?,
                    kind: kind_from_sql(row.get(4)?)?,
                    target_amount: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(plans)
    }

    fn create_transactions(&self, user: &User, amounts: &[Decimal4]) -> Result<Vec<Transaction>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut created = Vec::with_capacity(amounts.len());
        for &amount in amounts {
            let reference_id = Uuid::new_v4().to_string();
            let kind = TransactionKind::Deposit;
            tx.execute(
                "INSERT INTO transactions (reference_id, user_id, kind, amount, processed) \
                 VALUES (?1, ?2, ?3, ?4, 0)",
                params![reference_id, user.id, kind.as_str(), amount],
            )
            .map_err(|e| {
                constraint_conflict(e, || {
                    format!("user {} cannot own transactions", user.reference_id)
                })
            })?;
            created.push(Transaction {
                id: tx.last_insert_rowid(),
                reference_id,
                user_id: user.id,
                kind,
                amount,
                processed: false,
            });
        }

        tx.commit()?;
        Ok(created)
    }

    fn pending_transactions(&self, user: &User) -> Result<Vec<Transaction>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM transactions WHERE user_id = ?1 AND processed = 0 ORDER BY id",
            TRANSACTION_COLUMNS
        ))?;
        let pending = stmt
            .query_map(params![user.id], transaction_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(pending)
    }

    fn portfolio_funds(&self, user: &User) -> Result<PortfolioFunds> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT p.reference_id, up.fund FROM user_portfolios up \
             JOIN portfolios p ON p.id = up.portfolio_id WHERE up.user_id = ?1",
        )?;
        let funds = stmt
            .query_map(params![user.id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Decimal4>(1)?))
            })?
            .collect::<rusqlite::Result<PortfolioFunds>>()?;
        Ok(funds)
    }

    fn deposits_for(&self, transaction_id: i64) -> Result<Vec<Deposit>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT transaction_id, plan_id, amount FROM deposits \
             WHERE transaction_id = ?1 ORDER BY id",
        )?;
        let deposits = stmt
            .query_map(params![transaction_id], |row| {
                Ok(Deposit {
                    transaction_id: row.get(0)?,
                    plan_id: row.get(1)?,
                    amount: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(deposits)
    }

    fn run_unit_of_work<T, F>(&self, deadline: Deadline, work: F) -> Result<T>
    where
        F: FnOnce(&mut dyn UnitOfWork) -> Result<T>,
    {
        let mut conn = self.lock()?;
        deadline.check()?;

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = work(&mut SqliteUnit { conn: &tx }).and_then(|value| {
            deadline.check()?;
            Ok(value)
        });

        match result {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                warn!("Unit of work rolled back: {}", e);
                if let Err(rollback) = tx.rollback() {
                    warn!("Rollback failed: {}", rollback);
                }
                Err(e)
            }
        }
    }
}

impl Onboarding for SqliteStore {
    fn add_user(&self, reference_id: &str) -> Result<User> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO users (reference_id) VALUES (?1)",
            params![reference_id],
        )
        .map_err(|e| constraint_conflict(e, || format!("user {} already exists", reference_id)))?;
        Ok(User {
            id: conn.last_insert_rowid(),
            reference_id: reference_id.to_string(),
        })
    }

    fn add_portfolio(&self, reference_id: &str, name: &str, assets: &[Asset]) -> Result<Portfolio> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO portfolios (reference_id, name) VALUES (?1, ?2)",
            params![reference_id, name],
        )
        .map_err(|e| {
            constraint_conflict(e, || format!("portfolio {} already exists", reference_id))
        })?;
        let id = tx.last_insert_rowid();

        for asset in assets {
            tx.execute(
                "INSERT INTO assets (portfolio_id, name, class) VALUES (?1, ?2, ?3)",
                params![id, asset.name, asset.class],
            )?;
        }
        tx.commit()?;

        Ok(Portfolio {
            id,
            reference_id: reference_id.to_string(),
            name: name.to_string(),
            assets: assets.to_vec(),
        })
    }

    fn add_user_portfolio(
        &self,
        user: &User,
        portfolio: &Portfolio,
        fund: Decimal4,
    ) -> Result<UserPortfolio> {
        // Validates the opening balance before touching the database.
        UserPortfolio::new(0, user.id, portfolio.id, fund)?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO user_portfolios (user_id, portfolio_id, fund) VALUES (?1, ?2, ?3)",
            params![user.id, portfolio.id, fund],
        )
        .map_err(|e| {
            constraint_conflict(e, || {
                format!(
                    "user {} cannot hold portfolio {}",
                    user.reference_id, portfolio.reference_id
                )
            })
        })?;
        UserPortfolio::new(conn.last_insert_rowid(), user.id, portfolio.id, fund)
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

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO user_deposit_plans (user_id, portfolio_id, kind, target_amount) \
             VALUES (?1, ?2, ?3, ?4)",
            params![user.id, portfolio.id, kind.as_str(), target_amount],
        )
        .map_err(|e| {
            constraint_conflict(e, || {
                format!(
                    "user {} cannot add a {} plan for portfolio {}",
                    user.reference_id, kind, portfolio.reference_id
                )
            })
        })?;

        Ok(UserDepositPlan {
            id: conn.last_insert_rowid(),
            user_id: user.id,
            portfolio_id: portfolio.id,
            portfolio_reference: portfolio.reference_id.clone(),
            kind,
            target_amount,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::AllocationEngine;

    fn dec(s: &str) -> Decimal4 {
        Decimal4::from_str(s).unwrap()
    }

    fn migrated() -> SqliteStore {
        let store = SqliteStore::in_memory().unwrap();
        store.migrate().unwrap();
        store
    }

    fn store_with_member() -> (SqliteStore, User, Portfolio) {
        let store = migrated();
        let user = store.add_user("user-1").unwrap();
        let portfolio = store
            .add_portfolio("portfolio-a", "A", &[Asset::new("Gold", "Commodity")])
            .unwrap();
        store
            .add_user_portfolio(&user, &portfolio, Decimal4::ZERO)
            .unwrap();
        (store, user, portfolio)
    }

    #[test]
    fn test_migrate_is_repeatable() {
        let store = migrated();
        store.migrate().unwrap();
    }

    #[test]
    fn test_decimals_round_trip_through_text() {
        let (store, user, portfolio) = store_with_member();
        store
            .run_unit_of_work(Deadline::none(), |uow| {
                uow.increment_fund(user.id, portfolio.id, Decimal4::ZERO, dec("10.1234"))
            })
            .unwrap();

        assert_eq!(
            store.portfolio_funds(&user).unwrap()["portfolio-a"],
            dec("10.1234")
        );
    }

    #[test]
    fn test_plans_come_back_in_creation_order() {
        let (store, user, portfolio) = store_with_member();
        let other = store.add_portfolio("portfolio-b", "B", &[]).unwrap();

        store
            .add_deposit_plan(&user, &other, PlanKind::Monthly, dec("100"))
            .unwrap();
        store
            .add_deposit_plan(&user, &portfolio, PlanKind::OneTime, dec("1000"))
            .unwrap();

        let plans = store.deposit_plans(&user).unwrap();
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].kind, PlanKind::Monthly);
        assert_eq!(plans[0].portfolio_reference, "portfolio-b");
        assert_eq!(plans[1].target_amount, dec("1000"));
    }

    #[test]
    fn test_failed_unit_of_work_rolls_back() {
        let (store, user, portfolio) = store_with_member();
        let plan = store
            .add_deposit_plan(&user, &portfolio, PlanKind::OneTime, dec("10"))
            .unwrap();
        let tx = store.create_transactions(&user, &[dec("10")]).unwrap().remove(0);

        let result: Result<()> = store.run_unit_of_work(Deadline::none(), |uow| {
            uow.insert_deposit(&Deposit {
                transaction_id: tx.id,
                plan_id: plan.id,
                amount: dec("10"),
            })?;
            uow.increment_fund(user.id, portfolio.id, Decimal4::ZERO, dec("10"))?;
            uow.mark_processed(tx.id)?;
            Err(EngineError::InvalidInput("boom".into()))
        });

        assert!(result.is_err());
        assert!(store.deposits_for(tx.id).unwrap().is_empty());
        assert_eq!(store.pending_transactions(&user).unwrap().len(), 1);
        assert_eq!(
            store.portfolio_funds(&user).unwrap()["portfolio-a"],
            Decimal4::ZERO
        );
    }

    #[test]
    fn test_deadline_passing_after_writes_rolls_back() {
        let (store, user, portfolio) = store_with_member();
        let plan = store
            .add_deposit_plan(&user, &portfolio, PlanKind::OneTime, dec("10"))
            .unwrap();
        let tx = store.create_transactions(&user, &[dec("10")]).unwrap().remove(0);
        let deadline = Deadline::after(Duration::from_millis(20));

        let result = store.run_unit_of_work(deadline, |uow| {
            uow.insert_deposit(&Deposit {
                transaction_id: tx.id,
                plan_id: plan.id,
                amount: dec("10"),
            })?;
            uow.increment_fund(user.id, portfolio.id, Decimal4::ZERO, dec("10"))?;
            uow.mark_processed(tx.id)?;
            std::thread::sleep(Duration::from_millis(50));
            Ok(())
        });

        assert!(matches!(
            result,
            Err(EngineError::Persistence(PersistenceError::DeadlineExceeded))
        ));
        assert!(store.deposits_for(tx.id).unwrap().is_empty());
        assert_eq!(store.pending_transactions(&user).unwrap(), vec![tx]);
        assert_eq!(
            store.portfolio_funds(&user).unwrap()["portfolio-a"],
            Decimal4::ZERO
        );
    }

    #[test]
    fn test_increment_overflow_is_rejected() {
        let store = migrated();
        let user = store.add_user("user-1").unwrap();
        let portfolio = store.add_portfolio("portfolio-a", "A", &[]).unwrap();
        let big = dec("5000000000000000000000000");
        store.add_user_portfolio(&user, &portfolio, big).unwrap();

        let result = store.run_unit_of_work(Deadline::none(), |uow| {
            uow.increment_fund(user.id, portfolio.id, big, big)
        });

        assert!(matches!(result, Err(EngineError::InvalidInput(_))));
        assert_eq!(store.portfolio_funds(&user).unwrap()["portfolio-a"], big);
    }

    #[test]
    fn test_withdrawal_rows_are_never_allocated() {
        let (store, user, portfolio) = store_with_member();
        store
            .add_deposit_plan(&user, &portfolio, PlanKind::OneTime, dec("10"))
            .unwrap();
        let tx = store.create_transactions(&user, &[dec("10")]).unwrap().remove(0);
        assert_eq!(tx.kind, TransactionKind::Deposit);

        store
            .lock()
            .unwrap()
            .execute(
                "UPDATE transactions SET kind = 'withdrawal' WHERE id = ?1",
                params![tx.id],
            )
            .unwrap();
        assert_eq!(
            store.pending_transactions(&user).unwrap()[0].kind,
            TransactionKind::Withdrawal
        );

        let engine = AllocationEngine::new(store);
        let err = engine.resume_pending("user-1").unwrap_err();

        assert!(matches!(err.root(), EngineError::InvalidInput(_)));
        assert_eq!(engine.total_funds("user-1").unwrap(), Decimal4::ZERO);
    }

    #[test]
    fn test_duplicate_deposit_is_conflict() {
        let (store, user, portfolio) = store_with_member();
        let plan = store
            .add_deposit_plan(&user, &portfolio, PlanKind::OneTime, dec("10"))
            .unwrap();
        let tx = store.create_transactions(&user, &[dec("10")]).unwrap().remove(0);
        let deposit = Deposit {
            transaction_id: tx.id,
            plan_id: plan.id,
            amount: dec("5"),
        };

        let result = store.run_unit_of_work(Deadline::none(), |uow| {
            uow.insert_deposit(&deposit)?;
            uow.insert_deposit(&deposit)
        });

        assert!(matches!(
            result,
            Err(EngineError::Persistence(PersistenceError::Conflict(_)))
        ));
    }

    #[test]
    fn test_stale_increment_is_conflict() {
        let (store, user, portfolio) = store_with_member();
        let result = store.run_unit_of_work(Deadline::none(), |uow| {
            uow.increment_fund(user.id, portfolio.id, dec("3"), dec("1"))
        });
        assert!(matches!(
            result,
            Err(EngineError::Persistence(PersistenceError::Conflict(_)))
        ));
    }

    #[test]
    fn test_mark_processed_twice_is_conflict() {
        let (store, user, _) = store_with_member();
        let tx = store.create_transactions(&user, &[dec("1")]).unwrap().remove(0);

        store
            .run_unit_of_work(Deadline::none(), |uow| uow.mark_processed(tx.id))
            .unwrap();
        assert!(store
            .run_unit_of_work(Deadline::none(), |uow| uow.mark_processed(tx.id))
            .is_err());

        let reread = store
            .run_unit_of_work(Deadline::none(), |uow| uow.transaction(tx.id))
            .unwrap();
        assert!(reread.processed);
    }

    #[test]
    fn test_duplicate_onboarding_rejected() {
        let (store, user, portfolio) = store_with_member();
        assert!(store.add_user("user-1").is_err());
        assert!(store.add_portfolio("portfolio-a", "A", &[]).is_err());
        assert!(store
            .add_user_portfolio(&user, &portfolio, Decimal4::ZERO)
            .is_err());
    }

    #[test]
    fn test_missing_membership_is_not_found() {
        let (store, user, _) = store_with_member();
        let result =
            store.run_unit_of_work(Deadline::none(), |uow| uow.portfolio_fund(user.id, 999));
        assert!(matches!(result, Err(EngineError::NotFound { .. })));
    }

    #[test]
    fn test_file_database_persists_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deposits.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.migrate().unwrap();
            store.add_user("user-1").unwrap();
        }

        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(reopened.find_user("user-1").unwrap().reference_id, "user-1");
    }
}
