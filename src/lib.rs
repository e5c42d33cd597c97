//! # Deposit Allocator
//!
//! Allocates incoming cash deposits across a user's one-time and monthly
//! investment plans and credits each portfolio balance exactly once per
//! transaction.
//!
//! ## Design Principles
//!
//! - **Fixed-point arithmetic**: Uses 4 decimal places via `rust_decimal`
//! - **Priority waterfall**: one-time targets first, then monthly targets,
//!   then an even split once both are funded
//! - **Exact conservation**: the last plan of a split absorbs the rounding
//!   remainder, so deposits always add up to the transaction amount
//! - **Atomic application**: balances are read and credited inside one unit
//!   of work per transaction; a failure leaves the transaction unprocessed
//!
//! ## Example
//!
//! ```
//! use deposit_allocator::{seed, AllocationEngine, Decimal4, MemoryStore};
//!
//! let store = MemoryStore::new();
//! seed::seed_demo(&store).unwrap();
//!
//! let engine = AllocationEngine::new(store);
//! let outcome = engine
//!     .process_funds(seed::DEMO_USER, &[Decimal4::from(10_500)])
//!     .unwrap();
//! assert_eq!(outcome.funds[seed::PORTFOLIO_HIGH_RISK], Decimal4::from(10_000));
//! assert_eq!(outcome.funds[seed::PORTFOLIO_RETIREMENT], Decimal4::from(500));
//! ```

pub mod config;
pub mod decimal;
pub mod distributor;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod plan;
pub mod portfolio;
pub mod seed;
pub mod store;
pub mod transaction;
pub mod waterfall;

pub use config::{Config, DatabaseLocation};
pub use decimal::Decimal4;
pub use engine::{AllocationEngine, BatchOutcome, TransactionOutcome};
pub use error::{EngineError, PersistenceError, Result};
pub use plan::{PlanGroups, PlanKind, UserDepositPlan};
pub use portfolio::{Asset, Portfolio, PortfolioFunds, User, UserPortfolio};
pub use store::{Deadline, MemoryStore, Onboarding, SqliteStore, Store, UnitOfWork};
pub use transaction::{Deposit, DepositRequest, Transaction, TransactionKind};
