//! Transaction and deposit records, plus the CSV request format of the driver.

use crate::decimal::Decimal4;
use crate::error::{EngineError, Result};
use log::debug;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

/// Direction of a transaction. Only deposits are ever allocated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TransactionKind {
    #[default]
    Deposit,
    Withdrawal,
}

impl TransactionKind {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Deposit => "deposit",
            TransactionKind::Withdrawal => "withdrawal",
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "deposit" => Ok(TransactionKind::Deposit),
            "withdrawal" => Ok(TransactionKind::Withdrawal),
            other => Err(EngineError::InvalidInput(format!(
                "unknown transaction kind '{}'",
                other
            ))),
        }
    }
}

/// A persisted monetary inflow for one user.
///
/// Created unprocessed; `processed` flips to `true` exactly once, inside the
/// unit of work that credits its allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub id: i64,
    pub reference_id: String,
    pub user_id: i64,
    pub kind: TransactionKind,
    pub amount: Decimal4,
    pub processed: bool,
}

/// The amount of one transaction attributed to one deposit plan.
///
/// Append-only; unique per `(transaction_id, plan_id)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deposit {
    pub transaction_id: i64,
    pub plan_id: i64,
    pub amount: Decimal4,
}

/// Keeps the strictly positive amounts of a batch, in order.
///
/// This is the filter the transaction factory applies before creating
/// records; zero and negative amounts never become transactions.
pub fn positive_amounts(amounts: &[Decimal4]) -> Vec<Decimal4> {
    amounts
        .iter()
        .copied()
        .filter(|amount| {
            let keep = amount.is_positive();
            if !keep {
                debug!("Dropping non-positive deposit amount {}", amount);
            }
            keep
        })
        .collect()
}

/// Raw deposit request as read from the driver's CSV input.
#[derive(Debug, Deserialize)]
pub struct DepositRequest {
    /// User reference identifier
    pub user: String,

    /// Requested amount; kept as text so a bad value only skips its row
    pub amount: Option<String>,
}

impl DepositRequest {
    /// Parses the raw record into `(user reference, amount)`.
    ///
    /// Returns `None` for a blank user or a missing/unparseable amount.
    /// Non-positive amounts are returned as-is; filtering happens downstream.
    pub fn parse(&self) -> Option<(String, Decimal4)> {
        let user = self.user.trim();
        if user.is_empty() {
            return None;
        }
        let amount_str = self.amount.as_ref()?;
        let trimmed = amount_str.trim();
        if trimmed.is_empty() {
            return None;
        }
        let amount = Decimal4::from_str(trimmed).ok()?;
        Some((user.to_string(), amount))
    }
}
