//! Runtime configuration read from the environment.
//!
//! A `.env` file in the working directory is loaded first if present.

use crate::error::{EngineError, Result};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_UNIT_OF_WORK_TIMEOUT_MS: u64 = 15_000;

/// Where the SQLite database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseLocation {
    /// Private in-memory database, gone when the process exits.
    Memory,
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub database: DatabaseLocation,
    pub auto_migrate: bool,
    pub auto_seed: bool,
    /// Upper bound for one unit of work; `None` disables the deadline.
    pub unit_of_work_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database: DatabaseLocation::Memory,
            auto_migrate: false,
            auto_seed: false,
            unit_of_work_timeout: Some(Duration::from_millis(DEFAULT_UNIT_OF_WORK_TIMEOUT_MS)),
        }
    }
}

impl Config {
    /// Reads configuration from the process environment.
    ///
    /// - `DB_TYPE`: `sqlite` (default); `mysql` and `postgres` are rejected
    /// - `DB_FILE_PATH`: database file name inside the OS temp directory
    /// - `DB_DSN`: database path, used when `DB_FILE_PATH` is unset
    /// - `DB_AUTO_MIGRATE`, `DB_AUTO_SEED`: `true` or `1` to enable
    /// - `UNIT_OF_WORK_TIMEOUT_MS`: deadline per transaction, `0` for none
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Config::from_env`] over an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let flag = |key: &str| {
            get(key)
                .map(|value| matches!(value.trim().to_lowercase().as_str(), "true" | "1"))
                .unwrap_or(false)
        };

        match get("DB_TYPE").map(|value| value.trim().to_lowercase()) {
            None => {}
            Some(db_type) if db_type == "sqlite" => {}
            Some(db_type) if db_type == "mysql" || db_type == "postgres" => {
                return Err(EngineError::Config(format!(
                    "database type '{}' is not supported, use sqlite",
                    db_type
                )))
            }
            Some(db_type) => {
                return Err(EngineError::Config(format!(
                    "unknown database type '{}'",
                    db_type
                )))
            }
        }

        let database = if let Some(file_name) = get("DB_FILE_PATH") {
            DatabaseLocation::File(std::env::temp_dir().join(file_name.trim()))
        } else if let Some(dsn) = get("DB_DSN") {
            DatabaseLocation::File(PathBuf::from(dsn.trim()))
        } else {
            DatabaseLocation::Memory
        };

        let unit_of_work_timeout = match get("UNIT_OF_WORK_TIMEOUT_MS") {
            None => Some(Duration::from_millis(DEFAULT_UNIT_OF_WORK_TIMEOUT_MS)),
            Some(raw) => {
                let millis: u64 = raw.trim().parse().map_err(|_| {
                    EngineError::Config(format!("invalid UNIT_OF_WORK_TIMEOUT_MS '{}'", raw))
                })?;
                (millis > 0).then(|| Duration::from_millis(millis))
            }
        };

        Ok(Config {
            database,
            auto_migrate: flag("DB_AUTO_MIGRATE"),
            auto_seed: flag("DB_AUTO_SEED"),
            unit_of_work_timeout,
        })
    }
}
