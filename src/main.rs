//! Deposit Allocator CLI
//!
//! Reads deposit requests from CSV, allocates them per user and prints the
//! resulting portfolio funds.
//!
//! # Usage
//!
//! ```bash
//! cargo run -- requests.csv > funds.csv
//! ```
//!
//! Input header is `user,amount`; output header is `user,portfolio,fund`.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Set to `debug` or `warn` to control logging verbosity
//! - `DB_FILE_PATH`, `DB_DSN`, `DB_AUTO_MIGRATE`, `DB_AUTO_SEED`,
//!   `UNIT_OF_WORK_TIMEOUT_MS`: see `deposit_allocator::Config`

use csv::{ReaderBuilder, Trim};
use deposit_allocator::{
    seed, AllocationEngine, Config, Decimal4, DepositRequest, EngineError, Result, SqliteStore,
};
use log::{error, warn};
use std::env;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::process;

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        return Err(EngineError::MissingArgument);
    }

    let input_path = &args[1];
    let file = File::open(input_path)?;
    let requests = read_requests(BufReader::new(file))?;

    let config = Config::from_env()?;
    let store = SqliteStore::connect(&config)?;
    if config.auto_seed {
        seed::seed_demo(&store)?;
    }
    let engine = AllocationEngine::new(store).with_timeout(config.unit_of_work_timeout);

    let mut users = Vec::with_capacity(requests.len());
    for (user, amounts) in &requests {
        if let Err(e) = engine.process_funds(user, amounts) {
            error!("Deposits for user {} failed: {}", user, e);
        }
        users.push(user.as_str());
    }

    let stdout = io::stdout();
    let mut writer = csv::Writer::from_writer(stdout.lock());
    writer.write_record(["user", "portfolio", "fund"])?;

    users.sort_unstable();
    for user in users {
        let funds = match engine.portfolio_funds(user) {
            Ok(funds) => funds,
            Err(e) => {
                warn!("Cannot report funds for user {}: {}", user, e);
                continue;
            }
        };
        for (portfolio, fund) in funds {
            writer.write_record([user.to_string(), portfolio, fund.to_string()])?;
        }
    }

    writer.flush()?;
    Ok(())
}

/// Groups valid request rows per user, users in first-seen order.
fn read_requests<R: Read>(reader: R) -> Result<Vec<(String, Vec<Decimal4>)>> {
    let mut csv_reader = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .from_reader(reader);

    let mut grouped: Vec<(String, Vec<Decimal4>)> = Vec::new();
    for (row_idx, result) in csv_reader.deserialize::<DepositRequest>().enumerate() {
        let row_num = row_idx + 2; // 1-indexed, accounting for header row

        let record = match result {
            Ok(record) => record,
            Err(e) => {
                warn!("Row {}: CSV parse error: {}", row_num, e);
                continue;
            }
        };
        let Some((user, amount)) = record.parse() else {
            warn!("Row {}: Failed to parse deposit request", row_num);
            continue;
        };

        match grouped.iter_mut().find(|(u, _)| *u == user) {
            Some((_, amounts)) => amounts.push(amount),
            None => grouped.push((user, vec![amount])),
        }
    }

    Ok(grouped)
}
