//! Demo data for a fresh database.

use crate::decimal::Decimal4;
use crate::error::Result;
use crate::plan::PlanKind;
use crate::portfolio::{Asset, User};
use crate::store::Onboarding;
use log::info;

pub const DEMO_USER: &str = "user-123";
pub const PORTFOLIO_RETIREMENT: &str = "portfolio-retirement";
pub const PORTFOLIO_HIGH_RISK: &str = "portfolio-high-risk";
pub const PORTFOLIO_LOW_RISK: &str = "portfolio-low-risk";

/// Installs three portfolios and a demo user holding all of them.
///
/// Plans: one-time 10000 on high risk, one-time 500 on retirement, monthly
/// 100 on low risk. Every balance starts at zero.
pub fn seed_demo<O: Onboarding>(store: &O) -> Result<User> {
    let retirement = store.add_portfolio(
        PORTFOLIO_RETIREMENT,
        "Retirement",
        &[
            Asset::new("Apple Inc.", "Stock"),
            Asset::new("Tesla Inc.", "Stock"),
        ],
    )?;
    let high_risk = store.add_portfolio(
        PORTFOLIO_HIGH_RISK,
        "High Risk",
        &[
            Asset::new("Bitcoin", "Cryptocurrency"),
            Asset::new("Ethereum", "Cryptocurrency"),
        ],
    )?;
    let low_risk = store.add_portfolio(
        PORTFOLIO_LOW_RISK,
        "Low Risk",
        &[
            Asset::new("US Treasury Bonds", "Bond"),
            Asset::new("Gold", "Commodity"),
        ],
    )?;

    let user = store.add_user(DEMO_USER)?;
    for portfolio in [&retirement, &high_risk, &low_risk] {
        store.add_user_portfolio(&user, portfolio, Decimal4::ZERO)?;
    }

    store.add_deposit_plan(&user, &high_risk, PlanKind::OneTime, Decimal4::from(10_000))?;
    store.add_deposit_plan(&user, &retirement, PlanKind::OneTime, Decimal4::from(500))?;
    store.add_deposit_plan(&user, &low_risk, PlanKind::Monthly, Decimal4::from(100))?;

    info!("Seeded demo user {}", user.reference_id);
    Ok(user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, SqliteStore, Store};

    #[test]
    fn test_seed_memory_store() {
        let store = MemoryStore::new();
        let user = seed_demo(&store).unwrap();

        let funds = store.portfolio_funds(&user).unwrap();
        assert_eq!(funds.len(), 3);
        assert!(funds.values().all(|f| f.is_zero()));
        assert_eq!(store.deposit_plans(&user).unwrap().len(), 3);
    }

    #[test]
    fn test_seed_sqlite_store_once() {
        let store = SqliteStore::in_memory().unwrap();
        store.migrate().unwrap();

        let user = seed_demo(&store).unwrap();
        assert_eq!(store.find_user(DEMO_USER).unwrap(), user);

        let plans = store.deposit_plans(&user).unwrap();
        assert_eq!(plans[0].portfolio_reference, PORTFOLIO_HIGH_RISK);
        assert_eq!(plans[2].kind, PlanKind::Monthly);

        assert!(seed_demo(&store).is_err());
    }
}
