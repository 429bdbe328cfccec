//! Agent keeper core logic.
//!
//! This crate provides the decision side of the keeper:
//! - Keeper, chain and environment configuration
//! - Position reconciliation (indexed ledger + live chain reads)
//! - Liquidation protection (repay accrued interest or top up collateral)
//! - Borrow-target maintenance (borrow more or convert idle reserves)
//! - Yield rebalance planning against the market ranking service
//! - Per-chain driver and interval scheduler
//!
//! Chain access, HTTP clients and transaction submission live in
//! `keeper-chain` and `keeper-api`; everything here talks to them through
//! their traits.

pub mod config;
mod driver;
mod error;
mod ledger;
mod maintainer;
#[cfg(test)]
mod mocks;
mod planner;
mod protection;
mod reconcile;
pub mod u256_math;

pub use driver::{ChainDriver, Collaborators, CycleGuard, CycleReport, CycleToken, Scheduler};
pub use error::DataError;
pub use ledger::{AgentRecord, BorrowTarget, LivePosition, MarketRecord, TokenInfo};
pub use maintainer::{Decision, Maintainer, Skip};
pub use planner::{executable, generate_plan, plan_rebalance, target_map, Target};
pub use protection::{at_risk, plan_protection};
pub use reconcile::{AgentSnapshot, AssetReserve, BorrowState, Reconciler};
