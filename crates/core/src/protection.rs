//! Liquidation protection.
//!
//! A borrow whose health factor drops below the danger threshold is
//! remediated in one of two ways:
//! - repay the interest accrued since origination, when the owner has
//!   approved enough of the loan token
//! - otherwise top up every collateral market with a fraction of what the
//!   owner can currently supply
//!
//! The resulting health factor is re-evaluated on the next cycle.

use alloy::primitives::U256;
use std::collections::HashSet;
use tracing::{debug, info, warn};

use keeper_chain::AgentAction;

use crate::config::ProtectionConfig;
use crate::reconcile::{AgentSnapshot, BorrowState};
use crate::u256_math::{bps_of, f64_to_wad, wad_to_f64};

/// Borrows below the danger health factor.
pub fn at_risk<'a>(
    snapshot: &'a AgentSnapshot,
    config: &ProtectionConfig,
) -> impl Iterator<Item = &'a BorrowState> {
    let threshold = f64_to_wad(config.danger_health_factor);
    snapshot
        .borrows
        .iter()
        .filter(move |borrow| borrow.health_factor < threshold)
}

/// Remediation actions for every at-risk borrow of an agent, in order.
pub fn plan_protection(snapshot: &AgentSnapshot, config: &ProtectionConfig) -> Vec<AgentAction> {
    let mut actions = Vec::new();

    for borrow in at_risk(snapshot, config) {
        let accrued = borrow.debt.saturating_sub(borrow.target.original_amount());
        let health = wad_to_f64(borrow.health_factor);

        if accrued.is_zero() {
            debug!(
                agent = %snapshot.address(),
                borrow = %borrow.target.id,
                health_factor = health,
                "Borrow at risk but no interest accrued yet"
            );
            continue;
        }

        if borrow.owner_allowance >= accrued {
            info!(
                agent = %snapshot.address(),
                borrow = %borrow.target.id,
                health_factor = health,
                accrued = %accrued,
                "Repaying accrued interest"
            );
            actions.push(AgentAction::Repay {
                protocol: borrow.protocol(),
                market: *borrow.market(),
                amount: accrued,
            });
            continue;
        }

        let top_ups = collateral_top_ups(snapshot, config.top_up_bps);
        if top_ups.is_empty() {
            warn!(
                agent = %snapshot.address(),
                borrow = %borrow.target.id,
                health_factor = health,
                allowance = %borrow.owner_allowance,
                accrued = %accrued,
                "Borrow at risk with nothing to repay or supply"
            );
            continue;
        }

        info!(
            agent = %snapshot.address(),
            borrow = %borrow.target.id,
            health_factor = health,
            markets = top_ups.len(),
            "Allowance below accrued interest, adding collateral"
        );
        actions.extend(top_ups);
    }

    actions
}

/// One `distribute` per distinct probe-locked collateral market, sized at
/// `top_up_bps` of the owner's available balance. Zero amounts are dropped.
fn collateral_top_ups(snapshot: &AgentSnapshot, top_up_bps: u16) -> Vec<AgentAction> {
    let mut seen = HashSet::new();
    snapshot
        .reserves
        .iter()
        .filter(|reserve| reserve.probe_locked)
        .filter(|reserve| seen.insert(reserve.market_id))
        .filter_map(|reserve| {
            let amount = bps_of(reserve.available_user_balance, top_up_bps);
            (amount > U256::ZERO).then(|| AgentAction::Distribute {
                token: reserve.token.address,
                protocol: reserve.protocol,
                market: reserve.market,
                amount,
            })
        })
        .collect()
}
