//! Rebalance plan generation.
//!
//! Diffs each live reserve's protocol against the ranking service's best
//! supply market for its token and emits one move step per divergence.
//! Reserves backing a borrow never move.

use alloy::primitives::Address;
use anyhow::Result;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use keeper_api::{MarketRanking, RankedMarket};
use keeper_chain::{AgentAction, Market, MoveStep};

use crate::maintainer::ranked_market;
use crate::reconcile::{AgentSnapshot, AssetReserve};

/// Where a token should be supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub market: Market,
    pub protocol: u16,
}

impl From<&RankedMarket> for Target {
    fn from(ranked: &RankedMarket) -> Self {
        Self {
            market: ranked_market(ranked),
            protocol: ranked.protocol,
        }
    }
}

/// Target market per collateral token. When the service lists several
/// markets for one token the last listed wins; entries with a zero
/// collateral address are rejected.
pub fn target_map(ranked: &[RankedMarket]) -> HashMap<Address, Target> {
    let mut targets = HashMap::with_capacity(ranked.len());
    for market in ranked {
        let token = market.collateral_asset.token.address;
        if token.is_zero() {
            warn!(market = %market.market_address, platform = %market.platform, "Ranked market without collateral token");
            continue;
        }
        targets.insert(token, Target::from(market));
    }
    targets
}

/// Move steps in reserve order. Collateral reserves, reserves without a
/// target and reserves already in the target protocol are left alone.
pub fn generate_plan(reserves: &[AssetReserve], targets: &HashMap<Address, Target>) -> Vec<MoveStep> {
    reserves
        .iter()
        .filter(|reserve| !reserve.is_used_as_collateral)
        .filter_map(|reserve| {
            let target = targets.get(&reserve.token.address)?;
            if target.protocol == reserve.protocol {
                return None;
            }
            Some(MoveStep {
                from_market: reserve.market,
                from_protocol: reserve.protocol,
                to_market: target.market,
                to_protocol: target.protocol,
            })
        })
        .collect()
}

/// The part of a plan submitted this cycle. `max_steps == 0` keeps the
/// whole plan.
pub fn executable(mut plan: Vec<MoveStep>, max_steps: usize) -> Vec<MoveStep> {
    if max_steps > 0 {
        plan.truncate(max_steps);
    }
    plan
}

/// Yield rebalance for one agent, `None` when every reserve is in place.
pub async fn plan_rebalance(
    snapshot: &AgentSnapshot,
    ranking: &dyn MarketRanking,
    chain_id: u64,
    max_steps: usize,
) -> Result<Option<AgentAction>> {
    if snapshot.reserves.is_empty() {
        return Ok(None);
    }

    let tokens: Vec<Address> = snapshot.reserves.iter().map(|r| r.token.address).collect();
    let ranked = ranking
        .best_supply_markets(chain_id, &tokens, &snapshot.protocols)
        .await?;
    let targets = target_map(&ranked);

    let plan = generate_plan(&snapshot.reserves, &targets);
    if plan.is_empty() {
        debug!(agent = %snapshot.address(), "Reserves already in best markets");
        return Ok(None);
    }

    let total = plan.len();
    let steps = executable(plan, max_steps);
    info!(
        agent = %snapshot.address(),
        planned = total,
        submitting = steps.len(),
        "Rebalance planned"
    );
    Ok(Some(AgentAction::Rebalance { steps }))
}
