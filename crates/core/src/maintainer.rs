//! Borrow-target maintenance.
//!
//! Keeps the owner's loan-token balance topped up to a borrow's `maxAmount`
//! once it falls below `minAmount`. When existing collateral can carry the
//! extra debt the agent borrows directly; otherwise unused reserves are moved
//! into the borrow's protocol so they start counting as collateral.

use alloy::primitives::U256;
use anyhow::Result;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use keeper_api::{PriceOracle, RankedMarket};
use keeper_chain::{AgentAction, Market, MoveStep};

use crate::reconcile::{AgentSnapshot, AssetReserve, BorrowState};
use crate::u256_math::{convert_at_rate, f64_to_wad};

/// Why a borrow target produced no action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
    /// Auto-refill disabled
    RefillDisabled,
    /// Owner balance already at or above `minAmount`
    Satisfied,
    /// No live debt on the market
    NoDebt,
    /// No unused reserve can be moved into the borrow protocol
    NoReallocation,
}

/// Outcome for one borrow target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Borrow(AgentAction),
    Reallocate(AgentAction),
    Skip(Skip),
}

pub(crate) fn ranked_market(ranked: &RankedMarket) -> Market {
    Market {
        loan_token: ranked.loan_asset.token.address,
        collateral_token: ranked.collateral_asset.token.address,
        market_address: ranked.market_address,
        aux_id: ranked.aux_id,
        flags: ranked.flags,
    }
}

/// Market data and prices shared by every borrow of a cycle.
pub struct Maintainer<'a> {
    markets: &'a [RankedMarket],
    prices: &'a dyn PriceOracle,
    price_chain: &'a str,
}

impl<'a> Maintainer<'a> {
    pub fn new(markets: &'a [RankedMarket], prices: &'a dyn PriceOracle, price_chain: &'a str) -> Self {
        Self {
            markets,
            prices,
            price_chain,
        }
    }

    /// Loan-token amount the agent could still borrow against its unused
    /// reserves: `sum(supplied * price * ltv) - debt`.
    pub async fn additional_capacity(&self, snapshot: &AgentSnapshot, borrow: &BorrowState) -> Result<U256> {
        let loan = borrow.loan_token();
        let mut capacity = U256::ZERO;

        for reserve in snapshot.unused_reserves() {
            let Some(destination) = self.markets.iter().find(|m| {
                m.collateral_asset.token.address == reserve.token.address
                    && m.loan_asset.token.address == loan.address
                    && snapshot.protocols.contains(&m.protocol)
            }) else {
                debug!(token = %reserve.token.address, "No borrowable market for reserve");
                continue;
            };

            let price = self
                .prices
                .price_in_token(self.price_chain, reserve.token.address, loan.address)
                .await?;
            let ltv = destination.collateral_asset.policy.ltv;
            let value = convert_at_rate(
                reserve.supplied,
                f64_to_wad(price * ltv),
                reserve.token.decimals,
                loan.decimals,
            );
            debug!(
                token = %reserve.token.address,
                protocol = destination.protocol,
                price,
                ltv,
                value = %value,
                "Reserve borrowing power"
            );
            capacity = capacity.saturating_add(value);
        }

        Ok(capacity.saturating_sub(borrow.debt))
    }

    /// Steps moving every unused reserve into a market of the borrow's
    /// protocol with the same collateral token.
    fn reallocation_steps<'r>(
        &self,
        reserves: impl Iterator<Item = &'r AssetReserve>,
        borrow: &BorrowState,
    ) -> Vec<MoveStep> {
        let protocol = borrow.protocol();
        reserves
            .filter_map(|reserve| {
                let destination = self.markets.iter().find(|m| {
                    m.protocol == protocol
                        && m.collateral_asset.token.address == reserve.token.address
                })?;
                let to_market = ranked_market(destination);
                if to_market.id(protocol) == reserve.market_id {
                    return None;
                }
                Some(MoveStep {
                    from_market: reserve.market,
                    from_protocol: reserve.protocol,
                    to_market,
                    to_protocol: protocol,
                })
            })
            .collect()
    }

    pub async fn decide(&self, snapshot: &AgentSnapshot, borrow: &BorrowState) -> Result<Decision> {
        let Some(max_amount) = borrow.target.auto_refill() else {
            return Ok(Decision::Skip(Skip::RefillDisabled));
        };
        if borrow.owner_balance >= borrow.target.min_amount {
            return Ok(Decision::Skip(Skip::Satisfied));
        }
        if borrow.debt.is_zero() {
            return Ok(Decision::Skip(Skip::NoDebt));
        }
        // A maxAmount below minAmount leaves nothing to borrow
        let missing = max_amount.saturating_sub(borrow.owner_balance);
        if missing.is_zero() {
            return Ok(Decision::Skip(Skip::Satisfied));
        }

        let capacity = self.additional_capacity(snapshot, borrow).await?;
        if capacity >= missing {
            info!(
                agent = %snapshot.address(),
                borrow = %borrow.target.id,
                missing = %missing,
                capacity = %capacity,
                "Borrowing to restore target balance"
            );
            return Ok(Decision::Borrow(AgentAction::Borrow {
                protocol: borrow.protocol(),
                market: *borrow.market(),
                amount: missing,
            }));
        }

        let steps = self.reallocation_steps(snapshot.unused_reserves(), borrow);
        if steps.is_empty() {
            return Ok(Decision::Skip(Skip::NoReallocation));
        }
        info!(
            agent = %snapshot.address(),
            borrow = %borrow.target.id,
            missing = %missing,
            capacity = %capacity,
            steps = steps.len(),
            "Insufficient capacity, moving unused reserves into borrow protocol"
        );
        Ok(Decision::Reallocate(AgentAction::Rebalance { steps }))
    }

    /// Actions for all of an agent's borrow targets.
    ///
    /// Stops after the first reallocation, since it consumes every unused
    /// reserve.
    pub async fn plan(&self, snapshot: &AgentSnapshot) -> Result<Vec<AgentAction>> {
        let refill: Vec<&BorrowState> = snapshot
            .borrows
            .iter()
            .filter(|b| b.target.auto_refill().is_some())
            .collect();
        if refill.is_empty() {
            return Ok(Vec::new());
        }

        if snapshot.reserves.is_empty() {
            warn!(agent = %snapshot.address(), "Borrow targets set but agent has no live reserves");
            return Ok(Vec::new());
        }
        let collateral_protocols: BTreeSet<u16> =
            snapshot.collateral_reserves().map(|r| r.protocol).collect();
        if collateral_protocols.is_empty() {
            warn!(agent = %snapshot.address(), "Borrow targets set but agent has no collateral reserves");
            return Ok(Vec::new());
        }
        if collateral_protocols.len() > 1 {
            warn!(
                agent = %snapshot.address(),
                protocols = ?collateral_protocols,
                "Collateral spans multiple protocols, not maintaining borrow targets"
            );
            return Ok(Vec::new());
        }

        let mut actions = Vec::new();
        for borrow in refill {
            match self.decide(snapshot, borrow).await? {
                Decision::Borrow(action) => actions.push(action),
                Decision::Reallocate(action) => {
                    actions.push(action);
                    break;
                }
                Decision::Skip(reason) => {
                    debug!(agent = %snapshot.address(), borrow = %borrow.target.id, ?reason, "Borrow target unchanged");
                }
            }
        }
        Ok(actions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::fixtures::{borrow, ranked, reserve, snapshot, BorrowFixture, CBBTC, USDC, WETH};
    use crate::mocks::MockPrices;
    use std::collections::HashMap;

    const ONE_ETH: u64 = 1_000_000_000_000_000_000;

    fn prices() -> MockPrices {
        MockPrices(HashMap::from([(WETH, 3_000.0), (USDC, 1.0), (CBBTC, 60_000.0)]))
    }

    /// Borrow of USDC on protocol 1, owner holding `balance` with min 100 / max 500 USDC.
    fn low_balance(balance: u64, debt: u64) -> BorrowFixture {
        BorrowFixture {
            protocol: 1,
            min: 100_000_000,
            max: Some(500_000_000),
            debt,
            hf: 2.0,
            balance,
            allowance: 0,
        }
    }

    #[tokio::test]
    async fn test_satisfied_target_is_noop() {
        let markets = vec![ranked(WETH, 2, 0.8)];
        let prices = prices();
        let maintainer = Maintainer::new(&markets, &prices, "base");

        let snap = snapshot(
            vec![1, 2],
            vec![reserve(WETH, 2, ONE_ETH, 0, false), reserve(USDC, 1, 1, 0, false)],
            vec![borrow(low_balance(100_000_000, 1_000))],
        );
        assert!(maintainer.plan(&snap).await.unwrap().is_empty());
        assert_eq!(
            maintainer.decide(&snap, &snap.borrows[0]).await.unwrap(),
            Decision::Skip(Skip::Satisfied)
        );
    }

    #[tokio::test]
    async fn test_borrows_missing_amount_when_capacity_allows() {
        let markets = vec![ranked(WETH, 2, 0.8)];
        let prices = prices();
        let maintainer = Maintainer::new(&markets, &prices, "base");

        // 1 WETH unused: 3000 * 0.8 = 2400 USDC of capacity, 1000 USDC debt
        let snap = snapshot(
            vec![1, 2],
            vec![reserve(WETH, 2, ONE_ETH, 0, false), reserve(CBBTC, 1, 0, 0, true)],
            vec![borrow(low_balance(50_000_000, 1_000_000_000))],
        );
        let capacity = maintainer
            .additional_capacity(&snap, &snap.borrows[0])
            .await
            .unwrap();
        assert_eq!(capacity, U256::from(1_400_000_000u64));

        let actions = maintainer.plan(&snap).await.unwrap();
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            AgentAction::Borrow { protocol, amount, .. } => {
                assert_eq!(*protocol, 1);
                assert_eq!(*amount, U256::from(450_000_000u64));
            }
            other => panic!("expected borrow, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_reallocates_when_capacity_short() {
        let markets = vec![ranked(WETH, 2, 0.8), ranked(WETH, 1, 0.75)];
        let prices = prices();
        let maintainer = Maintainer::new(&markets, &prices, "base");

        // capacity 2400 - 2300 debt = 100 USDC < 450 missing
        let snap = snapshot(
            vec![1, 2],
            vec![reserve(WETH, 2, ONE_ETH, 0, false), reserve(CBBTC, 1, 0, 0, true)],
            vec![borrow(low_balance(50_000_000, 2_300_000_000))],
        );
        let actions = maintainer.plan(&snap).await.unwrap();
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            AgentAction::Rebalance { steps } => {
                assert_eq!(steps.len(), 1);
                assert_eq!(steps[0].from_protocol, 2);
                assert_eq!(steps[0].to_protocol, 1);
                assert_eq!(steps[0].to_market.collateral_token, WETH);
            }
            other => panic!("expected rebalance, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_refill_disabled_and_no_debt() {
        let markets = vec![ranked(WETH, 2, 0.8)];
        let prices = prices();
        let maintainer = Maintainer::new(&markets, &prices, "base");

        let mut disabled = low_balance(0, 1_000);
        disabled.max = Some(0);
        let snap = snapshot(vec![2], vec![reserve(WETH, 2, ONE_ETH, 0, false)], vec![borrow(disabled)]);
        assert_eq!(
            maintainer.decide(&snap, &snap.borrows[0]).await.unwrap(),
            Decision::Skip(Skip::RefillDisabled)
        );

        let snap = snapshot(
            vec![2],
            vec![reserve(WETH, 2, ONE_ETH, 0, false)],
            vec![borrow(low_balance(0, 0))],
        );
        assert_eq!(
            maintainer.decide(&snap, &snap.borrows[0]).await.unwrap(),
            Decision::Skip(Skip::NoDebt)
        );
    }

    #[tokio::test]
    async fn test_mixed_protocol_collateral_is_skipped() {
        let markets = vec![ranked(WETH, 2, 0.8)];
        let prices = prices();
        let maintainer = Maintainer::new(&markets, &prices, "base");

        let snap = snapshot(
            vec![1, 2, 3],
            vec![reserve(WETH, 1, ONE_ETH, 0, true), reserve(CBBTC, 3, 100_000_000, 0, true)],
            vec![borrow(low_balance(0, 1_000))],
        );
        assert!(maintainer.plan(&snap).await.unwrap().is_empty());

        let empty = snapshot(vec![1], vec![], vec![borrow(low_balance(0, 1_000))]);
        assert!(maintainer.plan(&empty).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_price_propagates() {
        let markets = vec![ranked(WETH, 2, 0.8)];
        let prices = MockPrices::default();
        let maintainer = Maintainer::new(&markets, &prices, "base");

        let snap = snapshot(
            vec![1, 2],
            vec![reserve(WETH, 2, ONE_ETH, 0, false), reserve(CBBTC, 1, 0, 0, true)],
            vec![borrow(low_balance(0, 1_000))],
        );
        assert!(maintainer.plan(&snap).await.is_err());
    }

    #[tokio::test]
    async fn test_agent_without_collateral_is_skipped() {
        let markets = vec![ranked(WETH, 2, 0.8)];
        let prices = prices();
        let maintainer = Maintainer::new(&markets, &prices, "base");

        let snap = snapshot(
            vec![1, 2],
            vec![reserve(WETH, 2, ONE_ETH, 0, false)],
            vec![borrow(low_balance(50_000_000, 1_000_000_000))],
        );
        assert_eq!(snap.collateral_reserves().count(), 0);
        assert!(maintainer.plan(&snap).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_max_below_min_never_borrows_zero() {
        let markets = vec![ranked(WETH, 2, 0.8)];
        let prices = prices();
        let maintainer = Maintainer::new(&markets, &prices, "base");

        // balance 60 is under min 100 but already above max 50
        let mut inverted = low_balance(60_000_000, 1_000_000_000);
        inverted.max = Some(50_000_000);
        let snap = snapshot(
            vec![1, 2],
            vec![reserve(WETH, 2, ONE_ETH, 0, false), reserve(CBBTC, 1, 0, 0, true)],
            vec![borrow(inverted)],
        );
        assert_eq!(
            maintainer.decide(&snap, &snap.borrows[0]).await.unwrap(),
            Decision::Skip(Skip::Satisfied)
        );
        assert!(maintainer.plan(&snap).await.unwrap().is_empty());
    }
}
