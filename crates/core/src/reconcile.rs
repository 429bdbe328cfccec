//! Position reconciliation.
//!
//! Merges an agent's indexed positions and borrow targets with live chain
//! reads into one [`AgentSnapshot`] that the decision engines work from.

use alloy::primitives::{Address, U256};
use anyhow::{Context, Result};
use futures::future::try_join_all;
use smallvec::SmallVec;
use std::collections::HashMap;
use tracing::{debug, instrument};

use keeper_api::AgentLedger;
use keeper_chain::{ChainReader, CollateralProbe, Market, MarketId};

use crate::ledger::{AgentRecord, BorrowTarget, LivePosition, MarketRecord, TokenInfo};

/// A live supply position with its collateral status and the owner's
/// spendable balance of the same token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetReserve {
    pub token: TokenInfo,
    pub protocol: u16,
    pub market: Market,
    pub market_id: MarketId,
    pub supplied: U256,
    /// `min(balanceOf(owner), allowance(owner, agent))`
    pub available_user_balance: U256,
    /// The forced-withdrawal simulation reverted
    pub probe_locked: bool,
    /// Locked by the probe, or placed in the designated borrow protocol
    pub is_used_as_collateral: bool,
}

/// A borrow target with its live debt and health.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BorrowState {
    pub target: BorrowTarget,
    pub adapter: Address,
    pub debt: U256,
    /// 1e18-scaled
    pub health_factor: U256,
    /// Owner's loan-token balance
    pub owner_balance: U256,
    /// Owner's loan-token allowance to the agent
    pub owner_allowance: U256,
}

impl BorrowState {
    pub fn protocol(&self) -> u16 {
        self.target.placement.protocol
    }

    pub fn market(&self) -> &Market {
        &self.target.placement.market
    }

    pub fn loan_token(&self) -> &TokenInfo {
        &self.target.placement.loan_token
    }
}

/// Reconciled state of one agent for one cycle.
#[derive(Debug, Clone)]
pub struct AgentSnapshot {
    pub agent: AgentRecord,
    /// Protocol codes enabled on the agent
    pub protocols: Vec<u16>,
    pub reserves: SmallVec<[AssetReserve; 4]>,
    pub borrows: SmallVec<[BorrowState; 2]>,
}

impl AgentSnapshot {
    pub fn address(&self) -> Address {
        self.agent.address
    }

    pub fn collateral_reserves(&self) -> impl Iterator<Item = &AssetReserve> {
        self.reserves.iter().filter(|r| r.is_used_as_collateral)
    }

    pub fn unused_reserves(&self) -> impl Iterator<Item = &AssetReserve> {
        self.reserves.iter().filter(|r| !r.is_used_as_collateral)
    }
}

/// Builds [`AgentSnapshot`]s from the ledger and chain.
pub struct Reconciler<'a> {
    ledger: &'a dyn AgentLedger,
    reader: &'a dyn ChainReader,
    probe: &'a dyn CollateralProbe,
    borrow_protocol: u16,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        ledger: &'a dyn AgentLedger,
        reader: &'a dyn ChainReader,
        probe: &'a dyn CollateralProbe,
        borrow_protocol: u16,
    ) -> Self {
        Self {
            ledger,
            reader,
            probe,
            borrow_protocol,
        }
    }

    /// Indexed positions and borrows, validated. Any malformed record fails
    /// the whole agent.
    async fn load_ledger(&self, agent: Address) -> Result<(Vec<LivePosition>, Vec<BorrowTarget>)> {
        let (positions, borrows) =
            tokio::try_join!(self.ledger.positions(agent), self.ledger.borrows(agent))
                .context("indexer query failed")?;

        let mut live = Vec::with_capacity(positions.len());
        for position in &positions {
            if let Some(position) = LivePosition::from_indexed(position)? {
                live.push(position);
            }
        }
        let targets = borrows
            .iter()
            .map(BorrowTarget::from_indexed)
            .collect::<Result<Vec<_>, _>>()?;

        Ok((live, targets))
    }

    async fn reserve(&self, agent: &AgentRecord, position: LivePosition) -> Result<AssetReserve> {
        let MarketRecord {
            protocol,
            market,
            id,
            ..
        } = position.placement;
        let token = position.token.address;

        let (probe_locked, balance, allowance) = tokio::join!(
            self.probe.is_collateral_locked(agent.address, protocol, &market),
            self.reader.erc20_balance(token, agent.owner),
            self.reader.erc20_allowance(token, agent.owner, agent.address),
        );

        Ok(AssetReserve {
            token: position.token,
            protocol,
            market,
            market_id: id,
            supplied: position.amount,
            available_user_balance: balance?.min(allowance?),
            probe_locked,
            is_used_as_collateral: probe_locked || protocol == self.borrow_protocol,
        })
    }

    async fn borrow_state(
        &self,
        agent: &AgentRecord,
        target: BorrowTarget,
        adapters: &mut HashMap<u16, Address>,
    ) -> Result<BorrowState> {
        let protocol = target.placement.protocol;
        let adapter = match adapters.get(&protocol) {
            Some(adapter) => *adapter,
            None => {
                let adapter = self
                    .reader
                    .protocol_to_adapter(agent.address, protocol)
                    .await
                    .with_context(|| format!("no adapter for protocol {protocol}"))?;
                adapters.insert(protocol, adapter);
                adapter
            }
        };

        let market = target.placement.market;
        let loan = target.placement.loan_token.address;
        let (debt, health_factor, balance, allowance) = tokio::join!(
            self.reader.borrow_balance(adapter, &market, agent.address),
            self.reader.health_factor(adapter, &market, agent.address),
            self.reader.erc20_balance(loan, agent.owner),
            self.reader.erc20_allowance(loan, agent.owner, agent.address),
        );

        Ok(BorrowState {
            target,
            adapter,
            debt: debt?,
            health_factor: health_factor?,
            owner_balance: balance?,
            owner_allowance: allowance?,
        })
    }

    #[instrument(skip(self, agent), fields(agent = %agent.address))]
    pub async fn reconcile(&self, agent: &AgentRecord) -> Result<AgentSnapshot> {
        let (positions, targets) = self.load_ledger(agent.address).await?;
        let protocols = self.reader.agent_protocols(agent.address).await?;

        let reserves = try_join_all(positions.into_iter().map(|p| self.reserve(agent, p))).await?;

        let mut adapters = HashMap::new();
        let mut borrows = SmallVec::new();
        for target in targets {
            borrows.push(self.borrow_state(agent, target, &mut adapters).await?);
        }

        let snapshot = AgentSnapshot {
            agent: agent.clone(),
            protocols,
            reserves: SmallVec::from_vec(reserves),
            borrows,
        };
        debug!(
            reserves = snapshot.reserves.len(),
            collateral = snapshot.collateral_reserves().count(),
            borrows = snapshot.borrows.len(),
            "Agent reconciled"
        );
        Ok(snapshot)
    }
}
