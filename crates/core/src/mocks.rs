//! In-memory implementations of the keeper's collaborator traits.

use alloy::primitives::{Address, B256, U256};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use keeper_api::{
    AgentLedger, ApiError, IndexedAgent, IndexedBorrow, IndexedPosition, MarketRanking,
    PriceOracle, RankedMarket,
};
use keeper_chain::{ActionExecutor, AgentAction, ChainReader, CollateralProbe, Market, SubmitError};

#[derive(Default)]
pub struct MockLedger {
    pub agents: Vec<IndexedAgent>,
    positions: HashMap<Address, Vec<IndexedPosition>>,
    borrows: HashMap<Address, Vec<IndexedBorrow>>,
}

impl MockLedger {
    pub fn add_position(&mut self, agent: Address, position: IndexedPosition) {
        self.positions.entry(agent).or_default().push(position);
    }

    pub fn add_borrow(&mut self, agent: Address, borrow: IndexedBorrow) {
        self.borrows.entry(agent).or_default().push(borrow);
    }
}

#[async_trait]
impl AgentLedger for MockLedger {
    async fn agents(&self) -> keeper_api::Result<Vec<IndexedAgent>> {
        Ok(self.agents.clone())
    }

    async fn positions(&self, agent: Address) -> keeper_api::Result<Vec<IndexedPosition>> {
        Ok(self.positions.get(&agent).cloned().unwrap_or_default())
    }

    async fn borrows(&self, agent: Address) -> keeper_api::Result<Vec<IndexedBorrow>> {
        Ok(self.borrows.get(&agent).cloned().unwrap_or_default())
    }
}

/// Chain state keyed the way the reader is queried. Unset balances read as zero.
#[derive(Default)]
pub struct MockChain {
    protocols: HashMap<Address, Vec<u16>>,
    balances: HashMap<(Address, Address), U256>,
    allowances: HashMap<(Address, Address, Address), U256>,
    adapters: HashMap<(Address, u16), Address>,
    debts: HashMap<Address, U256>,
    health_factors: HashMap<Address, U256>,
}

impl MockChain {
    pub fn with_protocols(mut self, agent: Address, protocols: Vec<u16>) -> Self {
        self.protocols.insert(agent, protocols);
        self
    }

    pub fn with_balance(mut self, token: Address, owner: Address, amount: u64) -> Self {
        self.balances.insert((token, owner), U256::from(amount));
        self
    }

    pub fn with_allowance(mut self, token: Address, owner: Address, spender: Address, amount: u64) -> Self {
        self.allowances.insert((token, owner, spender), U256::from(amount));
        self
    }

    pub fn with_adapter(mut self, agent: Address, protocol: u16, adapter: Address) -> Self {
        self.adapters.insert((agent, protocol), adapter);
        self
    }

    pub fn with_debt(mut self, adapter: Address, debt: u64) -> Self {
        self.debts.insert(adapter, U256::from(debt));
        self
    }

    pub fn with_health_factor(mut self, adapter: Address, hf: U256) -> Self {
        self.health_factors.insert(adapter, hf);
        self
    }
}

#[async_trait]
impl ChainReader for MockChain {
    async fn erc20_balance(&self, token: Address, owner: Address) -> Result<U256> {
        Ok(self.balances.get(&(token, owner)).copied().unwrap_or_default())
    }

    async fn erc20_allowance(&self, token: Address, owner: Address, spender: Address) -> Result<U256> {
        Ok(self
            .allowances
            .get(&(token, owner, spender))
            .copied()
            .unwrap_or_default())
    }

    async fn protocol_to_adapter(&self, agent: Address, protocol: u16) -> Result<Address> {
        self.adapters
            .get(&(agent, protocol))
            .copied()
            .ok_or_else(|| anyhow!("protocol {protocol} not enabled"))
    }

    async fn agent_protocols(&self, agent: Address) -> Result<Vec<u16>> {
        Ok(self.protocols.get(&agent).cloned().unwrap_or_default())
    }

    async fn borrow_balance(&self, adapter: Address, _market: &Market, _user: Address) -> Result<U256> {
        Ok(self.debts.get(&adapter).copied().unwrap_or_default())
    }

    async fn health_factor(&self, adapter: Address, _market: &Market, _user: Address) -> Result<U256> {
        Ok(self.health_factors.get(&adapter).copied().unwrap_or(U256::MAX))
    }
}

/// Markets (by address) whose forced withdrawal reverts.
#[derive(Default)]
pub struct MockProbe {
    locked: HashSet<Address>,
}

impl MockProbe {
    pub fn locked(markets: impl IntoIterator<Item = Address>) -> Self {
        Self {
            locked: markets.into_iter().collect(),
        }
    }
}

#[async_trait]
impl CollateralProbe for MockProbe {
    async fn is_collateral_locked(&self, _agent: Address, _protocol: u16, market: &Market) -> bool {
        self.locked.contains(&market.market_address)
    }
}

#[derive(Default)]
pub struct MockRanking {
    pub markets: Vec<RankedMarket>,
    pub fail: bool,
}

impl MockRanking {
    pub fn new(markets: Vec<RankedMarket>) -> Self {
        Self {
            markets,
            fail: false,
        }
    }
}

#[async_trait]
impl MarketRanking for MockRanking {
    async fn best_supply_markets(
        &self,
        _chain_id: u64,
        tokens: &[Address],
        protocols: &[u16],
    ) -> keeper_api::Result<Vec<RankedMarket>> {
        if self.fail {
            return Err(ApiError::GraphQl("ranking unavailable".to_string()));
        }
        Ok(self
            .markets
            .iter()
            .filter(|m| tokens.contains(&m.collateral_asset.token.address))
            .filter(|m| protocols.is_empty() || protocols.contains(&m.protocol))
            .cloned()
            .collect())
    }

    async fn markets_on_chain(&self, _chain_id: u64) -> keeper_api::Result<Vec<RankedMarket>> {
        if self.fail {
            return Err(ApiError::GraphQl("ranking unavailable".to_string()));
        }
        Ok(self.markets.clone())
    }
}

#[derive(Default)]
pub struct MockPrices(pub HashMap<Address, f64>);

#[async_trait]
impl PriceOracle for MockPrices {
    async fn usd_price(&self, chain: &str, token: Address) -> keeper_api::Result<f64> {
        self.0
            .get(&token)
            .copied()
            .ok_or_else(|| ApiError::MissingPrice(format!("{chain}:{token}")))
    }
}

/// Records every submitted action; optionally fails them all.
#[derive(Default)]
pub struct RecordingExecutor {
    pub submitted: Mutex<Vec<(Address, AgentAction)>>,
    pub fail: bool,
}

impl RecordingExecutor {
    pub fn failing() -> Self {
        Self {
            submitted: Mutex::default(),
            fail: true,
        }
    }

    pub fn actions(&self) -> Vec<AgentAction> {
        match self.submitted.lock() {
            Ok(guard) => guard.iter().map(|(_, action)| action.clone()).collect(),
            Err(_) => Vec::new(),
        }
    }
}

#[async_trait]
impl ActionExecutor for RecordingExecutor {
    async fn execute(&self, agent: Address, action: &AgentAction) -> Result<B256, SubmitError> {
        if self.fail {
            return Err(SubmitError::EstimationReverted {
                reason: "execution reverted".to_string(),
            });
        }
        let mut submitted = self
            .submitted
            .lock()
            .map_err(|_| SubmitError::Other(anyhow!("recorder poisoned")))?;
        submitted.push((agent, action.clone()));
        Ok(B256::with_last_byte(submitted.len() as u8))
    }
}

/// Fixed addresses and record builders shared by the core tests.
pub mod fixtures {
    use super::*;
    use alloy::primitives::address;
    use keeper_api::{
        AssetKind, CollateralAsset, CollateralPolicy, IndexedAllocation, IndexedMarket,
        IndexedToken, LoanAsset, Page, TokenRef,
    };
    use smallvec::SmallVec;

    use crate::ledger::{AgentRecord, BorrowTarget, MarketRecord, TokenInfo};
    use crate::reconcile::{AgentSnapshot, AssetReserve, BorrowState};
    use crate::u256_math::f64_to_wad;

    pub const AGENT: Address = address!("1111111111111111111111111111111111111111");
    pub const OWNER: Address = address!("2222222222222222222222222222222222222222");
    pub const ADAPTER: Address = address!("3333333333333333333333333333333333333333");

    pub const WETH: Address = address!("4200000000000000000000000000000000000006");
    pub const USDC: Address = address!("833589fCD6eDb6E08f4c7C32D4f71b54bdA02913");
    pub const CBBTC: Address = address!("cbB7C0000aB88B473b1f5aFd9ef808440eed33Bf");

    pub fn decimals(token: Address) -> u8 {
        match token {
            t if t == USDC => 6,
            t if t == CBBTC => 8,
            _ => 18,
        }
    }

    pub fn token_info(token: Address) -> TokenInfo {
        TokenInfo {
            address: token,
            symbol: String::new(),
            decimals: decimals(token),
        }
    }

    /// Market address unique to a collateral token and protocol.
    pub fn market_address(token: Address, protocol: u16) -> Address {
        let mut bytes = token.0 .0;
        bytes[0] = 0xA0 | (protocol as u8 & 0x0F);
        Address::from(bytes)
    }

    /// USDC-loan market for `collateral` under protocol 2.
    pub fn market_of(collateral: Address) -> Market {
        market_in(collateral, 2)
    }

    pub fn market_in(collateral: Address, protocol: u16) -> Market {
        Market {
            loan_token: USDC,
            collateral_token: collateral,
            market_address: market_address(collateral, protocol),
            aux_id: B256::ZERO,
            flags: 0,
        }
    }

    pub fn hf(value: f64) -> U256 {
        f64_to_wad(value)
    }

    pub fn agent() -> AgentRecord {
        AgentRecord {
            address: AGENT,
            owner: OWNER,
            adapters: vec![ADAPTER],
            disabled_at: None,
        }
    }

    fn indexed_token(token: Address) -> IndexedToken {
        IndexedToken {
            address: Some(token.to_string()),
            symbol: None,
            decimals: Some(decimals(token) as i64),
        }
    }

    fn indexed_market(market: &Market, protocol: i64) -> IndexedMarket {
        IndexedMarket {
            id: None,
            protocol_code: Some(protocol),
            market_address: Some(market.market_address.to_string()),
            aux_id: Some(market.aux_id.to_string()),
            flags: Some(market.flags as i64),
            loan_token: Some(indexed_token(market.loan_token)),
            collateral_token: Some(indexed_token(market.collateral_token)),
        }
    }

    pub fn indexed_position(id: &str, token: Address, protocol: i64, amount: &str) -> IndexedPosition {
        let market = market_in(token, protocol as u16);
        IndexedPosition {
            id: id.to_string(),
            token: Some(indexed_token(token)),
            allocations: Some(Page {
                items: vec![IndexedAllocation {
                    id: format!("{id}-a1"),
                    amount: amount.to_string(),
                    timestamp: "1700000000".to_string(),
                    market: Some(indexed_market(&market, protocol)),
                    withdrawal: None,
                }],
            }),
        }
    }

    /// Borrow of USDC against WETH.
    pub fn indexed_borrow(id: &str, protocol: i64, min: &str, max: Option<&str>) -> IndexedBorrow {
        let market = market_in(WETH, protocol as u16);
        IndexedBorrow {
            id: id.to_string(),
            min_amount: min.to_string(),
            max_amount: max.map(str::to_string),
            market: Some(indexed_market(&market, protocol)),
        }
    }

    pub fn reserve(token: Address, protocol: u16, supplied: u64, available: u64, locked: bool) -> AssetReserve {
        let market = market_in(token, protocol);
        AssetReserve {
            token: token_info(token),
            protocol,
            market,
            market_id: market.id(protocol),
            supplied: U256::from(supplied),
            available_user_balance: U256::from(available),
            probe_locked: locked,
            is_used_as_collateral: locked || protocol == 1,
        }
    }

    pub struct BorrowFixture {
        pub protocol: u16,
        pub min: u64,
        pub max: Option<u64>,
        pub debt: u64,
        pub hf: f64,
        pub balance: u64,
        pub allowance: u64,
    }

    impl Default for BorrowFixture {
        fn default() -> Self {
            Self {
                protocol: 1,
                min: 100,
                max: Some(500),
                debt: 500,
                hf: 2.0,
                balance: 0,
                allowance: 0,
            }
        }
    }

    pub fn borrow(fixture: BorrowFixture) -> BorrowState {
        let market = market_in(WETH, fixture.protocol);
        BorrowState {
            target: BorrowTarget {
                id: "b1".to_string(),
                placement: MarketRecord {
                    protocol: fixture.protocol,
                    market,
                    id: market.id(fixture.protocol),
                    loan_token: token_info(USDC),
                    collateral_token: token_info(WETH),
                },
                min_amount: U256::from(fixture.min),
                max_amount: fixture.max.map(U256::from),
            },
            adapter: ADAPTER,
            debt: U256::from(fixture.debt),
            health_factor: hf(fixture.hf),
            owner_balance: U256::from(fixture.balance),
            owner_allowance: U256::from(fixture.allowance),
        }
    }

    pub fn snapshot(protocols: Vec<u16>, reserves: Vec<AssetReserve>, borrows: Vec<BorrowState>) -> AgentSnapshot {
        AgentSnapshot {
            agent: agent(),
            protocols,
            reserves: SmallVec::from_vec(reserves),
            borrows: SmallVec::from_vec(borrows),
        }
    }

    /// Ranked USDC-loan market for `collateral`.
    pub fn ranked(collateral: Address, protocol: u16, ltv: f64) -> RankedMarket {
        let market = market_in(collateral, protocol);
        RankedMarket {
            loan_asset: LoanAsset {
                token: TokenRef {
                    address: USDC,
                    symbol: "USDC".to_string(),
                    decimals: 6,
                },
                borrow_rate: 0.05,
            },
            collateral_asset: CollateralAsset {
                token: TokenRef {
                    address: collateral,
                    symbol: String::new(),
                    decimals: decimals(collateral),
                },
                policy: CollateralPolicy {
                    liq_threshold: ltv + 0.05,
                    ltv,
                },
                supply_rate: 0.03,
                kind: Some(AssetKind::Collateral),
            },
            aux_id: market.aux_id,
            flags: market.flags,
            market_address: market.market_address,
            platform: format!("protocol-{protocol}"),
            protocol,
        }
    }

    #[test]
    fn test_market_addresses_are_distinct() {
        assert_ne!(market_address(WETH, 1), market_address(WETH, 2));
        assert_ne!(market_address(WETH, 2), market_address(CBBTC, 2));
    }
}
