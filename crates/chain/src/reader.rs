//! Read-only on-chain queries the keeper depends on.

use alloy::primitives::{Address, U256};
use anyhow::Result;
use async_trait::async_trait;

use crate::market::Market;

/// Contract reads used by reconciliation and the decision engines.
///
/// Implemented by [`crate::ChainClient`] over JSON-RPC; tests substitute an
/// in-memory implementation.
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// ERC20 `balanceOf(owner)`.
    async fn erc20_balance(&self, token: Address, owner: Address) -> Result<U256>;

    /// ERC20 `allowance(owner, spender)`.
    async fn erc20_allowance(&self, token: Address, owner: Address, spender: Address)
        -> Result<U256>;

    /// `protocolToAdapter(protocol)` on the agent.
    async fn protocol_to_adapter(&self, agent: Address, protocol: u16) -> Result<Address>;

    /// Protocol codes enabled on the agent.
    async fn agent_protocols(&self, agent: Address) -> Result<Vec<u16>>;

    /// Live debt of `user` on a market, via the adapter.
    async fn borrow_balance(&self, adapter: Address, market: &Market, user: Address)
        -> Result<U256>;

    /// 1e18-scaled health factor of `user` on a market, via the adapter.
    async fn health_factor(&self, adapter: Address, market: &Market, user: Address)
        -> Result<U256>;
}
