//! Collateral-lock detection.
//!
//! A reserve is locked as collateral when a forced withdrawal of it would
//! fail. The probe simulates `batchWithdraw([protocol], [market], true)`
//! from the keeper account and never broadcasts anything.

use alloy::primitives::Address;
use alloy::transports::TransportError;
use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::contracts::{ILendingAgent, MarketKey};
use crate::market::Market;
use crate::provider::ChainClient;
use crate::signer::revert_reason;

/// Answers whether an agent's reserve currently backs a borrow.
#[async_trait]
pub trait CollateralProbe: Send + Sync {
    /// `true` when the reserve cannot be withdrawn right now.
    async fn is_collateral_locked(&self, agent: Address, protocol: u16, market: &Market) -> bool;
}

/// Outcome of a failed withdrawal simulation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SimulationFailure {
    #[error("reverted: {0}")]
    Reverted(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl From<TransportError> for SimulationFailure {
    fn from(err: TransportError) -> Self {
        if err.as_error_resp().is_some() {
            Self::Reverted(revert_reason(&err))
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// `eth_call` of a forced withdrawal of one reserve.
#[async_trait]
pub trait WithdrawSimulator: Send + Sync {
    async fn simulate_forced_withdraw(
        &self,
        agent: Address,
        from: Address,
        protocol: u16,
        market: &Market,
    ) -> Result<(), SimulationFailure>;
}

#[async_trait]
impl WithdrawSimulator for ChainClient {
    async fn simulate_forced_withdraw(
        &self,
        agent: Address,
        from: Address,
        protocol: u16,
        market: &Market,
    ) -> Result<(), SimulationFailure> {
        ILendingAgent::new(agent, self.provider())
            .batchWithdraw(vec![protocol], vec![MarketKey::from(market)], true)
            .from(from)
            .call()
            .await
            .map(|_| ())
            .map_err(|e| match e {
                alloy::contract::Error::TransportError(err) => SimulationFailure::from(err),
                other => SimulationFailure::Reverted(other.to_string()),
            })
    }
}

/// Probe backed by a simulated forced withdrawal.
///
/// Any failure, including transport errors, reads as locked so that a
/// flaky RPC never lets a collateral reserve be moved.
#[derive(Debug, Clone)]
pub struct SimulatedWithdrawProbe<S = ChainClient> {
    simulator: S,
    account: Address,
}

impl<S: WithdrawSimulator> SimulatedWithdrawProbe<S> {
    pub fn new(simulator: S, account: Address) -> Self {
        Self { simulator, account }
    }
}

#[async_trait]
impl<S: WithdrawSimulator> CollateralProbe for SimulatedWithdrawProbe<S> {
    async fn is_collateral_locked(&self, agent: Address, protocol: u16, market: &Market) -> bool {
        let result = self
            .simulator
            .simulate_forced_withdraw(agent, self.account, protocol, market)
            .await;

        match result {
            Ok(()) => false,
            Err(SimulationFailure::Reverted(reason)) => {
                debug!(
                    agent = %agent,
                    protocol,
                    market = %market.market_address,
                    reason = %reason,
                    "Forced withdrawal reverts, reserve is collateral"
                );
                true
            }
            Err(SimulationFailure::Transport(error)) => {
                debug!(
                    agent = %agent,
                    protocol,
                    market = %market.market_address,
                    error = %error,
                    "Probe call failed, treating reserve as collateral"
                );
                true
            }
        }
    }
}
