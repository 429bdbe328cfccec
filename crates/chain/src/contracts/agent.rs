//! Agent actions the keeper can submit, and their calldata.

use alloy::primitives::{Address, Bytes, U256};
use alloy::sol_types::SolCall;
use std::fmt;

use super::bindings::{ILendingAgent, MarketKey, RebalanceStep};
use crate::market::Market;

/// One supply move from a source market to a destination market.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveStep {
    pub from_market: Market,
    pub from_protocol: u16,
    pub to_market: Market,
    pub to_protocol: u16,
}

impl From<&MoveStep> for RebalanceStep {
    fn from(step: &MoveStep) -> Self {
        Self {
            fromMarket: MarketKey::from(&step.from_market),
            fromProtocolCode: step.from_protocol,
            toMarket: MarketKey::from(&step.to_market),
            toProtocolCode: step.to_protocol,
        }
    }
}

/// A state-changing call on an agent contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentAction {
    /// Repay `amount` of the loan token on a borrow market.
    Repay {
        protocol: u16,
        market: Market,
        amount: U256,
    },
    /// Pull `amount` of `token` from the owner and supply it to a market.
    Distribute {
        token: Address,
        protocol: u16,
        market: Market,
        amount: U256,
    },
    /// Borrow `amount` on a market and forward it to the owner.
    Borrow {
        protocol: u16,
        market: Market,
        amount: U256,
    },
    /// Move supplied funds between markets.
    Rebalance { steps: Vec<MoveStep> },
}

impl AgentAction {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentAction::Repay { .. } => "repay",
            AgentAction::Distribute { .. } => "distribute",
            AgentAction::Borrow { .. } => "borrow",
            AgentAction::Rebalance { .. } => "rebalance",
        }
    }

    /// ABI-encoded call on the agent contract.
    pub fn calldata(&self) -> Bytes {
        match self {
            AgentAction::Repay {
                protocol,
                market,
                amount,
            } => ILendingAgent::repayCall {
                protocolCode: *protocol,
                market: market.into(),
                amount: *amount,
            }
            .abi_encode()
            .into(),
            AgentAction::Distribute {
                token,
                protocol,
                market,
                amount,
            } => ILendingAgent::distributeCall {
                tokens: vec![*token],
                protocolCodes: vec![*protocol],
                markets: vec![market.into()],
                amounts: vec![*amount],
            }
            .abi_encode()
            .into(),
            AgentAction::Borrow {
                protocol,
                market,
                amount,
            } => ILendingAgent::borrowCall {
                protocolCode: *protocol,
                market: market.into(),
                minAmount: *amount,
                maxAmount: U256::ZERO,
            }
            .abi_encode()
            .into(),
            AgentAction::Rebalance { steps } => ILendingAgent::rebalanceCall {
                steps: steps.iter().map(RebalanceStep::from).collect(),
            }
            .abi_encode()
            .into(),
        }
    }
}

impl fmt::Display for AgentAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentAction::Repay {
                protocol, amount, ..
            } => write!(f, "repay {amount} on protocol {protocol}"),
            AgentAction::Distribute {
                token,
                protocol,
                amount,
                ..
            } => write!(f, "distribute {amount} of {token} into protocol {protocol}"),
            AgentAction::Borrow {
                protocol, amount, ..
            } => write!(f, "borrow {amount} on protocol {protocol}"),
            AgentAction::Rebalance { steps } => write!(f, "rebalance with {} step(s)", steps.len()),
        }
    }
}
