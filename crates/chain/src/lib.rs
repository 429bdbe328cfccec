//! Keeper chain interaction layer.
//!
//! This crate provides:
//! - Market keys and their canonical [`MarketId`] hash
//! - Contract bindings for lending agents, protocol adapters and ERC20
//! - [`ChainClient`]: JSON-RPC reads, block sampling, Linea estimation
//! - [`CollateralProbe`]: collateral-lock detection by simulated withdrawal
//! - Gas statistics and pricing strategies (Legacy, EIP-1559, Linea)
//! - [`TransactionSender`]: the estimate, check, simulate and send pipeline
//!
//! Works with any EVM chain reachable over HTTP JSON-RPC.

pub mod contracts;
pub mod gas;
mod market;
mod probe;
mod provider;
mod reader;
mod signer;

pub use contracts::{AgentAction, MoveStep};
pub use gas::{GasParams, GasPricingModel, GasStrategy, SamplingConfig};
pub use market::{market_id, Market, MarketId, MarketIdError};
pub use probe::{CollateralProbe, SimulatedWithdrawProbe, SimulationFailure, WithdrawSimulator};
pub use provider::{ChainClient, ConnectError, LineaGasEstimate};
pub use reader::ChainReader;
pub use signer::{
    check_gas_ceiling, revert_reason, ActionExecutor, NonceManager, SubmitError,
    TransactionSender, TransactionSenderBuilder,
};
