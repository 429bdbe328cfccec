//! Contract bindings and call encoding.
//!
//! - [`bindings`]: agent and adapter interfaces sharing the `MarketKey` struct
//! - [`common`]: ERC20
//! - [`agent`]: the [`AgentAction`] set the keeper submits

pub mod agent;
pub mod bindings;
pub mod common;

pub use agent::{AgentAction, MoveStep};
pub use bindings::{ILendingAdapter, ILendingAgent, MarketKey, RebalanceStep};
pub use common::IERC20;
