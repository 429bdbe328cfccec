//! Contract bindings for the lending agent and its protocol adapters.
//!
//! The agent and adapter interfaces share the `MarketKey` and `RebalanceStep`
//! structs, so both live in one `sol!` invocation.
//!
//! # Usage
//!
//! ```rust,ignore
//! use keeper_chain::contracts::bindings::ILendingAgent;
//!
//! let agent = ILendingAgent::new(agent_address, &provider);
//! let adapter = agent.protocolToAdapter(1).call().await?._0;
//! ```

use alloy::sol;

use crate::market::Market;

sol! {
    /// Market key as passed to agents and adapters.
    #[derive(Debug, PartialEq, Eq)]
    struct MarketKey {
        address loanToken;
        address collateralToken;
        address marketAddress;
        bytes32 auxId;
        uint16 flags;
    }

    /// One supply move between two markets.
    #[derive(Debug, PartialEq, Eq)]
    struct RebalanceStep {
        MarketKey fromMarket;
        uint16 fromProtocolCode;
        MarketKey toMarket;
        uint16 toProtocolCode;
    }

    /// Per-user automation contract.
    #[sol(rpc)]
    interface ILendingAgent {
        function protocolToAdapter(uint16 protocolCode) external view returns (address);
        function getProtocols() external view returns (uint16[] memory);

        function batchWithdraw(uint16[] calldata protocolCodes, MarketKey[] calldata markets, bool force) external;
        function distribute(
            address[] calldata tokens,
            uint16[] calldata protocolCodes,
            MarketKey[] calldata markets,
            uint256[] calldata amounts
        ) external;
        function borrow(uint16 protocolCode, MarketKey calldata market, uint256 minAmount, uint256 maxAmount) external;
        function repay(uint16 protocolCode, MarketKey calldata market, uint256 amount) external;
        function rebalance(RebalanceStep[] calldata steps) external;
    }

    /// Per-protocol adapter translating generic calls into protocol calls.
    #[sol(rpc)]
    interface ILendingAdapter {
        function protocolCode() external view returns (uint16);
        function getSupplyBalance(MarketKey calldata market, address user) external view returns (uint256);
        function getBorrowBalance(MarketKey calldata market, address user) external view returns (uint256);
        /// 1e18-scaled.
        function getHealthFactor(MarketKey calldata market, address user) external view returns (uint256);
    }
}

impl From<&Market> for MarketKey {
    fn from(market: &Market) -> Self {
        Self {
            loanToken: market.loan_token,
            collateralToken: market.collateral_token,
            marketAddress: market.market_address,
            auxId: market.aux_id,
            flags: market.flags,
        }
    }
}

impl From<&MarketKey> for Market {
    fn from(key: &MarketKey) -> Self {
        Self {
            loan_token: key.loanToken,
            collateral_token: key.collateralToken,
            market_address: key.marketAddress,
            aux_id: key.auxId,
            flags: key.flags,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{address, B256};
    use alloy::sol_types::SolCall;

    #[test]
    fn test_market_key_conversion_round_trips() {
        let market = Market {
            loan_token: address!("833589fCD6eDb6E08f4c7C32D4f71b54bdA02913"),
            collateral_token: address!("4200000000000000000000000000000000000006"),
            market_address: address!("A238Dd80C259a72e81d7e4664a9801593F98d1c5"),
            aux_id: B256::with_last_byte(9),
            flags: 3,
        };
        let key = MarketKey::from(&market);
        assert_eq!(key.flags, 3);
        assert_eq!(Market::from(&key), market);
    }

    #[test]
    fn test_signatures() {
        assert_eq!(
            ILendingAgent::repayCall::SIGNATURE,
            "repay(uint16,(address,address,address,bytes32,uint16),uint256)"
        );
        assert_eq!(
            ILendingAgent::rebalanceCall::SIGNATURE,
            "rebalance(((address,address,address,bytes32,uint16),uint16,(address,address,address,bytes32,uint16),uint16)[])"
        );
        assert_eq!(ILendingAdapter::protocolCodeCall::SIGNATURE, "protocolCode()");
    }
}
