//! Standard token interfaces.

use alloy::sol;

sol! {
    /// ERC20 subset needed to read owner balances and approvals.
    #[sol(rpc)]
    interface IERC20 {
        function balanceOf(address account) external view returns (uint256);
        function allowance(address owner, address spender) external view returns (uint256);
        function decimals() external view returns (uint8);
        function symbol() external view returns (string);
    }
}
