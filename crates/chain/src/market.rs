//! Lending market placements and their canonical identifiers.
//!
//! A [`Market`] plus a 16-bit protocol code forms a market key. Hashing the
//! key with the ABI encoding of
//! `(uint16 protocolCode, address loanToken, address collateralToken,
//! address marketAddress, bytes32 auxId, uint16 flags)` yields the
//! [`MarketId`] used for every equality check across the keeper.

use alloy::primitives::{keccak256, Address, B256};
use alloy::sol_types::SolValue;
use std::fmt;
use thiserror::Error;

/// A specific lending placement inside one protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Market {
    /// Asset that can be borrowed from this market
    pub loan_token: Address,
    /// Asset supplied into this market
    pub collateral_token: Address,
    /// Protocol contract holding the market
    pub market_address: Address,
    /// Opaque protocol-specific discriminator
    pub aux_id: B256,
    /// Protocol-specific bitmask
    pub flags: u16,
}

impl Market {
    /// Identifier of this market under a known-valid protocol code.
    pub fn id(&self, protocol_code: u16) -> MarketId {
        let encoded = (
            protocol_code,
            self.loan_token,
            self.collateral_token,
            self.market_address,
            self.aux_id,
            self.flags,
        )
            .abi_encode();
        MarketId(keccak256(encoded))
    }
}

/// Canonical hash of `(protocolCode, market)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MarketId(pub B256);

impl fmt::Display for MarketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MarketIdError {
    #[error("invalid protocol code {0}: must fit in uint16")]
    InvalidProtocolCode(i64),
}

/// Hash a market key whose protocol code comes from untrusted input.
pub fn market_id(protocol_code: i64, market: &Market) -> Result<MarketId, MarketIdError> {
    let code =
        u16::try_from(protocol_code).map_err(|_| MarketIdError::InvalidProtocolCode(protocol_code))?;
    Ok(market.id(code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    fn sample_market() -> Market {
        Market {
            loan_token: address!("833589fCD6eDb6E08f4c7C32D4f71b54bdA02913"),
            collateral_token: address!("4200000000000000000000000000000000000006"),
            market_address: address!("A238Dd80C259a72e81d7e4664a9801593F98d1c5"),
            aux_id: B256::ZERO,
            flags: 0,
        }
    }

    #[test]
    fn test_market_id_is_deterministic() {
        let market = sample_market();
        assert_eq!(market_id(1, &market), market_id(1, &market));
        assert_eq!(market_id(1, &market).unwrap(), market.id(1));
    }

    #[test]
    fn test_market_id_changes_with_every_field() {
        let base = sample_market();
        let base_id = base.id(1);

        assert_ne!(base.id(2), base_id);

        let mut flagged = base;
        flagged.flags = 1;
        assert_ne!(flagged.id(1), base_id);

        let mut aux = base;
        aux.aux_id = B256::with_last_byte(1);
        assert_ne!(aux.id(1), base_id);

        let mut swapped = base;
        std::mem::swap(&mut swapped.loan_token, &mut swapped.collateral_token);
        assert_ne!(swapped.id(1), base_id);
    }

    #[test]
    fn test_market_id_rejects_out_of_range_codes() {
        let market = sample_market();
        assert!(market_id(0, &market).is_ok());
        assert!(market_id(65_535, &market).is_ok());
        assert_eq!(
            market_id(65_536, &market),
            Err(MarketIdError::InvalidProtocolCode(65_536))
        );
        assert_eq!(
            market_id(-1, &market),
            Err(MarketIdError::InvalidProtocolCode(-1))
        );
    }

    #[test]
    fn test_market_id_matches_abi_encoding() {
        let market = sample_market();
        let encoded = (
            7u16,
            market.loan_token,
            market.collateral_token,
            market.market_address,
            market.aux_id,
            market.flags,
        )
            .abi_encode();
        // Six static words.
        assert_eq!(encoded.len(), 6 * 32);
        assert_eq!(market.id(7).0, keccak256(encoded));
    }
}
