//! Fixed-point helpers for token amounts.
//!
//! Amounts stay in raw token units (`U256`). Ratios that arrive as `f64`
//! (prices, LTVs, thresholds) are converted to WAD once and applied with
//! integer arithmetic.

use alloy::primitives::U256;

/// WAD constant: 1e18 for 18-decimal fixed-point arithmetic
pub const WAD: U256 = U256::from_limbs([1_000_000_000_000_000_000u64, 0, 0, 0]);

/// Basis points denominator (10000 = 100%)
pub const BPS_DENOMINATOR: U256 = U256::from_limbs([10_000u64, 0, 0, 0]);

#[inline(always)]
pub fn pow10(exp: u8) -> U256 {
    U256::from(10u64).pow(U256::from(exp))
}

/// `value * bps / 10000`, rounded down.
///
/// Example: bps_of(1000, 1000) = 100 (10%)
#[inline(always)]
pub fn bps_of(value: U256, bps: u16) -> U256 {
    value.saturating_mul(U256::from(bps)) / BPS_DENOMINATOR
}

/// Convert a non-negative ratio to WAD. Negative and NaN inputs map to zero.
#[inline(always)]
pub fn f64_to_wad(value: f64) -> U256 {
    if value.is_nan() || value <= 0.0 {
        return U256::ZERO;
    }
    U256::from((value * 1e18) as u128)
}

/// Convert WAD (18 decimals) to f64, for logging and threshold checks.
#[inline(always)]
pub fn wad_to_f64(wad: U256) -> f64 {
    if wad <= U256::from(u128::MAX) {
        let value: u128 = wad.to();
        value as f64 / 1e18
    } else {
        const LIMB: f64 = 18_446_744_073_709_551_616.0; // 2^64
        let value = wad
            .as_limbs()
            .iter()
            .rev()
            .fold(0.0, |acc, limb| acc * LIMB + *limb as f64);
        value / 1e18
    }
}

/// Value `amount` of one token in another token's units at `rate_wad`
/// (price of one whole base token in whole quote tokens).
///
/// Divides once, after every multiplication, so low-decimal base tokens
/// keep their precision.
#[inline(always)]
pub fn convert_at_rate(amount: U256, rate_wad: U256, base_decimals: u8, quote_decimals: u8) -> U256 {
    let numerator = amount
        .saturating_mul(rate_wad)
        .saturating_mul(pow10(quote_decimals));
    numerator / WAD.saturating_mul(pow10(base_decimals))
}
