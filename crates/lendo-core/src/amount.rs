//! Exact conversion between user-facing decimal amounts and wei.
//!
//! The ledger speaks base-unit integers (`U256` wei). The client keeps amounts as
//! [`Decimal`] with up to 18 fractional digits, so every value that the wire can
//! express in that range converts back and forth without rounding.

use std::str::FromStr;

use alloy_primitives::U256;
use rust_decimal::Decimal;

use crate::error::AmountError;

/// Number of fractional digits in one ether.
pub const WEI_DECIMALS: u32 = 18;

/// Largest mantissa a `Decimal` can carry (2^96 - 1).
const MAX_MANTISSA: u128 = 79_228_162_514_264_337_593_543_950_335;

/// Convert a non-negative decimal amount into wei.
pub fn to_wei(amount: Decimal) -> Result<U256, AmountError> {
    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(AmountError::Negative(amount.to_string()));
    }

    let amount = amount.normalize();
    let scale = amount.scale();
    if scale > WEI_DECIMALS {
        return Err(AmountError::TooPrecise(amount.to_string()));
    }

    let mantissa = amount.mantissa().unsigned_abs();
    let factor = U256::from(10u8).pow(U256::from(WEI_DECIMALS - scale));

    Ok(U256::from(mantissa) * factor)
}

/// Convert a wei amount read from the ledger into a decimal.
///
/// Fails when the value does not fit a `Decimal` with 18 fractional digits
/// (roughly 79 billion ether), rather than silently rounding it.
pub fn from_wei(wei: U256) -> Result<Decimal, AmountError> {
    if wei > U256::from(MAX_MANTISSA) {
        return Err(AmountError::Overflow(wei.to_string()));
    }

    let raw = wei.to::<u128>() as i128;
    Decimal::try_from_i128_with_scale(raw, WEI_DECIMALS)
        .map(|d| d.normalize())
        .map_err(|_| AmountError::Overflow(wei.to_string()))
}

/// Parse user input into a strictly positive amount expressible in wei.
pub fn parse_amount(input: &str) -> Result<Decimal, AmountError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(AmountError::Invalid(input.to_string()));
    }

    let amount =
        Decimal::from_str(trimmed).map_err(|_| AmountError::Invalid(input.to_string()))?;
    if amount <= Decimal::ZERO {
        return Err(AmountError::NotPositive(trimmed.to_string()));
    }
    if amount.normalize().scale() > WEI_DECIMALS {
        return Err(AmountError::TooPrecise(trimmed.to_string()));
    }

    Ok(amount.normalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_one_ether() {
        let wei = to_wei(dec!(1)).unwrap();
        assert_eq!(wei, U256::from(1_000_000_000_000_000_000u128));
        assert_eq!(from_wei(wei).unwrap(), dec!(1));
    }

    #[test]
    fn test_round_trip_preserves_value() {
        let samples = [
            dec!(0),
            dec!(0.000000000000000001),
            dec!(0.1),
            dec!(0.55),
            dec!(1.5),
            dec!(12345.678901234567890123),
            dec!(79228162514.264337593543950335),
        ];
        for amount in samples {
            let wei = to_wei(amount).unwrap();
            assert_eq!(from_wei(wei).unwrap(), amount, "round trip of {amount}");
        }
    }

    #[test]
    fn test_wei_to_decimal_round_trip() {
        for raw in [1u128, 7, 10u128.pow(17), 123_456_789_012_345_678_901] {
            let wei = U256::from(raw);
            assert_eq!(to_wei(from_wei(wei).unwrap()).unwrap(), wei);
        }
    }

    #[test]
    fn test_rejects_sub_wei_precision() {
        assert!(matches!(
            to_wei(dec!(0.0000000000000000001)),
            Err(AmountError::TooPrecise(_))
        ));
    }

    #[test]
    fn test_rejects_negative() {
        assert!(matches!(to_wei(dec!(-1)), Err(AmountError::Negative(_))));
    }

    #[test]
    fn test_from_wei_overflow() {
        let too_big = U256::from(MAX_MANTISSA) + U256::from(1u8);
        assert!(matches!(from_wei(too_big), Err(AmountError::Overflow(_))));
        assert!(from_wei(U256::MAX).is_err());
    }

    #[test]
    fn test_parse_amount() {
        assert_eq!(parse_amount(" 1.50 ").unwrap(), dec!(1.5));
        assert!(matches!(parse_amount(""), Err(AmountError::Invalid(_))));
        assert!(matches!(parse_amount("abc"), Err(AmountError::Invalid(_))));
        assert!(matches!(parse_amount("0"), Err(AmountError::NotPositive(_))));
        assert!(matches!(parse_amount("-2"), Err(AmountError::NotPositive(_))));
        assert!(matches!(
            parse_amount("1.0000000000000000001"),
            Err(AmountError::TooPrecise(_))
        ));
    }
}
