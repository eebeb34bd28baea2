//! Unit conversion between human-facing units and integer subunits
//!
//! The ledger only deals in integer subunits of the base asset; every
//! human-facing amount is converted exactly (no floating point) before a
//! transaction is constructed.

use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::{error::EscrowError, EscrowResult};

/// Subunits per one base-asset unit.
pub const SUBUNITS_PER_UNIT: u64 = 1_000_000;

/// Decimal places representable in subunits.
pub const MAX_DECIMAL_PLACES: u32 = 6;

/// Parse a human-facing unit amount (e.g. `"10.5"`) into integer subunits.
///
/// # Errors
///
/// Returns a validation error for unparsable input, non-positive amounts,
/// more than six decimal places, or overflow.
pub fn units_to_subunits(units: &str) -> EscrowResult<u64> {
    let value = Decimal::from_str(units.trim())
        .map_err(|e| EscrowError::validation("amount", format!("not a decimal number: {e}")))?;

    if value <= Decimal::ZERO {
        return Err(EscrowError::validation(
            "amount",
            format!("amount must be positive, got {units}"),
        ));
    }
    if value.normalize().scale() > MAX_DECIMAL_PLACES {
        return Err(EscrowError::validation(
            "amount",
            format!("amount {units} is finer than one subunit ({MAX_DECIMAL_PLACES} decimal places)"),
        ));
    }

    let subunits = value
        .checked_mul(Decimal::from(SUBUNITS_PER_UNIT))
        .and_then(|v| v.normalize().to_u64())
        .ok_or_else(|| {
            EscrowError::validation("amount", format!("amount {units} overflows subunit range"))
        })?;

    Ok(subunits)
}

/// Render integer subunits as an exact human-facing unit string.
pub fn subunits_to_units(subunits: u64) -> String {
    let value = Decimal::from(subunits) / Decimal::from(SUBUNITS_PER_UNIT);
    value.normalize().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_whole_and_fractional_units() {
        assert_eq!(units_to_subunits("10").unwrap(), 10_000_000);
        assert_eq!(units_to_subunits("10.5").unwrap(), 10_500_000);
        assert_eq!(units_to_subunits("0.000001").unwrap(), 1);
    }

    #[test]
    fn rejects_non_positive_amounts() {
        assert!(units_to_subunits("0").is_err());
        assert!(units_to_subunits("-3").is_err());
    }

    #[test]
    fn rejects_sub_subunit_precision() {
        assert!(units_to_subunits("0.0000001").is_err());
        // Trailing zeros beyond six places are still exact.
        assert_eq!(units_to_subunits("1.0000010").unwrap(), 1_000_001);
    }

    #[test]
    fn rejects_garbage() {
        assert!(units_to_subunits("ten").is_err());
        assert!(units_to_subunits("").is_err());
    }

    #[test]
    fn renders_units_exactly() {
        assert_eq!(subunits_to_units(10_000_000), "10");
        assert_eq!(subunits_to_units(1_500_000), "1.5");
        assert_eq!(subunits_to_units(1), "0.000001");
    }

    #[test]
    fn round_trips() {
        for s in ["1", "0.25", "123456.654321"] {
            let sub = units_to_subunits(s).unwrap();
            assert_eq!(units_to_subunits(&subunits_to_units(sub)).unwrap(), sub);
        }
    }
}
