//! Money calculation utilities using rust_decimal for precision
//!
//! Amounts travel as `f64` (the backend stores `numeric` and returns JSON
//! numbers). All arithmetic goes through `Decimal`, then back to `f64`
//! rounded to 2 decimal places.

use rust_decimal::prelude::*;

/// Rounding precision for monetary values
const DECIMAL_PLACES: u32 = 2;

/// Tolerance for monetary comparisons (0.01)
pub const MONEY_TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

/// Convert f64 to Decimal
#[inline]
pub fn to_decimal(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or_else(|| {
        tracing::error!(value = ?value, "Non-finite f64 in monetary calculation, defaulting to zero");
        Decimal::ZERO
    })
}

/// Convert Decimal back to f64, rounded to 2 decimal places (half away from zero)
#[inline]
pub fn to_f64(value: Decimal) -> f64 {
    value
        .round_dp_with_strategy(DECIMAL_PLACES, RoundingStrategy::MidpointAwayFromZero)
        .to_f64()
        .unwrap_or_else(|| {
            tracing::error!(value = %value, "Decimal out of f64 range, defaulting to zero");
            0.0
        })
}

/// `quantity * unit_price` for one order line
pub fn line_total(quantity: i32, unit_price: f64) -> Decimal {
    Decimal::from(quantity) * to_decimal(unit_price)
}

/// Sum of line totals over `(quantity, unit_price)` pairs, as stored
pub fn order_total<I>(lines: I) -> f64
where
    I: IntoIterator<Item = (i32, f64)>,
{
    to_f64(
        lines
            .into_iter()
            .map(|(quantity, unit_price)| line_total(quantity, unit_price))
            .sum(),
    )
}

/// Compare two amounts within [`MONEY_TOLERANCE`]
pub fn money_eq(a: f64, b: f64) -> bool {
    (to_decimal(a) - to_decimal(b)).abs() < MONEY_TOLERANCE
}
