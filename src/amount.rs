//! Amount handling utilities: position sizing and price moves

use rust_decimal::{Decimal, RoundingStrategy};

/// Decimal places kept on base amounts sent to venues
pub const BASE_AMOUNT_SCALE: u32 = 8;

/// Size a purchase from a quote balance.
///
/// Returns `(quote_value, base_amount)` where `quote_value = balance * percent / 100`
/// and `base_amount = quote_value / price`, truncated to [`BASE_AMOUNT_SCALE`].
/// Returns zeros for a non-positive price, percent or balance.
pub fn allocate(balance: Decimal, price: Decimal, percent: Decimal) -> (Decimal, Decimal) {
    allocate_leveraged(balance, price, percent, 1)
}

/// Same as [`allocate`], with the base amount scaled by `leverage`
pub fn allocate_leveraged(
    balance: Decimal,
    price: Decimal,
    percent: Decimal,
    leverage: u32,
) -> (Decimal, Decimal) {
    if price <= Decimal::ZERO || percent <= Decimal::ZERO || balance <= Decimal::ZERO || leverage == 0 {
        return (Decimal::ZERO, Decimal::ZERO);
    }

    let value = balance * percent / Decimal::ONE_HUNDRED;
    let base_amount = truncate_amount(value * Decimal::from(leverage) / price);
    (value, base_amount)
}

/// Truncate toward zero so a venue is never asked for more than was sized
pub fn truncate_amount(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(BASE_AMOUNT_SCALE, RoundingStrategy::ToZero)
}

/// Signed percentage change from `from` to `to`. `None` when `from` is not positive.
pub fn percent_change(from: Decimal, to: Decimal) -> Option<Decimal> {
    if from <= Decimal::ZERO {
        return None;
    }
    Some((to - from) / from * Decimal::ONE_HUNDRED)
}

/// True once the price has dropped by at least `threshold` percent
pub fn dropped_by(reference: Decimal, price: Decimal, threshold: Decimal) -> bool {
    percent_change(reference, price).map_or(false, |change| -change >= threshold)
}

/// True once the price has risen by at least `threshold` percent
pub fn rose_by(reference: Decimal, price: Decimal, threshold: Decimal) -> bool {
    percent_change(reference, price).map_or(false, |change| change >= threshold)
}

/// `price` moved by `percent` (positive up, negative down)
pub fn offset_price(price: Decimal, percent: Decimal) -> Decimal {
    price * (Decimal::ONE_HUNDRED + percent) / Decimal::ONE_HUNDRED
}
