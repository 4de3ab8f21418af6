use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

/// Largest multiple of `step` that is <= `value`. Steps must be positive;
/// a non-positive step returns the value untouched.
pub fn floor_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    (value / step).floor() * step
}

/// Smallest multiple of `step` that is >= `value`.
pub fn ceil_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    (value / step).ceil() * step
}

/// Number of fractional digits the step requires, e.g. 0.0001 -> 4, 1 -> 0.
pub fn step_scale(step: Decimal) -> u32 {
    step.normalize().scale()
}

/// Floors `value` to the step and renders it with exactly as many fractional
/// digits as the step carries. This is the only path a price or quantity may
/// take on its way into an order payload.
pub fn format_by_step(value: Decimal, step: Decimal) -> String {
    let mut floored = floor_to_step(value, step);
    floored.rescale(step_scale(step));
    floored.to_string()
}

/// Lossy entry point for snapshot floats. Returns `None` for NaN/inf.
pub fn from_f64(value: f64) -> Option<Decimal> {
    if !value.is_finite() {
        return None;
    }
    Decimal::from_f64(value)
}

pub fn floor_f64_to_step(value: f64, step: Decimal) -> Option<Decimal> {
    from_f64(value).map(|v| floor_to_step(v, step))
}

pub fn ceil_f64_to_step(value: f64, step: Decimal) -> Option<Decimal> {
    from_f64(value).map(|v| ceil_to_step(v, step))
}
