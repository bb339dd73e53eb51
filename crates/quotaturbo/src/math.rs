//! Numeric helpers shared by the sampler and the policy

/// Divisors whose magnitude does not exceed this are treated as zero
pub const DEFAULT_PRECISION: f64 = 1e-9;

const NANOS_PER_MICRO: f64 = 1000.0;

/// Divide, returning `fallback` instead of dividing by a near-zero divisor
pub fn saturating_div(dividend: f64, divisor: f64, fallback: f64, precision: f64) -> f64 {
    if divisor.abs() <= precision {
        return fallback;
    }
    dividend / divisor
}

/// Divide with the default precision, saturating to `f64::MAX`
pub fn div(dividend: f64, divisor: f64) -> f64 {
    saturating_div(dividend, divisor, f64::MAX, DEFAULT_PRECISION)
}

pub fn percentage_to_decimal(percentage: f64) -> f64 {
    div(percentage, 100.0)
}

/// Convert nanoseconds into microseconds
pub fn ns_to_us(ns: i64) -> f64 {
    div(ns as f64, NANOS_PER_MICRO)
}
