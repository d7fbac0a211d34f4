//! Currency helpers. Balances are stored as `f64` in major units and
//! compared after rounding to cents; the simplifier works in whole cents.

pub const MINOR_PER_MAJOR: f64 = 100.0;

/// Round to two decimal places.
pub fn round2(value: f64) -> f64 {
    let rounded = (value * MINOR_PER_MAJOR).round() / MINOR_PER_MAJOR;
    // Normalise -0.0 so equality checks and JSON output stay stable.
    if rounded == 0.0 {
        0.0
    } else {
        rounded
    }
}

pub fn to_minor(value: f64) -> i64 {
    (value * MINOR_PER_MAJOR).round() as i64
}

pub fn from_minor(minor: i64) -> f64 {
    minor as f64 / MINOR_PER_MAJOR
}
