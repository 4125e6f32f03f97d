//! Price/quantity quantisation helpers

/// Tolerance for float comparisons on prices and sizes
pub const EPSILON: f64 = 1e-9;

/// Round a price to the nearest multiple of the instrument tick size.
///
/// Idempotent: rounding an already-rounded price returns the same value.
pub fn round_to_tick(price: f64, tick_size: f64) -> f64 {
    if tick_size <= 0.0 {
        return price;
    }
    let steps = (price / tick_size + 0.5).floor();
    steps * tick_size
}

/// Round a quantity down to the nearest multiple of the instrument step size.
///
/// Truncates rather than rounds so an order never exceeds the requested
/// volume. Idempotent like [`round_to_tick`].
pub fn round_to_step(qty: f64, step_size: f64) -> f64 {
    if step_size <= 0.0 {
        return qty;
    }
    let steps = (qty / step_size + EPSILON).floor();
    steps * step_size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_to_tick() {
        assert!((round_to_tick(50000.07, 0.1) - 50000.1).abs() < EPSILON);
        assert!((round_to_tick(50000.04, 0.1) - 50000.0).abs() < EPSILON);
        assert!((round_to_tick(123.456, 0.5) - 123.5).abs() < EPSILON);
    }

    #[test]
    fn test_round_to_step_truncates() {
        assert!((round_to_step(0.0019, 0.001) - 0.001).abs() < EPSILON);
        assert!((round_to_step(1.2349, 0.001) - 1.234).abs() < EPSILON);
        // Below one step rounds to zero
        assert!(round_to_step(0.0004, 0.001).abs() < EPSILON);
    }

    #[test]
    fn test_rounding_is_idempotent() {
        let once = round_to_tick(49901.23456, 0.5);
        let twice = round_to_tick(once, 0.5);
        assert_eq!(once, twice);

        let once = round_to_step(0.123456, 0.001);
        let twice = round_to_step(once, 0.001);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_zero_increment_passthrough() {
        assert_eq!(round_to_tick(123.45, 0.0), 123.45);
        assert_eq!(round_to_step(1.5, 0.0), 1.5);
    }
}
