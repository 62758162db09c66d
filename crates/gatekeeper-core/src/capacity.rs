//! Capacity model: maps a busy rating plus configured reserve/headroom to
//! usable capacity, and usable capacity minus outstanding leases to
//! available capacity.

/// Busy rating → curve multiplier, indexed 0..=10. Busy 0, 1, and 2 all map
/// to 1.00 (spec's table collapses that range).
const CURVE: [f64; 11] = [
    1.00, 1.00, 1.00, 0.80, 0.65, 0.50, 0.35, 0.25, 0.15, 0.10, 0.00,
];

/// `usable(b) = max(0, floor(total * curve[b] * (1 - headroom)) - reserve)`
pub fn usable_units(total_capacity_units: i64, busy_rating: u8, headroom_pct: f64, reserve_units: i64) -> i64 {
    let curve = CURVE[busy_rating.min(10) as usize];
    let scaled = (total_capacity_units as f64) * curve * (1.0 - headroom_pct);
    let usable = scaled.floor() as i64 - reserve_units;
    usable.max(0)
}

/// `available = max(0, usable - leased)`
pub fn available_units(usable_units: i64, leased_units: i64) -> i64 {
    (usable_units - leased_units).max(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_zero_is_full_capacity_minus_reserve() {
        assert_eq!(usable_units(100, 0, 0.0, 5), 95);
    }

    #[test]
    fn busy_two_still_full_curve() {
        assert_eq!(usable_units(100, 2, 0.0, 5), 95);
    }

    #[test]
    fn busy_ten_is_zero_usable_but_not_negative() {
        assert_eq!(usable_units(100, 10, 0.0, 5), 0);
    }

    #[test]
    fn busy_eight_fail_closed_scenario() {
        // S5: total=100, reserve=5, busy=8 -> floor(100*0.15) - 5 = 10
        assert_eq!(usable_units(100, 8, 0.0, 5), 10);
    }

    #[test]
    fn headroom_shaves_after_curve() {
        // busy=0, curve=1.00, headroom=0.1 -> floor(100*1.0*0.9) - 5 = 85
        assert_eq!(usable_units(100, 0, 0.1, 5), 85);
    }

    #[test]
    fn available_never_negative() {
        assert_eq!(available_units(10, 50), 0);
        assert_eq!(available_units(50, 10), 40);
    }
}
