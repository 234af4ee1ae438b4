//! # Domain Invariants
//!
//! Scoring rules and capacity checks that must hold for every peer and
//! server record, kept as pure functions so each component applies them the
//! same way.

use std::time::Duration;

/// Concurrent requests a peer accepts when it advertises no capacity.
pub const DEFAULT_PEER_CAPACITY: u32 = 4;

/// Consecutive failures after which a server enters cooldown.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Weight of the newest sample in latency moving averages.
pub const LATENCY_EWMA_ALPHA: f64 = 0.2;

/// Invariant: a peer never holds more active slots than its capacity.
///
/// Returns `true` if one more slot may be reserved.
pub fn invariant_capacity(in_flight: u32, capacity: u32) -> bool {
    in_flight < capacity
}

/// Effective capacity of a peer, substituting the default for 0.
pub fn effective_capacity(advertised: u32, default: u32) -> u32 {
    if advertised == 0 {
        default.max(1)
    } else {
        advertised
    }
}

/// Exponentially weighted moving average. The first sample seeds the average.
pub fn ewma(previous: Option<f64>, sample: f64, alpha: f64) -> f64 {
    match previous {
        None => sample,
        Some(prev) => alpha * sample + (1.0 - alpha) * prev,
    }
}

/// Cooldown window for a failure streak.
///
/// `None` below the threshold. At the threshold the window is `base`, and
/// it doubles with every further consecutive failure, capped at `max`.
pub fn cooldown_window(
    failure_streak: u32,
    threshold: u32,
    base: Duration,
    max: Duration,
) -> Option<Duration> {
    if threshold == 0 || failure_streak < threshold {
        return None;
    }
    let doublings = (failure_streak - threshold).min(31);
    Some(base.saturating_mul(1u32 << doublings).min(max))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_invariant() {
        assert!(invariant_capacity(0, 1));
        assert!(!invariant_capacity(1, 1));
        assert!(!invariant_capacity(5, 4));
    }

    #[test]
    fn test_effective_capacity_defaults_unspecified() {
        assert_eq!(effective_capacity(0, 4), 4);
        assert_eq!(effective_capacity(0, 0), 1);
        assert_eq!(effective_capacity(2, 4), 2);
    }

    #[test]
    fn test_ewma_seeds_then_smooths() {
        let first = ewma(None, 100.0, 0.2);
        assert_eq!(first, 100.0);
        let second = ewma(Some(first), 200.0, 0.2);
        assert!((second - 120.0).abs() < 1e-9);
    }

    #[test]
    fn test_cooldown_below_threshold() {
        let base = Duration::from_secs(10);
        let max = Duration::from_secs(100);
        assert_eq!(cooldown_window(2, 3, base, max), None);
    }

    #[test]
    fn test_cooldown_strictly_increases_until_cap() {
        let base = Duration::from_secs(10);
        let max = Duration::from_secs(1000);
        let w3 = cooldown_window(3, 3, base, max).unwrap();
        let w4 = cooldown_window(4, 3, base, max).unwrap();
        let w5 = cooldown_window(5, 3, base, max).unwrap();
        assert_eq!(w3, Duration::from_secs(10));
        assert!(w4 > w3);
        assert!(w5 > w4);
        assert_eq!(cooldown_window(60, 3, base, max).unwrap(), max);
    }
}
