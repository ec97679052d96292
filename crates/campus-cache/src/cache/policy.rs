//! Tier placement decisions, kept free of storage mechanics.

/// Local occupancy at which promotions stop and writes start evicting.
pub const DEFAULT_OCCUPANCY_CEILING: f64 = 0.9;

/// Placement policy for the local tier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierPolicy {
    /// Largest serialized value the local tier admits.
    pub max_value_bytes: usize,
    /// Fraction of `max_keys` above which promotions are refused.
    pub occupancy_ceiling: f64,
}

impl TierPolicy {
    pub fn new(max_value_bytes: usize, occupancy_ceiling: f64) -> Self {
        Self {
            max_value_bytes,
            occupancy_ceiling,
        }
    }

    /// Whether a value written by a caller should also live in the local tier.
    pub fn should_store_local(&self, size: usize) -> bool {
        size <= self.max_value_bytes
    }

    /// Whether a distributed hit should be copied into the local tier.
    ///
    /// Large or one-off values arriving while the local tier is nearly full
    /// would otherwise push out hot entries.
    pub fn should_promote(&self, size: usize, occupancy: f64) -> bool {
        self.should_store_local(size) && occupancy < self.occupancy_ceiling
    }
}

/// `len / max_keys`, saturating at 1.0 for an empty capacity.
pub fn occupancy(len: usize, max_keys: usize) -> f64 {
    if max_keys == 0 {
        1.0
    } else {
        len as f64 / max_keys as f64
    }
}

/// Entry count at which admitting a new key first evicts the oldest ones.
///
/// Always within `1..=max_keys`, so the hard capacity holds even for tiny stores.
pub fn eviction_watermark(max_keys: usize, ceiling: f64) -> usize {
    let mark = (max_keys as f64 * ceiling).ceil() as usize;
    mark.clamp(1, max_keys.max(1))
}

/// Entry count a write at the watermark evicts down to.
///
/// The batch is the headroom between the watermark and `max_keys` (at least
/// one entry), so steady writes keep occupancy mostly below the promotion
/// ceiling instead of pinned at it.
pub fn eviction_target(max_keys: usize, watermark: usize) -> usize {
    let batch = max_keys.saturating_sub(watermark).max(1);
    watermark.saturating_sub(batch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_promote_requires_small_value_and_headroom() {
        let policy = TierPolicy::new(1024, DEFAULT_OCCUPANCY_CEILING);
        assert!(policy.should_promote(512, 0.5));
        assert!(policy.should_promote(1024, 0.89));
        assert!(!policy.should_promote(1025, 0.1));
        assert!(!policy.should_promote(10, 0.9));
        assert!(!policy.should_promote(10, 1.0));
    }

    #[test]
    fn test_store_local_only_checks_size() {
        let policy = TierPolicy::new(1024, DEFAULT_OCCUPANCY_CEILING);
        assert!(policy.should_store_local(1024));
        assert!(!policy.should_store_local(4096));
    }

    #[test]
    fn test_watermark() {
        assert_eq!(eviction_watermark(2, 0.9), 2);
        assert_eq!(eviction_watermark(10, 0.9), 9);
        assert_eq!(eviction_watermark(10_000, 0.9), 9_000);
        assert_eq!(eviction_watermark(1, 0.9), 1);
        assert_eq!(eviction_watermark(5, 1.0), 5);
    }

    #[test]
    fn test_eviction_target() {
        assert_eq!(eviction_target(100, 90), 80);
        assert_eq!(eviction_target(10_000, 9_000), 8_000);
        assert_eq!(eviction_target(10, 9), 8);
        assert_eq!(eviction_target(2, 2), 1);
        assert_eq!(eviction_target(1, 1), 0);
    }

    #[test]
    fn test_occupancy() {
        assert_eq!(occupancy(0, 10), 0.0);
        assert_eq!(occupancy(9, 10), 0.9);
        assert_eq!(occupancy(3, 0), 1.0);
    }
}
