use serde::{Deserialize, Serialize};

/// One 60-second enqueue-and-drain iteration.
///
/// The scheduler mints a new `Cycle` every tick; workers compare their
/// cached `id` against the broker's current value and treat a mismatch as
/// a cycle boundary, refreshing their cached start timestamp atomically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cycle {
    pub id: u64,
    /// Milliseconds since the Unix epoch.
    pub start_ms: i64,
}

impl Cycle {
    #[must_use]
    pub fn new(id: u64, start_ms: i64) -> Self {
        Self { id, start_ms }
    }

    /// Second offset of `now_ms` from this cycle's start, floored. Used to
    /// key the per-second analytics bucket.
    #[must_use]
    pub fn second_offset(&self, now_ms: i64) -> i64 {
        (now_ms - self.start_ms).div_euclid(1000)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn second_offset_floors_toward_zero_at_cycle_start() {
        let cycle = Cycle::new(1, 60_000);
        assert_eq!(cycle.second_offset(60_000), 0);
        assert_eq!(cycle.second_offset(60_999), 0);
        assert_eq!(cycle.second_offset(61_000), 1);
    }

    #[test]
    fn second_offset_handles_values_before_start() {
        let cycle = Cycle::new(1, 60_000);
        assert_eq!(cycle.second_offset(59_500), -1);
    }
}
