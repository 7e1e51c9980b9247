//! Duration helpers shared by the scheduler, the recovery policy and the pollers.
//!
//! Conversions saturate instead of truncating so they are safe to use in display and
//! backoff arithmetic without casts.

use std::time::Duration;

/// Extension trait for saturating Duration conversions and arithmetic.
pub trait DurationExt {
    /// Convert duration to milliseconds as u64, saturating at `u64::MAX`.
    fn as_millis_u64(&self) -> u64;

    /// Whole seconds as u32 (fraction discarded), saturating at `u32::MAX`.
    ///
    /// Used for countdown display, where a floored value is wanted.
    fn as_secs_u32(&self) -> u32;

    /// Multiply by `factor`, clamping the result to `cap`.
    fn mul_capped(&self, factor: u32, cap: Duration) -> Duration;
}

impl DurationExt for Duration {
    fn as_millis_u64(&self) -> u64 {
        u64::try_from(self.as_millis()).unwrap_or(u64::MAX)
    }

    fn as_secs_u32(&self) -> u32 {
        u32::try_from(self.as_secs()).unwrap_or(u32::MAX)
    }

    fn mul_capped(&self, factor: u32, cap: Duration) -> Duration {
        self.checked_mul(factor).map_or(cap, |d| d.min(cap))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_as_millis_u64() {
        assert_eq!(Duration::from_millis(1234).as_millis_u64(), 1234);
        assert_eq!(Duration::ZERO.as_millis_u64(), 0);
    }

    #[test]
    fn test_as_secs_u32_floors() {
        assert_eq!(Duration::from_millis(149_900).as_secs_u32(), 149);
        assert_eq!(Duration::ZERO.as_secs_u32(), 0);
    }

    #[test]
    fn test_as_secs_u32_large() {
        let duration = Duration::from_secs(u64::from(u32::MAX) + 1);
        assert_eq!(duration.as_secs_u32(), u32::MAX);
    }

    #[test]
    fn test_mul_capped() {
        let base = Duration::from_secs(2);
        assert_eq!(base.mul_capped(3, Duration::from_secs(8)), Duration::from_secs(6));
        assert_eq!(base.mul_capped(5, Duration::from_secs(8)), Duration::from_secs(8));
        assert_eq!(
            Duration::MAX.mul_capped(2, Duration::from_secs(30)),
            Duration::from_secs(30)
        );
    }
}
