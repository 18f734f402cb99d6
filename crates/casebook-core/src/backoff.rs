use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

/// Exponential backoff with jitter for retried jobs.
///
/// The ceiling for attempt `n` (1-based) is `base * 2^(n-1)`, capped at
/// `cap`. The actual delay is drawn uniformly from `[ceiling/2, ceiling]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            cap: Duration::from_secs(300),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
        }
    }

    /// No delay at all; retries are eligible immediately.
    pub fn immediate() -> Self {
        Self {
            base: Duration::ZERO,
            cap: Duration::ZERO,
        }
    }

    pub fn ceiling(&self, attempt: i32) -> Duration {
        let exp = attempt.saturating_sub(1).clamp(0, 30) as u32;
        let factor = 1u32 << exp;
        self.base.saturating_mul(factor).min(self.cap)
    }

    pub fn delay(&self, attempt: i32) -> Duration {
        let ceiling = self.ceiling(attempt);
        let ms = ceiling.as_millis() as u64;
        if ms == 0 {
            return Duration::ZERO;
        }
        let jittered = rand::thread_rng().gen_range(ms / 2..=ms);
        Duration::from_millis(jittered)
    }

    pub fn next_run_at(&self, now: DateTime<Utc>, attempt: i32) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay(attempt))
            .unwrap_or_else(|_| chrono::Duration::seconds(self.cap.as_secs() as i64));
        now + delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceiling_doubles_then_caps() {
        let p = BackoffPolicy::default();
        assert_eq!(p.ceiling(1), Duration::from_secs(5));
        assert_eq!(p.ceiling(2), Duration::from_secs(10));
        assert_eq!(p.ceiling(3), Duration::from_secs(20));
        assert_eq!(p.ceiling(7), Duration::from_secs(300));
        assert_eq!(p.ceiling(60), Duration::from_secs(300));
    }

    #[test]
    fn attempt_zero_uses_base() {
        let p = BackoffPolicy::default();
        assert_eq!(p.ceiling(0), Duration::from_secs(5));
        assert_eq!(p.ceiling(-3), Duration::from_secs(5));
    }

    #[test]
    fn delay_stays_within_jitter_band() {
        let p = BackoffPolicy::default();
        for attempt in 1..10 {
            let ceiling = p.ceiling(attempt);
            for _ in 0..20 {
                let d = p.delay(attempt);
                assert!(d <= ceiling, "attempt {attempt}: {d:?} > {ceiling:?}");
                assert!(d >= ceiling / 2, "attempt {attempt}: {d:?} < half of {ceiling:?}");
            }
        }
    }

    #[test]
    fn immediate_policy_never_waits() {
        let p = BackoffPolicy::immediate();
        let now = Utc::now();
        assert_eq!(p.delay(4), Duration::ZERO);
        assert_eq!(p.next_run_at(now, 4), now);
    }

    #[test]
    fn cap_never_below_base() {
        let p = BackoffPolicy::new(Duration::from_secs(10), Duration::from_secs(1));
        assert_eq!(p.cap, Duration::from_secs(10));
    }
}
