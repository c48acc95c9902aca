// =============================================================================
// Rate-Limit Tracker — per-second / per-minute / per-day request budgets
// =============================================================================
//
// Indian broker APIs enforce tiered request limits (typically 10/s, 200/min
// and a large daily cap). The tracker keeps one epoch-aligned window per
// tier; a request is admitted only when every tier has budget left. Overflow
// is reported to the caller, which skips the cycle rather than queueing.
// =============================================================================

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::types::now_ms;

/// Per-tier limits supplied at construction.
#[derive(Debug, Clone, Copy)]
pub struct RateLimits {
    pub per_second: u32,
    pub per_minute: u32,
    pub per_day: u32,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            per_second: 10,
            per_minute: 200,
            per_day: 100_000,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    start_ms: i64,
    count: u32,
}

impl Window {
    fn admit(&mut self, now: i64, width_ms: i64, limit: u32) -> bool {
        if now - self.start_ms >= width_ms {
            self.start_ms = now - now.rem_euclid(width_ms);
            self.count = 0;
        }
        if self.count >= limit {
            return false;
        }
        self.count += 1;
        true
    }
}

struct Inner {
    second: Window,
    minute: Window,
    day: Window,
}

/// Immutable snapshot for the status feed.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitSnapshot {
    pub used_second: u32,
    pub used_minute: u32,
    pub used_day: u32,
}

/// Thread-safe tracker; one per adapter.
pub struct RateLimitTracker {
    limits: RateLimits,
    inner: Mutex<Inner>,
}

impl RateLimitTracker {
    pub fn new(limits: RateLimits) -> Self {
        let zero = Window {
            start_ms: 0,
            count: 0,
        };
        Self {
            limits,
            inner: Mutex::new(Inner {
                second: zero,
                minute: zero,
                day: zero,
            }),
        }
    }

    /// Try to admit one request across all tiers. All-or-nothing: a refusal
    /// in any tier consumes no budget anywhere.
    pub fn try_acquire(&self) -> bool {
        let now = now_ms();
        let mut inner = self.inner.lock();

        let second_ok = {
            let mut probe = inner.second;
            probe.admit(now, 1_000, self.limits.per_second)
        };
        let minute_ok = {
            let mut probe = inner.minute;
            probe.admit(now, 60_000, self.limits.per_minute)
        };
        let day_ok = {
            let mut probe = inner.day;
            probe.admit(now, 86_400_000, self.limits.per_day)
        };

        if !(second_ok && minute_ok && day_ok) {
            warn!(
                second_ok,
                minute_ok, day_ok, "broker request refused by rate-limit tracker"
            );
            return false;
        }

        inner.second.admit(now, 1_000, self.limits.per_second);
        inner.minute.admit(now, 60_000, self.limits.per_minute);
        inner.day.admit(now, 86_400_000, self.limits.per_day);
        debug!(
            used_second = inner.second.count,
            used_minute = inner.minute.count,
            "broker request admitted"
        );
        true
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        let inner = self.inner.lock();
        RateLimitSnapshot {
            used_second: inner.second.count,
            used_minute: inner.minute.count,
            used_day: inner.day.count,
        }
    }
}

impl std::fmt::Debug for RateLimitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snap = self.snapshot();
        f.debug_struct("RateLimitTracker")
            .field("limits", &self.limits)
            .field("used_second", &snap.used_second)
            .field("used_minute", &snap.used_minute)
            .field("used_day", &snap.used_day)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_second_limit_is_enforced() {
        let tracker = RateLimitTracker::new(RateLimits {
            per_second: 3,
            per_minute: 100,
            per_day: 1000,
        });
        assert!(tracker.try_acquire());
        assert!(tracker.try_acquire());
        assert!(tracker.try_acquire());
        assert!(!tracker.try_acquire());
        assert_eq!(tracker.snapshot().used_second, 3);
    }

    #[test]
    fn refusal_consumes_no_budget() {
        let tracker = RateLimitTracker::new(RateLimits {
            per_second: 1,
            per_minute: 1,
            per_day: 1000,
        });
        assert!(tracker.try_acquire());
        assert!(!tracker.try_acquire());
        // The refused attempt must not have advanced the daily counter.
        assert_eq!(tracker.snapshot().used_day, 1);
    }

    #[test]
    fn window_rolls_over() {
        let mut w = Window {
            start_ms: 0,
            count: 5,
        };
        // Same window: full.
        assert!(!w.admit(500, 1_000, 5));
        // Next window: budget resets.
        assert!(w.admit(1_500, 1_000, 5));
        assert_eq!(w.count, 1);
        assert_eq!(w.start_ms, 1_000);
    }
}
