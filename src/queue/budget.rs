//! Token budget over a time window
//!
//! Every method takes the current time explicitly, so window behavior can be
//! driven from tests without sleeping.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, warn};

/// How the budget window advances
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowMode {
    /// Usage drops to zero when the window ends. A burst straddling the
    /// boundary can spend close to twice the limit.
    #[default]
    Fixed,
    /// Usage older than one window ages out individually
    Sliding,
}

/// Point-in-time view of the budget
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetSnapshot {
    pub limit: u64,
    pub used: u64,
    /// Estimated cost held for jobs currently running
    pub reserved: u64,
    pub remaining: u64,
    pub window_reset_at: DateTime<Utc>,
    pub mode: WindowMode,
    /// `used / limit` as a percentage
    pub utilization: f64,
}

/// Rolling cap on provider tokens.
///
/// `used` never exceeds `limit`; remaining quota is always
/// `limit - (used + reserved)`, floored at zero.
#[derive(Debug, Clone)]
pub struct ResourceBudget {
    limit: u64,
    window: Duration,
    mode: WindowMode,
    used: u64,
    reserved: u64,
    window_reset_at: DateTime<Utc>,
    /// Sliding mode only: (when, tokens), oldest first
    ledger: VecDeque<(DateTime<Utc>, u64)>,
}

impl ResourceBudget {
    pub fn new(limit: u64, window: Duration, mode: WindowMode, now: DateTime<Utc>) -> Self {
        Self {
            limit,
            window,
            mode,
            used: 0,
            reserved: 0,
            window_reset_at: now + window,
            ledger: VecDeque::new(),
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn mode(&self) -> WindowMode {
        self.mode
    }

    pub fn used(&mut self, now: DateTime<Utc>) -> u64 {
        self.roll(now);
        self.used
    }

    pub fn reserved(&self) -> u64 {
        self.reserved
    }

    pub fn remaining(&mut self, now: DateTime<Utc>) -> u64 {
        self.roll(now);
        self.limit.saturating_sub(self.used + self.reserved)
    }

    /// Hold `cost` tokens for a job about to run.
    ///
    /// Returns the remaining quota as the error when it is short.
    pub fn try_reserve(&mut self, cost: u64, now: DateTime<Utc>) -> Result<(), u64> {
        let remaining = self.remaining(now);
        if remaining < cost {
            return Err(remaining);
        }
        self.reserved += cost;
        Ok(())
    }

    /// Drop a reservation without recording usage
    pub fn release(&mut self, reserved: u64) {
        self.reserved = self.reserved.saturating_sub(reserved);
    }

    /// Replace a reservation with the actual cost of the finished job
    pub fn settle(&mut self, reserved: u64, actual: u64, now: DateTime<Utc>) {
        self.release(reserved);
        self.record(actual, now);
    }

    /// Add usage spent at `at` to the window, clamped at the limit.
    ///
    /// In sliding mode the entry ages out one window after `at`, which may
    /// lie in the past when usage is replayed after a restart.
    pub fn record(&mut self, tokens: u64, at: DateTime<Utc>) {
        self.roll(at);
        let room = self.limit.saturating_sub(self.used);
        let counted = tokens.min(room);
        if counted < tokens {
            warn!(
                tokens,
                used = self.used,
                limit = self.limit,
                "usage exceeds remaining budget, clamping to limit"
            );
        }
        self.used += counted;
        if self.mode == WindowMode::Sliding && counted > 0 {
            let slot = self.ledger.partition_point(|&(entry_at, _)| entry_at <= at);
            self.ledger.insert(slot, (at, counted));
        }
    }

    pub fn utilization(&mut self, now: DateTime<Utc>) -> f64 {
        self.roll(now);
        if self.limit == 0 {
            return 100.0;
        }
        self.used as f64 / self.limit as f64 * 100.0
    }

    pub fn snapshot(&mut self, now: DateTime<Utc>) -> BudgetSnapshot {
        let remaining = self.remaining(now);
        BudgetSnapshot {
            limit: self.limit,
            used: self.used,
            reserved: self.reserved,
            remaining,
            window_reset_at: self.window_reset_at,
            mode: self.mode,
            utilization: self.utilization(now),
        }
    }

    /// Expire usage that fell out of the window
    fn roll(&mut self, now: DateTime<Utc>) {
        match self.mode {
            WindowMode::Fixed => {
                if now < self.window_reset_at {
                    return;
                }
                if self.used > 0 {
                    debug!(used = self.used, "budget window reset");
                }
                self.used = 0;
                if self.window <= Duration::zero() {
                    self.window_reset_at = now;
                    return;
                }
                // Skip whole windows when the budget sat idle past several resets.
                let overdue = (now - self.window_reset_at).num_milliseconds();
                let windows = overdue / self.window.num_milliseconds().max(1) + 1;
                self.window_reset_at += self.window * windows as i32;
            }
            WindowMode::Sliding => {
                let horizon = now - self.window;
                while let Some(&(at, tokens)) = self.ledger.front() {
                    if at > horizon {
                        break;
                    }
                    self.used = self.used.saturating_sub(tokens);
                    self.ledger.pop_front();
                }
                self.window_reset_at = match self.ledger.front() {
                    Some(&(oldest, _)) => oldest + self.window,
                    None => now + self.window,
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn reservation_counts_against_remaining() {
        let now = t0();
        let mut budget = ResourceBudget::new(10_000, Duration::hours(1), WindowMode::Fixed, now);

        budget.try_reserve(4_000, now).unwrap();
        assert_eq!(budget.remaining(now), 6_000);
        assert_eq!(budget.try_reserve(7_000, now), Err(6_000));

        budget.settle(4_000, 2_500, now);
        assert_eq!(budget.used(now), 2_500);
        assert_eq!(budget.remaining(now), 7_500);
    }

    #[test]
    fn used_is_clamped_to_limit() {
        let now = t0();
        let mut budget = ResourceBudget::new(1_000, Duration::hours(1), WindowMode::Fixed, now);

        budget.record(800, now);
        budget.record(900, now);

        assert_eq!(budget.used(now), 1_000);
        assert_eq!(budget.remaining(now), 0);
    }

    #[test]
    fn fixed_window_resets_wholesale() {
        let now = t0();
        let mut budget = ResourceBudget::new(1_000, Duration::hours(1), WindowMode::Fixed, now);
        budget.record(900, now + Duration::minutes(59));

        let later = now + Duration::minutes(61);
        assert_eq!(budget.remaining(later), 1_000);
        assert_eq!(budget.snapshot(later).window_reset_at, now + Duration::hours(2));
    }

    #[test]
    fn fixed_window_skips_idle_windows() {
        let now = t0();
        let mut budget = ResourceBudget::new(1_000, Duration::hours(1), WindowMode::Fixed, now);

        let much_later = now + Duration::hours(5) + Duration::minutes(30);
        budget.record(100, much_later);

        assert_eq!(budget.snapshot(much_later).window_reset_at, now + Duration::hours(6));
        assert_eq!(budget.used(much_later), 100);
    }

    #[test]
    fn sliding_window_ages_out_individual_entries() {
        let now = t0();
        let mut budget = ResourceBudget::new(1_000, Duration::hours(1), WindowMode::Sliding, now);
        budget.record(600, now);
        budget.record(300, now + Duration::minutes(40));

        // Just past the boundary only the first entry has aged out.
        let later = now + Duration::minutes(61);
        assert_eq!(budget.used(later), 300);
        assert_eq!(
            budget.snapshot(later).window_reset_at,
            now + Duration::minutes(100)
        );
    }

    #[test]
    fn replayed_usage_ages_out_from_its_own_timestamp() {
        let now = t0();
        let mut budget = ResourceBudget::new(1_000, Duration::hours(1), WindowMode::Sliding, now);
        budget.record(300, now + Duration::minutes(40));
        budget.record(600, now);

        let later = now + Duration::minutes(61);
        assert_eq!(budget.used(later), 300);
        assert_eq!(
            budget.snapshot(later).window_reset_at,
            now + Duration::minutes(100)
        );
    }

    #[test]
    fn release_never_underflows() {
        let now = t0();
        let mut budget = ResourceBudget::new(1_000, Duration::hours(1), WindowMode::Fixed, now);
        budget.release(50);
        assert_eq!(budget.reserved(), 0);
        assert_eq!(budget.remaining(now), 1_000);
    }

    #[test]
    fn utilization_is_percentage_of_limit() {
        let now = t0();
        let mut budget = ResourceBudget::new(2_000, Duration::hours(1), WindowMode::Fixed, now);
        budget.record(500, now);
        assert_eq!(budget.utilization(now), 25.0);
    }
}
