//! Adaptive pull interval: slows down under inactivity or outages, snaps back on change.

use std::time::Duration;

use crate::config::PollConfig;

/// Interval between two scheduled full refreshes.
#[derive(Debug, Clone)]
pub struct AdaptiveInterval {
    base: Duration,
    idle_max: Duration,
    error_max: Duration,
    growth: f64,
    idle_cycles_before_growth: u32,
    errors_before_backoff: u32,
    current: Duration,
    last_count: Option<u32>,
    unchanged_cycles: u32,
    consecutive_errors: u32,
}

impl AdaptiveInterval {
    /// Start at the configured base interval.
    pub fn new(config: &PollConfig) -> Self {
        Self {
            base: config.base_interval,
            idle_max: config.max_interval,
            error_max: config.error_max_interval,
            growth: config.growth_factor,
            idle_cycles_before_growth: config.idle_cycles_before_growth,
            errors_before_backoff: config.errors_before_backoff,
            current: config.base_interval,
            last_count: None,
            unchanged_cycles: 0,
            consecutive_errors: 0,
        }
    }

    /// Delay before the next scheduled refresh.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Consecutive failed refreshes since the last success.
    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    /// Record a successful refresh that observed `count` votes.
    pub fn on_success(&mut self, count: u32, voting: bool) {
        // Leaving an outage: the error cap no longer applies.
        if self.consecutive_errors > 0 {
            self.consecutive_errors = 0;
            self.current = self.current.min(self.idle_max);
        }

        if self.last_count == Some(count) {
            self.unchanged_cycles += 1;
            if voting && self.unchanged_cycles >= self.idle_cycles_before_growth {
                self.current = self.current.mul_f64(self.growth).min(self.idle_max);
                self.unchanged_cycles = 0;
            }
        } else {
            self.current = self.base;
            self.unchanged_cycles = 0;
        }
        self.last_count = Some(count);
    }

    /// Record a failed refresh.
    pub fn on_error(&mut self) {
        self.consecutive_errors += 1;
        if self.consecutive_errors >= self.errors_before_backoff {
            self.current = (self.current * 2).min(self.error_max);
        }
    }

    /// Snap back to the base interval, e.g. after a push notification.
    pub fn reset(&mut self) {
        self.current = self.base;
        self.unchanged_cycles = 0;
    }
}
