//! Send pacing
//!
//! Spaces discrete sends so a stream approximates a target bitrate. Sends that
//! overrun their slot are not compensated later: there is no catch-up burst.
//!
//! The runtime timer resolves whole milliseconds, so intervals shorter than
//! that are paced as bursts of several sends per timer tick.

use std::time::Duration;

use tokio::time::{Interval, MissedTickBehavior};

/// Shortest wait handed to the timer.
pub const TIMER_SLICE: Duration = Duration::from_millis(1);

/// Ideal spacing between sends of `unit_size_bytes` at `target_rate_mbps`.
///
/// Returns `None` when pacing is disabled (zero, negative or non-finite rate).
pub fn ideal_interval(target_rate_mbps: f64, unit_size_bytes: usize) -> Option<Duration> {
    if !target_rate_mbps.is_finite() || target_rate_mbps <= 0.0 || unit_size_bytes == 0 {
        return None;
    }
    let secs = unit_size_bytes as f64 * 8.0 / (target_rate_mbps * 1_000_000.0);
    Duration::try_from_secs_f64(secs)
        .ok()
        .filter(|interval| !interval.is_zero())
}

/// Delay before the next send, given how long the previous send took.
pub fn next_send_delay(
    target_rate_mbps: f64,
    unit_size_bytes: usize,
    actual_elapsed: Duration,
) -> Duration {
    ideal_interval(target_rate_mbps, unit_size_bytes)
        .map(|ideal| ideal.saturating_sub(actual_elapsed))
        .unwrap_or(Duration::ZERO)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiter {
    ideal: Option<Duration>,
}

impl RateLimiter {
    pub fn new(target_rate_mbps: f64, unit_size_bytes: usize) -> Self {
        Self {
            ideal: ideal_interval(target_rate_mbps, unit_size_bytes),
        }
    }

    pub fn unlimited() -> Self {
        Self { ideal: None }
    }

    pub fn is_paced(&self) -> bool {
        self.ideal.is_some()
    }

    pub fn ideal_interval(&self) -> Option<Duration> {
        self.ideal
    }

    /// Sends per timer tick: enough that a tick is at least one timer slice.
    pub fn burst(&self) -> u32 {
        match self.ideal {
            Some(ideal) if ideal < TIMER_SLICE => {
                TIMER_SLICE.as_nanos().div_ceil(ideal.as_nanos()) as u32
            }
            _ => 1,
        }
    }

    /// Spacing between bursts; `None` when unpaced.
    pub fn tick_period(&self) -> Option<Duration> {
        self.ideal.map(|ideal| ideal * self.burst())
    }
}

/// Ticker that hands out send slots at the limiter's rate.
#[derive(Debug)]
pub struct Pacer {
    ticker: Option<Interval>,
    burst: u32,
}

impl Pacer {
    /// Must be created inside the runtime. The first slot is immediate.
    pub fn new(limiter: RateLimiter) -> Self {
        let ticker = limiter.tick_period().map(|period| {
            let mut ticker = tokio::time::interval(period);
            // A stalled sender resumes at the normal rate instead of bursting
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        Self {
            ticker,
            burst: limiter.burst(),
        }
    }

    /// Sends allowed per slot.
    pub fn burst(&self) -> u32 {
        self.burst
    }

    /// Wait for the next slot. Returns at once when unpaced.
    pub async fn next_slot(&mut self) {
        if let Some(ticker) = &mut self.ticker {
            ticker.tick().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn assert_close(actual: Duration, expected: Duration) {
        let diff = actual.abs_diff(expected);
        assert!(diff < Duration::from_nanos(10), "{:?} vs {:?}", actual, expected);
    }

    #[test]
    fn test_ideal_interval() {
        // 1400 B at 10 Mbit/s
        let interval = ideal_interval(10.0, 1400).unwrap();
        assert_close(interval, Duration::from_micros(1120));

        assert_eq!(
            ideal_interval(1.0, 125_000).unwrap(),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn test_no_pacing_for_zero_rate() {
        assert!(ideal_interval(0.0, 1400).is_none());
        assert!(ideal_interval(-5.0, 1400).is_none());
        assert!(ideal_interval(f64::INFINITY, 1400).is_none());
        assert!(ideal_interval(1e300, 1400).is_none());
        assert_eq!(
            next_send_delay(0.0, 1400, Duration::ZERO),
            Duration::ZERO
        );
        assert!(!RateLimiter::new(0.0, 1400).is_paced());
    }

    #[test]
    fn test_delay_subtracts_send_time() {
        let delay = next_send_delay(10.0, 1400, Duration::from_micros(120));
        assert_close(delay, Duration::from_micros(1000));
    }

    #[test]
    fn test_slow_send_gets_no_catch_up() {
        assert_eq!(
            next_send_delay(10.0, 1400, Duration::from_millis(5)),
            Duration::ZERO
        );
        // The next slot is a full interval again, not shortened
        assert_close(
            next_send_delay(10.0, 1400, Duration::ZERO),
            Duration::from_micros(1120),
        );
    }

    #[test]
    fn test_burst_sizing() {
        // 1.12 ms already exceeds a timer slice
        let limiter = RateLimiter::new(10.0, 1400);
        assert_eq!(limiter.burst(), 1);
        assert_close(limiter.tick_period().unwrap(), Duration::from_micros(1120));

        // 112 us per datagram: 9 per tick, 1.008 ms apart
        let limiter = RateLimiter::new(100.0, 1400);
        assert_eq!(limiter.burst(), 9);
        assert_close(limiter.tick_period().unwrap(), Duration::from_micros(1008));

        let limiter = RateLimiter::new(10_000.0, 1400);
        assert!(limiter.tick_period().unwrap() >= TIMER_SLICE);
    }

    #[test]
    fn test_unlimited() {
        let limiter = RateLimiter::unlimited();
        assert!(limiter.ideal_interval().is_none());
        assert!(limiter.tick_period().is_none());
        assert_eq!(limiter.burst(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacer_slots_per_second() {
        let mut pacer = Pacer::new(RateLimiter::new(10.0, 1400));
        let start = Instant::now();
        let mut slots = 0u32;
        while start.elapsed() < Duration::from_secs(1) {
            pacer.next_slot().await;
            slots += pacer.burst();
        }
        // 1 / 1.12 ms is ~893 per second
        assert!((885..=900).contains(&slots), "got {} slots", slots);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacer_does_not_catch_up() {
        let mut pacer = Pacer::new(RateLimiter::new(10.0, 1400));
        pacer.next_slot().await;

        tokio::time::advance(Duration::from_millis(50)).await;
        // The overdue slot fires once, then spacing resets from here
        pacer.next_slot().await;
        let resumed = Instant::now();
        pacer.next_slot().await;
        assert!(resumed.elapsed() >= Duration::from_micros(1120));
    }

    #[tokio::test]
    async fn test_unpaced_slot_is_immediate() {
        let mut pacer = Pacer::new(RateLimiter::unlimited());
        tokio::time::timeout(Duration::from_millis(100), pacer.next_slot())
            .await
            .unwrap();
    }
}
