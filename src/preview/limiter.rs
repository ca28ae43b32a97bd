//! Preview rate limiting
//!
//! Frames are budgeted against wall time: a probe turns the time elapsed
//! since the budget cursor into whole frames and advances the cursor by
//! what it granted. Probes closer than the probe interval are refused
//! outright, and one probe never grants more than `rate` frames, so any
//! one-second window holds at most `rate` frames. The first probe of a
//! stream starts with one second of budget.

/// Source of wall time in seconds
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

/// Monotonic clock measured from its creation
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: std::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Token budget of preview frames
#[derive(Debug, Clone)]
pub struct RateLimiter {
    rate: usize,
    probe_interval: f64,
    last_probe: Option<f64>,
    /// Budget cursor; unset until the first probe
    last_time: Option<f64>,
}

impl RateLimiter {
    pub fn new(rate: usize, probe_interval: f64) -> Self {
        Self {
            rate: rate.max(1),
            probe_interval,
            last_probe: None,
            last_time: None,
        }
    }

    pub fn rate(&self) -> usize {
        self.rate
    }

    /// Frames that may be emitted now, at most `available`
    pub fn probe(&mut self, now: f64, available: usize) -> usize {
        if let Some(last) = self.last_probe {
            if now - last < self.probe_interval {
                return 0;
            }
        }
        self.last_probe = Some(now);

        let rate = self.rate as f64;
        let last_time = self.last_time.unwrap_or(now - 1.0);
        let granted = ((now - last_time) * rate).trunc();
        self.last_time = Some(last_time + granted / rate);
        if granted <= 0.0 {
            return 0;
        }
        (granted as usize).min(available).min(self.rate)
    }

    /// Restart the budget one frame period after `now` (first emission)
    pub fn arm(&mut self, now: f64) {
        self.last_time = Some(now + 1.0 / self.rate as f64);
    }

    pub fn reset(&mut self) {
        self.last_probe = None;
        self.last_time = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drive the limiter with updates every `period` seconds, arming on the
    /// first grant, and return `(time, frames)` for each grant
    fn simulate(rate: usize, period_ms: u64, duration_ms: u64, available: usize) -> Vec<(f64, usize)> {
        let mut limiter = RateLimiter::new(rate, 1.0);
        let mut armed = false;
        let mut grants = Vec::new();
        let mut t = 0;
        while t <= duration_ms {
            let now = 100.0 + t as f64 / 1000.0;
            let n = limiter.probe(now, available);
            if n > 0 {
                if !armed {
                    limiter.arm(now);
                    armed = true;
                }
                grants.push((now, n));
            }
            t += period_ms;
        }
        grants
    }

    #[test]
    fn test_never_exceeds_rate_in_any_window() {
        for rate in [1, 4, 8, 16] {
            for period_ms in [1, 10, 33, 100, 250, 999, 1000, 1001, 1500, 3000] {
                let grants = simulate(rate, period_ms, 20_000, 64);
                for (i, (start, _)) in grants.iter().enumerate() {
                    let in_window: usize = grants[i..]
                        .iter()
                        .take_while(|(t, _)| t - start < 1.0)
                        .map(|(_, n)| n)
                        .sum();
                    assert!(
                        in_window <= rate,
                        "rate {rate}, period {period_ms}ms: {in_window} frames in window at {start}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_probes_closer_than_interval_are_refused() {
        let mut limiter = RateLimiter::new(8, 1.0);
        assert_eq!(limiter.probe(100.0, 13), 8);
        assert_eq!(limiter.probe(100.5, 13), 0);
        assert_eq!(limiter.probe(100.99, 13), 0);
        assert!(limiter.probe(101.0, 13) > 0);
    }

    #[test]
    fn test_grant_capped_by_available_frames() {
        let mut limiter = RateLimiter::new(16, 1.0);
        assert_eq!(limiter.probe(100.0, 5), 5);
    }

    #[test]
    fn test_armed_budget_after_first_frame() {
        let mut limiter = RateLimiter::new(8, 1.0);
        assert_eq!(limiter.probe(100.0, 13), 8);
        limiter.arm(100.0);
        // One period is reserved by arming: 8 * (1 - 1/8) = 7
        assert_eq!(limiter.probe(101.0, 13), 7);
        assert_eq!(limiter.probe(102.0, 13), 8);
    }

    #[test]
    fn test_slow_updates_do_not_replay_dropped_frames() {
        let mut limiter = RateLimiter::new(4, 1.0);
        limiter.probe(100.0, 100);
        limiter.arm(100.0);
        // Ten idle seconds still grant at most one second of frames
        assert_eq!(limiter.probe(110.0, 100), 4);
        assert_eq!(limiter.probe(111.0, 100), 4);
    }

    #[test]
    fn test_first_probe_at_clock_origin() {
        let mut limiter = RateLimiter::new(8, 1.0);
        assert_eq!(limiter.probe(0.0, 13), 8);
        assert_eq!(limiter.probe(0.5, 13), 0);

        let clock = SystemClock::new();
        let mut limiter = RateLimiter::new(4, 1.0);
        assert_eq!(limiter.probe(clock.now(), 13), 4);
    }

    #[test]
    fn test_reset() {
        let mut limiter = RateLimiter::new(8, 1.0);
        limiter.probe(100.0, 8);
        limiter.reset();
        assert_eq!(limiter.probe(100.1, 8), 8);
    }
}
