use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Wall-clock source sampled once per processed frame.
pub trait Clock: Send {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        ManualClock { now: Arc::new(Mutex::new(Instant::now())) }
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Interval timer checked by polling.
#[derive(Debug, Clone, Copy)]
pub struct IntervalTimer {
    interval: Duration,
    last: Instant,
}

impl IntervalTimer {
    pub fn new(interval: Duration, start: Instant) -> Self {
        IntervalTimer { interval, last: start }
    }

    pub fn elapsed(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last) >= self.interval
    }

    pub fn reset(&mut self, now: Instant) {
        self.last = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_timer() {
        let clock = ManualClock::new();
        let mut timer = IntervalTimer::new(Duration::from_secs(10), clock.now());
        clock.advance(Duration::from_secs(9));
        assert!(!timer.elapsed(clock.now()));
        clock.advance(Duration::from_secs(1));
        assert!(timer.elapsed(clock.now()));
        timer.reset(clock.now());
        assert!(!timer.elapsed(clock.now()));
    }
}
