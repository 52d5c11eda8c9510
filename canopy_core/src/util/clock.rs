use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

/// Time source of the scheduler. Production code uses `SystemClock`,
/// tests drive the loop with a `ManualClock`.
pub trait Clock: Send + Sync
{
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock
{
    fn now(&self) -> Instant
    {
        Instant::now()
    }

    fn sleep(&self, duration: Duration)
    {
        thread::sleep(duration)
    }
}

/// # ManualClock
/// A clock that only moves when told to. Sleeping on it advances the
/// clock instead of blocking, so a loop paced by `sleep` runs at full
/// speed in simulated time.
pub struct ManualClock
{
    origin: Instant,
    offset: Mutex<Duration>
}

impl ManualClock
{
    pub fn new() -> Self
    {
        ManualClock { origin: Instant::now(), offset: Mutex::new(Duration::from_secs(0)) }
    }

    pub fn advance(&self, by: Duration)
    {
        *self.offset.lock().unwrap_or_else(|p| p.into_inner()) += by;
    }

    /// Time passed since the clock was created.
    pub fn elapsed(&self) -> Duration
    {
        *self.offset.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Default for ManualClock
{
    fn default() -> Self
    {
        Self::new()
    }
}

impl Clock for ManualClock
{
    fn now(&self) -> Instant
    {
        self.origin + self.elapsed()
    }

    fn sleep(&self, duration: Duration)
    {
        self.advance(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_only_moves_when_advanced()
    {
        let clock = ManualClock::new();
        let t0 = clock.now();
        assert_eq!(t0, clock.now());
        clock.advance(Duration::from_secs(2));
        assert_eq!(t0 + Duration::from_secs(2), clock.now());
    }

    #[test]
    fn sleeping_on_manual_clock_advances_it()
    {
        let clock = ManualClock::new();
        let t0 = clock.now();
        clock.sleep(Duration::from_millis(100));
        assert_eq!(Duration::from_millis(100), clock.now() - t0);
    }
}
