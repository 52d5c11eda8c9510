use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;

const SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Error, PartialEq)]
#[error("controller loop did not acknowledge the pause within {0:?}")]
pub struct PauseTimeout(pub Duration);

#[derive(Default)]
struct PauseState
{
    requested: bool,
    acknowledged: bool
}

/// # PauseBarrier
/// Lets a mutator stop a controller loop at an iteration boundary. The
/// loop calls `checkpoint` between iterations; a mutator calls `pause`
/// and gets a guard once the loop is parked. The loop resumes when the
/// guard is dropped. Mutators are serialized among themselves.
pub struct PauseBarrier
{
    state: Mutex<PauseState>,
    signal: Condvar,
    mutation: Mutex<()>
}

pub struct PauseGuard<'a>
{
    barrier: &'a PauseBarrier,
    _mutation: MutexGuard<'a, ()>
}

impl Drop for PauseGuard<'_>
{
    fn drop(&mut self)
    {
        self.barrier.resume();
    }
}

impl PauseBarrier
{
    pub fn new() -> Self
    {
        PauseBarrier {
            state: Mutex::new(PauseState::default()),
            signal: Condvar::new(),
            mutation: Mutex::new(())
        }
    }

    fn state(&self) -> MutexGuard<'_, PauseState>
    {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn pause_requested(&self) -> bool
    {
        self.state().requested
    }

    /// Called by the loop between iterations. Parks while a pause is
    /// requested and `running` holds. Returns true if the loop was parked.
    pub fn checkpoint(&self, running: &AtomicBool) -> bool
    {
        let mut state = self.state();
        if !state.requested
        {
            return false;
        }

        state.acknowledged = true;
        self.signal.notify_all();
        while state.requested && running.load(Ordering::SeqCst)
        {
            state = self.signal
                        .wait_timeout(state, SLICE)
                        .unwrap_or_else(|p| p.into_inner())
                        .0;
        }
        state.acknowledged = false;
        true
    }

    /// Requests a pause and waits for the loop to acknowledge it. A loop
    /// that is not running counts as parked.
    pub fn pause(&self, running: &AtomicBool, timeout: Duration) -> Result<PauseGuard<'_>, PauseTimeout>
    {
        let mutation = self.mutation.lock().unwrap_or_else(|p| p.into_inner());
        let deadline = Instant::now() + timeout;

        let mut state = self.state();
        state.requested = true;
        while !state.acknowledged && running.load(Ordering::SeqCst)
        {
            let now = Instant::now();
            if now >= deadline
            {
                state.requested = false;
                self.signal.notify_all();
                return Err(PauseTimeout(timeout));
            }
            let wait = (deadline - now).min(SLICE);
            state = self.signal
                        .wait_timeout(state, wait)
                        .unwrap_or_else(|p| p.into_inner())
                        .0;
        }
        drop(state);

        Ok(PauseGuard { barrier: self, _mutation: mutation })
    }

    fn resume(&self)
    {
        self.state().requested = false;
        self.signal.notify_all();
    }
}

impl Default for PauseBarrier
{
    fn default() -> Self
    {
        Self::new()
    }
}
