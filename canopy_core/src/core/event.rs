use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// # Event
/// A sticky, resettable flag threads can block on. Once triggered it
/// stays set until `reset` is called, so a trigger that happens before
/// somebody waits is never lost.
#[derive(Clone)]
pub struct Event
{
    state: Arc<(Mutex<bool>, Condvar)>,
}

impl Event
{
    pub fn new() -> Self
    {
        Event {
            state: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    pub fn trigger(&self)
    {
        let (mtx, cvar) = &*self.state;
        let mut set = mtx.lock().unwrap_or_else(|p| p.into_inner());
        *set = true;
        cvar.notify_all();
    }

    pub fn reset(&self)
    {
        let (mtx, _) = &*self.state;
        *mtx.lock().unwrap_or_else(|p| p.into_inner()) = false;
    }

    pub fn is_set(&self) -> bool
    {
        let (mtx, _) = &*self.state;
        *mtx.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn wait(&self)
    {
        let (mtx, cvar) = &*self.state;
        let mut set = mtx.lock().unwrap_or_else(|p| p.into_inner());
        while !*set
        {
            set = cvar.wait(set).unwrap_or_else(|p| p.into_inner());
        }
    }

    /// Returns true if the event got set before the timeout ran out.
    pub fn wait_timeout(&self, timeout: Duration) -> bool
    {
        let deadline = Instant::now() + timeout;
        let (mtx, cvar) = &*self.state;
        let mut set = mtx.lock().unwrap_or_else(|p| p.into_inner());
        while !*set
        {
            let now = Instant::now();
            if now >= deadline
            {
                return false;
            }
            set = cvar.wait_timeout(set, deadline - now)
                      .unwrap_or_else(|p| p.into_inner())
                      .0;
        }
        true
    }
}

impl Default for Event
{
    fn default() -> Self
    {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
     use super::*;
     use std::thread;

     #[test]
     fn trigger_before_wait_returns_immediately()
     {
        let e = Event::new();
        e.trigger();
        let now = Instant::now();
        assert!(e.wait_timeout(Duration::from_secs(2)));
        assert!(now.elapsed() < Duration::from_secs(1));
     }

     #[test]
     fn wait_times_out_if_never_triggered()
     {
        let e = Event::new();
        assert!(!e.wait_timeout(Duration::from_millis(10)));
     }

     #[test]
     fn event_stays_set_until_reset()
     {
         let e = Event::new();
         e.trigger();
         assert!(e.wait_timeout(Duration::from_millis(10)));
         assert!(e.is_set());
         e.reset();
         assert!(!e.wait_timeout(Duration::from_millis(10)));
     }

     #[test]
     fn trigger_from_other_thread_wakes_waiter()
     {
         let e = Event::new();
         let remote = e.clone();
         let t = thread::spawn(move || {
             thread::sleep(Duration::from_millis(20));
             remote.trigger();
         });
         assert!(e.wait_timeout(Duration::from_secs(2)));
         t.join().unwrap();
     }
}
