use super::{event::Event, shareable::Shareable};
use std::{sync::{Arc, Weak}, thread, time::{Duration, Instant}};

type TimerCallback = Box<dyn FnOnce() + Send>;

struct TimerEntry
{
    callback: TimerCallback,
    due_time: Instant,
    guard: Weak<()>
}

/// Keeps a scheduled call alive. Dropping the guard cancels the call
/// if it has not fired yet.
pub type TimerGuard = Arc<()>;

/// # Timer
/// A single background thread that runs one-shot callbacks once their
/// delay has expired. Callbacks run outside the timer's lock, so they
/// are free to schedule further calls.
pub struct Timer
{
    scheduled_calls: Shareable<Vec<TimerEntry>>,
    wait_event: Event,
    terminate: Shareable<bool>
}

impl Timer
{
    pub fn new() -> Arc<Self>
    {
        let result = Arc::new(Timer {
            scheduled_calls: Shareable::new(Vec::new()),
            wait_event:      Event::new(),
            terminate:       Shareable::new(false)
        });
        let timer = result.clone();
        thread::Builder::new()
            .name("timer".to_string())
            .spawn(move || timer.thread_func())
            .map(|_| ())
            .unwrap_or_else(|e| tracing::error!("Failed to start timer thread: {}", e));
        result
    }

    pub fn stop(&self)
    {
        *self.terminate.lock() = true;
        self.wait_event.trigger();
    }

    pub fn schedule(&self, callback: TimerCallback, delay: Duration) -> TimerGuard
    {
        let guard = Arc::new(());
        self.scheduled_calls.lock().push(TimerEntry {
            callback,
            due_time: Instant::now() + delay,
            guard: Arc::downgrade(&guard)
        });
        self.wait_event.trigger();
        guard
    }

    pub fn pending(&self) -> usize
    {
        self.scheduled_calls
            .lock()
            .iter()
            .filter(|x| x.guard.upgrade().is_some())
            .count()
    }

    fn next_due_time(&self) -> Option<Instant>
    {
        self.scheduled_calls
            .lock()
            .iter()
            .map(|x| x.due_time)
            .min()
    }

    fn take_due_entries(&self) -> Vec<TimerEntry>
    {
        let now = Instant::now();
        let mut calls = self.scheduled_calls.lock();
        let (due, waiting): (Vec<TimerEntry>, Vec<TimerEntry>) =
            calls.drain(..).partition(|x| x.due_time <= now);
        *calls = waiting;
        due
    }

    fn thread_func(&self)
    {
        loop
        {
            let wait_for = match self.next_due_time()
            {
                Some(due) => due.saturating_duration_since(Instant::now()),
                None => Duration::from_secs(10)
            };

            if self.wait_event.wait_timeout(wait_for)
            {
                // Either a new call was scheduled or we got stopped.
                self.wait_event.reset();
                if *self.terminate.lock()
                {
                    return;
                }
            }

            for entry in self.take_due_entries()
            {
                if entry.guard.upgrade().is_some()
                {
                    (entry.callback)();
                }
            }
        }
    }
}
