/*
    Cross-process locks for shared hardware: I2C multiplexers, ADC chips
    and pre-activation outputs. A lock is a file created exclusively in
    the lock directory that holds the owner's PID, so it is honored by
    every thread and every process on the machine.
*/
use crate::trace::trace_helper::TraceHelper;
use crate::util::clock::Clock;
use canopy_hal::i2c::ChannelSelect;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const DEFAULT_ATTEMPTS: u32 = 600;
pub const DEFAULT_POLL: Duration = Duration::from_millis(100);
/// Poll intervals a lock file may stay without a PID before it counts
/// as abandoned.
const STALE_GRACE_POLLS: u32 = 5;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResourceKey
{
    I2cMultiplexer { bus: u8, address: u8, channel: u8 },
    Adc { bus: u8, address: u8 },
    PreOutput { output_id: String, channel: u32 },
    Named { name: String }
}

impl ResourceKey
{
    /// Name of the lock file. All channels of one multiplexer share a
    /// lock, since selecting a channel affects every user of the chip.
    pub fn lock_name(&self) -> String
    {
        match self
        {
            ResourceKey::I2cMultiplexer { bus, address, .. } =>
                format!("canopy_multiplexer_bus{}_0x{:02X}.pid", bus, address),
            ResourceKey::Adc { bus, address } =>
                format!("canopy_adc_bus{}_0x{:02X}.pid", bus, address),
            ResourceKey::PreOutput { output_id, channel } =>
                format!("canopy_pre_output_{}_{}.pid", sanitize(output_id), channel),
            ResourceKey::Named { name } =>
                format!("canopy_{}.pid", sanitize(name))
        }
    }
}

fn sanitize(name: &str) -> String
{
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireOutcome
{
    Acquired,
    /// The lock is held but switching the multiplexer channel failed.
    ChannelSelectFailed,
    TimedOut,
    Cancelled
}

impl AcquireOutcome
{
    pub fn is_usable(&self) -> bool
    {
        *self == AcquireOutcome::Acquired
    }
}

/// # LockManager
/// Acquires and releases resource locks for one owner (usually one
/// input controller). Acquisition polls a bounded number of times and
/// never blocks indefinitely; release is idempotent.
pub struct LockManager
{
    lock_dir: PathBuf,
    attempts: u32,
    poll: Duration,
    stale_grace: Duration,
    clock: Arc<dyn Clock>,
    held: Mutex<HashSet<String>>,
    tracer: TraceHelper
}

impl LockManager
{
    pub fn new(lock_dir: impl AsRef<Path>, attempts: u32, poll: Duration, clock: Arc<dyn Clock>, tracer: TraceHelper) -> Self
    {
        LockManager {
            lock_dir: lock_dir.as_ref().to_path_buf(),
            attempts: attempts.max(1),
            poll,
            stale_grace: poll * STALE_GRACE_POLLS,
            clock,
            held: Mutex::new(HashSet::new()),
            tracer
        }
    }

    fn lock_path(&self, key: &ResourceKey) -> PathBuf
    {
        self.lock_dir.join(key.lock_name())
    }

    fn held(&self) -> std::sync::MutexGuard<'_, HashSet<String>>
    {
        self.held.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn is_held(&self, key: &ResourceKey) -> bool
    {
        self.held().contains(&key.lock_name())
    }

    pub fn acquire(&self, key: &ResourceKey) -> bool
    {
        self.acquire_cancellable(key, None) == AcquireOutcome::Acquired
    }

    /// Like `acquire`, but gives up early once `running` turns false.
    pub fn acquire_cancellable(&self, key: &ResourceKey, running: Option<&AtomicBool>) -> AcquireOutcome
    {
        if self.is_held(key)
        {
            return AcquireOutcome::Acquired;
        }

        let path = self.lock_path(key);
        if let Err(e) = fs::create_dir_all(&self.lock_dir)
        {
            self.tracer.error(format!("Cannot create lock directory {}: {}", self.lock_dir.display(), e));
            return AcquireOutcome::TimedOut;
        }

        for attempt in 0..self.attempts
        {
            if let Some(flag) = running
            {
                if !flag.load(Ordering::SeqCst)
                {
                    return AcquireOutcome::Cancelled;
                }
            }

            match try_create(&path)
            {
                Ok(()) =>
                {
                    self.held().insert(key.lock_name());
                    self.tracer.trace(format!("Acquired lock {}", path.display()));
                    return AcquireOutcome::Acquired;
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists =>
                {
                    if break_if_stale(&path, self.stale_grace)
                    {
                        self.tracer.warn(format!("Broke stale lock {}", path.display()));
                        continue;
                    }
                }
                Err(e) =>
                {
                    self.tracer.error(format!("Cannot create lock {}: {}", path.display(), e));
                    return AcquireOutcome::TimedOut;
                }
            }

            if attempt + 1 < self.attempts
            {
                self.clock.sleep(self.poll);
            }
        }

        self.tracer.error(format!("Could not acquire lock {} after {} attempts", path.display(), self.attempts));
        AcquireOutcome::TimedOut
    }

    /// Acquires the lock and, for multiplexer keys, switches the
    /// multiplexer to the key's channel.
    pub fn acquire_with_select<S>(&self, key: &ResourceKey, select: Option<&mut S>, running: Option<&AtomicBool>) -> AcquireOutcome
        where S: ChannelSelect + ?Sized
    {
        let outcome = self.acquire_cancellable(key, running);
        if outcome != AcquireOutcome::Acquired
        {
            return outcome;
        }

        if let (ResourceKey::I2cMultiplexer { address, channel, .. }, Some(mux)) = (key, select)
        {
            self.tracer.debug(format!("Setting multiplexer at 0x{:02X} to channel {}", address, channel));
            if let Err(e) = mux.select_channel(*channel)
            {
                self.tracer.error(format!("Could not set channel {} on multiplexer at 0x{:02X}: {}", channel, address, e));
                return AcquireOutcome::ChannelSelectFailed;
            }
        }
        AcquireOutcome::Acquired
    }

    /// Returns a guard that releases the lock when dropped, on every
    /// exit path.
    pub fn scoped<S>(self: &Arc<Self>, key: &ResourceKey, select: Option<&mut S>, running: Option<&AtomicBool>) -> LockGuard
        where S: ChannelSelect + ?Sized
    {
        let outcome = self.acquire_with_select(key, select, running);
        LockGuard { manager: self.clone(), key: key.clone(), outcome }
    }

    /// Releases a lock held by this manager. Releasing a lock that was
    /// never acquired, or was already released, does nothing.
    pub fn release(&self, key: &ResourceKey)
    {
        let name = key.lock_name();
        if !self.held().remove(&name)
        {
            return;
        }
        let path = self.lock_path(key);
        // Only remove the file if it is still ours; a stale-lock breaker
        // elsewhere may already have replaced it.
        if read_pid(&path) == Some(std::process::id())
        {
            if let Err(e) = fs::remove_file(&path)
            {
                self.tracer.error(format!("Cannot remove lock {}: {}", path.display(), e));
                return;
            }
        }
        self.tracer.trace(format!("Released lock {}", path.display()));
    }

    pub fn release_all(&self)
    {
        let names: Vec<String> = self.held().iter().cloned().collect();
        for name in names
        {
            self.held().remove(&name);
            let path = self.lock_dir.join(&name);
            if read_pid(&path) == Some(std::process::id())
            {
                let _ = fs::remove_file(&path);
            }
        }
    }
}

impl Drop for LockManager
{
    fn drop(&mut self)
    {
        self.release_all();
    }
}

pub struct LockGuard
{
    manager: Arc<LockManager>,
    key: ResourceKey,
    outcome: AcquireOutcome
}

impl LockGuard
{
    pub fn outcome(&self) -> AcquireOutcome
    {
        self.outcome
    }

    pub fn key(&self) -> &ResourceKey
    {
        &self.key
    }
}

impl Drop for LockGuard
{
    fn drop(&mut self)
    {
        self.manager.release(&self.key);
    }
}

fn try_create(path: &Path) -> std::io::Result<()>
{
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    write!(file, "{}", std::process::id())?;
    file.sync_all()
}

fn read_pid(path: &Path) -> Option<u32>
{
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn process_gone(pid: u32) -> bool
{
    let proc_root = Path::new("/proc");
    proc_root.is_dir() && !proc_root.join(pid.to_string()).exists()
}

fn file_age(path: &Path) -> Option<Duration>
{
    fs::metadata(path).ok()?.modified().ok()?.elapsed().ok()
}

/// A file is stale if its owner process is gone. A file without a
/// readable PID is being written, unless it is older than `grace`; then
/// its writer died before finishing.
fn is_stale(path: &Path, grace: Duration) -> bool
{
    match read_pid(path)
    {
        Some(pid) => process_gone(pid),
        None => file_age(path).map_or(false, |age| age >= grace)
    }
}

/// Removes a stale lock file. Breakers take turns through a companion
/// ".break" file and check the lock again while holding it. Only a
/// breaker removes a dead owner's file, so the file checked is the file
/// removed.
fn break_if_stale(path: &Path, grace: Duration) -> bool
{
    if !is_stale(path, grace)
    {
        return false;
    }

    let guard = path.with_extension("break");
    if try_create(&guard).is_err()
    {
        // A breaker that died on the job leaves its guard behind.
        if is_stale(&guard, grace)
        {
            let _ = fs::remove_file(&guard);
        }
        return false;
    }

    let broken = is_stale(path, grace) && fs::remove_file(path).is_ok();
    let _ = fs::remove_file(&guard);
    broken
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::clock::ManualClock;
    use canopy_hal::HalError;
    use mockall::mock;
    use mockall::predicate::eq;

    mock! {
        Mux {}
        impl ChannelSelect for Mux {
            fn select_channel(&mut self, channel: u8) -> Result<(), HalError>;
        }
    }

    fn manager(dir: &Path, clock: Arc<ManualClock>) -> Arc<LockManager>
    {
        Arc::new(LockManager::new(dir, DEFAULT_ATTEMPTS, DEFAULT_POLL, clock, TraceHelper::new("LOCK".to_string())))
    }

    fn adc() -> ResourceKey
    {
        ResourceKey::Adc { bus: 1, address: 0x48 }
    }

    #[test]
    fn acquire_creates_lock_file_with_pid()
    {
        let dir = tempfile::tempdir().unwrap();
        let lm = manager(dir.path(), Arc::new(ManualClock::new()));
        assert!(lm.acquire(&adc()));
        let path = dir.path().join(adc().lock_name());
        assert_eq!(Some(std::process::id()), read_pid(&path));
        lm.release(&adc());
        assert!(!path.exists());
    }

    #[test]
    fn release_is_idempotent()
    {
        let dir = tempfile::tempdir().unwrap();
        let lm = manager(dir.path(), Arc::new(ManualClock::new()));
        lm.release(&adc());
        assert!(lm.acquire(&adc()));
        lm.release(&adc());
        lm.release(&adc());
        assert!(!lm.is_held(&adc()));
    }

    #[test]
    fn release_by_non_owner_keeps_the_lock()
    {
        let dir = tempfile::tempdir().unwrap();
        let owner = manager(dir.path(), Arc::new(ManualClock::new()));
        let other = manager(dir.path(), Arc::new(ManualClock::new()));
        assert!(owner.acquire(&adc()));
        other.release(&adc());
        assert!(dir.path().join(adc().lock_name()).exists());
    }

    #[test]
    fn acquire_on_held_resource_times_out_within_bound()
    {
        let dir = tempfile::tempdir().unwrap();
        let owner = manager(dir.path(), Arc::new(ManualClock::new()));
        let clock = Arc::new(ManualClock::new());
        let contender = manager(dir.path(), clock.clone());

        assert!(owner.acquire(&adc()));
        assert!(!contender.acquire(&adc()));
        assert!(clock.elapsed() <= DEFAULT_POLL * DEFAULT_ATTEMPTS);
        assert!(clock.elapsed() >= DEFAULT_POLL * (DEFAULT_ATTEMPTS - 1));
    }

    #[test]
    fn lock_becomes_available_after_release()
    {
        let dir = tempfile::tempdir().unwrap();
        let first = manager(dir.path(), Arc::new(ManualClock::new()));
        let second = manager(dir.path(), Arc::new(ManualClock::new()));
        assert!(first.acquire(&adc()));
        first.release(&adc());
        assert!(second.acquire(&adc()));
    }

    #[test]
    fn stale_lock_of_dead_process_is_broken()
    {
        if !Path::new("/proc").is_dir()
        {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(adc().lock_name());
        fs::write(&path, dead_pid()).unwrap();
        let lm = manager(dir.path(), Arc::new(ManualClock::new()));
        assert!(lm.acquire(&adc()));
        assert_eq!(Some(std::process::id()), read_pid(&path));
    }

    fn dead_pid() -> &'static str
    {
        // PIDs are capped well below this on Linux.
        "4194399"
    }

    fn age(path: &Path, by: Duration)
    {
        let file = OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(std::time::SystemTime::now() - by).unwrap();
    }

    #[test]
    fn abandoned_lock_file_without_pid_is_broken()
    {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(adc().lock_name());
        fs::write(&path, "").unwrap();
        age(&path, Duration::from_secs(60));
        let lm = manager(dir.path(), Arc::new(ManualClock::new()));
        assert!(lm.acquire(&adc()));
        assert_eq!(Some(std::process::id()), read_pid(&path));
    }

    #[test]
    fn fresh_lock_file_without_pid_is_left_to_its_writer()
    {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(adc().lock_name());
        fs::write(&path, "").unwrap();
        let lm = Arc::new(LockManager::new(dir.path(), 5, DEFAULT_POLL, Arc::new(ManualClock::new()), TraceHelper::new("LOCK".to_string())));
        assert!(!lm.acquire(&adc()));
        assert!(path.exists());
        assert_eq!(None, read_pid(&path));
    }

    #[test]
    fn stale_lock_is_not_broken_while_another_breaker_is_at_work()
    {
        if !Path::new("/proc").is_dir()
        {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(adc().lock_name());
        fs::write(&path, dead_pid()).unwrap();
        // a live process holds the break guard
        fs::write(path.with_extension("break"), std::process::id().to_string()).unwrap();

        assert!(!break_if_stale(&path, DEFAULT_POLL));
        assert_eq!(Some(4194399), read_pid(&path));
        assert!(path.with_extension("break").exists());
    }

    #[test]
    fn lock_retaken_by_a_live_owner_is_not_broken()
    {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(adc().lock_name());
        fs::write(&path, std::process::id().to_string()).unwrap();
        age(&path, Duration::from_secs(60));

        assert!(!break_if_stale(&path, DEFAULT_POLL));
        assert!(path.exists());
        assert!(!path.with_extension("break").exists());
    }

    #[test]
    fn guard_of_a_dead_breaker_is_cleared()
    {
        if !Path::new("/proc").is_dir()
        {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(adc().lock_name());
        fs::write(&path, dead_pid()).unwrap();
        fs::write(path.with_extension("break"), dead_pid()).unwrap();

        let lm = manager(dir.path(), Arc::new(ManualClock::new()));
        assert!(lm.acquire(&adc()));
        assert_eq!(Some(std::process::id()), read_pid(&path));
        assert!(!path.with_extension("break").exists());
    }

    #[test]
    fn multiplexer_channels_share_one_lock()
    {
        let a = ResourceKey::I2cMultiplexer { bus: 1, address: 0x70, channel: 0 };
        let b = ResourceKey::I2cMultiplexer { bus: 1, address: 0x70, channel: 5 };
        assert_eq!(a.lock_name(), b.lock_name());
    }

    #[test]
    fn multiplexer_channel_is_selected_after_acquire()
    {
        let dir = tempfile::tempdir().unwrap();
        let lm = manager(dir.path(), Arc::new(ManualClock::new()));
        let mut mux = MockMux::new();
        mux.expect_select_channel().with(eq(5u8)).times(1).returning(|_| Ok(()));
        let key = ResourceKey::I2cMultiplexer { bus: 1, address: 0x70, channel: 5 };
        let guard = lm.scoped(&key, Some(&mut mux), None);
        assert_eq!(AcquireOutcome::Acquired, guard.outcome());
    }

    #[test]
    fn failed_channel_select_is_reported_and_lock_released_by_guard()
    {
        let dir = tempfile::tempdir().unwrap();
        let lm = manager(dir.path(), Arc::new(ManualClock::new()));
        let mut mux = MockMux::new();
        mux.expect_select_channel().returning(|_| Err(HalError::Bus("nack".to_string())));
        let key = ResourceKey::I2cMultiplexer { bus: 1, address: 0x70, channel: 2 };
        {
            let guard = lm.scoped(&key, Some(&mut mux), None);
            assert_eq!(AcquireOutcome::ChannelSelectFailed, guard.outcome());
            assert!(lm.is_held(&key));
        }
        assert!(!lm.is_held(&key));
        assert!(!dir.path().join(key.lock_name()).exists());
    }

    #[test]
    fn cleared_running_flag_cancels_acquire()
    {
        let dir = tempfile::tempdir().unwrap();
        let owner = manager(dir.path(), Arc::new(ManualClock::new()));
        let contender = manager(dir.path(), Arc::new(ManualClock::new()));
        assert!(owner.acquire(&adc()));
        let running = AtomicBool::new(false);
        assert_eq!(AcquireOutcome::Cancelled, contender.acquire_cancellable(&adc(), Some(&running)));
    }
}
