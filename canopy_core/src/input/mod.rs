/*
    The input controller: one cooperative loop per configured input,
    each on its own thread. The loop decides when a measurement is due,
    runs the pre-activation output, takes the shared resource lock, calls
    the driver, hands the result to the persistence sink and evaluates
    the input's conditionals.
*/
use crate::cfg::{ConfigError, DaemonConfig, InputChannelConfig};
use crate::cfg::{ConditionalConfig, EdgeDirection};
use crate::conditional::{ActionDispatch, ConditionalTable};
use crate::core::{event::Event, shareable::Shareable};
use crate::driver::{registry::DriverRegistry, AcquisitionDriver, DriverError};
use crate::io::OutputControl;
use crate::lock::{LockGuard, LockManager, ResourceKey};
use crate::measurement::MeasurementSet;
use crate::persistence::MeasurementSink;
use crate::trace::trace_helper::TraceHelper;
use crate::util::clock::Clock;
use canopy_hal::gpio::{EdgeSource, Level};
use canopy_hal::i2c::ChannelSelect;
use canopy_hal::HalError;
use chrono::{DateTime, Utc};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use strum_macros::Display;
use thiserror::Error;

pub mod edge;
pub mod pause;
pub mod preactivation;

use self::edge::EdgeMonitor;
use self::pause::{PauseBarrier, PauseTimeout};
use self::preactivation::PreActivationSequencer;

/// Failures that keep a controller from starting at all.
#[derive(Debug, Error)]
pub enum ControllerError
{
    #[error("input {id}: unknown device type {device}")]
    UnknownDevice { id: String, device: String },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("input {id}: cannot create driver: {source}")]
    Driver
    {
        id: String,
        #[source]
        source: DriverError
    },
    #[error("input {id}: {source}")]
    Hal
    {
        id: String,
        #[source]
        source: HalError
    },
    #[error("input {id}: edge input needs an edge configuration")]
    MissingEdgeConfig { id: String },
    #[error("cannot spawn controller thread: {0}")]
    Spawn(#[source] std::io::Error)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum ControllerState
{
    Idle,
    Due,
    PreActivating,
    Locking,
    Reading,
    Committing,
    Paused,
    Stopped
}

#[derive(Clone, Debug, PartialEq)]
pub struct ControllerStatus
{
    pub state: ControllerState,
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_measurement: Option<MeasurementSet>,
    pub cycles: u64,
    pub successes: u64
}

impl Default for ControllerStatus
{
    fn default() -> Self
    {
        ControllerStatus {
            state: ControllerState::Idle,
            consecutive_failures: 0,
            last_success: None,
            last_measurement: None,
            cycles: 0,
            successes: 0
        }
    }
}

const LOUD_EVERY: u32 = 3;

/// Counts consecutive "no data" reads. Only every third one in a row is
/// worth a loud log line.
#[derive(Debug, Default)]
pub struct FailureCounter
{
    consecutive: u32
}

impl FailureCounter
{
    pub fn new() -> Self
    {
        FailureCounter { consecutive: 0 }
    }

    /// Returns true if this failure should be logged loudly.
    pub fn record_failure(&mut self) -> bool
    {
        self.consecutive += 1;
        self.consecutive % LOUD_EVERY == 0
    }

    pub fn record_success(&mut self)
    {
        self.consecutive = 0;
    }

    pub fn consecutive(&self) -> u32
    {
        self.consecutive
    }
}

/// Collaborators every controller talks to.
#[derive(Clone)]
pub struct ControllerServices
{
    pub outputs: Arc<dyn OutputControl>,
    pub sink: Arc<dyn MeasurementSink>,
    pub actions: Arc<dyn ActionDispatch>,
    pub clock: Arc<dyn Clock>
}

#[derive(Clone, Debug)]
pub struct ControllerSettings
{
    pub sample_rate: Duration,
    pub lock_dir: PathBuf,
    pub lock_attempts: u32,
    pub lock_poll: Duration,
    /// How long a conditional change waits for the loop to park.
    pub pause_timeout: Duration
}

impl ControllerSettings
{
    pub fn from_daemon(cfg: &DaemonConfig) -> Self
    {
        ControllerSettings {
            sample_rate: cfg.sample_rate(),
            lock_dir: cfg.lock_dir.clone(),
            lock_attempts: cfg.lock_attempts,
            lock_poll: cfg.lock_poll(),
            pause_timeout: Duration::from_secs(120)
        }
    }
}

impl Default for ControllerSettings
{
    fn default() -> Self
    {
        Self::from_daemon(&DaemonConfig::default())
    }
}

/// State shared between a controller thread, its handle and its edge
/// callback.
pub struct ControllerShared
{
    running: AtomicBool,
    pause: PauseBarrier,
    conditionals: Shareable<ConditionalTable>,
    force: AtomicBool,
    edge_seen: AtomicBool,
    status: Shareable<ControllerStatus>,
    ready: Event
}

impl ControllerShared
{
    fn new(conditionals: ConditionalTable) -> Self
    {
        ControllerShared {
            running: AtomicBool::new(true),
            pause: PauseBarrier::new(),
            conditionals: Shareable::new(conditionals),
            force: AtomicBool::new(false),
            edge_seen: AtomicBool::new(false),
            status: Shareable::new(ControllerStatus::default()),
            ready: Event::new()
        }
    }

    fn set_state(&self, state: ControllerState)
    {
        self.status.lock().state = state;
    }
}

enum Phase
{
    Idle,
    Due,
    PreActivating { deadline: Instant },
    Locking,
    Committing { result: Option<MeasurementSet> }
}

impl Phase
{
    fn state(&self) -> ControllerState
    {
        match self
        {
            Phase::Idle => ControllerState::Idle,
            Phase::Due => ControllerState::Due,
            Phase::PreActivating { .. } => ControllerState::PreActivating,
            Phase::Locking => ControllerState::Locking,
            Phase::Committing { .. } => ControllerState::Committing
        }
    }
}

fn panic_message(payload: &Box<dyn Any + Send>) -> String
{
    if let Some(s) = payload.downcast_ref::<&str>()
    {
        s.to_string()
    }
    else if let Some(s) = payload.downcast_ref::<String>()
    {
        s.clone()
    }
    else
    {
        "unknown panic".to_string()
    }
}

/// # InputController
/// Drives one input. Build it with `new`, then either `launch` it onto
/// its own thread or call `tick` directly.
pub struct InputController
{
    cfg: InputChannelConfig,
    driver: Option<Box<dyn AcquisitionDriver>>,
    edge_source: Option<Box<dyn EdgeSource>>,
    mux: Option<Box<dyn ChannelSelect>>,
    locks: Arc<LockManager>,
    sequencer: PreActivationSequencer,
    services: ControllerServices,
    settings: ControllerSettings,
    shared: Arc<ControllerShared>,
    tracer: TraceHelper,
    phase: Phase,
    next_measurement: Instant,
    last_success: Option<Instant>,
    trigger_pending: bool,
    forced: bool,
    failures: FailureCounter,
    pre_output_lock: Option<LockGuard>
}

impl InputController
{
    /// Everything that can be wrong with the configuration is detected
    /// here; a controller that was built will run.
    pub fn new(cfg: InputChannelConfig,
               conditionals: ConditionalTable,
               registry: &DriverRegistry,
               services: ControllerServices,
               settings: ControllerSettings) -> Result<Self, ControllerError>
    {
        cfg.validate()?;
        if !registry.knows(&cfg.device)
        {
            return Err(ControllerError::UnknownDevice { id: cfg.unique_id.clone(), device: cfg.device.clone() });
        }

        let tracer = TraceHelper::new(format!("INPUT/{}", cfg.unique_id));
        let (driver, edge_source) = if DriverRegistry::is_edge_device(&cfg.device)
        {
            if cfg.edge.is_none()
            {
                return Err(ControllerError::MissingEdgeConfig { id: cfg.unique_id.clone() });
            }
            (None, Some(registry.create_edge_source(&cfg)?))
        }
        else
        {
            (Some(registry.create_driver(&cfg)?), None)
        };

        let mux = match &cfg.resource
        {
            Some(ResourceKey::I2cMultiplexer { bus, address, .. }) =>
                Some(registry.create_channel_select(&cfg.unique_id, *bus, *address)?),
            _ => None
        };

        let locks = Arc::new(LockManager::new(&settings.lock_dir,
                                              settings.lock_attempts,
                                              settings.lock_poll,
                                              services.clock.clone(),
                                              tracer.child("Lock")));
        let sequencer = PreActivationSequencer::new(cfg.pre_output.clone(),
                                                    services.outputs.clone(),
                                                    tracer.child("PreOutput"));
        let next_measurement = services.clock.now() + cfg.start_offset();

        Ok(InputController {
            cfg,
            driver,
            edge_source,
            mux,
            locks,
            sequencer,
            services,
            settings,
            shared: Arc::new(ControllerShared::new(conditionals)),
            tracer,
            phase: Phase::Idle,
            next_measurement,
            last_success: None,
            trigger_pending: false,
            forced: false,
            failures: FailureCounter::new(),
            pre_output_lock: None
        })
    }

    pub fn input_id(&self) -> &str
    {
        &self.cfg.unique_id
    }

    pub fn next_measurement(&self) -> Instant
    {
        self.next_measurement
    }

    pub fn status(&self) -> ControllerStatus
    {
        self.shared.status.snapshot()
    }

    /// Makes the next iteration measure regardless of the schedule.
    pub fn force_measurement(&self)
    {
        self.shared.force.store(true, Ordering::SeqCst);
    }

    fn is_edge_input(&self) -> bool
    {
        self.driver.is_none()
    }

    fn set_state(&self, state: ControllerState)
    {
        self.shared.set_state(state);
    }

    /// Subscribes the edge callback of a digital input. Does nothing for
    /// polled inputs.
    pub fn start_edge_detection(&mut self) -> Result<(), ControllerError>
    {
        let edge_cfg = match &self.cfg.edge
        {
            Some(e) => e.clone(),
            None => return Ok(())
        };
        let id = self.cfg.unique_id.clone();
        let source = match self.edge_source.as_mut()
        {
            Some(s) => s,
            None => return Ok(())
        };

        let mut handler = EdgeHandler {
            monitor: EdgeMonitor::new(&edge_cfg),
            input_id: self.cfg.unique_id.clone(),
            services: self.services.clone(),
            shared: self.shared.clone(),
            tracer: self.tracer.child("Edge")
        };
        let hal_edge = handler.monitor.hal_edge();
        source.subscribe(hal_edge, edge_cfg.bouncetime(), Box::new(move |level| handler.on_edge(level)))
              .map_err(|source| ControllerError::Hal { id, source })?;
        self.tracer.info(format!("Watching {} edges on gpio {:?}", edge_cfg.edge, self.cfg.gpio));
        Ok(())
    }

    /// Starts the controller thread.
    pub fn launch(mut self) -> Result<ControllerHandle, ControllerError>
    {
        self.start_edge_detection()?;
        let input_id = self.cfg.unique_id.clone();
        let input_name = self.cfg.display_name().to_string();
        let shared = self.shared.clone();
        let pause_timeout = self.settings.pause_timeout;
        let thread = thread::Builder::new()
                        .name(format!("input-{}", input_id))
                        .spawn(move || self.run())
                        .map_err(ControllerError::Spawn)?;
        Ok(ControllerHandle { input_id, input_name, shared, pause_timeout, thread: Some(thread) })
    }

    fn run(mut self)
    {
        self.tracer.info(format!("Activated ({}, every {:?})", self.cfg.device, self.cfg.period()));
        self.shared.ready.trigger();

        while self.shared.running.load(Ordering::SeqCst)
        {
            if self.shared.pause.pause_requested()
            {
                self.set_state(ControllerState::Paused);
                self.shared.pause.checkpoint(&self.shared.running);
                self.set_state(self.phase.state());
                if !self.shared.running.load(Ordering::SeqCst)
                {
                    break;
                }
            }

            self.tick();
            self.services.clock.sleep(self.settings.sample_rate);
        }

        self.teardown();
    }

    /// One loop iteration: advance the measurement state machine as far
    /// as it goes without waiting, then evaluate periodic conditionals.
    pub fn tick(&mut self)
    {
        if self.shared.force.swap(false, Ordering::SeqCst)
        {
            self.forced = true;
        }

        let now = self.services.clock.now();
        while self.step(now) {}
        self.set_state(self.phase.state());

        let now = self.services.clock.now();
        self.evaluate_conditionals(now);
    }

    /// Performs one transition. Returns true if the next one may follow
    /// right away.
    fn step(&mut self, now: Instant) -> bool
    {
        match std::mem::replace(&mut self.phase, Phase::Idle)
        {
            Phase::Idle =>
            {
                if self.is_edge_input()
                {
                    self.forced = false;
                    return false;
                }
                self.schedule(now)
            }
            Phase::Due =>
            {
                self.set_state(ControllerState::Due);
                if let Some(key) = self.sequencer.lock_key()
                {
                    let guard = self.locks.scoped(&key, None::<&mut dyn ChannelSelect>, Some(&self.shared.running));
                    if !guard.outcome().is_usable()
                    {
                        self.tracer.error(format!("Could not acquire pre-output lock {}", key.lock_name()));
                        self.abort_cycle();
                        return false;
                    }
                    self.pre_output_lock = Some(guard);
                }

                self.phase = match self.sequencer.maybe_preactivate(now)
                {
                    Some(deadline) => Phase::PreActivating { deadline },
                    None => Phase::Locking
                };
                true
            }
            Phase::PreActivating { deadline } =>
            {
                if now >= deadline
                {
                    self.phase = Phase::Locking;
                    true
                }
                else
                {
                    self.phase = Phase::PreActivating { deadline };
                    false
                }
            }
            Phase::Locking =>
            {
                let result = self.acquire_and_read();
                self.phase = Phase::Committing { result };
                true
            }
            Phase::Committing { result } =>
            {
                self.commit(now, result);
                false
            }
        }
    }

    /// Idle: checks whether a measurement is due and advances the
    /// schedule by whole periods so it keeps its phase.
    fn schedule(&mut self, now: Instant) -> bool
    {
        let forced = std::mem::replace(&mut self.forced, false);
        if forced
        {
            self.tracer.info("Measurement forced");
            self.next_measurement = now;
        }
        if now < self.next_measurement
        {
            return false;
        }

        let due_at = self.next_measurement;
        let period = self.cfg.period();
        while self.next_measurement <= now
        {
            self.next_measurement += period;
        }

        // A read that already happened for this slot (e.g. a forced one)
        // is not repeated.
        if !forced && self.last_success.map_or(false, |t| t >= due_at)
        {
            self.tracer.debug("Already measured for this period");
            return false;
        }

        self.trigger_pending = true;
        self.phase = Phase::Due;
        true
    }

    /// Locking and reading. The resource lock is released before this
    /// returns, whatever the driver did.
    fn acquire_and_read(&mut self) -> Option<MeasurementSet>
    {
        self.set_state(ControllerState::Locking);
        let resource_lock = match self.cfg.resource.clone()
        {
            Some(key) =>
            {
                let guard = self.locks.scoped(&key, self.mux.as_deref_mut(), Some(&self.shared.running));
                if !guard.outcome().is_usable()
                {
                    self.tracer.error(format!("Could not use shared resource {} ({:?})", key.lock_name(), guard.outcome()));
                    return None;
                }
                Some(guard)
            }
            None => None
        };

        self.set_state(ControllerState::Reading);
        let driver = self.driver.as_mut()?;
        let result = panic::catch_unwind(AssertUnwindSafe(|| driver.get_measurement()));
        drop(resource_lock);

        match result
        {
            Ok(Ok(set)) if !set.is_empty() => Some(set),
            Ok(Ok(_)) | Ok(Err(DriverError::NoData)) =>
            {
                if self.failures.record_failure()
                {
                    self.tracer.error(format!("No data returned {} times in a row", self.failures.consecutive()));
                }
                else
                {
                    self.tracer.debug("No data returned");
                }
                None
            }
            Ok(Err(e)) =>
            {
                self.tracer.error_chain("Driver error", &e);
                None
            }
            Err(payload) =>
            {
                self.tracer.error(format!("Driver panicked: {}", panic_message(&payload)));
                None
            }
        }
    }

    fn commit(&mut self, now: Instant, result: Option<MeasurementSet>)
    {
        self.set_state(ControllerState::Committing);
        self.pre_output_lock = None;
        self.sequencer.after_measure();

        let mut status = self.shared.status.lock();
        status.cycles += 1;
        match result
        {
            Some(set) =>
            {
                self.failures.record_success();
                self.last_success = Some(now);
                status.successes += 1;
                status.last_success = Some(Utc::now());
                status.last_measurement = Some(set.clone());
                self.services.sink.persist(&self.cfg.unique_id, set);
            }
            None =>
            {
                self.trigger_pending = false;
            }
        }
        status.consecutive_failures = self.failures.consecutive();
    }

    fn abort_cycle(&mut self)
    {
        self.pre_output_lock = None;
        self.trigger_pending = false;
        self.phase = Phase::Idle;
        self.shared.status.lock().cycles += 1;
    }

    fn evaluate_conditionals(&mut self, now: Instant)
    {
        let idle = matches!(self.phase, Phase::Idle);
        let edge_seen = self.shared.edge_seen.swap(false, Ordering::SeqCst);
        let pending = (idle && self.trigger_pending) || edge_seen;
        if idle
        {
            self.trigger_pending = false;
        }

        let triggers = self.shared.conditionals.lock().evaluate_periodic(now, pending);
        for trigger in triggers
        {
            self.tracer.info(&trigger.message);
            self.services.actions.dispatch(trigger);
        }
    }

    fn teardown(&mut self)
    {
        if let Some(source) = self.edge_source.as_mut()
        {
            if let Err(e) = source.unsubscribe()
            {
                self.tracer.warn(format!("Cannot remove edge detection: {}", e));
            }
        }

        self.sequencer.pre_stop();
        if let Some(driver) = self.driver.as_mut()
        {
            let stopped = panic::catch_unwind(AssertUnwindSafe(|| {
                driver.pre_stop();
                driver.stop();
            }));
            if let Err(payload) = stopped
            {
                self.tracer.error(format!("Driver panicked on stop: {}", panic_message(&payload)));
            }
        }

        self.pre_output_lock = None;
        self.locks.release_all();
        self.set_state(ControllerState::Stopped);
        self.shared.running.store(false, Ordering::SeqCst);
        self.tracer.info("Deactivated");
    }
}

/// Runs on the GPIO backend's notification thread.
struct EdgeHandler
{
    monitor: EdgeMonitor,
    input_id: String,
    services: ControllerServices,
    shared: Arc<ControllerShared>,
    tracer: TraceHelper
}

impl EdgeHandler
{
    fn on_edge(&mut self, level: Level)
    {
        let now = self.services.clock.now();
        let direction = match self.monitor.on_edge(now, level)
        {
            Some(d) => d,
            None => return
        };

        self.tracer.debug(format!("{} edge detected", direction));
        self.services.sink.persist(&self.input_id, MeasurementSet::edge(direction == EdgeDirection::Rising));
        self.shared.edge_seen.store(true, Ordering::SeqCst);

        let triggers = self.shared.conditionals.lock().evaluate_edge(direction, level);
        for trigger in triggers
        {
            self.tracer.info(&trigger.message);
            self.services.actions.dispatch(trigger);
        }
    }
}

/// # ControllerHandle
/// The daemon's grip on a launched controller. Dropping the handle stops
/// the controller and waits for its thread.
pub struct ControllerHandle
{
    input_id: String,
    input_name: String,
    shared: Arc<ControllerShared>,
    pause_timeout: Duration,
    thread: Option<thread::JoinHandle<()>>
}

impl ControllerHandle
{
    pub fn input_id(&self) -> &str
    {
        &self.input_id
    }

    pub fn is_running(&self) -> bool
    {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Blocks until the controller thread entered its loop.
    pub fn wait_ready(&self, timeout: Duration) -> bool
    {
        self.shared.ready.wait_timeout(timeout)
    }

    pub fn force_measurement(&self)
    {
        self.shared.force.store(true, Ordering::SeqCst);
    }

    pub fn status(&self) -> ControllerStatus
    {
        self.shared.status.snapshot()
    }

    pub fn conditional_count(&self) -> usize
    {
        self.shared.conditionals.lock().len()
    }

    /// Replaces the conditional table while the loop is parked.
    pub fn rebuild_conditionals(&self, configs: &[ConditionalConfig]) -> Result<(), PauseTimeout>
    {
        let _paused = self.shared.pause.pause(&self.shared.running, self.pause_timeout)?;
        let table = ConditionalTable::rebuild(&self.input_id, &self.input_name, configs);
        *self.shared.conditionals.lock() = table;
        Ok(())
    }

    /// Asks the loop to stop; it does so at the next iteration boundary.
    pub fn stop(&self)
    {
        self.shared.running.store(false, Ordering::SeqCst);
    }

    /// Waits for the controller thread. A panic that escaped the loop
    /// comes back as its message.
    pub fn join(&mut self) -> Result<(), String>
    {
        match self.thread.take()
        {
            Some(thread) => thread.join().map_err(|payload| panic_message(&payload)),
            None => Ok(())
        }
    }
}

impl Drop for ControllerHandle
{
    fn drop(&mut self)
    {
        self.stop();
        let _ = self.join();
    }
}
