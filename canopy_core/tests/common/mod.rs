#![allow(dead_code)]

use canopy_core::cfg::InputChannelConfig;
use canopy_core::conditional::{ActionDispatch, ConditionalTable, ConditionalTrigger};
use canopy_core::core::shareable::Shareable;
use canopy_core::driver::registry::DriverRegistry;
use canopy_core::driver::{AcquisitionDriver, DriverError};
use canopy_core::input::{ControllerServices, ControllerSettings, InputController};
use canopy_core::io::OutputControl;
use canopy_core::measurement::{Measurement, MeasurementSet};
use canopy_core::persistence::MeasurementSink;
use canopy_core::util::clock::{Clock, ManualClock};
use canopy_hal::gpio::{Edge, EdgeCallback, EdgeSource, Level};
use canopy_hal::HalError;
use std::collections::VecDeque;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::fmt::MakeWriter;

pub type Step = Result<MeasurementSet, DriverError>;

pub fn reading(value: f64) -> Step
{
    Ok(MeasurementSet::new().with(0, Measurement::now(value, "C")))
}

/// Driver that plays back a script, then keeps returning "no data".
#[derive(Clone)]
pub struct ScriptedDriver
{
    pub script: Shareable<VecDeque<Step>>,
    pub calls: Shareable<u32>,
    pub stopped: Shareable<bool>
}

impl ScriptedDriver
{
    pub fn new(steps: Vec<Step>) -> Self
    {
        ScriptedDriver {
            script: Shareable::new(steps.into_iter().collect()),
            calls: Shareable::new(0),
            stopped: Shareable::new(false)
        }
    }

    pub fn calls(&self) -> u32
    {
        *self.calls.lock()
    }
}

impl AcquisitionDriver for ScriptedDriver
{
    fn get_measurement(&mut self) -> Result<MeasurementSet, DriverError>
    {
        *self.calls.lock() += 1;
        self.script.lock().pop_front().unwrap_or(Err(DriverError::NoData))
    }

    fn stop(&mut self)
    {
        *self.stopped.lock() = true;
    }
}

pub struct PanickingDriver;

impl AcquisitionDriver for PanickingDriver
{
    fn get_measurement(&mut self) -> Result<MeasurementSet, DriverError>
    {
        panic!("bus exploded")
    }
}

#[derive(Clone, Default)]
pub struct RecordingSink
{
    pub writes: Shareable<Vec<(String, MeasurementSet)>>
}

impl RecordingSink
{
    pub fn values(&self) -> Vec<f64>
    {
        self.writes.lock().iter().filter_map(|(_, s)| s.get(0).map(|m| m.value)).collect()
    }

    pub fn len(&self) -> usize
    {
        self.writes.lock().len()
    }
}

impl MeasurementSink for RecordingSink
{
    fn persist(&self, input_id: &str, measurements: MeasurementSet)
    {
        self.writes.lock().push((input_id.to_string(), measurements));
    }
}

/// Sink that fails the way a broken store client would.
pub struct PanickingSink;

impl MeasurementSink for PanickingSink
{
    fn persist(&self, _input_id: &str, _measurements: MeasurementSet)
    {
        panic!("sink exploded")
    }
}

/// Formatted log output of whatever runs under `subscriber()`.
#[derive(Clone, Default)]
pub struct CapturedLog
{
    text: Shareable<Vec<u8>>
}

impl CapturedLog
{
    pub fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync
    {
        tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_max_level(tracing::Level::TRACE)
            .without_time()
            .finish()
    }

    pub fn errors(&self) -> Vec<String>
    {
        String::from_utf8_lossy(&self.text.lock())
            .lines()
            .filter(|l| l.contains("ERROR"))
            .map(|l| l.to_string())
            .collect()
    }
}

impl Write for CapturedLog
{
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize>
    {
        self.text.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()>
    {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLog
{
    type Writer = CapturedLog;

    fn make_writer(&'a self) -> Self::Writer
    {
        self.clone()
    }
}

#[derive(Clone, Default)]
pub struct RecordingActions
{
    pub triggers: Shareable<Vec<ConditionalTrigger>>
}

impl RecordingActions
{
    pub fn ids(&self) -> Vec<String>
    {
        self.triggers.lock().iter().map(|t| t.conditional_id.clone()).collect()
    }
}

impl ActionDispatch for RecordingActions
{
    fn dispatch(&self, trigger: ConditionalTrigger)
    {
        self.triggers.lock().push(trigger);
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum OutputCall
{
    On(String, u32, Option<Duration>),
    Off(String, u32)
}

#[derive(Clone, Default)]
pub struct RecordingOutputs
{
    pub calls: Shareable<Vec<OutputCall>>
}

impl OutputControl for RecordingOutputs
{
    fn output_on(&self, output_id: &str, channel: u32, duration: Option<Duration>)
    {
        self.calls.lock().push(OutputCall::On(output_id.to_string(), channel, duration));
    }

    fn output_off(&self, output_id: &str, channel: u32)
    {
        self.calls.lock().push(OutputCall::Off(output_id.to_string(), channel));
    }
}

/// Edge source whose callback the test fires by hand.
#[derive(Clone, Default)]
pub struct ManualEdgeSource
{
    pub callback: Shareable<Option<EdgeCallback>>,
    pub level: Shareable<Option<Level>>
}

impl ManualEdgeSource
{
    pub fn fire(&self, level: Level)
    {
        *self.level.lock() = Some(level);
        if let Some(cb) = self.callback.lock().as_mut()
        {
            cb(level);
        }
    }

    pub fn is_subscribed(&self) -> bool
    {
        self.callback.lock().is_some()
    }
}

impl EdgeSource for ManualEdgeSource
{
    fn subscribe(&mut self, _edge: Edge, _bouncetime: Duration, callback: EdgeCallback) -> Result<(), HalError>
    {
        *self.callback.lock() = Some(callback);
        Ok(())
    }

    fn unsubscribe(&mut self) -> Result<(), HalError>
    {
        *self.callback.lock() = None;
        Ok(())
    }

    fn level(&self) -> Result<Level, HalError>
    {
        Ok(self.level.lock().unwrap_or(Level::Low))
    }
}

pub struct Harness
{
    pub clock: Arc<ManualClock>,
    pub sink: RecordingSink,
    pub actions: RecordingActions,
    pub outputs: RecordingOutputs
}

impl Harness
{
    pub fn new() -> Self
    {
        Harness {
            clock: Arc::new(ManualClock::new()),
            sink: RecordingSink::default(),
            actions: RecordingActions::default(),
            outputs: RecordingOutputs::default()
        }
    }

    pub fn services(&self) -> ControllerServices
    {
        ControllerServices {
            outputs: Arc::new(self.outputs.clone()),
            sink: Arc::new(self.sink.clone()),
            actions: Arc::new(self.actions.clone()),
            clock: self.clock.clone() as Arc<dyn Clock>
        }
    }

    pub fn settings(&self, lock_dir: &Path) -> ControllerSettings
    {
        ControllerSettings {
            sample_rate: Duration::from_millis(100),
            lock_dir: lock_dir.to_path_buf(),
            lock_attempts: 5,
            lock_poll: Duration::from_millis(100),
            pause_timeout: Duration::from_secs(5)
        }
    }

    /// A controller for `cfg` whose driver is `driver`.
    pub fn controller(&self, cfg: InputChannelConfig, driver: ScriptedDriver, table: ConditionalTable, lock_dir: &Path) -> InputController
    {
        let mut registry = DriverRegistry::new();
        let device = cfg.device.clone();
        registry.register(&device, move |_cfg| Ok(Box::new(driver.clone()) as Box<dyn AcquisitionDriver>));
        InputController::new(cfg, table, &registry, self.services(), self.settings(lock_dir)).unwrap()
    }

    /// Advances simulated time and runs one loop iteration.
    pub fn tick_after(&self, controller: &mut InputController, by: Duration)
    {
        self.clock.advance(by);
        controller.tick();
    }
}
