use canopy_core::{cfg::{seconds, InputChannelConfig}, trace::trace_helper::TraceHelper};
use canopy_hal::{adc::AdcChannel,
                 gpio::{DataLine, Edge, EdgeCallback, EdgeSample, EdgeSource, Level},
                 HalError};
use std::{sync::{atomic::{AtomicBool, Ordering}, Arc, Mutex},
          thread,
          time::Duration};

/// DHT22 style data line. Answers every capture with a frame encoding
/// the "temperature" and "humidity" options.
pub struct SimDhtLine
{
    temperature: f64,
    humidity: f64,
    powered: bool
}

impl SimDhtLine
{
    pub fn new(cfg: &InputChannelConfig) -> Self
    {
        SimDhtLine {
            temperature: cfg.option_f64("temperature").unwrap_or(21.0),
            humidity: cfg.option_f64("humidity").unwrap_or(55.0),
            powered: true
        }
    }

    fn payload(&self) -> [u8; 5]
    {
        let humidity = (self.humidity * 10.0).round().max(0.0).min(1000.0) as u16;
        let magnitude = (self.temperature.abs() * 10.0).round().min(f64::from(0x7FFF)) as u16;
        let temperature = if self.temperature < 0.0 { magnitude | 0x8000 } else { magnitude };
        let mut bytes = [(humidity >> 8) as u8, humidity as u8, (temperature >> 8) as u8, temperature as u8, 0];
        bytes[4] = bytes[..4].iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        bytes
    }
}

impl DataLine for SimDhtLine
{
    fn capture(&mut self, _start_pulse: Duration, _window: Duration) -> Result<Vec<EdgeSample>, HalError>
    {
        if !self.powered
        {
            return Ok(Vec::new());
        }

        let mut samples = Vec::with_capacity(84);
        let mut tick: u32 = 0;
        let mut pulse = |high_us: u32, low_us: u32| {
            samples.push(EdgeSample::new(Level::High, tick));
            tick = tick.wrapping_add(high_us);
            samples.push(EdgeSample::new(Level::Low, tick));
            tick = tick.wrapping_add(low_us);
        };
        pulse(30, 80);
        pulse(80, 50);
        for byte in self.payload().iter()
        {
            for i in (0..8).rev()
            {
                pulse(if byte >> i & 1 == 1 { 70 } else { 26 }, 50);
            }
        }
        Ok(samples)
    }

    fn set_power(&mut self, on: bool) -> Result<(), HalError>
    {
        self.powered = on;
        Ok(())
    }

    fn has_power_control(&self) -> bool
    {
        true
    }
}

/// Voltage source reading the "volts" option.
pub struct SimAdc
{
    volts: f64
}

impl SimAdc
{
    pub fn new(cfg: &InputChannelConfig) -> Self
    {
        SimAdc { volts: cfg.option_f64("volts").unwrap_or(1.65) }
    }
}

impl AdcChannel for SimAdc
{
    fn read_voltage(&mut self) -> Result<f64, HalError>
    {
        Ok(self.volts)
    }
}

/// A line that toggles every "toggle_every" seconds once subscribed.
pub struct SimEdgeSource
{
    interval: Duration,
    level: Arc<Mutex<Level>>,
    running: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
    tracer: TraceHelper
}

impl SimEdgeSource
{
    pub fn new(cfg: &InputChannelConfig) -> Self
    {
        SimEdgeSource {
            interval: seconds(cfg.option_f64("toggle_every").unwrap_or(5.0)).max(Duration::from_millis(10)),
            level: Arc::new(Mutex::new(Level::Low)),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
            tracer: TraceHelper::new(format!("SIM/Gpio{}", cfg.gpio.unwrap_or(0)))
        }
    }
}

impl EdgeSource for SimEdgeSource
{
    fn subscribe(&mut self, edge: Edge, _bouncetime: Duration, mut callback: EdgeCallback) -> Result<(), HalError>
    {
        self.unsubscribe()?;
        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let level = self.level.clone();
        let interval = self.interval;
        self.tracer.debug(format!("Toggling every {:?}, reporting {:?} edges", interval, edge));

        let worker = thread::Builder::new().name("sim-gpio".to_string()).spawn(move || {
            while running.load(Ordering::SeqCst)
            {
                thread::sleep(interval);
                let now = {
                    let mut current = level.lock().unwrap_or_else(|p| p.into_inner());
                    *current = if current.is_high() { Level::Low } else { Level::High };
                    *current
                };
                let wanted = match edge
                {
                    Edge::Rising => now.is_high(),
                    Edge::Falling => !now.is_high(),
                    Edge::Both => true
                };
                if wanted && running.load(Ordering::SeqCst)
                {
                    callback(now);
                }
            }
        })?;
        self.worker = Some(worker);
        Ok(())
    }

    fn unsubscribe(&mut self) -> Result<(), HalError>
    {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take()
        {
            let _ = worker.join();
        }
        Ok(())
    }

    fn level(&self) -> Result<Level, HalError>
    {
        Ok(*self.level.lock().unwrap_or_else(|p| p.into_inner()))
    }
}
