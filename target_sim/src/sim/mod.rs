/*
    Simulated hardware. Every input of the configuration can run on the
    desktop: DHT sensors get a data line that answers with a proper
    frame, ADCs a voltage source and edge inputs a line that toggles on
    its own. Values come from the input's "options".
*/
use canopy_core::{cfg::InputChannelConfig,
                  driver::{registry::DriverRegistry, AcquisitionDriver, DriverError},
                  measurement::{Measurement, MeasurementSet},
                  trace::trace_helper::TraceHelper};
use canopy_hal::{i2c::ChannelSelect, output::OutputDriver, HalError};
use std::time::Instant;

mod lines;

pub use lines::{SimAdc, SimDhtLine, SimEdgeSource};

pub fn register(registry: &mut DriverRegistry)
{
    registry.register("SIM_TEMPERATURE", |cfg| Ok(Box::new(WaveSensor::new(cfg)) as Box<dyn AcquisitionDriver>));
    dht::register(registry, |cfg: &InputChannelConfig| Ok(SimDhtLine::new(cfg)));
    adc::register(registry, "SIM_ADC", |cfg: &InputChannelConfig, _channel| Ok(SimAdc::new(cfg)));
    registry.set_edge_source(|cfg| Ok(Box::new(SimEdgeSource::new(cfg)) as Box<dyn canopy_hal::gpio::EdgeSource>));
    registry.set_channel_select(|bus, address| Ok(Box::new(SimMux::new(bus, address)) as Box<dyn ChannelSelect>));
}

/// Sine wave around "base" with "amplitude", one cycle every
/// "cycle" seconds. Every "miss_every"-th read returns no data.
struct WaveSensor
{
    base: f64,
    amplitude: f64,
    cycle: f64,
    miss_every: u64,
    reads: u64,
    started: Instant,
    unit: String
}

impl WaveSensor
{
    fn new(cfg: &InputChannelConfig) -> Self
    {
        WaveSensor {
            base: cfg.option_f64("base").unwrap_or(20.0),
            amplitude: cfg.option_f64("amplitude").unwrap_or(2.0),
            cycle: cfg.option_f64("cycle").unwrap_or(600.0).max(1.0),
            miss_every: cfg.option_f64("miss_every").unwrap_or(0.0) as u64,
            reads: 0,
            started: Instant::now(),
            unit: cfg.option_str("unit").unwrap_or("C").to_string()
        }
    }
}

impl AcquisitionDriver for WaveSensor
{
    fn get_measurement(&mut self) -> Result<MeasurementSet, DriverError>
    {
        self.reads += 1;
        if self.miss_every > 0 && self.reads % self.miss_every == 0
        {
            return Err(DriverError::NoData);
        }
        let phase = self.started.elapsed().as_secs_f64() / self.cycle * std::f64::consts::PI * 2.0;
        let value = self.base + self.amplitude * phase.sin();
        Ok(MeasurementSet::new().with(0, Measurement::now(value, &self.unit)))
    }
}

/// Outputs that only log what they would switch.
pub struct LoggingOutputs
{
    tracer: TraceHelper
}

impl LoggingOutputs
{
    pub fn new() -> Self
    {
        LoggingOutputs { tracer: TraceHelper::new("SIM/Outputs".to_string()) }
    }
}

impl OutputDriver for LoggingOutputs
{
    fn set(&mut self, output_id: &str, channel: u32, on: bool) -> Result<(), HalError>
    {
        self.tracer.info(format!("Output {} channel {} -> {}", output_id, channel, if on { "on" } else { "off" }));
        Ok(())
    }
}

struct SimMux
{
    tracer: TraceHelper
}

impl SimMux
{
    fn new(bus: u8, address: u8) -> Self
    {
        SimMux { tracer: TraceHelper::new(format!("SIM/Mux{}_0x{:02X}", bus, address)) }
    }
}

impl ChannelSelect for SimMux
{
    fn select_channel(&mut self, channel: u8) -> Result<(), HalError>
    {
        if channel > 7
        {
            return Err(HalError::Bus(format!("no channel {}", channel)));
        }
        self.tracer.debug(format!("Channel {} selected", channel));
        Ok(())
    }
}
