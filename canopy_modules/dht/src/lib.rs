/*
*   # The DHT Module
*   Reads temperature and humidity from the AOSONG DHT11 and DHT22
*   (AM2302) single-wire sensors.
*
*   ## Usage
*   The target hands the module a factory for a `DataLine` on the
*   input's gpio. `register` makes the device tags "DHT11", "DHT22"
*   and "AM2302" known to the driver registry.
*
*   ### Behavior
*   A read wakes the sensor, captures the transitions of its answer and
*   decodes them. A failed read is retried `retries` times, `retry_delay`
*   apart. If that is not enough and the line can switch the sensor's
*   supply, the sensor is power cycled and the retries start over.
*   Only after both layers fail the controller sees "no data".
*
*   Channels: 0 temperature (C), 1 humidity (percent), 2 dew point (C),
*   3 vapor pressure deficit (Pa).
*
*   ### Notes
*   Reading more often than about every two seconds makes the DHT22
*   hang; give it a period of 3s or more.
*/
extern crate canopy_core;
extern crate canopy_hal;

use canopy_core::{cfg::InputChannelConfig,
                  driver::{registry::DriverRegistry, AcquisitionDriver, DriverError},
                  measurement::{Measurement, MeasurementSet},
                  trace::trace_helper::TraceHelper};
use canopy_hal::{gpio::DataLine, HalError};
use std::{thread, time::Duration};

pub mod decoder;
pub mod error;
pub mod psychro;

pub use decoder::{DecodeStats, DhtModel, DhtReading};
use error::ReadError;

/// How long the sensor gets to answer.
const CAPTURE_WINDOW: Duration = Duration::from_millis(200);
const DEFAULT_POWER_OFF_S: f64 = 2.0;
const DEFAULT_POWER_SETTLE_S: f64 = 2.0;

/// Registers the DHT device tags. `line_factory` opens the data line
/// for an input's configuration.
pub fn register<L, F>(registry: &mut DriverRegistry, line_factory: F)
    where L: DataLine + 'static,
          F: Fn(&InputChannelConfig) -> Result<L, HalError> + Clone + Send + Sync + 'static
{
    for tag in ["DHT11", "DHT22", "AM2302"].iter()
    {
        let factory = line_factory.clone();
        registry.register(tag, move |cfg| {
            let model = DhtModel::from_tag(&cfg.device).ok_or_else(|| DriverError::Fault(format!("not a DHT device: {}", cfg.device)))?;
            let line = factory(cfg)?;
            Ok(Box::new(DhtSensor::new(line, model, cfg)) as Box<dyn AcquisitionDriver>)
        });
    }
}

pub struct DhtSensor<L: DataLine>
{
    line: L,
    model: DhtModel,
    retries: u32,
    retry_delay: Duration,
    power_off: Duration,
    power_settle: Duration,
    stats: DecodeStats,
    tracer: TraceHelper
}

impl<L: DataLine> DhtSensor<L>
{
    /// Power cycle timing can be tuned through the input options
    /// "power_off" and "power_settle" (seconds).
    pub fn new(line: L, model: DhtModel, cfg: &InputChannelConfig) -> Self
    {
        let seconds = canopy_core::cfg::seconds;
        DhtSensor {
            line,
            model,
            retries: cfg.retries.max(1),
            retry_delay: cfg.retry_delay(),
            power_off: seconds(cfg.option_f64("power_off").unwrap_or(DEFAULT_POWER_OFF_S)),
            power_settle: seconds(cfg.option_f64("power_settle").unwrap_or(DEFAULT_POWER_SETTLE_S)),
            stats: DecodeStats::default(),
            tracer: TraceHelper::new(format!("DHT/{}", cfg.unique_id))
        }
    }

    pub fn stats(&self) -> DecodeStats
    {
        self.stats
    }

    /// One wake-capture-decode transaction.
    pub fn read_once(&mut self) -> Result<DhtReading, ReadError>
    {
        let samples = self.line.capture(self.model.start_pulse(), CAPTURE_WINDOW)?;
        let result = decoder::decode(&samples, self.model);
        self.stats.record(&result);
        Ok(result?)
    }

    /// Up to `retries` reads. Returns the reading or the last error.
    fn read_with_retries(&mut self) -> Result<DhtReading, ReadError>
    {
        let mut attempt = 1;
        loop
        {
            match self.read_once()
            {
                Ok(reading) => return Ok(reading),
                Err(e) if attempt >= self.retries => return Err(e),
                Err(e) =>
                {
                    self.tracer.debug(format!("Read {} of {} failed: {}", attempt, self.retries, e));
                }
            }
            attempt += 1;
            thread::sleep(self.retry_delay);
        }
    }

    fn power_cycle(&mut self) -> Result<(), HalError>
    {
        self.tracer.warn(format!("Sensor does not answer, power cycling ({:?})", self.stats));
        self.line.set_power(false)?;
        thread::sleep(self.power_off);
        self.line.set_power(true)?;
        thread::sleep(self.power_settle);
        self.stats.sensor_resets += 1;
        Ok(())
    }
}

fn to_measurements(reading: DhtReading) -> MeasurementSet
{
    let dew_point = psychro::dew_point(reading.temperature, reading.humidity);
    let vpd = psychro::vapor_pressure_deficit(reading.temperature, reading.humidity);
    MeasurementSet::new()
        .with(0, Measurement::now(reading.temperature, "C"))
        .with(1, Measurement::now(reading.humidity, "percent"))
        .with(2, Measurement::now(dew_point, "C"))
        .with(3, Measurement::now(vpd, "Pa"))
}

impl<L: DataLine> AcquisitionDriver for DhtSensor<L>
{
    fn get_measurement(&mut self) -> Result<MeasurementSet, DriverError>
    {
        let mut result = self.read_with_retries();
        if result.is_err() && self.line.has_power_control()
        {
            self.power_cycle()?;
            result = self.read_with_retries();
        }

        match result
        {
            Ok(reading) => Ok(to_measurements(reading)),
            Err(ReadError::Decode(e)) =>
            {
                self.tracer.debug(format!("Could not acquire a measurement: {}", e));
                Err(DriverError::NoData)
            }
            Err(ReadError::Hal(e)) => Err(DriverError::Hal(e))
        }
    }

    fn stop(&mut self)
    {
        self.tracer.debug(format!("Stopped ({:?})", self.stats));
    }
}
