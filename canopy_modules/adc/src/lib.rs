/*
*   # The ADC Module
*   Analog inputs behind an ADC (ADS1x15, MCP3008 and the like). The
*   measured voltage is reported on channel 0; if the input has an
*   `adc` scaling section the voltage is also converted into units
*   (e.g. a 0.5-4.5V pressure transducer to 0-100 psi) and reported on
*   channel 1.
*
*   The scaling is linear between (volts_min, units_min) and
*   (volts_max, units_max), or falling if `inverse_scale` is set. The
*   voltage is clamped to the volts range before conversion and the
*   result is clamped to the units range.
*
*   ADCs usually sit on a shared I2C bus; give such inputs a `resource`
*   so the controller serializes access.
*/
extern crate canopy_core;
extern crate canopy_hal;

use canopy_core::{cfg::{AdcScalingConfig, InputChannelConfig},
                  driver::{registry::DriverRegistry, AcquisitionDriver, DriverError},
                  measurement::{Measurement, MeasurementSet},
                  trace::trace_helper::TraceHelper};
use canopy_hal::{adc::AdcChannel, HalError};

pub const VOLTAGE_CHANNEL: u32 = 0;
pub const SCALED_CHANNEL: u32 = 1;

/// Converts a voltage into units according to `scaling`.
pub fn convert(volts: f64, scaling: &AdcScalingConfig) -> f64
{
    let (v_lo, v_hi) = ordered(scaling.volts_min, scaling.volts_max);
    let (u_lo, u_hi) = ordered(scaling.units_min, scaling.units_max);
    let span = v_hi - v_lo;
    if span <= 0.0
    {
        return u_lo;
    }

    let fraction = (volts.max(v_lo).min(v_hi) - v_lo) / span;
    let units = if scaling.inverse_scale
    {
        u_hi - (u_hi - u_lo) * fraction
    }
    else
    {
        u_lo + (u_hi - u_lo) * fraction
    };
    units.max(u_lo).min(u_hi)
}

fn ordered(a: f64, b: f64) -> (f64, f64)
{
    if a <= b { (a, b) } else { (b, a) }
}

/// Registers `tag` as an ADC device. `adc_factory` opens the converter
/// channel named by the input's scaling section (channel 0 if there is
/// none).
pub fn register<A, F>(registry: &mut DriverRegistry, tag: &str, adc_factory: F)
    where A: AdcChannel + 'static,
          F: Fn(&InputChannelConfig, u32) -> Result<A, HalError> + Send + Sync + 'static
{
    registry.register(tag, move |cfg| {
        let hw_channel = cfg.adc.as_ref().map(|a| a.channel).unwrap_or(0);
        let adc = adc_factory(cfg, hw_channel)?;
        Ok(Box::new(ScaledAdcInput::new(adc, cfg)) as Box<dyn AcquisitionDriver>)
    });
}

pub struct ScaledAdcInput<A: AdcChannel>
{
    adc: A,
    scaling: Option<AdcScalingConfig>,
    tracer: TraceHelper
}

impl<A: AdcChannel> ScaledAdcInput<A>
{
    pub fn new(adc: A, cfg: &InputChannelConfig) -> Self
    {
        ScaledAdcInput {
            adc,
            scaling: cfg.adc.clone(),
            tracer: TraceHelper::new(format!("ADC/{}", cfg.unique_id))
        }
    }
}

impl<A: AdcChannel> AcquisitionDriver for ScaledAdcInput<A>
{
    fn get_measurement(&mut self) -> Result<MeasurementSet, DriverError>
    {
        let volts = self.adc.read_voltage()?;
        if !volts.is_finite()
        {
            self.tracer.debug(format!("Discarding conversion result {}", volts));
            return Err(DriverError::NoData);
        }

        let mut set = MeasurementSet::new().with(VOLTAGE_CHANNEL, Measurement::now(volts, "V"));
        if let Some(scaling) = &self.scaling
        {
            set.insert(SCALED_CHANNEL, Measurement::now(convert(volts, scaling), &scaling.unit));
        }
        Ok(set)
    }
}
