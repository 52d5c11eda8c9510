use canopy_core::trace::trace_helper::TraceHelper;
use canopy_hal::{output::OutputDriver, HalError};
use rppal::gpio::{Gpio, OutputPin};
use std::collections::HashMap;

/// Parses output ids of the form "gpio17" or "17".
pub fn parse_pin(output_id: &str) -> Option<u8>
{
    let digits = output_id.trim().trim_start_matches("gpio").trim_start_matches("GPIO");
    digits.parse().ok()
}

/// # GpioOutputs
/// Relays and MOSFETs wired straight to header pins. The output id
/// names the BCM pin, the channel is ignored. Pins are claimed on first
/// use and keep their level when the daemon exits.
pub struct GpioOutputs
{
    gpio: Gpio,
    pins: HashMap<u8, OutputPin>,
    tracer: TraceHelper
}

impl GpioOutputs
{
    pub fn new() -> Result<Self, rppal::gpio::Error>
    {
        Ok(GpioOutputs {
            gpio: Gpio::new()?,
            pins: HashMap::new(),
            tracer: TraceHelper::new("IO/GpioOutputs".to_string())
        })
    }

    fn pin(&mut self, pin: u8) -> Result<&mut OutputPin, HalError>
    {
        if !self.pins.contains_key(&pin)
        {
            let mut output = self.gpio.get(pin).map_err(|_| HalError::PinUnavailable(pin))?.into_output();
            output.set_reset_on_drop(false);
            self.pins.insert(pin, output);
        }
        self.pins.get_mut(&pin).ok_or(HalError::PinUnavailable(pin))
    }
}

impl OutputDriver for GpioOutputs
{
    fn set(&mut self, output_id: &str, _channel: u32, on: bool) -> Result<(), HalError>
    {
        let pin = parse_pin(output_id).ok_or_else(|| HalError::Bus(format!("{} does not name a gpio pin", output_id)))?;
        let output = self.pin(pin)?;
        if on { output.set_high() } else { output.set_low() }
        self.tracer.debug(format!("gpio{} -> {}", pin, on));
        Ok(())
    }
}
