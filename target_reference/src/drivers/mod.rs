/*
    rppal implementations of the canopy HAL traits for the reference
    board.
*/
use canopy_core::{cfg::InputChannelConfig, driver::registry::DriverRegistry};
use canopy_hal::{adc::AdcChannel,
                 gpio::{DataLine, Edge, EdgeCallback, EdgeSample, EdgeSource, Level},
                 i2c::ChannelSelect,
                 HalError};
use rppal::gpio::{self, Gpio, InputPin, IoPin, Mode, Trigger};
use rppal::i2c::I2c;
use std::{thread, time::{Duration, Instant}};

pub fn register(registry: &mut DriverRegistry)
{
    dht::register(registry, |cfg: &InputChannelConfig| RpiDhtLine::new(cfg));
    adc::register(registry, "ADS1115", |cfg: &InputChannelConfig, channel| Ads1115::new(cfg, channel));
    registry.set_edge_source(|cfg| Ok(Box::new(RpiEdgeSource::new(cfg)?) as Box<dyn EdgeSource>));
    registry.set_channel_select(|bus, address| Ok(Box::new(Tca9548a::new(bus, address)?) as Box<dyn ChannelSelect>));
}

fn gpio_pin(cfg: &InputChannelConfig) -> Result<gpio::Pin, HalError>
{
    let number = cfg.gpio.ok_or(HalError::Unsupported("input without gpio"))?;
    Gpio::new().and_then(|g| g.get(number))
               .map_err(|_| HalError::PinUnavailable(number))
}

fn hal_level(level: gpio::Level) -> Level
{
    match level
    {
        gpio::Level::High => Level::High,
        gpio::Level::Low => Level::Low
    }
}

fn bus_error(e: rppal::i2c::Error) -> HalError
{
    HalError::Bus(e.to_string())
}

pub struct RpiEdgeSource
{
    pin: InputPin
}

impl RpiEdgeSource
{
    pub fn new(cfg: &InputChannelConfig) -> Result<Self, HalError>
    {
        Ok(RpiEdgeSource { pin: gpio_pin(cfg)?.into_input() })
    }
}

impl EdgeSource for RpiEdgeSource
{
    // rppal has no debounce of its own; the edge monitor's reset period
    // covers contact bounce.
    fn subscribe(&mut self, edge: Edge, _bouncetime: Duration, mut callback: EdgeCallback) -> Result<(), HalError>
    {
        let trigger = match edge
        {
            Edge::Rising => Trigger::RisingEdge,
            Edge::Falling => Trigger::FallingEdge,
            Edge::Both => Trigger::Both
        };
        self.pin
            .set_async_interrupt(trigger, move |level| callback(hal_level(level)))
            .map_err(|e| HalError::Bus(e.to_string()))
    }

    fn unsubscribe(&mut self) -> Result<(), HalError>
    {
        self.pin.clear_async_interrupt().map_err(|e| HalError::Bus(e.to_string()))
    }

    fn level(&self) -> Result<Level, HalError>
    {
        Ok(hal_level(self.pin.read()))
    }
}

/// DHT data line, sampled by busy polling. The sensor's bits are tens
/// of microseconds long, which an interrupt per edge does not resolve
/// reliably on a Pi.
pub struct RpiDhtLine
{
    pin: IoPin,
    power: Option<gpio::OutputPin>
}

impl RpiDhtLine
{
    /// The optional "power_gpio" option names a pin that switches the
    /// sensor supply.
    pub fn new(cfg: &InputChannelConfig) -> Result<Self, HalError>
    {
        let mut pin = gpio_pin(cfg)?.into_io(Mode::Input);
        pin.set_pullupdown(gpio::PullUpDown::Off);
        let power = match cfg.option_f64("power_gpio")
        {
            Some(n) =>
            {
                let number = n as u8;
                let mut out = Gpio::new().and_then(|g| g.get(number))
                                         .map_err(|_| HalError::PinUnavailable(number))?
                                         .into_output_high();
                out.set_reset_on_drop(false);
                Some(out)
            }
            None => None
        };
        Ok(RpiDhtLine { pin, power })
    }
}

impl DataLine for RpiDhtLine
{
    fn capture(&mut self, start_pulse: Duration, window: Duration) -> Result<Vec<EdgeSample>, HalError>
    {
        self.pin.set_mode(Mode::Output);
        self.pin.set_low();
        thread::sleep(start_pulse);
        self.pin.set_mode(Mode::Input);

        let started = Instant::now();
        let mut samples = Vec::with_capacity(96);
        let mut last = self.pin.read();
        samples.push(EdgeSample::new(hal_level(last), 0));
        while started.elapsed() < window
        {
            let level = self.pin.read();
            if level != last
            {
                samples.push(EdgeSample::new(hal_level(level), started.elapsed().as_micros() as u32));
                last = level;
            }
        }
        Ok(samples)
    }

    fn set_power(&mut self, on: bool) -> Result<(), HalError>
    {
        let power = self.power.as_mut().ok_or(HalError::Unsupported("power control"))?;
        if on { power.set_high() } else { power.set_low() }
        Ok(())
    }

    fn has_power_control(&self) -> bool
    {
        self.power.is_some()
    }
}

/// TCA9548A: a single control byte with one bit per downstream channel.
pub struct Tca9548a
{
    i2c: I2c
}

impl Tca9548a
{
    pub fn new(bus: u8, address: u8) -> Result<Self, HalError>
    {
        let mut i2c = I2c::with_bus(bus).map_err(bus_error)?;
        i2c.set_slave_address(u16::from(address)).map_err(bus_error)?;
        Ok(Tca9548a { i2c })
    }
}

impl ChannelSelect for Tca9548a
{
    fn select_channel(&mut self, channel: u8) -> Result<(), HalError>
    {
        if channel > 7
        {
            return Err(HalError::Bus(format!("TCA9548A has no channel {}", channel)));
        }
        self.i2c.write(&[1 << channel]).map_err(bus_error)?;
        Ok(())
    }
}

const ADS1115_DEFAULT_ADDRESS: u8 = 0x48;
const ADS1115_CONVERSION: u8 = 0x00;
const ADS1115_CONFIG: u8 = 0x01;
/// Full scale of the +-4.096V gain setting.
const ADS1115_FULL_SCALE: f64 = 4.096;

/// ADS1115 in single shot mode, single ended against GND. Bus and
/// address come from the "i2c_bus" and "i2c_address" options.
pub struct Ads1115
{
    i2c: I2c,
    channel: u32
}

impl Ads1115
{
    pub fn new(cfg: &InputChannelConfig, channel: u32) -> Result<Self, HalError>
    {
        if channel > 3
        {
            return Err(HalError::Bus(format!("ADS1115 has no channel {}", channel)));
        }
        let bus = cfg.option_f64("i2c_bus").unwrap_or(1.0) as u8;
        let address = cfg.option_f64("i2c_address").map(|a| a as u8).unwrap_or(ADS1115_DEFAULT_ADDRESS);
        let mut i2c = I2c::with_bus(bus).map_err(bus_error)?;
        i2c.set_slave_address(u16::from(address)).map_err(bus_error)?;
        Ok(Ads1115 { i2c, channel })
    }

    fn config_word(&self) -> u16
    {
        let start = 1 << 15;
        let mux = (4 + self.channel as u16) << 12;
        let gain = 1 << 9;
        let single_shot = 1 << 8;
        let rate_128sps = 4 << 5;
        let comparator_off = 3;
        start | mux | gain | single_shot | rate_128sps | comparator_off
    }
}

impl AdcChannel for Ads1115
{
    fn read_voltage(&mut self) -> Result<f64, HalError>
    {
        let config = self.config_word().to_be_bytes();
        self.i2c.write(&[ADS1115_CONFIG, config[0], config[1]]).map_err(bus_error)?;
        // one conversion at 128 SPS takes ~8ms
        thread::sleep(Duration::from_millis(9));

        let mut raw = [0u8; 2];
        self.i2c.write_read(&[ADS1115_CONVERSION], &mut raw).map_err(bus_error)?;
        Ok(f64::from(i16::from_be_bytes(raw)) * ADS1115_FULL_SCALE / 32768.0)
    }
}
