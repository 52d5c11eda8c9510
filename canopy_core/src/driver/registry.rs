use super::{AcquisitionDriver, DriverError};
use crate::cfg::InputChannelConfig;
use crate::input::ControllerError;
use canopy_hal::{gpio::EdgeSource, i2c::ChannelSelect, HalError};
use std::collections::HashMap;

/// Device tag of digital inputs that are driven by edge interrupts
/// instead of a polling driver.
pub const EDGE_DEVICE: &str = "EDGE";

pub type DriverFactory =
    Box<dyn Fn(&InputChannelConfig) -> Result<Box<dyn AcquisitionDriver>, DriverError> + Send + Sync>;
pub type EdgeSourceFactory =
    Box<dyn Fn(&InputChannelConfig) -> Result<Box<dyn EdgeSource>, HalError> + Send + Sync>;
pub type ChannelSelectFactory =
    Box<dyn Fn(u8, u8) -> Result<Box<dyn ChannelSelect>, HalError> + Send + Sync>;

/// # DriverRegistry
/// Maps device type tags (e.g. "DHT22") to driver constructors. Targets
/// fill the registry with whatever their hardware supports; an input
/// whose tag is unknown cannot be started.
pub struct DriverRegistry
{
    drivers: HashMap<String, DriverFactory>,
    edge_source: Option<EdgeSourceFactory>,
    channel_select: Option<ChannelSelectFactory>
}

fn normalize(tag: &str) -> String
{
    tag.trim().to_uppercase()
}

impl DriverRegistry
{
    pub fn new() -> Self
    {
        DriverRegistry {
            drivers: HashMap::new(),
            edge_source: None,
            channel_select: None
        }
    }

    pub fn register<F>(&mut self, tag: &str, factory: F)
        where F: Fn(&InputChannelConfig) -> Result<Box<dyn AcquisitionDriver>, DriverError> + Send + Sync + 'static
    {
        self.drivers.insert(normalize(tag), Box::new(factory));
    }

    pub fn set_edge_source<F>(&mut self, factory: F)
        where F: Fn(&InputChannelConfig) -> Result<Box<dyn EdgeSource>, HalError> + Send + Sync + 'static
    {
        self.edge_source = Some(Box::new(factory));
    }

    pub fn set_channel_select<F>(&mut self, factory: F)
        where F: Fn(u8, u8) -> Result<Box<dyn ChannelSelect>, HalError> + Send + Sync + 'static
    {
        self.channel_select = Some(Box::new(factory));
    }

    pub fn is_edge_device(tag: &str) -> bool
    {
        normalize(tag) == EDGE_DEVICE
    }

    pub fn knows(&self, tag: &str) -> bool
    {
        Self::is_edge_device(tag) || self.drivers.contains_key(&normalize(tag))
    }

    pub fn device_tags(&self) -> Vec<String>
    {
        let mut tags: Vec<String> = self.drivers.keys().cloned().collect();
        tags.sort();
        tags
    }

    pub fn create_driver(&self, cfg: &InputChannelConfig) -> Result<Box<dyn AcquisitionDriver>, ControllerError>
    {
        let factory = self.drivers
                          .get(&normalize(&cfg.device))
                          .ok_or_else(|| ControllerError::UnknownDevice {
                              id: cfg.unique_id.clone(),
                              device: cfg.device.clone()
                          })?;
        factory(cfg).map_err(|source| ControllerError::Driver { id: cfg.unique_id.clone(), source })
    }

    pub fn create_edge_source(&self, cfg: &InputChannelConfig) -> Result<Box<dyn EdgeSource>, ControllerError>
    {
        let factory = self.edge_source
                          .as_ref()
                          .ok_or_else(|| ControllerError::Hal {
                              id: cfg.unique_id.clone(),
                              source: HalError::Unsupported("edge detection")
                          })?;
        factory(cfg).map_err(|source| ControllerError::Hal { id: cfg.unique_id.clone(), source })
    }

    pub fn create_channel_select(&self, id: &str, bus: u8, address: u8) -> Result<Box<dyn ChannelSelect>, ControllerError>
    {
        let factory = self.channel_select
                          .as_ref()
                          .ok_or_else(|| ControllerError::Hal {
                              id: id.to_string(),
                              source: HalError::Unsupported("i2c multiplexer")
                          })?;
        factory(bus, address).map_err(|source| ControllerError::Hal { id: id.to_string(), source })
    }
}

impl Default for DriverRegistry
{
    fn default() -> Self
    {
        Self::new()
    }
}
