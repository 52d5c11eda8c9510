use crate::HalError;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Level
{
    Low,
    High
}

impl Level
{
    pub fn is_high(self) -> bool
    {
        self == Level::High
    }
}

/// Edges an `EdgeSource` reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Edge
{
    Rising,
    Falling,
    Both
}

/// Invoked from the notification thread of the GPIO backend with the
/// level the line had right after the transition.
pub type EdgeCallback = Box<dyn FnMut(Level) + Send>;

/// # EdgeSource
/// A digital line that notifies asynchronously on level transitions.
/// Implementations call the callback from their own thread, never from
/// the thread that subscribed.
pub trait EdgeSource: Send
{
    fn subscribe(&mut self, edge: Edge, bouncetime: Duration, callback: EdgeCallback) -> Result<(), HalError>;
    fn unsubscribe(&mut self) -> Result<(), HalError>;
    fn level(&self) -> Result<Level, HalError>;
}

/// One captured transition of a single-wire data line. `tick_us` is a
/// free running microsecond counter and is allowed to wrap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EdgeSample
{
    pub level: Level,
    pub tick_us: u32
}

impl EdgeSample
{
    pub fn new(level: Level, tick_us: u32) -> Self
    {
        Self { level, tick_us }
    }
}

/// # DataLine
/// Single-wire, host-initiated data line (DHT family). The host pulls the
/// line low for `start_pulse`, releases it and records every transition
/// within `window`, starting with the rising edge of the release.
pub trait DataLine: Send
{
    fn capture(&mut self, start_pulse: Duration, window: Duration) -> Result<Vec<EdgeSample>, HalError>;

    /// Switches the sensor supply, if the line has a power pin wired up.
    fn set_power(&mut self, _on: bool) -> Result<(), HalError>
    {
        Err(HalError::Unsupported("power control"))
    }

    fn has_power_control(&self) -> bool
    {
        false
    }
}
