use crate::HalError;

/// An I2C multiplexer (TCA9548A style) that routes one downstream
/// channel at a time to the upstream bus.
pub trait ChannelSelect: Send
{
    fn select_channel(&mut self, channel: u8) -> Result<(), HalError>;
}
