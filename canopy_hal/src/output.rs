use crate::HalError;

/// Physical switching of an output channel (relay, MOSFET, ...).
pub trait OutputDriver: Send
{
    fn set(&mut self, output_id: &str, channel: u32, on: bool) -> Result<(), HalError>;
}
