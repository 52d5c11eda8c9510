use crate::HalError;

pub trait AdcChannel: Send
{
    /// Performs one conversion and returns the measured voltage.
    fn read_voltage(&mut self) -> Result<f64, HalError>;
}
