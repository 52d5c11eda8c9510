/*
    The acquisition driver contract. A driver performs the hardware
    transaction for one input and either returns a MeasurementSet or
    fails. The controller owns exactly one driver instance.
*/
use crate::measurement::MeasurementSet;
use canopy_hal::HalError;
use thiserror::Error;

pub mod registry;

#[derive(Debug, Error)]
pub enum DriverError
{
    /// Transient miss, e.g. the sensor did not answer this time.
    #[error("no data")]
    NoData,
    #[error(transparent)]
    Hal(#[from] HalError),
    #[error("{0}")]
    Fault(String)
}

impl DriverError
{
    pub fn is_transient(&self) -> bool
    {
        matches!(self, DriverError::NoData)
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait AcquisitionDriver: Send
{
    fn get_measurement(&mut self) -> Result<MeasurementSet, DriverError>;

    /// Called once before the controller thread tears down.
    fn pre_stop(&mut self) {}

    /// Releases serial ports, bus handles and the like.
    fn stop(&mut self) {}
}
