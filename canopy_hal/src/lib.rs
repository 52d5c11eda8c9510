/*
*   # canopy HAL
*   The traits in this crate are the only contact points between the
*   acquisition engine and real hardware. The reference target implements
*   them on top of rppal, the simulation target implements them in memory
*   and the tests mock them.
*/
pub mod error;
pub mod gpio;
pub mod i2c;
pub mod adc;
pub mod output;

pub use error::HalError;
