use canopy_hal::HalError;
use thiserror::Error;

/// Why a captured frame did not yield a reading.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum DecodeError
{
    #[error("no response from sensor")]
    MissingMessage,
    #[error("short message, {0} of 40 bits")]
    ShortMessage(usize),
    #[error("bad checksum")]
    BadChecksum
}

#[derive(Debug, Error)]
pub enum ReadError
{
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Hal(#[from] HalError)
}
