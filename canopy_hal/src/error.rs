use thiserror::Error;

#[derive(Debug, Error)]
pub enum HalError
{
    #[error("operation not supported by this line: {0}")]
    Unsupported(&'static str),

    #[error("pin {0} is not available")]
    PinUnavailable(u8),

    #[error("bus error: {0}")]
    Bus(String),

    #[error("timed out waiting for the device")]
    Timeout,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
