use std::io;
use thiserror::Error;

use crate::frame::AckCode;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("malformed frame: header tag {tag:#04X} does not match trailing tag {trailer:#04X}")]
    MalformedFrame { tag: u8, trailer: u8 },
    #[error("device rejected command {command:#04X}: {code}")]
    DeviceRejection { command: u8, code: AckCode },
    #[error("unknown acknowledgement code {0:#04X}")]
    UnknownAcknowledgement(u8),
    #[error("invalid {field}: {message}")]
    Configuration {
        field: &'static str,
        message: String,
    },
    #[error("impedance range check failed: {0}")]
    Range(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("device not ready: {0}")]
    NotReady(String),
    #[error("sweep cancelled")]
    Cancelled,
}

impl DriverError {
    pub(crate) fn config(field: &'static str, message: impl Into<String>) -> Self {
        DriverError::Configuration {
            field,
            message: message.into(),
        }
    }

    /// Whether the error came from the local validation layer, i.e. no byte reached the device.
    pub fn is_configuration(&self) -> bool {
        matches!(self, DriverError::Configuration { .. })
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;
