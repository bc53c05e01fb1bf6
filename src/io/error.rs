// src/io/error.rs
//
// Error type shared by all CAN bus backends.

use std::fmt;

/// Errors raised by bus backends during open, read, and send.
#[derive(Debug, Clone, PartialEq)]
pub enum IoError {
    /// Failed to reach or start the underlying device or process.
    Connection { device: String, message: String },
    /// Device reached but a protocol exchange failed.
    Protocol { device: String, message: String },
    /// Invalid or unsupported configuration value.
    Configuration { message: String },
    /// Read failure on an open device.
    Read { device: String, message: String },
}

impl IoError {
    pub fn connection(device: &str, message: impl Into<String>) -> Self {
        IoError::Connection {
            device: device.to_string(),
            message: message.into(),
        }
    }

    pub fn protocol(device: &str, message: impl Into<String>) -> Self {
        IoError::Protocol {
            device: device.to_string(),
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        IoError::Configuration {
            message: message.into(),
        }
    }

    pub fn read(device: &str, message: impl Into<String>) -> Self {
        IoError::Read {
            device: device.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoError::Connection { device, message } => {
                write!(f, "{}: connection failed: {}", device, message)
            }
            IoError::Protocol { device, message } => {
                write!(f, "{}: protocol error: {}", device, message)
            }
            IoError::Configuration { message } => write!(f, "configuration error: {}", message),
            IoError::Read { device, message } => write!(f, "{}: read failed: {}", device, message),
        }
    }
}

impl std::error::Error for IoError {}
