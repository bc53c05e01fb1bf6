// src/io/mod.rs
//
// CAN bus backends and shared message types.
// One async trait covers the hardware paths (PiCAN shell tools, slcan
// serial adapters) plus the loopback bus used by tests and dry runs.

pub mod error;
pub mod loopback;
pub mod pican;
pub mod replay;
#[cfg(not(target_os = "ios"))]
pub mod slcan;

pub use error::IoError;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

use crate::settings::AppSettings;
use crate::signal::SignalError;

// ============================================================================
// Shared Types
// ============================================================================

/// Largest standard (11-bit) CAN arbitration id.
pub const MAX_11_BIT_ID: u32 = 0x7FF;

/// Width class of a CAN arbitration id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdLength {
    Bit11,
    Bit29,
}

impl IdLength {
    pub fn from_id(can_id: u32) -> Self {
        if can_id > MAX_11_BIT_ID {
            IdLength::Bit29
        } else {
            IdLength::Bit11
        }
    }
}

/// Parsed CAN message - the unit all backends emit and accept.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CanMessage {
    pub can_id: u32,
    pub id_length: IdLength,
    /// Payload bytes in wire order, at most 8.
    pub data: Vec<u8>,
    /// Declared payload length; may be less than 8.
    pub data_length: u8,
    /// Host UNIX timestamp in microseconds.
    pub timestamp_us: u64,
}

impl CanMessage {
    /// Payload packed into a u64, zero padded, first wire byte lowest.
    pub fn payload(&self) -> u64 {
        let mut bytes = [0u8; 8];
        for (i, b) in self.data.iter().take(8).enumerate() {
            bytes[i] = *b;
        }
        u64::from_le_bytes(bytes)
    }
}

/// The nine standard CAN bitrates. Discriminants are the slcan `S<n>`
/// setup indexes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CanSpeed {
    Kbit10 = 0,
    Kbit20 = 1,
    Kbit50 = 2,
    Kbit100 = 3,
    Kbit125 = 4,
    Kbit250 = 5,
    Kbit500 = 6,
    Kbit800 = 7,
    Mbit1 = 8,
}

impl CanSpeed {
    pub fn bitrate(self) -> u32 {
        match self {
            CanSpeed::Kbit10 => 10_000,
            CanSpeed::Kbit20 => 20_000,
            CanSpeed::Kbit50 => 50_000,
            CanSpeed::Kbit100 => 100_000,
            CanSpeed::Kbit125 => 125_000,
            CanSpeed::Kbit250 => 250_000,
            CanSpeed::Kbit500 => 500_000,
            CanSpeed::Kbit800 => 800_000,
            CanSpeed::Mbit1 => 1_000_000,
        }
    }

    pub fn slcan_index(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for CanSpeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bitrate())
    }
}

/// Parse a decimal bitrate string into one of the nine standard speeds.
pub fn parse_can_speed(text: &str) -> Result<CanSpeed, SignalError> {
    match text.trim() {
        "10000" => Ok(CanSpeed::Kbit10),
        "20000" => Ok(CanSpeed::Kbit20),
        "50000" => Ok(CanSpeed::Kbit50),
        "100000" => Ok(CanSpeed::Kbit100),
        "125000" => Ok(CanSpeed::Kbit125),
        "250000" => Ok(CanSpeed::Kbit250),
        "500000" => Ok(CanSpeed::Kbit500),
        "800000" => Ok(CanSpeed::Kbit800),
        "1000000" => Ok(CanSpeed::Mbit1),
        _ => Err(SignalError::UnsupportedBitrate(text.to_string())),
    }
}

/// Host UNIX timestamp in microseconds.
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Result of a transmit operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransmitResult {
    /// Whether the transmission was successful
    pub success: bool,
    /// Timestamp when the frame was sent (microseconds since UNIX epoch)
    pub timestamp_us: u64,
    /// Error message if transmission failed
    pub error: Option<String>,
}

impl TransmitResult {
    /// Create a successful transmit result with current timestamp
    pub fn success() -> Self {
        Self {
            success: true,
            timestamp_us: now_us(),
            error: None,
        }
    }

    /// Create a failed transmit result with an error message
    pub fn error(message: String) -> Self {
        Self {
            success: false,
            timestamp_us: now_us(),
            error: Some(message),
        }
    }
}

// ============================================================================
// Bus trait and factory
// ============================================================================

/// Common interface over the CAN bus backends.
///
/// All methods take `&self`; backends use interior mutability so one
/// `Arc<dyn CanBus>` can be shared between the receive wiring and the
/// broadcast scheduler. Backends are constructed with an mpsc sender and
/// push every parsed inbound frame into it.
#[async_trait]
pub trait CanBus: Send + Sync {
    fn is_open(&self) -> bool;
    async fn open(&self, interface: &str, speed: CanSpeed) -> Result<(), IoError>;
    async fn send(&self, message: &CanMessage) -> TransmitResult;
    async fn close(&self);
}

/// Pick a backend for the configured hardware and the interface argument
/// its `open` expects: the PiCAN shell tools when the dump utility is
/// installed, an slcan serial adapter when the serial device node exists,
/// otherwise a loopback bus so the daemon can still run.
pub fn create_bus(
    settings: &AppSettings,
    rx: mpsc::Sender<CanMessage>,
) -> (Arc<dyn CanBus>, String) {
    if Path::new(&settings.can_cmd).exists() {
        tlog!("[io] Using PiCAN shell backend ({})", settings.can_cmd);
        return (
            Arc::new(pican::PiCanBus::new(&settings.can_cmd, rx)),
            settings.can_interface.clone(),
        );
    }
    #[cfg(not(target_os = "ios"))]
    if Path::new(&settings.serial_port).exists() {
        tlog!("[io] Using slcan serial backend ({})", settings.serial_port);
        return (
            Arc::new(slcan::SlcanBus::new(rx)),
            settings.serial_port.clone(),
        );
    }
    tlog!("[io] No CAN hardware found, using loopback bus");
    (
        Arc::new(loopback::LoopbackBus::new(rx)),
        settings.can_interface.clone(),
    )
}
