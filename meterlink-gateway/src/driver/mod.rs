pub mod mock;
pub mod modbus;

use std::time::Duration;

use async_trait::async_trait;
use meterlink_core::{DeviceEndpoint, Protocol};

/// Largest register count a single Modbus read may request.
pub const MODBUS_MAX_REGISTERS: u16 = 125;

/// A contiguous register range read in one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub start: u16,
    pub count: u16,
}

impl ChunkDescriptor {
    pub fn new(start: u16, count: u16) -> Self {
        Self { start, count }
    }

    pub fn end(&self) -> u32 {
        self.start as u32 + self.count as u32
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("device exception {code:#04x} ({}) on function {function:#04x}", exception_name(*.code))]
    Exception { function: u8, code: u8 },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("connection closed by device")]
    Closed,

    #[error("no driver registered for protocol {0}")]
    Unsupported(Protocol),
}

/// Human-readable name of a Modbus exception code.
pub fn exception_name(code: u8) -> &'static str {
    match code {
        0x01 => "illegal function",
        0x02 => "illegal data address",
        0x03 => "illegal data value",
        0x04 => "slave device failure",
        0x05 => "acknowledge",
        0x06 => "slave device busy",
        0x0A => "gateway path unavailable",
        0x0B => "gateway target device failed to respond",
        _ => "unknown exception",
    }
}

/// Protocol driver able to open sessions with field devices.
///
/// Drivers only move raw register words. Turning words into engineering
/// values is left to downstream consumers.
#[async_trait]
pub trait DeviceDriver: Send + Sync + 'static {
    /// Protocol served by this driver.
    fn protocol(&self) -> Protocol;

    /// Upper bound on registers per request, regardless of batch size.
    fn max_registers_per_request(&self) -> u16 {
        MODBUS_MAX_REGISTERS
    }

    /// Open a session with the device at `endpoint`, giving up after `timeout`.
    async fn connect(
        &self,
        endpoint: &DeviceEndpoint,
        timeout: Duration,
    ) -> Result<Box<dyn DeviceHandle>, DriverError>;
}

/// An open session with one device.
#[async_trait]
pub trait DeviceHandle: Send + 'static {
    /// Read `chunk.count` registers starting at `chunk.start`.
    async fn read_points(
        &mut self,
        chunk: ChunkDescriptor,
        timeout: Duration,
    ) -> Result<Vec<u16>, DriverError>;

    /// Lightweight liveness check used by the pool's health sweep.
    async fn probe(&mut self) -> bool;

    async fn close(&mut self) -> Result<(), DriverError>;
}

/// Combine the raw words of a point into one unsigned value, most
/// significant word first.
pub fn combine_words(words: &[u16]) -> f64 {
    words
        .iter()
        .fold(0u128, |acc, w| (acc << 16) | *w as u128) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exception_display_names_the_code() {
        let err = DriverError::Exception {
            function: 0x03,
            code: 0x02,
        };
        assert_eq!(
            err.to_string(),
            "device exception 0x02 (illegal data address) on function 0x03"
        );
    }

    #[test]
    fn combine_words_is_big_endian() {
        assert_eq!(combine_words(&[7]), 7.0);
        assert_eq!(combine_words(&[0x0001, 0x0000]), 65536.0);
        assert_eq!(combine_words(&[]), 0.0);
    }
}
