//! # Modbus Stack Error Handling
//!
//! One error type covers the whole stack: frame staging in the byte codec,
//! the transports, the master-side transaction and the slave-side dispatch.
//!
//! ## Error Categories
//!
//! ### Transport Errors
//! - **I/O / Connection**: socket or serial port failures, potentially fixed by a reconnect
//! - **ConnectionClosed**: the peer closed the stream before a new frame started
//! - **Timeout**: no complete frame inside the configured window
//!
//! ### Framing Errors
//! - **FrameTruncated**: the stream ended in the middle of a header or body
//! - **ChecksumMismatch**: serial CRC/LRC failure, the frame is discarded
//! - **CapacityExceeded**: a frame does not fit the fixed staging buffer
//! - **Frame**: any other malformed frame
//!
//! ### Dispatch Errors
//! - **IllegalUnitAddress / IllegalDataAddress / InvalidData / InvalidFunction**:
//!   raised while serving a request and converted into a Modbus exception
//!   response by the slave, see [`ModbusError::exception_code`]
//!
//! ## Retry Logic
//!
//! ```rust
//! use modbus_stack::{ModbusError, ModbusResult};
//!
//! fn should_retry(result: &ModbusResult<Vec<u16>>, attempt: usize, max: usize) -> bool {
//!     match result {
//!         Ok(_) => false,
//!         Err(error) => error.is_recoverable() && attempt < max,
//!     }
//! }
//! ```

use thiserror::Error;

use crate::protocol::ModbusException;

/// Result type alias for Modbus operations
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Comprehensive Modbus error types
///
/// Each variant carries enough context to log a useful message; the
/// classification helpers below decide what a caller may retry.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModbusError {
    /// I/O related errors (network, serial)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Connection establishment or maintenance failure
    ///
    /// Also raised when an operation is attempted on a transport whose
    /// channel has already been closed.
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// End of stream before the first byte of a new frame
    #[error("Connection closed by peer")]
    ConnectionClosed,

    /// Operation exceeded its configured timeout
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Premature end of stream in the middle of a frame
    ///
    /// `section` names the part that was cut short ("header" or "message").
    #[error("Premature end of stream ({section} truncated)")]
    FrameTruncated { section: String },

    /// Serial checksum validation failure (CRC-16 for RTU, LRC for ASCII)
    #[error("{kind} validation failed: expected={expected:04X}, actual={actual:04X}")]
    ChecksumMismatch {
        kind: String,
        expected: u16,
        actual: u16,
    },

    /// A frame does not fit into the fixed capacity staging buffer
    #[error("Capacity exceeded: {requested} bytes requested, {capacity} available")]
    CapacityExceeded { requested: usize, capacity: usize },

    /// Malformed frame that is neither truncated nor a checksum failure
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// General protocol violations
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Unsupported or malformed function code
    #[error("Invalid function code: 0x{code:02X}")]
    InvalidFunction { code: u8 },

    /// No process image is registered for the addressed unit
    #[error("Illegal unit address: {unit_id}")]
    IllegalUnitAddress { unit_id: u8 },

    /// Address range outside the bounds of a process image collection
    #[error("Illegal data address: start={start}, count={count}")]
    IllegalDataAddress { start: u16, count: u16 },

    /// Invalid data value (quantity out of range, bad coil value, ...)
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Modbus exception response returned by a device
    ///
    /// # Standard Exception Codes
    /// - 0x01: Illegal Function
    /// - 0x02: Illegal Data Address
    /// - 0x03: Illegal Data Value
    /// - 0x04: Slave Device Failure
    /// - 0x05: Acknowledge
    /// - 0x06: Slave Device Busy
    /// - 0x08: Memory Parity Error
    /// - 0x0A: Gateway Path Unavailable
    /// - 0x0B: Gateway Target Device Failed to Respond
    #[error("Modbus exception: function={function:02X}, code={code:02X} ({message})")]
    Exception { function: u8, code: u8, message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Internal errors (should not occur in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ModbusError {
    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection { message: message.into() }
    }

    /// Create a new timeout error
    ///
    /// # Arguments
    ///
    /// * `operation` - Description of the operation that timed out
    /// * `timeout_ms` - Timeout duration in milliseconds
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a truncated frame error for the given section
    pub fn frame_truncated<S: Into<String>>(section: S) -> Self {
        Self::FrameTruncated { section: section.into() }
    }

    /// Create a CRC-16 mismatch error
    pub fn crc_mismatch(expected: u16, actual: u16) -> Self {
        Self::ChecksumMismatch {
            kind: "CRC".to_string(),
            expected,
            actual,
        }
    }

    /// Create an LRC mismatch error
    pub fn lrc_mismatch(expected: u8, actual: u8) -> Self {
        Self::ChecksumMismatch {
            kind: "LRC".to_string(),
            expected: expected as u16,
            actual: actual as u16,
        }
    }

    /// Create a capacity error
    pub fn capacity_exceeded(requested: usize, capacity: usize) -> Self {
        Self::CapacityExceeded { requested, capacity }
    }

    /// Create a frame error
    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame { message: message.into() }
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol { message: message.into() }
    }

    /// Create an invalid function error
    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    /// Create an illegal unit address error
    pub fn illegal_unit_address(unit_id: u8) -> Self {
        Self::IllegalUnitAddress { unit_id }
    }

    /// Create an illegal data address error
    pub fn illegal_data_address(start: u16, count: u16) -> Self {
        Self::IllegalDataAddress { start, count }
    }

    /// Create an invalid data error
    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData { message: message.into() }
    }

    /// Create a Modbus exception error
    ///
    /// Standard exception codes are mapped to human-readable messages.
    pub fn exception(function: u8, code: u8) -> Self {
        let message = match ModbusException::from_u8(code) {
            Some(exception) => exception.name(),
            None => "Unknown Exception",
        }
        .to_string();

        Self::Exception { function, code, message }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Check if the error is recoverable (can retry)
    ///
    /// # Examples
    ///
    /// ```rust
    /// use modbus_stack::ModbusError;
    ///
    /// let timeout_error = ModbusError::timeout("read response", 3000);
    /// assert!(timeout_error.is_recoverable());
    ///
    /// let invalid_function = ModbusError::invalid_function(0x99);
    /// assert!(!invalid_function.is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { .. } => true,
            Self::Connection { .. } => true,
            Self::ConnectionClosed => true,
            Self::Timeout { .. } => true,
            Self::ChecksumMismatch { .. } => true,
            Self::Exception { code, .. } => {
                // Acknowledge, Busy
                matches!(code, 0x05 | 0x06)
            }
            _ => false,
        }
    }

    /// Check if the error is a network/transport issue
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::Connection { .. } | Self::ConnectionClosed | Self::Timeout { .. }
        )
    }

    /// Check if the error is a protocol or framing issue
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::Protocol { .. }
                | Self::InvalidFunction { .. }
                | Self::Exception { .. }
                | Self::Frame { .. }
                | Self::FrameTruncated { .. }
                | Self::ChecksumMismatch { .. }
                | Self::CapacityExceeded { .. }
        )
    }

    /// Check if the error means the underlying channel is gone
    ///
    /// A master connection reacts to these by attempting one reconnect.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::Connection { .. } | Self::ConnectionClosed)
    }

    /// Map a dispatch-time error to the Modbus exception sent back to the requester
    ///
    /// Returns `None` for errors that are local faults rather than
    /// addressing or data problems of the request itself.
    pub fn exception_code(&self) -> Option<ModbusException> {
        match self {
            Self::InvalidFunction { .. } => Some(ModbusException::IllegalFunction),
            Self::IllegalUnitAddress { .. } | Self::IllegalDataAddress { .. } => {
                Some(ModbusException::IllegalDataAddress)
            }
            Self::InvalidData { .. } => Some(ModbusException::IllegalDataValue),
            Self::Internal { .. } => Some(ModbusException::ServerDeviceFailure),
            _ => None,
        }
    }
}

/// Convert from std::io::Error
///
/// End-of-file surfaces as a truncated frame; callers that can tell a
/// clean close apart (no byte of the frame read yet) map it themselves.
impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => Self::frame_truncated("message"),
            std::io::ErrorKind::TimedOut => Self::timeout(err.to_string(), 0),
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::BrokenPipe => Self::connection(err.to_string()),
            _ => Self::io(err.to_string()),
        }
    }
}

/// Convert from tokio timeout errors
///
/// The specific timeout duration should be supplied when creating
/// timeout errors manually.
impl From<tokio::time::error::Elapsed> for ModbusError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("Operation timeout", 0)
    }
}

/// Convert from serde JSON errors
impl From<serde_json::Error> for ModbusError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {}", err))
    }
}

/// Convert from serde YAML errors
impl From<serde_yaml::Error> for ModbusError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::configuration(format!("YAML error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = ModbusError::timeout("read response", 3000);
        assert!(err.is_recoverable());
        assert!(err.is_transport_error());

        let err = ModbusError::exception(0x03, 0x02);
        assert!(!err.is_recoverable());
        assert!(err.is_protocol_error());
        assert!(err.to_string().contains("Illegal Data Address"));
    }

    #[test]
    fn test_error_display() {
        let err = ModbusError::crc_mismatch(0x1234, 0x5678);
        let msg = format!("{}", err);
        assert!(msg.contains("CRC validation failed"));
        assert!(msg.contains("1234"));
        assert!(msg.contains("5678"));

        let err = ModbusError::frame_truncated("header");
        assert_eq!(err.to_string(), "Premature end of stream (header truncated)");
    }

    #[test]
    fn test_exception_code_mapping() {
        assert_eq!(
            ModbusError::illegal_data_address(10, 1).exception_code(),
            Some(ModbusException::IllegalDataAddress)
        );
        assert_eq!(
            ModbusError::illegal_unit_address(9).exception_code(),
            Some(ModbusException::IllegalDataAddress)
        );
        assert_eq!(
            ModbusError::invalid_function(0x2B).exception_code(),
            Some(ModbusException::IllegalFunction)
        );
        assert_eq!(
            ModbusError::invalid_data("quantity").exception_code(),
            Some(ModbusException::IllegalDataValue)
        );
        assert_eq!(ModbusError::timeout("read", 1).exception_code(), None);
    }

    #[test]
    fn test_io_error_conversion() {
        let eof = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert!(matches!(ModbusError::from(eof), ModbusError::FrameTruncated { .. }));

        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = ModbusError::from(reset);
        assert!(err.is_connection_lost());
    }
}
