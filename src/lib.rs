//! # Modbus Stack - Modbus master/slave over TCP, UDP and serial lines
//!
//! An async Modbus implementation for both sides of the wire: masters issue
//! transactions over a connection, slaves answer them from process images
//! behind a listener. Every binding shares one message model and one
//! transport interface.
//!
//! ## Features
//!
//! - **Four bindings**: Modbus TCP (MBAP or headless), Modbus UDP, serial RTU, serial ASCII
//! - **Master side**: connections with lazy connect, single reconnect on write failure,
//!   transactions with ID correlation, retries and per-attempt timeouts
//! - **Slave side**: process images per unit ID, exception responses, serial broadcast
//! - **Listeners**: concurrent TCP handlers, a UDP receive loop, one task per serial port
//! - **Configuration**: serde structs loadable from JSON or YAML
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Master | Slave |
//! |------|----------|--------|-------|
//! | 0x01 | Read Coils | ✅ | ✅ |
//! | 0x02 | Read Discrete Inputs | ✅ | ✅ |
//! | 0x03 | Read Holding Registers | ✅ | ✅ |
//! | 0x04 | Read Input Registers | ✅ | ✅ |
//! | 0x05 | Write Single Coil | ✅ | ✅ |
//! | 0x06 | Write Single Register | ✅ | ✅ |
//! | 0x0F | Write Multiple Coils | ✅ | ✅ |
//! | 0x10 | Write Multiple Registers | ✅ | ✅ |
//! | 0x14 | Read File Record | ✅ | ✅ |
//!
//! ## Quick Start
//!
//! ### Master Example
//!
//! ```rust,no_run
//! use modbus_stack::{MasterConnection, ModbusRequest, ModbusResult, TcpMasterConnection};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let mut connection = TcpMasterConnection::with_address("127.0.0.1:502".parse().unwrap(), Duration::from_secs(3));
//!
//!     let response = connection
//!         .transaction(ModbusRequest::read_holding_registers(1, 0, 10))
//!         .execute()
//!         .await?
//!         .into_result()?;
//!     println!("Read registers: {:?}", response.registers()?);
//!
//!     connection.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ### Slave Example
//!
//! ```rust,no_run
//! use modbus_stack::{ModbusListener, ModbusSlave, ModbusTcpListener, ProcessImage, ProcessImageLayout};
//! use modbus_stack::config::TcpListenerConfig;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let layout = ProcessImageLayout { holding_registers: 100, ..Default::default() };
//!     let slave = Arc::new(ModbusSlave::with_image(1, ProcessImage::new(layout)));
//!
//!     let mut listener = ModbusTcpListener::new(TcpListenerConfig::default(), slave);
//!     listener.start().await?;
//!
//!     // Listener is now serving...
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌─────────────────┐
//! │   Transaction   │    │    Listener     │
//! └─────────────────┘    └─────────────────┘
//!          │                       │
//! ┌─────────────────┐    ┌─────────────────┐
//! │   Connection    │    │  Slave / Image  │
//! └─────────────────┘    └─────────────────┘
//!          │                       │
//! ┌─────────────────┐    ┌─────────────────┐
//! │    Protocol     │    │    Protocol     │
//! └─────────────────┘    └─────────────────┘
//!          │                       │
//! ┌─────────────────┐    ┌─────────────────┐
//! │   Transport     │◄──►│   Transport     │
//! │ (TCP/UDP/Serial)│    │ (TCP/UDP/Serial)│
//! └─────────────────┘    └─────────────────┘
//! ```

/// Core error types and result handling
pub mod error;

/// Fixed-capacity byte buffer with big-endian accessors
pub mod codec;

/// Modbus message model: function codes, headers, request and response PDUs
pub mod protocol;

/// Coils, discrete inputs, registers and files of one device
pub mod process_image;

/// Unit ID dispatch on the slave side
pub mod slave;

/// Framing for TCP, UDP and serial lines
pub mod transport;

/// Master-side connections
pub mod connection;

/// Request/response pairing with retries and timeouts
pub mod transaction;

/// TCP, UDP and serial listeners
pub mod server;

/// Configuration structs
pub mod config;

/// Timing and logging helpers
pub mod utils;

// Re-export main types for convenience
pub use connection::{MasterConnection, SerialConnection, TcpMasterConnection, UdpMasterConnection};
pub use error::{ModbusError, ModbusResult};
pub use process_image::{ProcessImage, ProcessImageLayout};
pub use protocol::{ModbusException, ModbusFunction, ModbusRequest, ModbusResponse};
pub use server::{ListenerStats, ModbusListener, ModbusSerialListener, ModbusTcpListener, ModbusUdpListener};
pub use slave::ModbusSlave;
pub use transaction::ModbusTransaction;
pub use transport::{ModbusTransport, SerialEncoding, SerialTransport, TcpTransport, TransportStats, UdpTransport};
pub use utils::OperationTimer;

/// Default timeout for operations (3 seconds)
pub const DEFAULT_TIMEOUT_MS: u64 = 3000;

/// Default number of additional attempts after a failed transaction
pub const DEFAULT_RETRIES: u32 = 5;

/// Largest Modbus frame without the MBAP header
pub const MAX_MESSAGE_LENGTH: usize = 256;

/// Maximum number of coils or discrete inputs in one read request
pub const MAX_COILS_PER_REQUEST: u16 = 2000;

/// Maximum number of registers in one read request
pub const MAX_REGISTERS_PER_REQUEST: u16 = 125;

/// Maximum number of coils in one write multiple coils request
pub const MAX_COILS_PER_WRITE: u16 = 1968;

/// Maximum number of registers in one write multiple registers request
pub const MAX_REGISTERS_PER_WRITE: u16 = 123;

/// Modbus TCP/UDP default port
pub const DEFAULT_PORT: u16 = 502;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
