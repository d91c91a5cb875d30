//! # Modbus Transport Layer
//!
//! A transport frames Modbus messages for one physical binding and owns
//! exactly one underlying channel at a time. All bindings expose the same
//! interface, so connections, transactions and listeners never care which
//! one they drive.
//!
//! ## Supported Transports
//!
//! ### Modbus TCP (`TcpTransport`)
//! - MBAP header with transaction ID, protocol ID and byte count
//! - Headless mode: unit ID, function code, body and a 2-byte trailer
//!
//! ### Modbus UDP (`UdpTransport`)
//! - One datagram per frame, MBAP header always present
//!
//! ### Modbus Serial (`SerialTransport`)
//! - RTU: binary frames with CRC-16, delimited by inter-frame silence
//! - ASCII: `:` + hex + LRC + CR LF
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use modbus_stack::transport::{ModbusTransport, TcpTransport};
//! use modbus_stack::protocol::ModbusRequest;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let stream = tokio::net::TcpStream::connect("127.0.0.1:502").await?;
//!     let mut transport = TcpTransport::new(stream, Duration::from_secs(3));
//!
//!     let mut request = ModbusRequest::read_holding_registers(1, 0, 10);
//!     request.set_transaction_id(1);
//!     transport.write_message(&request).await?;
//!     let response = transport.read_response().await?;
//!     println!("Registers: {:?}", response.registers()?);
//!
//!     let stats = transport.get_stats();
//!     println!("Frames sent: {}", stats.frames_sent);
//!
//!     transport.close().await?;
//!     Ok(())
//! }
//! ```

pub mod serial;
pub mod tcp;
pub mod udp;

pub use serial::{frame_gap, open_port, SerialEncoding, SerialTransport};
pub use tcp::TcpTransport;
pub use udp::UdpTransport;

use async_trait::async_trait;
use crc::{Crc, CRC_16_MODBUS};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::info;

use crate::codec::ByteBuffer;
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{BodyLayout, ModbusMessage, ModbusRequest, ModbusResponse};

/// Modbus TCP Application Protocol header size
pub const MBAP_HEADER_SIZE: usize = 6;

/// CRC calculator for RTU (polynomial 0xA001 reflected, initial value 0xFFFF)
const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Physical binding of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Tcp,
    Udp,
    Serial,
}

impl TransportKind {
    /// Tag used in packet logs
    pub fn tag(self) -> &'static str {
        match self {
            TransportKind::Tcp => "TCP",
            TransportKind::Udp => "UDP",
            TransportKind::Serial => "SERIAL",
        }
    }
}

/// Format raw bytes as hex string for packet logging
pub fn format_hex_packet(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Log packet with direction and format
fn log_packet(protocol: &str, direction: &str, data: &[u8]) {
    info!("[MODBUS-{}] {} {}", protocol, direction, format_hex_packet(data));
}

/// CRC-16 of an RTU frame, appended to the wire low byte first
pub fn calculate_crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// LRC of an ASCII frame: two's complement of the byte sum
pub fn calculate_lrc(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |sum, &b| sum.wrapping_add(b)).wrapping_neg()
}

/// Transport layer abstraction for Modbus communication
///
/// One transport is driven by one task at a time; its scratch buffers are
/// owned through `&mut self`. Every blocking read is bounded by
/// [`ModbusTransport::timeout`]; on expiry the read fails with
/// `ModbusError::Timeout` and the channel stays open.
#[async_trait]
pub trait ModbusTransport: Send {
    /// Binding of this transport
    fn kind(&self) -> TransportKind;

    /// Frame and send one message in a single flush
    async fn write_message(&mut self, message: &dyn ModbusMessage) -> ModbusResult<()>;

    /// Read the next complete request frame
    async fn read_request(&mut self) -> ModbusResult<ModbusRequest>;

    /// Read the next complete response frame
    async fn read_response(&mut self) -> ModbusResult<ModbusResponse>;

    /// Release the underlying channel
    ///
    /// The channel is dropped even when releasing it reports an error; the
    /// first error is returned.
    async fn close(&mut self) -> ModbusResult<()>;

    fn timeout(&self) -> Duration;

    fn set_timeout(&mut self, timeout: Duration);

    /// Check if the underlying channel is present and usable
    fn is_connected(&self) -> bool;

    /// Whether responses carry the transaction ID of their request
    ///
    /// False for serial lines and headless TCP, which rely on line
    /// turnaround instead.
    fn correlates_transactions(&self) -> bool;

    /// Get transport statistics
    fn get_stats(&self) -> TransportStats;
}

/// Transport layer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl TransportStats {
    /// Account for a failed read or write
    pub(crate) fn record_error(&mut self, error: &ModbusError) {
        self.errors += 1;
        if matches!(error, ModbusError::Timeout { .. }) {
            self.timeouts += 1;
        }
    }
}

/// Read the first `n` bytes of a frame
///
/// End of stream before the first byte is a clean close; after it the frame
/// is truncated in `section`.
pub(crate) async fn read_frame_start<R>(
    reader: &mut R,
    buf: &mut ByteBuffer,
    n: usize,
    section: &str,
) -> ModbusResult<()>
where
    R: AsyncRead + Unpin + Send,
{
    let mut scratch = [0u8; MBAP_HEADER_SIZE];
    let scratch = scratch
        .get_mut(..n)
        .ok_or_else(|| ModbusError::capacity_exceeded(n, MBAP_HEADER_SIZE))?;

    let mut filled = 0;
    while filled < n {
        let read = reader.read(&mut scratch[filled..]).await?;
        if read == 0 {
            return Err(if filled == 0 {
                ModbusError::ConnectionClosed
            } else {
                ModbusError::frame_truncated(section)
            });
        }
        filled += read;
    }
    buf.write_bytes(scratch)
}

/// Read exactly `n` more bytes of a frame into `buf`
pub(crate) async fn read_into<R>(reader: &mut R, buf: &mut ByteBuffer, n: usize, section: &str) -> ModbusResult<()>
where
    R: AsyncRead + Unpin + Send,
{
    let mut scratch = [0u8; crate::MAX_MESSAGE_LENGTH];
    let scratch = scratch
        .get_mut(..n)
        .ok_or_else(|| ModbusError::capacity_exceeded(n, crate::MAX_MESSAGE_LENGTH))?;
    reader.read_exact(scratch).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => ModbusError::frame_truncated(section),
        _ => ModbusError::from(e),
    })?;
    buf.write_bytes(scratch)
}

/// Write a complete frame and flush it
pub(crate) async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> ModbusResult<()>
where
    W: AsyncWrite + Unpin + Send,
{
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a body whose length follows from its layout
pub(crate) async fn read_body<R>(reader: &mut R, buf: &mut ByteBuffer, layout: BodyLayout, function_code: u8) -> ModbusResult<()>
where
    R: AsyncRead + Unpin + Send,
{
    match layout {
        BodyLayout::Fixed(n) => read_into(reader, buf, n, "message").await,
        BodyLayout::Counted { prefix } => {
            read_into(reader, buf, prefix, "message").await?;
            // Last prefix byte is the byte count
            let count = buf.as_bytes()[buf.len() - 1] as usize;
            read_into(reader, buf, count, "message").await
        }
        BodyLayout::Unknown => Err(ModbusError::frame(format!(
            "Cannot delimit body of function code 0x{:02X}",
            function_code
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc_calculation() {
        let data = [0x01, 0x03, 0x00, 0x00, 0x00, 0x02];
        // Transmitted as C4 0B
        assert_eq!(calculate_crc16(&data), 0x0BC4);
        assert_eq!(calculate_crc16(&data).to_le_bytes(), [0xC4, 0x0B]);
    }

    #[test]
    fn test_lrc_calculation() {
        assert_eq!(calculate_lrc(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x0A]), 0xF2);
        // Sum overflows a byte
        assert_eq!(calculate_lrc(&[0xFF, 0xFF, 0x02]), 0x00);
        assert_eq!(calculate_lrc(&[]), 0x00);
    }

    #[test]
    fn test_hex_formatting() {
        assert_eq!(format_hex_packet(&[0x01, 0xAB, 0x0F]), "01 AB 0F");
    }

    #[tokio::test]
    async fn test_frame_start_distinguishes_close_from_truncation() {
        let mut buf = ByteBuffer::new(16);
        let mut empty: &[u8] = &[];
        let err = read_frame_start(&mut empty, &mut buf, 6, "header").await.unwrap_err();
        assert_eq!(err, ModbusError::ConnectionClosed);

        let mut partial: &[u8] = &[0x00, 0x01, 0x00];
        let err = read_frame_start(&mut partial, &mut buf, 6, "header").await.unwrap_err();
        assert_eq!(err, ModbusError::frame_truncated("header"));
    }

    #[tokio::test]
    async fn test_counted_body() {
        let mut buf = ByteBuffer::new(16);
        let mut data: &[u8] = &[0x04, 0x00, 0x01, 0x00, 0x02, 0xFF];
        read_body(&mut data, &mut buf, BodyLayout::Counted { prefix: 1 }, 0x03).await.unwrap();
        assert_eq!(buf.as_bytes(), &[0x04, 0x00, 0x01, 0x00, 0x02]);

        let mut short: &[u8] = &[0x04, 0x00];
        buf.reset();
        let err = read_body(&mut short, &mut buf, BodyLayout::Counted { prefix: 1 }, 0x03).await.unwrap_err();
        assert_eq!(err, ModbusError::frame_truncated("message"));
    }
}
