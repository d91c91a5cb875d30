/// Modbus TCP transport
///
/// Frames are either MBAP framed (`[tid][pid=0][len][unit][fc][body]`) or
/// headless (`[unit][fc][body][crc lo][crc hi]`). In headless mode there is
/// no length prefix, so the body is delimited by its function code layout.
///
/// A read that stops after the first byte of a frame, whether by timeout,
/// cancellation or a bad length field, leaves the rest of that frame in the
/// socket. The stream is dropped in that case and the owning connection
/// reconnects before its next write.

use async_trait::async_trait;
use log::debug;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::{
    calculate_crc16, log_packet, read_body, read_into, write_frame, ModbusTransport,
    TransportKind, TransportStats, MBAP_HEADER_SIZE,
};
use crate::codec::ByteBuffer;
use crate::connection::TcpMasterConnection;
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{BodyLayout, FrameKind, MessageHeader, ModbusMessage, ModbusRequest, ModbusResponse};

/// Modbus TCP transport implementation
pub struct TcpTransport<S = TcpStream> {
    stream: Option<S>,
    in_buf: ByteBuffer,
    out_buf: ByteBuffer,
    headless: bool,
    timeout: Duration,
    stats: TransportStats,
    /// Enable packet logging for debugging
    packet_logging: bool,
    /// Part of a frame has been consumed but not all of it
    mid_frame: bool,
}

impl<S> TcpTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Create a transport bound to a connected stream
    pub fn new(stream: S, timeout: Duration) -> Self {
        Self {
            stream: Some(stream),
            in_buf: ByteBuffer::new(crate::MAX_MESSAGE_LENGTH + MBAP_HEADER_SIZE),
            out_buf: ByteBuffer::new(crate::MAX_MESSAGE_LENGTH + MBAP_HEADER_SIZE),
            headless: false,
            timeout,
            stats: TransportStats::default(),
            packet_logging: false,
            mid_frame: false,
        }
    }

    pub fn set_headless(&mut self, headless: bool) {
        self.headless = headless;
    }

    pub fn is_headless(&self) -> bool {
        self.headless
    }

    /// Enable or disable packet logging
    pub fn set_packet_logging(&mut self, enabled: bool) {
        self.packet_logging = enabled;
    }

    /// Replace the underlying stream, closing the previous one first
    ///
    /// A failure to close the previous stream is logged and ignored.
    pub async fn set_stream(&mut self, stream: S) {
        if let Some(mut previous) = self.stream.take() {
            if let Err(e) = previous.shutdown().await {
                debug!("Ignoring error while closing previous TCP stream: {}", e);
            }
        }
        self.stream = Some(stream);
        self.mid_frame = false;
    }

    pub fn stream(&self) -> Option<&S> {
        self.stream.as_ref()
    }

    fn encode(&mut self, message: &dyn ModbusMessage) -> ModbusResult<()> {
        let buf = &mut self.out_buf;
        buf.reset();

        if !self.headless {
            buf.write_u16(message.transaction_id())?;
            buf.write_u16(0)?;
            buf.write_u16(0)?; // patched below
        }
        buf.write_u8(message.unit_id())?;
        buf.write_u8(message.function_code())?;
        message.encode_body(buf)?;

        if self.headless {
            let crc = calculate_crc16(buf.as_bytes());
            buf.write_bytes(&crc.to_le_bytes())?;
        } else {
            let length = (buf.len() - MBAP_HEADER_SIZE) as u16;
            buf.set_u16(4, length)?;
        }
        Ok(())
    }

    /// Read one frame into `in_buf`, leaving the cursor at the body
    async fn read_frame(&mut self, kind: FrameKind) -> ModbusResult<(MessageHeader, u8)> {
        if self.mid_frame {
            return Err(ModbusError::connection("TCP stream lost frame sync after an interrupted read"));
        }
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ModbusError::connection("TCP transport is closed"))?;
        let buf = &mut self.in_buf;
        buf.reset();

        let mut header = MessageHeader {
            headless: self.headless,
            ..Default::default()
        };

        let mut first = [0u8; 1];
        if stream.read(&mut first).await? == 0 {
            return Err(ModbusError::ConnectionClosed);
        }
        self.mid_frame = true;
        buf.write_u8(first[0])?;

        if self.headless {
            read_into(stream, buf, 1, "header").await?;
            let function_code = buf.as_bytes()[1];
            read_body(stream, buf, BodyLayout::of(kind, function_code), function_code).await?;

            // Serial-compatible trailer, read and discarded
            let mut trailer = [0u8; 2];
            stream.read_exact(&mut trailer).await.map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => ModbusError::frame_truncated("message"),
                _ => ModbusError::from(e),
            })?;
        } else {
            read_into(stream, buf, MBAP_HEADER_SIZE - 1, "header").await?;
            header.transaction_id = buf.read_u16()?;
            header.protocol_id = buf.read_u16()?;
            let length = buf.read_u16()? as usize;
            if length < 2 {
                return Err(ModbusError::frame(format!("Invalid MBAP length: {}", length)));
            }
            read_into(stream, buf, length, "message").await?;
        }

        header.unit_id = buf.read_u8()?;
        let function_code = buf.read_u8()?;
        self.mid_frame = false;
        Ok((header, function_code))
    }

    async fn receive(&mut self, kind: FrameKind) -> ModbusResult<(MessageHeader, u8)> {
        let limit = self.timeout;
        let result = match timeout(limit, self.read_frame(kind)).await {
            Ok(result) => result,
            Err(_) => Err(ModbusError::timeout("read TCP frame", limit.as_millis() as u64)),
        };

        match result {
            Ok(frame) => {
                self.stats.frames_received += 1;
                self.stats.bytes_received += self.in_buf.len() as u64;
                if self.packet_logging {
                    log_packet("TCP", "receive", self.in_buf.as_bytes());
                }
                Ok(frame)
            }
            Err(e) => {
                self.stats.record_error(&e);
                if self.mid_frame || e.is_connection_lost() || matches!(e, ModbusError::FrameTruncated { .. }) {
                    debug!("Dropping TCP stream after failed read: {}", e);
                    self.stream = None;
                    self.mid_frame = false;
                }
                Err(e)
            }
        }
    }
}

impl TcpTransport<TcpStream> {
    /// Remote address of the bound socket
    pub fn peer_addr(&self) -> ModbusResult<SocketAddr> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| ModbusError::connection("TCP transport is closed"))?;
        Ok(stream.peer_addr()?)
    }

    /// Turn this transport into a master connection to its peer
    pub fn into_master(self) -> ModbusResult<TcpMasterConnection> {
        let address = self.peer_addr()?;
        Ok(TcpMasterConnection::with_transport(address, self))
    }
}

#[async_trait]
impl<S> ModbusTransport for TcpTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    async fn write_message(&mut self, message: &dyn ModbusMessage) -> ModbusResult<()> {
        if let Err(e) = self.encode(message) {
            self.stats.errors += 1;
            return Err(e);
        }

        let limit = self.timeout;
        let frame = self.out_buf.as_bytes();
        let result = match self.stream.as_mut() {
            Some(stream) => match timeout(limit, write_frame(stream, frame)).await {
                Ok(result) => result,
                Err(_) => Err(ModbusError::timeout("write TCP frame", limit.as_millis() as u64)),
            },
            None => Err(ModbusError::connection("TCP transport is closed")),
        };

        match result {
            Ok(()) => {
                self.stats.frames_sent += 1;
                self.stats.bytes_sent += frame.len() as u64;
                if self.packet_logging {
                    log_packet("TCP", "send", frame);
                }
                Ok(())
            }
            Err(e) => {
                self.stats.record_error(&e);
                if e.is_connection_lost() {
                    self.stream = None;
                }
                Err(e)
            }
        }
    }

    async fn read_request(&mut self) -> ModbusResult<ModbusRequest> {
        let (header, function_code) = self.receive(FrameKind::Request).await?;
        Ok(ModbusRequest::from_frame(header, function_code, &mut self.in_buf))
    }

    async fn read_response(&mut self) -> ModbusResult<ModbusResponse> {
        let (header, function_code) = self.receive(FrameKind::Response).await?;
        ModbusResponse::from_frame(header, function_code, &mut self.in_buf).map_err(|e| {
            self.stats.errors += 1;
            e
        })
    }

    async fn close(&mut self) -> ModbusResult<()> {
        match self.stream.take() {
            Some(mut stream) => stream.shutdown().await.map_err(ModbusError::from),
            None => Ok(()),
        }
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// False once a read was abandoned inside a frame
    fn is_connected(&self) -> bool {
        self.stream.is_some() && !self.mid_frame
    }

    fn correlates_transactions(&self) -> bool {
        !self.headless
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ResponsePdu, RequestPdu};
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_write_mbap_frame() {
        let mock = Builder::new()
            .write(&[0x00, 0x07, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01])
            .build();
        let mut transport = TcpTransport::new(mock, Duration::from_secs(1));

        let mut request = ModbusRequest::read_holding_registers(1, 0, 1);
        request.set_transaction_id(7);
        transport.write_message(&request).await.unwrap();

        let stats = transport.get_stats();
        assert_eq!(stats.frames_sent, 1);
        assert_eq!(stats.bytes_sent, 12);
    }

    #[tokio::test]
    async fn test_read_mbap_response() {
        let mock = Builder::new()
            .read(&[0x12, 0x34, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x00, 0x63])
            .build();
        let mut transport = TcpTransport::new(mock, Duration::from_secs(1));

        let response = transport.read_response().await.unwrap();
        assert_eq!(response.header.transaction_id, 0x1234);
        assert_eq!(response.header.unit_id, 1);
        assert_eq!(response.registers().unwrap(), &[99]);
    }

    #[tokio::test]
    async fn test_headless_request_discards_trailer() {
        let mock = Builder::new()
            .read(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0xAA, 0xBB])
            .read(&[0x01, 0x06, 0x00, 0x00, 0x00, 0x63, 0x00, 0x00])
            .build();
        let mut transport = TcpTransport::new(mock, Duration::from_secs(1));
        transport.set_headless(true);
        assert!(!transport.correlates_transactions());

        let request = transport.read_request().await.unwrap();
        assert!(request.header.headless);
        assert_eq!(request.pdu, RequestPdu::ReadHoldingRegisters { address: 0, quantity: 1 });

        let request = transport.read_request().await.unwrap();
        assert_eq!(request.pdu, RequestPdu::WriteSingleRegister { address: 0, value: 99 });
    }

    #[tokio::test]
    async fn test_headless_write_appends_crc() {
        let mock = Builder::new()
            .write(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B])
            .build();
        let mut transport = TcpTransport::new(mock, Duration::from_secs(1));
        transport.set_headless(true);

        let request = ModbusRequest::read_holding_registers(1, 0, 2);
        transport.write_message(&request).await.unwrap();
    }

    #[tokio::test]
    async fn test_truncated_header() {
        let mock = Builder::new().read(&[0x00, 0x01, 0x00]).build();
        let mut transport = TcpTransport::new(mock, Duration::from_secs(1));

        let err = transport.read_request().await.unwrap_err();
        assert_eq!(err, ModbusError::frame_truncated("header"));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_truncated_message() {
        let mock = Builder::new()
            .read(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03])
            .build();
        let mut transport = TcpTransport::new(mock, Duration::from_secs(1));

        let err = transport.read_request().await.unwrap_err();
        assert_eq!(err, ModbusError::frame_truncated("message"));
    }

    #[tokio::test]
    async fn test_clean_close() {
        let mock = Builder::new().build();
        let mut transport = TcpTransport::new(mock, Duration::from_secs(1));

        let err = transport.read_request().await.unwrap_err();
        assert_eq!(err, ModbusError::ConnectionClosed);
        assert_eq!(transport.get_stats().errors, 1);
    }

    #[tokio::test]
    async fn test_read_timeout_keeps_stream() {
        let (client, _server) = tokio::io::duplex(64);
        let mut transport = TcpTransport::new(client, Duration::from_millis(20));

        let err = transport.read_response().await.unwrap_err();
        assert!(matches!(err, ModbusError::Timeout { .. }));
        assert!(transport.is_connected());
        assert_eq!(transport.get_stats().timeouts, 1);
    }

    #[tokio::test]
    async fn test_timeout_inside_frame_drops_stream() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut transport = TcpTransport::new(client, Duration::from_millis(50));

        // First half of an MBAP header, then nothing
        server.write_all(&[0x00, 0x01, 0x00, 0x00]).await.unwrap();
        let err = transport.read_response().await.unwrap_err();
        assert!(matches!(err, ModbusError::Timeout { .. }));
        assert!(!transport.is_connected());
        assert_eq!(transport.get_stats().timeouts, 1);
    }

    #[tokio::test]
    async fn test_abandoned_read_marks_stream_out_of_sync() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut transport = TcpTransport::new(client, Duration::from_secs(1));

        server.write_all(&[0x00, 0x01, 0x00]).await.unwrap();
        let abandoned = tokio::time::timeout(Duration::from_millis(30), transport.read_response()).await;
        assert!(abandoned.is_err());
        assert!(!transport.is_connected());

        // Remainder of the old frame is never parsed as a new header
        server.write_all(&[0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x00, 0x01]).await.unwrap();
        let err = transport.read_response().await.unwrap_err();
        assert!(matches!(err, ModbusError::Connection { .. }));
        assert!(transport.stream().is_none());
    }

    #[tokio::test]
    async fn test_oversized_length_drops_stream() {
        let mock = Builder::new().read(&[0x00, 0x01, 0x00, 0x00, 0x02, 0x00]).build();
        let mut transport = TcpTransport::new(mock, Duration::from_secs(1));

        let err = transport.read_response().await.unwrap_err();
        assert_eq!(err, ModbusError::capacity_exceeded(512, crate::MAX_MESSAGE_LENGTH));
        assert!(!transport.is_connected());
        assert!(transport.stream().is_none());
    }

    #[tokio::test]
    async fn test_response_echoes_request_header() {
        let (client, server) = tokio::io::duplex(256);
        let mut master = TcpTransport::new(client, Duration::from_secs(1));
        let mut slave = TcpTransport::new(server, Duration::from_secs(1));

        let mut request = ModbusRequest::read_input_registers(9, 4, 2);
        request.set_transaction_id(0xFFFE);
        master.write_message(&request).await.unwrap();

        let received = slave.read_request().await.unwrap();
        assert_eq!(received, request);
        let response = received.create_response(ResponsePdu::ReadInputRegisters(vec![1, 2]));
        slave.write_message(&response).await.unwrap();

        let response = master.read_response().await.unwrap();
        assert_eq!(response.header.transaction_id, 0xFFFE);
        assert_eq!(response.registers().unwrap(), &[1, 2]);
    }

    #[tokio::test]
    async fn test_set_stream_replaces_channel() {
        let mut transport = TcpTransport::new(Builder::new().build(), Duration::from_secs(1));
        transport.close().await.unwrap();
        assert!(!transport.is_connected());

        transport
            .set_stream(Builder::new().read(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x03, 0x01, 0x83, 0x02]).build())
            .await;
        let response = transport.read_response().await.unwrap();
        assert!(response.is_exception());
    }
}
