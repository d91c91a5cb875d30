/// Modbus UDP transport
///
/// Same MBAP framing as TCP, one complete frame per datagram. A socket
/// connected to a peer (master side) sends to that peer; an unconnected
/// socket (slave side) answers whoever sent the last datagram.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use super::{log_packet, ModbusTransport, TransportKind, TransportStats, MBAP_HEADER_SIZE};
use crate::codec::ByteBuffer;
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{MessageHeader, ModbusMessage, ModbusRequest, ModbusResponse};

/// Modbus UDP transport implementation
pub struct UdpTransport {
    socket: Option<Arc<UdpSocket>>,
    /// Fixed peer of a connected socket
    remote: Option<SocketAddr>,
    /// Sender of the last datagram received
    last_peer: Option<SocketAddr>,
    in_buf: ByteBuffer,
    out_buf: ByteBuffer,
    timeout: Duration,
    stats: TransportStats,
    packet_logging: bool,
}

impl UdpTransport {
    /// Create a transport over a bound socket
    ///
    /// If the socket is connected, frames go to its peer; otherwise replies
    /// go to the sender of the last received frame.
    pub fn new(socket: Arc<UdpSocket>, timeout: Duration) -> Self {
        let remote = socket.peer_addr().ok();
        Self {
            socket: Some(socket),
            remote,
            last_peer: None,
            in_buf: ByteBuffer::new(crate::MAX_MESSAGE_LENGTH + MBAP_HEADER_SIZE),
            out_buf: ByteBuffer::new(crate::MAX_MESSAGE_LENGTH + MBAP_HEADER_SIZE),
            timeout,
            stats: TransportStats::default(),
            packet_logging: false,
        }
    }

    /// Bind an ephemeral local port and connect it to `address`
    pub async fn connect(address: SocketAddr, timeout: Duration) -> ModbusResult<Self> {
        let local: SocketAddr = if address.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| ModbusError::connection(format!("Failed to bind UDP socket: {}", e)))?;
        socket
            .connect(address)
            .await
            .map_err(|e| ModbusError::connection(format!("Failed to connect UDP socket to {}: {}", address, e)))?;
        Ok(Self::new(Arc::new(socket), timeout))
    }

    /// Enable or disable packet logging
    pub fn set_packet_logging(&mut self, enabled: bool) {
        self.packet_logging = enabled;
    }

    /// Sender of the last datagram received
    pub fn last_peer(&self) -> Option<SocketAddr> {
        self.last_peer
    }

    pub fn local_addr(&self) -> ModbusResult<SocketAddr> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| ModbusError::connection("UDP transport is closed"))?;
        Ok(socket.local_addr()?)
    }

    fn encode(&mut self, message: &dyn ModbusMessage) -> ModbusResult<()> {
        let buf = &mut self.out_buf;
        buf.reset();
        buf.write_u16(message.transaction_id())?;
        buf.write_u16(0)?;
        buf.write_u16(0)?;
        buf.write_u8(message.unit_id())?;
        buf.write_u8(message.function_code())?;
        message.encode_body(buf)?;
        let length = (buf.len() - MBAP_HEADER_SIZE) as u16;
        buf.set_u16(4, length)
    }

    async fn receive_datagram(&mut self) -> ModbusResult<()> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| ModbusError::connection("UDP transport is closed"))?;

        let mut datagram = [0u8; crate::MAX_MESSAGE_LENGTH + MBAP_HEADER_SIZE];
        let (len, peer) = socket.recv_from(&mut datagram).await?;
        self.last_peer = Some(peer);
        self.in_buf.reset_with(&datagram[..len])
    }

    /// Receive one datagram and parse its MBAP header
    async fn receive(&mut self) -> ModbusResult<(MessageHeader, u8)> {
        let limit = self.timeout;
        let result = match timeout(limit, self.receive_datagram()).await {
            Ok(result) => result.and_then(|()| parse_mbap(&mut self.in_buf)),
            Err(_) => Err(ModbusError::timeout("read UDP datagram", limit.as_millis() as u64)),
        };

        match result {
            Ok(frame) => {
                self.stats.frames_received += 1;
                self.stats.bytes_received += self.in_buf.len() as u64;
                if self.packet_logging {
                    log_packet("UDP", "receive", self.in_buf.as_bytes());
                }
                Ok(frame)
            }
            Err(e) => {
                self.stats.record_error(&e);
                Err(e)
            }
        }
    }
}

/// Parse the header of a complete datagram, leaving the cursor at the body
fn parse_mbap(buf: &mut ByteBuffer) -> ModbusResult<(MessageHeader, u8)> {
    if buf.len() < MBAP_HEADER_SIZE {
        return Err(ModbusError::frame_truncated("header"));
    }
    let transaction_id = buf.read_u16()?;
    let protocol_id = buf.read_u16()?;
    let length = buf.read_u16()? as usize;
    if length < 2 {
        return Err(ModbusError::frame(format!("Invalid MBAP length: {}", length)));
    }
    if buf.remaining() < length {
        return Err(ModbusError::frame_truncated("message"));
    }
    let header = MessageHeader {
        transaction_id,
        protocol_id,
        unit_id: buf.read_u8()?,
        headless: false,
    };
    let function_code = buf.read_u8()?;
    Ok((header, function_code))
}

#[async_trait]
impl ModbusTransport for UdpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }

    async fn write_message(&mut self, message: &dyn ModbusMessage) -> ModbusResult<()> {
        if let Err(e) = self.encode(message) {
            self.stats.errors += 1;
            return Err(e);
        }

        let limit = self.timeout;
        let frame = self.out_buf.as_bytes();
        let result = match (&self.socket, self.remote, self.last_peer) {
            (None, _, _) => Err(ModbusError::connection("UDP transport is closed")),
            (Some(socket), Some(_), _) => match timeout(limit, socket.send(frame)).await {
                Ok(sent) => sent.map_err(ModbusError::from),
                Err(_) => Err(ModbusError::timeout("write UDP datagram", limit.as_millis() as u64)),
            },
            (Some(socket), None, Some(peer)) => match timeout(limit, socket.send_to(frame, peer)).await {
                Ok(sent) => sent.map_err(ModbusError::from),
                Err(_) => Err(ModbusError::timeout("write UDP datagram", limit.as_millis() as u64)),
            },
            (Some(_), None, None) => Err(ModbusError::connection("No UDP peer to send to")),
        };

        match result {
            Ok(_) => {
                self.stats.frames_sent += 1;
                self.stats.bytes_sent += frame.len() as u64;
                if self.packet_logging {
                    log_packet("UDP", "send", frame);
                }
                Ok(())
            }
            Err(e) => {
                self.stats.record_error(&e);
                Err(e)
            }
        }
    }

    async fn read_request(&mut self) -> ModbusResult<ModbusRequest> {
        let (header, function_code) = self.receive().await?;
        Ok(ModbusRequest::from_frame(header, function_code, &mut self.in_buf))
    }

    async fn read_response(&mut self) -> ModbusResult<ModbusResponse> {
        let (header, function_code) = self.receive().await?;
        ModbusResponse::from_frame(header, function_code, &mut self.in_buf).map_err(|e| {
            self.stats.errors += 1;
            e
        })
    }

    async fn close(&mut self) -> ModbusResult<()> {
        self.socket = None;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    fn correlates_transactions(&self) -> bool {
        true
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{RequestPdu, ResponsePdu};

    #[test]
    fn test_parse_short_datagrams() {
        let mut buf = ByteBuffer::new(32);
        buf.reset_with(&[0x00, 0x01, 0x00]).unwrap();
        assert_eq!(parse_mbap(&mut buf).unwrap_err(), ModbusError::frame_truncated("header"));

        buf.reset_with(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03]).unwrap();
        assert_eq!(parse_mbap(&mut buf).unwrap_err(), ModbusError::frame_truncated("message"));

        buf.reset_with(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01]).unwrap();
        let (header, function_code) = parse_mbap(&mut buf).unwrap();
        assert_eq!(header.transaction_id, 1);
        assert_eq!(header.unit_id, 1);
        assert_eq!(function_code, 0x03);
    }

    #[tokio::test]
    async fn test_datagram_exchange() {
        let server_socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let server_addr = server_socket.local_addr().unwrap();
        let mut slave = UdpTransport::new(server_socket, Duration::from_secs(1));
        let mut master = UdpTransport::connect(server_addr, Duration::from_secs(1)).await.unwrap();

        let mut request = ModbusRequest::write_single_coil(2, 5, true);
        request.set_transaction_id(42);
        master.write_message(&request).await.unwrap();

        let received = slave.read_request().await.unwrap();
        assert_eq!(received.pdu, RequestPdu::WriteSingleCoil { address: 5, value: 0xFF00 });
        assert_eq!(slave.last_peer(), Some(master.local_addr().unwrap()));

        let response = received.create_response(ResponsePdu::WriteSingleCoil { address: 5, value: 0xFF00 });
        slave.write_message(&response).await.unwrap();

        let response = master.read_response().await.unwrap();
        assert_eq!(response.header.transaction_id, 42);
        assert_eq!(master.get_stats().frames_received, 1);
    }

    #[tokio::test]
    async fn test_reply_without_peer_fails() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let mut transport = UdpTransport::new(socket, Duration::from_millis(20));
        let response = ModbusResponse::new(1, ResponsePdu::WriteSingleRegister { address: 0, value: 1 });
        assert!(matches!(
            transport.write_message(&response).await,
            Err(ModbusError::Connection { .. })
        ));

        assert!(matches!(transport.read_request().await, Err(ModbusError::Timeout { .. })));
        assert!(transport.is_connected());
    }
}
