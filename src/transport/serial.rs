/// Modbus serial transport (RTU and ASCII)
///
/// RTU frame format: `[unit][fc][body][crc lo][crc hi]`, frames separated by
/// at least 3.5 character times of silence.
///
/// ASCII frame format: `:AAFFDDD...LRCCRLF`
/// - `:` - Start character
/// - `AA` - Unit ID (2 ASCII chars)
/// - `FF` - Function code (2 ASCII chars)
/// - `DDD...` - Data (variable length ASCII chars)
/// - `LRC` - Checksum (2 ASCII chars)
/// - `CRLF` - End characters (0x0D, 0x0A)

use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::timeout;
use tokio_serial::SerialStream;

use super::{
    calculate_crc16, calculate_lrc, log_packet, read_body, read_frame_start, read_into, write_frame,
    ModbusTransport, TransportKind, TransportStats,
};
use crate::codec::ByteBuffer;
use crate::config::SerialParameters;
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{BodyLayout, FrameKind, MessageHeader, ModbusMessage, ModbusRequest, ModbusResponse};

/// Size of the RTU checksum trailer
const CRC_SIZE: usize = 2;

/// Inter-character timeout for ASCII lines
const ASCII_INTER_CHAR_TIMEOUT: Duration = Duration::from_secs(1);

/// Longest ASCII line after the `:` marker: hex of a full frame and its LRC, then CR LF
const MAX_ASCII_LINE: usize = 2 * (crate::MAX_MESSAGE_LENGTH + 1) + 2;

/// Serial line encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialEncoding {
    Ascii,
    Rtu,
}

impl Default for SerialEncoding {
    fn default() -> Self {
        SerialEncoding::Rtu
    }
}

/// Minimum silence between RTU frames
///
/// 3.5 character times at 11 bits per character, fixed at 1750 µs above
/// 19200 baud.
pub fn frame_gap(baud_rate: u32) -> Duration {
    if baud_rate == 0 || baud_rate > 19200 {
        Duration::from_micros(1750)
    } else {
        Duration::from_micros(38_500_000 / baud_rate as u64)
    }
}

/// Modbus serial transport implementation
pub struct SerialTransport<S = SerialStream> {
    port: Option<BufReader<S>>,
    encoding: SerialEncoding,
    /// Frame gap time (minimum silence between RTU frames)
    frame_gap: Duration,
    inter_char_timeout: Duration,
    timeout: Duration,
    in_buf: ByteBuffer,
    out_buf: ByteBuffer,
    stats: TransportStats,
    /// Enable packet logging for debugging
    packet_logging: bool,
}

/// Open the configured serial port
pub fn open_port(params: &SerialParameters) -> ModbusResult<SerialStream> {
    let builder = tokio_serial::new(&params.port_name, params.baud_rate)
        .data_bits(params.tokio_data_bits()?)
        .stop_bits(params.tokio_stop_bits()?)
        .parity(params.tokio_parity())
        .timeout(params.timeout);

    SerialStream::open(&builder)
        .map_err(|e| ModbusError::connection(format!("Failed to open serial port {}: {}", params.port_name, e)))
}

impl SerialTransport<SerialStream> {
    /// Open the configured serial port and bind a transport to it
    pub fn open(params: &SerialParameters) -> ModbusResult<Self> {
        Ok(Self::from_parameters(open_port(params)?, params))
    }
}

impl<S> SerialTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Create a transport over an open serial channel
    pub fn new(port: S, encoding: SerialEncoding, baud_rate: u32, timeout: Duration) -> Self {
        let frame_gap = frame_gap(baud_rate);
        let inter_char_timeout = match encoding {
            SerialEncoding::Rtu => frame_gap,
            SerialEncoding::Ascii => ASCII_INTER_CHAR_TIMEOUT,
        };

        Self {
            port: Some(BufReader::new(port)),
            encoding,
            frame_gap,
            inter_char_timeout,
            timeout,
            in_buf: ByteBuffer::new(crate::MAX_MESSAGE_LENGTH + CRC_SIZE),
            out_buf: ByteBuffer::new(crate::MAX_MESSAGE_LENGTH + CRC_SIZE),
            stats: TransportStats::default(),
            packet_logging: false,
        }
    }

    /// Create a transport over an open channel using the configured line settings
    pub fn from_parameters(port: S, params: &SerialParameters) -> Self {
        let mut transport = Self::new(port, params.encoding, params.baud_rate, params.timeout);
        if let Some(inter_char_timeout) = params.inter_char_timeout {
            transport.set_inter_char_timeout(inter_char_timeout);
        }
        transport.set_packet_logging(params.packet_logging);
        transport
    }

    pub fn encoding(&self) -> SerialEncoding {
        self.encoding
    }

    pub fn frame_gap(&self) -> Duration {
        self.frame_gap
    }

    /// Longest pause allowed between two characters of a frame
    ///
    /// On RTU this silence also ends a frame of unknown length.
    pub fn set_inter_char_timeout(&mut self, inter_char_timeout: Duration) {
        self.inter_char_timeout = inter_char_timeout;
    }

    /// Enable or disable packet logging
    pub fn set_packet_logging(&mut self, enabled: bool) {
        self.packet_logging = enabled;
    }

    fn encode(&mut self, message: &dyn ModbusMessage) -> ModbusResult<()> {
        let buf = &mut self.out_buf;
        buf.reset();
        buf.write_u8(message.unit_id())?;
        buf.write_u8(message.function_code())?;
        message.encode_body(buf)
    }

    async fn read_rtu_frame(&mut self, kind: FrameKind) -> ModbusResult<()> {
        let silence = self.inter_char_timeout;
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| ModbusError::connection("Serial port not connected"))?;
        let buf = &mut self.in_buf;
        buf.reset();

        read_frame_start(port, buf, 2, "header").await?;
        let function_code = buf.as_bytes()[1];
        match BodyLayout::of(kind, function_code) {
            BodyLayout::Unknown => read_until_silence(port, buf, silence).await?,
            layout => {
                read_body(port, buf, layout, function_code).await?;
                read_into(port, buf, CRC_SIZE, "message").await?;
            }
        }

        let len = buf.len();
        if len < 2 + CRC_SIZE {
            return Err(ModbusError::frame_truncated("message"));
        }
        let frame = buf.as_bytes();
        let expected = calculate_crc16(&frame[..len - CRC_SIZE]);
        let actual = u16::from_le_bytes([frame[len - 2], frame[len - 1]]);
        if expected != actual {
            drain(port, silence).await;
            return Err(ModbusError::crc_mismatch(expected, actual));
        }

        buf.truncate(len - CRC_SIZE);
        Ok(())
    }

    async fn read_ascii_frame(&mut self) -> ModbusResult<()> {
        let inter_char = self.inter_char_timeout;
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| ModbusError::connection("Serial port not connected"))?;

        // Skip noise up to the start marker
        loop {
            match port.read_u8().await {
                Ok(b':') => break,
                Ok(byte) => debug!("Skipping noise byte 0x{:02X} before ASCII frame", byte),
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Err(ModbusError::ConnectionClosed)
                }
                Err(e) => return Err(e.into()),
            }
        }

        let mut line = Vec::with_capacity(MAX_ASCII_LINE);
        loop {
            let byte = match timeout(inter_char, port.read_u8()).await {
                Ok(Ok(byte)) => byte,
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Err(ModbusError::frame_truncated("message")),
            };
            line.push(byte);
            if byte == b'\n' {
                break;
            }
            if line.len() == MAX_ASCII_LINE {
                return Err(ModbusError::capacity_exceeded(line.len() + 1, MAX_ASCII_LINE));
            }
        }
        if !line.ends_with(b"\r\n") {
            return Err(if line.ends_with(b"\n") {
                ModbusError::frame("ASCII frame missing CR before LF")
            } else {
                ModbusError::frame_truncated("message")
            });
        }

        let raw = hex::decode(&line[..line.len() - 2])
            .map_err(|e| ModbusError::frame(format!("Invalid ASCII hex: {}", e)))?;
        if raw.len() < 3 {
            return Err(ModbusError::frame_truncated("message"));
        }

        let (data, lrc) = raw.split_at(raw.len() - 1);
        let expected = calculate_lrc(data);
        if expected != lrc[0] {
            return Err(ModbusError::lrc_mismatch(expected, lrc[0]));
        }
        self.in_buf.reset_with(data)
    }

    async fn receive(&mut self, kind: FrameKind) -> ModbusResult<(MessageHeader, u8)> {
        let limit = self.timeout;
        let read = async {
            match self.encoding {
                SerialEncoding::Rtu => self.read_rtu_frame(kind).await,
                SerialEncoding::Ascii => self.read_ascii_frame().await,
            }
        };
        let result = match timeout(limit, read).await {
            Ok(result) => result,
            Err(_) => Err(ModbusError::timeout("read serial frame", limit.as_millis() as u64)),
        };

        match result {
            Ok(()) => {
                self.stats.frames_received += 1;
                self.stats.bytes_received += self.in_buf.len() as u64;
                if self.packet_logging {
                    log_packet("SERIAL", "receive", self.in_buf.as_bytes());
                }
                let header = MessageHeader::new(self.in_buf.read_u8()?);
                let function_code = self.in_buf.read_u8()?;
                Ok((header, function_code))
            }
            Err(e) => {
                self.stats.record_error(&e);
                if matches!(e, ModbusError::ChecksumMismatch { .. }) {
                    warn!("Discarding serial frame: {}", e);
                }
                if e.is_connection_lost() {
                    self.port = None;
                }
                Err(e)
            }
        }
    }
}

/// Read until the line stays silent for `silence`
async fn read_until_silence<R>(port: &mut R, buf: &mut ByteBuffer, silence: Duration) -> ModbusResult<()>
where
    R: AsyncRead + Unpin + Send,
{
    loop {
        match timeout(silence, port.read_u8()).await {
            Ok(Ok(byte)) => buf.write_u8(byte)?,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Ok(()),
        }
    }
}

/// Discard input until the line stays silent for `silence`
async fn drain<R>(port: &mut R, silence: Duration)
where
    R: AsyncRead + Unpin + Send,
{
    let mut discarded = 0usize;
    while let Ok(Ok(_)) = timeout(silence, port.read_u8()).await {
        discarded += 1;
    }
    if discarded > 0 {
        debug!("Drained {} bytes after corrupt frame", discarded);
    }
}

#[async_trait]
impl<S> ModbusTransport for SerialTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    async fn write_message(&mut self, message: &dyn ModbusMessage) -> ModbusResult<()> {
        if let Err(e) = self.encode(message) {
            self.stats.errors += 1;
            return Err(e);
        }

        let ascii_line;
        let frame: &[u8] = match self.encoding {
            SerialEncoding::Rtu => {
                let crc = calculate_crc16(self.out_buf.as_bytes());
                self.out_buf.write_bytes(&crc.to_le_bytes())?;
                // Wait for frame gap before sending next frame
                tokio::time::sleep(self.frame_gap).await;
                self.out_buf.as_bytes()
            }
            SerialEncoding::Ascii => {
                let raw = self.out_buf.as_bytes();
                let lrc = calculate_lrc(raw);
                let mut line = Vec::with_capacity(2 * raw.len() + 5);
                line.push(b':');
                line.extend_from_slice(hex::encode_upper(raw).as_bytes());
                line.extend_from_slice(hex::encode_upper([lrc]).as_bytes());
                line.extend_from_slice(b"\r\n");
                ascii_line = line;
                &ascii_line
            }
        };

        let limit = self.timeout;
        let result = match self.port.as_mut() {
            Some(port) => match timeout(limit, write_frame(port, frame)).await {
                Ok(result) => result,
                Err(_) => Err(ModbusError::timeout("write serial frame", limit.as_millis() as u64)),
            },
            None => Err(ModbusError::connection("Serial port not connected")),
        };

        match result {
            Ok(()) => {
                self.stats.frames_sent += 1;
                self.stats.bytes_sent += frame.len() as u64;
                if self.packet_logging {
                    log_packet("SERIAL", "send", frame);
                }
                Ok(())
            }
            Err(e) => {
                self.stats.record_error(&e);
                if e.is_connection_lost() {
                    self.port = None;
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
        match self.port.take() {
            Some(mut port) => port.shutdown().await.map_err(ModbusError::from),
            None => Ok(()),
        }
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    fn correlates_transactions(&self) -> bool {
        false
    }

    fn get_stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{RequestPdu, ResponsePdu};
    use tokio_test::io::Builder;

    fn with_crc(data: &[u8]) -> Vec<u8> {
        let mut frame = data.to_vec();
        frame.extend_from_slice(&calculate_crc16(data).to_le_bytes());
        frame
    }

    #[test]
    fn test_frame_gap() {
        assert_eq!(frame_gap(9600), Duration::from_micros(4010));
        assert_eq!(frame_gap(19200), Duration::from_micros(2005));
        assert_eq!(frame_gap(115200), Duration::from_micros(1750));
    }

    #[tokio::test]
    async fn test_rtu_write() {
        let mock = Builder::new()
            .write(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B])
            .build();
        let mut transport = SerialTransport::new(mock, SerialEncoding::Rtu, 115200, Duration::from_secs(1));

        let request = ModbusRequest::read_holding_registers(1, 0, 2);
        transport.write_message(&request).await.unwrap();
        assert_eq!(transport.get_stats().bytes_sent, 8);
    }

    #[tokio::test]
    async fn test_rtu_read_response() {
        let mock = Builder::new()
            .read(&with_crc(&[0x01, 0x03, 0x04, 0x00, 0x0A, 0x01, 0x02]))
            .build();
        let mut transport = SerialTransport::new(mock, SerialEncoding::Rtu, 115200, Duration::from_secs(1));

        let response = transport.read_response().await.unwrap();
        assert_eq!(response.header.unit_id, 1);
        assert_eq!(response.registers().unwrap(), &[0x000A, 0x0102]);
        assert!(!transport.correlates_transactions());
    }

    #[tokio::test]
    async fn test_rtu_unknown_function_uses_silence() {
        let mock = Builder::new()
            .read(&with_crc(&[0x01, 0x2B, 0x0E, 0x01, 0x00]))
            .build();
        let mut transport = SerialTransport::new(mock, SerialEncoding::Rtu, 115200, Duration::from_secs(1));

        let request = transport.read_request().await.unwrap();
        assert_eq!(
            request.pdu,
            RequestPdu::Unsupported { function_code: 0x2B, data: vec![0x0E, 0x01, 0x00] }
        );
    }

    #[tokio::test]
    async fn test_rtu_crc_mismatch_discards_frame() {
        let (mut line, port) = tokio::io::duplex(256);
        let mut transport = SerialTransport::new(port, SerialEncoding::Rtu, 115200, Duration::from_secs(1));

        line.write_all(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00]).await.unwrap();
        let err = transport.read_request().await.unwrap_err();
        assert_eq!(err, ModbusError::crc_mismatch(0x0BC4, 0x0000));

        // Next frame is read cleanly
        line.write_all(&with_crc(&[0x01, 0x06, 0x00, 0x01, 0x00, 0x03])).await.unwrap();
        let request = transport.read_request().await.unwrap();
        assert_eq!(request.pdu, RequestPdu::WriteSingleRegister { address: 1, value: 3 });
    }

    #[test]
    fn test_single_bit_flip_is_detected() {
        let frame = with_crc(&[0x11, 0x10, 0x00, 0x01, 0x00, 0x01, 0x02, 0x12, 0x34]);
        for byte in 0..frame.len() - 2 {
            for bit in 0..8 {
                let mut corrupted = frame.clone();
                corrupted[byte] ^= 1 << bit;
                let len = corrupted.len();
                let actual = u16::from_le_bytes([corrupted[len - 2], corrupted[len - 1]]);
                assert_ne!(calculate_crc16(&corrupted[..len - 2]), actual);
            }
        }
    }

    #[tokio::test]
    async fn test_ascii_write() {
        let mock = Builder::new().write(b":010300000002FA\r\n").build();
        let mut transport = SerialTransport::new(mock, SerialEncoding::Ascii, 9600, Duration::from_secs(1));

        let request = ModbusRequest::read_holding_registers(1, 0, 2);
        transport.write_message(&request).await.unwrap();
    }

    #[tokio::test]
    async fn test_ascii_read_skips_noise() {
        let mock = Builder::new().read(b"\x00\xFF:010300000002fa\r\n").build();
        let mut transport = SerialTransport::new(mock, SerialEncoding::Ascii, 9600, Duration::from_secs(1));

        let request = transport.read_request().await.unwrap();
        assert_eq!(request.header.unit_id, 1);
        assert_eq!(request.pdu, RequestPdu::ReadHoldingRegisters { address: 0, quantity: 2 });
    }

    #[tokio::test]
    async fn test_ascii_lrc_mismatch() {
        let mock = Builder::new().read(b":010300000002FB\r\n").build();
        let mut transport = SerialTransport::new(mock, SerialEncoding::Ascii, 9600, Duration::from_secs(1));

        let err = transport.read_request().await.unwrap_err();
        assert_eq!(err, ModbusError::lrc_mismatch(0xFA, 0xFB));
        assert_eq!(transport.get_stats().errors, 1);
    }

    #[tokio::test]
    async fn test_ascii_exchange_over_pipe() {
        let (a, b) = tokio::io::duplex(256);
        let mut master = SerialTransport::new(a, SerialEncoding::Ascii, 9600, Duration::from_secs(1));
        let mut slave = SerialTransport::new(b, SerialEncoding::Ascii, 9600, Duration::from_secs(1));

        let request = ModbusRequest::read_coils(4, 0, 10);
        master.write_message(&request).await.unwrap();
        let received = slave.read_request().await.unwrap();
        assert_eq!(received.pdu, request.pdu);

        let bits = vec![true, false, true, false, false, false, false, false, true, true];
        slave
            .write_message(&received.create_response(ResponsePdu::ReadCoils(bits.clone())))
            .await
            .unwrap();
        let response = master.read_response().await.unwrap();
        assert_eq!(&response.bits().unwrap()[..10], &bits[..]);
    }

    #[tokio::test]
    async fn test_closed_line() {
        let mock = Builder::new().build();
        let mut transport = SerialTransport::new(mock, SerialEncoding::Ascii, 9600, Duration::from_secs(1));
        assert_eq!(transport.read_request().await.unwrap_err(), ModbusError::ConnectionClosed);
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_ascii_line_without_end_is_bounded() {
        let (line, mut peer) = tokio::io::duplex(2048);
        let mut transport = SerialTransport::new(line, SerialEncoding::Ascii, 9600, Duration::from_secs(1));

        let mut noise = vec![b':'];
        noise.extend(std::iter::repeat(b'A').take(2 * MAX_ASCII_LINE));
        peer.write_all(&noise).await.unwrap();

        let err = transport.read_request().await.unwrap_err();
        assert!(matches!(err, ModbusError::CapacityExceeded { .. }));
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn test_ascii_inter_char_timeout() {
        let (line, mut peer) = tokio::io::duplex(64);
        let mut transport = SerialTransport::new(line, SerialEncoding::Ascii, 9600, Duration::from_secs(2));
        transport.set_inter_char_timeout(Duration::from_millis(50));

        // Line goes quiet in the middle of a frame
        peer.write_all(b":0103").await.unwrap();
        let started = std::time::Instant::now();
        let err = transport.read_request().await.unwrap_err();
        assert_eq!(err, ModbusError::frame_truncated("message"));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
