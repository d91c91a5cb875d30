/// Master-side request/response pairing
///
/// A transaction sends one request on a master connection and waits for the
/// matching response. On TCP/UDP a response whose transaction ID differs
/// from the outstanding one is stale and discarded; on serial lines and
/// headless TCP the unit ID is checked instead. A malformed datagram on UDP
/// is unrelated traffic too and is skipped. Each attempt is bounded by
/// the connection timeout, and a recoverable failure triggers another
/// attempt until the retry budget is spent.

use log::{debug, warn};
use std::time::Duration;
use tokio::time::{timeout_at, Instant};

use crate::connection::MasterConnection;
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{ModbusRequest, ModbusResponse};
use crate::transport::{ModbusTransport, TransportKind};
use crate::utils::OperationTimer;

/// One request/response exchange on a master connection
pub struct ModbusTransaction<'c, C: MasterConnection> {
    connection: &'c mut C,
    request: ModbusRequest,
    retries: u32,
    timeout: Duration,
}

impl<'c, C: MasterConnection> ModbusTransaction<'c, C> {
    pub fn new(connection: &'c mut C, request: ModbusRequest) -> Self {
        let retries = connection.retries();
        let timeout = connection.timeout();
        Self {
            connection,
            request,
            retries,
            timeout,
        }
    }

    /// Additional attempts after the first one
    pub fn set_retries(&mut self, retries: u32) {
        self.retries = retries;
    }

    /// Time allowed for each attempt
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn request(&self) -> &ModbusRequest {
        &self.request
    }

    /// Send the request and wait for its response
    ///
    /// An exception response is returned as a response; use
    /// [`ModbusResponse::into_result`] to turn it into an error.
    pub async fn execute(mut self) -> ModbusResult<ModbusResponse> {
        self.request.validate()?;

        let timer = OperationTimer::start("modbus transaction");
        let mut last_error = None;

        for attempt in 0..=self.retries {
            if attempt > 0 {
                debug!("Retrying transaction (attempt {} of {})", attempt + 1, self.retries + 1);
            }

            let transaction_id = self.connection.next_transaction_id();
            self.request.set_transaction_id(transaction_id);

            if let Err(e) = self.connection.write_request(&self.request).await {
                if !e.is_recoverable() {
                    timer.stop_and_log(false);
                    return Err(e);
                }
                debug!("Write failed: {}", e);
                last_error = Some(e);
                continue;
            }

            match self.await_response().await {
                Ok(response) => {
                    timer.stop();
                    return Ok(response);
                }
                Err(e) if e.is_recoverable() => {
                    debug!("Attempt {} failed: {}", attempt + 1, e);
                    last_error = Some(e);
                }
                Err(e) => {
                    timer.stop_and_log(false);
                    return Err(e);
                }
            }
        }

        timer.stop_and_log(false);
        let error = match last_error {
            Some(e) if !matches!(e, ModbusError::Timeout { .. }) => e,
            _ => ModbusError::timeout("await response", self.timeout.as_millis() as u64),
        };
        warn!(
            "Transaction for unit {} function 0x{:02X} failed after {} attempts: {}",
            self.request.header.unit_id,
            self.request.pdu.function_code(),
            self.retries + 1,
            error
        );
        Err(error)
    }

    /// Send the request without waiting for a reply (serial broadcast)
    pub async fn send(mut self) -> ModbusResult<()> {
        self.request.validate()?;
        let transaction_id = self.connection.next_transaction_id();
        self.request.set_transaction_id(transaction_id);
        self.connection.write_request(&self.request).await
    }

    /// Read responses until one matches the outstanding request
    async fn await_response(&mut self) -> ModbusResult<ModbusResponse> {
        let limit = self.timeout;
        let deadline = Instant::now() + limit;
        let expected_id = self.request.header.transaction_id;
        let expected_unit = self.request.header.unit_id;
        let expected_function = self.request.pdu.function_code();

        let transport = self.connection.transport()?;
        let correlates = transport.correlates_transactions();
        let datagrams = transport.kind() == TransportKind::Udp;

        loop {
            let response = match timeout_at(deadline, transport.read_response()).await {
                Ok(Ok(response)) => response,
                Ok(Err(e)) if datagrams && is_malformed_frame(&e) => {
                    debug!("Discarding malformed datagram: {}", e);
                    continue;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(ModbusError::timeout("await response", limit.as_millis() as u64)),
            };

            if correlates && response.header.transaction_id != expected_id {
                debug!(
                    "Discarding response with transaction ID {} (expected {})",
                    response.header.transaction_id, expected_id
                );
                continue;
            }
            if !correlates && response.header.unit_id != expected_unit {
                debug!(
                    "Discarding response from unit {} (expected {})",
                    response.header.unit_id, expected_unit
                );
                continue;
            }
            if response.pdu.function_code() & 0x7F != expected_function {
                debug!(
                    "Discarding response for function 0x{:02X} (expected 0x{:02X})",
                    response.pdu.function_code(),
                    expected_function
                );
                continue;
            }
            return Ok(response);
        }
    }
}

/// Errors raised by the content of a frame rather than by the channel
fn is_malformed_frame(error: &ModbusError) -> bool {
    matches!(
        error,
        ModbusError::Frame { .. }
            | ModbusError::FrameTruncated { .. }
            | ModbusError::CapacityExceeded { .. }
            | ModbusError::Protocol { .. }
            | ModbusError::InvalidFunction { .. }
            | ModbusError::InvalidData { .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::TcpMasterConnection;
    use crate::protocol::ResponsePdu;
    use crate::transport::TcpTransport;
    use tokio::net::{TcpListener, TcpStream};

    async fn pair() -> (TcpMasterConnection, TcpTransport) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let client = TcpStream::connect(address).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let master = TcpTransport::new(client, Duration::from_millis(200)).into_master().unwrap();
        (master, TcpTransport::new(server, Duration::from_secs(1)))
    }

    #[tokio::test]
    async fn test_stale_response_is_discarded() {
        let (mut master, mut slave) = pair().await;

        let server = tokio::spawn(async move {
            let request = slave.read_request().await.unwrap();
            let mut stale = request.create_response(ResponsePdu::ReadHoldingRegisters(vec![1]));
            stale.header.transaction_id = request.header.transaction_id.wrapping_sub(1);
            slave.write_message(&stale).await.unwrap();
            let fresh = request.create_response(ResponsePdu::ReadHoldingRegisters(vec![2]));
            slave.write_message(&fresh).await.unwrap();
            slave
        });

        let response = master
            .transaction(ModbusRequest::read_holding_registers(1, 0, 1))
            .execute()
            .await
            .unwrap();
        assert_eq!(response.registers().unwrap(), &[2]);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_leaves_transport_open() {
        let (mut master, _slave) = pair().await;

        let mut transaction = master.transaction(ModbusRequest::read_coils(1, 0, 8));
        transaction.set_retries(0);
        transaction.set_timeout(Duration::from_millis(50));

        let started = std::time::Instant::now();
        let err = transaction.execute().await.unwrap_err();
        assert!(matches!(err, ModbusError::Timeout { .. }));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(master.is_connected());
    }

    #[tokio::test]
    async fn test_retries_resend_request() {
        let (mut master, mut slave) = pair().await;

        let server = tokio::spawn(async move {
            // Ignore the first request, answer the second
            let first = slave.read_request().await.unwrap();
            let second = slave.read_request().await.unwrap();
            assert_ne!(first.header.transaction_id, second.header.transaction_id);
            let response = second.create_response(ResponsePdu::WriteSingleRegister { address: 3, value: 7 });
            slave.write_message(&response).await.unwrap();
        });

        let mut transaction = master.transaction(ModbusRequest::write_single_register(1, 3, 7));
        transaction.set_retries(1);
        transaction.set_timeout(Duration::from_millis(100));
        let response = transaction.execute().await.unwrap();
        assert_eq!(response.pdu, ResponsePdu::WriteSingleRegister { address: 3, value: 7 });
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_response_split_by_timeout_forces_reconnect() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            // First connection: half a response, the rest after the master gave up
            let (mut first, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 12];
            first.read_exact(&mut request).await.unwrap();
            let late = [request[0], request[1], 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x00, 0x01];
            first.write_all(&late[..4]).await.unwrap();
            let straggler = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(250)).await;
                let _ = first.write_all(&late[4..]).await;
            });

            // Second connection answers normally
            let (second, _) = listener.accept().await.unwrap();
            let mut slave = TcpTransport::new(second, Duration::from_secs(1));
            let request = slave.read_request().await.unwrap();
            let response = request.create_response(ResponsePdu::ReadHoldingRegisters(vec![2]));
            slave.write_message(&response).await.unwrap();
            straggler.await.unwrap();
        });

        let mut master = TcpMasterConnection::with_address(address, Duration::from_millis(100));
        master.set_retries(0);

        let err = master
            .transaction(ModbusRequest::read_holding_registers(1, 0, 1))
            .execute()
            .await
            .unwrap_err();
        assert!(matches!(err, ModbusError::Timeout { .. }));
        assert!(!master.is_connected());

        let response = master
            .transaction(ModbusRequest::read_holding_registers(1, 0, 1))
            .execute()
            .await
            .unwrap();
        assert_eq!(response.registers().unwrap(), &[2]);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_datagram_is_skipped() {
        use crate::connection::UdpMasterConnection;
        use crate::transport::UdpTransport;
        use std::sync::Arc;
        use tokio::net::UdpSocket;

        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let address = socket.local_addr().unwrap();
        let mut slave = UdpTransport::new(Arc::clone(&socket), Duration::from_secs(1));

        let server = tokio::spawn(async move {
            let request = slave.read_request().await.unwrap();
            let peer = slave.last_peer().unwrap();
            // Stray short datagram, then a reply with an unknown function code
            socket.send_to(&[0x00, 0x01, 0x00], peer).await.unwrap();
            let mut bogus = request.header.transaction_id.to_be_bytes().to_vec();
            bogus.extend_from_slice(&[0x00, 0x00, 0x00, 0x02, 0x01, 0x2B]);
            socket.send_to(&bogus, peer).await.unwrap();
            let response = request.create_response(ResponsePdu::ReadInputRegisters(vec![5]));
            slave.write_message(&response).await.unwrap();
        });

        let mut master = UdpMasterConnection::with_address(address, Duration::from_secs(1));
        master.set_retries(0);
        let response = master
            .transaction(ModbusRequest::read_input_registers(1, 0, 1))
            .execute()
            .await
            .unwrap();
        assert_eq!(response.registers().unwrap(), &[5]);
        assert_eq!(master.transport().unwrap().get_stats().errors, 2);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_request_is_not_sent() {
        let (mut master, _slave) = pair().await;
        let err = master
            .transaction(ModbusRequest::read_holding_registers(1, 0, 0))
            .execute()
            .await
            .unwrap_err();
        assert!(matches!(err, ModbusError::InvalidData { .. }));
        assert_eq!(master.transport().unwrap().get_stats().frames_sent, 0);
    }
}
