//! Master-side connections
//!
//! A connection owns the channel to one slave (a TCP socket, a connected
//! UDP socket or a serial port) and the transport bound to it. It handles
//! open/close, the transaction ID counter, and the reconnect policy:
//!
//! - [`MasterConnection::connect_if_needed`] runs before every write.
//! - After a failed write that left the channel down, exactly one reconnect
//!   is attempted. A failing reconnect is logged and ignored; the write
//!   error is what the caller sees.

use async_trait::async_trait;
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_serial::SerialStream;

use crate::config::{SerialParameters, TcpMasterConfig, UdpMasterConfig};
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::ModbusRequest;
use crate::transaction::ModbusTransaction;
use crate::transport::{open_port, ModbusTransport, SerialTransport, TcpTransport, UdpTransport};

/// Lifecycle and transport access of a master connection
#[async_trait]
pub trait MasterConnection: Send {
    type Transport: ModbusTransport;

    /// Open the channel and bind a transport to it
    async fn connect(&mut self) -> ModbusResult<()>;

    /// Close the transport and mark the connection unconnected
    async fn close(&mut self) -> ModbusResult<()>;

    fn is_connected(&self) -> bool;

    /// Transport bound to the open channel
    fn transport(&mut self) -> ModbusResult<&mut Self::Transport>;

    /// Per-attempt response timeout
    fn timeout(&self) -> Duration;

    fn set_timeout(&mut self, timeout: Duration);

    /// Additional attempts a transaction makes after the first one
    fn retries(&self) -> u32;

    /// Next transaction ID, wrapping at 16 bits
    fn next_transaction_id(&mut self) -> u16;

    async fn connect_if_needed(&mut self) -> ModbusResult<()> {
        if !self.is_connected() {
            self.connect().await?;
        }
        Ok(())
    }

    /// Write a request on the bound transport
    ///
    /// The original write error is always returned, even when the single
    /// reconnect attempt succeeds.
    async fn write_request(&mut self, request: &ModbusRequest) -> ModbusResult<()> {
        self.connect_if_needed().await?;
        let result = self.transport()?.write_message(request).await;

        if let Err(e) = &result {
            if !self.is_connected() {
                warn!("Write failed ({}), attempting one reconnect", e);
                if let Err(reconnect_error) = self.connect().await {
                    debug!("Ignoring failed reconnect: {}", reconnect_error);
                }
            }
        }
        result
    }

    /// Create a transaction for one request on this connection
    fn transaction(&mut self, request: ModbusRequest) -> ModbusTransaction<'_, Self>
    where
        Self: Sized,
    {
        ModbusTransaction::new(self, request)
    }
}

/// Master connection over TCP
pub struct TcpMasterConnection {
    config: TcpMasterConfig,
    transaction_id: u16,
    transport: Option<TcpTransport>,
}

impl TcpMasterConnection {
    pub fn new(config: TcpMasterConfig) -> Self {
        Self {
            config,
            transaction_id: 0,
            transport: None,
        }
    }

    /// Connection to `address` with default settings
    pub fn with_address(address: SocketAddr, timeout: Duration) -> Self {
        Self::new(TcpMasterConfig {
            address,
            timeout,
            ..Default::default()
        })
    }

    /// Connection wrapping an already established transport
    pub fn with_transport(address: SocketAddr, transport: TcpTransport) -> Self {
        let config = TcpMasterConfig {
            address,
            timeout: transport.timeout(),
            headless: transport.is_headless(),
            ..Default::default()
        };
        Self {
            config,
            transaction_id: 0,
            transport: Some(transport),
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.config.address
    }

    pub fn set_retries(&mut self, retries: u32) {
        self.config.retries = retries;
    }
}

#[async_trait]
impl MasterConnection for TcpMasterConnection {
    type Transport = TcpTransport;

    async fn connect(&mut self) -> ModbusResult<()> {
        let address = self.config.address;
        let limit = self.config.timeout;
        let stream = match timeout(limit, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(ModbusError::connection(format!("Failed to connect to {}: {}", address, e)))
            }
            Err(_) => return Err(ModbusError::timeout(format!("connect to {}", address), limit.as_millis() as u64)),
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY on {}: {}", address, e);
        }

        match self.transport.as_mut() {
            Some(transport) => transport.set_stream(stream).await,
            None => {
                let mut transport = TcpTransport::new(stream, limit);
                transport.set_headless(self.config.headless);
                transport.set_packet_logging(self.config.packet_logging);
                self.transport = Some(transport);
            }
        }
        info!("Connected to Modbus TCP slave at {}", address);
        Ok(())
    }

    async fn close(&mut self) -> ModbusResult<()> {
        match self.transport.as_mut() {
            Some(transport) => transport.close().await,
            None => Ok(()),
        }
    }

    fn is_connected(&self) -> bool {
        self.transport.as_ref().map_or(false, |t| t.is_connected())
    }

    fn transport(&mut self) -> ModbusResult<&mut TcpTransport> {
        self.transport
            .as_mut()
            .ok_or_else(|| ModbusError::connection("Not connected"))
    }

    fn timeout(&self) -> Duration {
        self.config.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.config.timeout = timeout;
        if let Some(transport) = self.transport.as_mut() {
            transport.set_timeout(timeout);
        }
    }

    fn retries(&self) -> u32 {
        self.config.retries
    }

    fn next_transaction_id(&mut self) -> u16 {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        self.transaction_id
    }
}

/// Master connection over UDP
pub struct UdpMasterConnection {
    config: UdpMasterConfig,
    transaction_id: u16,
    transport: Option<UdpTransport>,
}

impl UdpMasterConnection {
    pub fn new(config: UdpMasterConfig) -> Self {
        Self {
            config,
            transaction_id: 0,
            transport: None,
        }
    }

    pub fn with_address(address: SocketAddr, timeout: Duration) -> Self {
        Self::new(UdpMasterConfig {
            address,
            timeout,
            ..Default::default()
        })
    }

    pub fn set_retries(&mut self, retries: u32) {
        self.config.retries = retries;
    }
}

#[async_trait]
impl MasterConnection for UdpMasterConnection {
    type Transport = UdpTransport;

    async fn connect(&mut self) -> ModbusResult<()> {
        let mut transport = UdpTransport::connect(self.config.address, self.config.timeout).await?;
        transport.set_packet_logging(self.config.packet_logging);
        self.transport = Some(transport);
        debug!("UDP socket connected to {}", self.config.address);
        Ok(())
    }

    async fn close(&mut self) -> ModbusResult<()> {
        match self.transport.as_mut() {
            Some(transport) => transport.close().await,
            None => Ok(()),
        }
    }

    fn is_connected(&self) -> bool {
        self.transport.as_ref().map_or(false, |t| t.is_connected())
    }

    fn transport(&mut self) -> ModbusResult<&mut UdpTransport> {
        self.transport
            .as_mut()
            .ok_or_else(|| ModbusError::connection("Not connected"))
    }

    fn timeout(&self) -> Duration {
        self.config.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.config.timeout = timeout;
        if let Some(transport) = self.transport.as_mut() {
            transport.set_timeout(timeout);
        }
    }

    fn retries(&self) -> u32 {
        self.config.retries
    }

    fn next_transaction_id(&mut self) -> u16 {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        self.transaction_id
    }
}

/// Opens the channel of a serial connection
pub type PortOpener<S> = Box<dyn FnMut(&SerialParameters) -> ModbusResult<S> + Send>;

/// Master connection over a serial line
pub struct SerialConnection<S = SerialStream> {
    params: SerialParameters,
    opener: PortOpener<S>,
    transaction_id: u16,
    transport: Option<SerialTransport<S>>,
}

impl SerialConnection<SerialStream> {
    pub fn new(params: SerialParameters) -> Self {
        Self::with_opener(params, Box::new(open_port))
    }
}

impl<S> SerialConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Connection whose channel comes from `opener`
    pub fn with_opener(params: SerialParameters, opener: PortOpener<S>) -> Self {
        Self {
            params,
            opener,
            transaction_id: 0,
            transport: None,
        }
    }

    pub fn parameters(&self) -> &SerialParameters {
        &self.params
    }
}

#[async_trait]
impl<S> MasterConnection for SerialConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    type Transport = SerialTransport<S>;

    async fn connect(&mut self) -> ModbusResult<()> {
        if let Some(mut previous) = self.transport.take() {
            if let Err(e) = previous.close().await {
                debug!("Ignoring error while closing serial port: {}", e);
            }
        }

        let port = (self.opener)(&self.params)?;
        let transport = SerialTransport::from_parameters(port, &self.params);
        if !self.params.open_delay.is_zero() {
            debug!("Waiting {:?} for {} to settle", self.params.open_delay, self.params.port_name);
            tokio::time::sleep(self.params.open_delay).await;
        }
        self.transport = Some(transport);
        info!("Opened serial port {} ({} baud)", self.params.port_name, self.params.baud_rate);
        Ok(())
    }

    async fn close(&mut self) -> ModbusResult<()> {
        match self.transport.as_mut() {
            Some(transport) => transport.close().await,
            None => Ok(()),
        }
    }

    fn is_connected(&self) -> bool {
        self.transport.as_ref().map_or(false, |t| t.is_connected())
    }

    fn transport(&mut self) -> ModbusResult<&mut SerialTransport<S>> {
        self.transport
            .as_mut()
            .ok_or_else(|| ModbusError::connection("Serial port not open"))
    }

    fn timeout(&self) -> Duration {
        self.params.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.params.timeout = timeout;
        if let Some(transport) = self.transport.as_mut() {
            transport.set_timeout(timeout);
        }
    }

    fn retries(&self) -> u32 {
        self.params.retries
    }

    fn next_transaction_id(&mut self) -> u16 {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        self.transaction_id
    }
}
