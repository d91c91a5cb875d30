/// Modbus listeners
///
/// A listener binds a channel, reads requests through a transport, lets a
/// [`ModbusSlave`] produce the responses and writes them back. The TCP
/// listener serves every accepted connection on its own task, the UDP
/// listener runs one receive loop for all peers, and the serial listener
/// owns its port exclusively.

use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::SerialStream;

use crate::config::{SerialParameters, TcpListenerConfig, UdpListenerConfig};
use crate::connection::PortOpener;
use crate::error::{ModbusError, ModbusResult};
use crate::slave::ModbusSlave;
use crate::transport::{open_port, ModbusTransport, SerialTransport, TcpTransport, TransportKind, UdpTransport};
use crate::utils::LatencyStats;

/// Modbus listener trait
#[async_trait]
pub trait ModbusListener: Send {
    /// Bind the channel and start serving in the background
    async fn start(&mut self) -> ModbusResult<()>;

    /// Signal every handler to finish and wait for the accept loop to exit
    async fn stop(&mut self) -> ModbusResult<()>;

    fn is_listening(&self) -> bool;

    /// Most recent failure of the listener itself, for supervisors
    fn last_error(&self) -> Option<String>;

    fn get_stats(&self) -> ListenerStats;

    /// Bound socket address; `None` before start and for serial lines
    fn local_addr(&self) -> Option<SocketAddr>;
}

/// Listener statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ListenerStats {
    pub connections: u64,
    pub requests: u64,
    pub exception_responses: u64,
    pub transport_errors: u64,
    pub latency: LatencyStats,
}

/// State shared between a listener and its handler tasks
#[derive(Debug, Default)]
struct ListenerState {
    listening: AtomicBool,
    last_error: Mutex<Option<String>>,
    stats: Mutex<ListenerStats>,
}

impl ListenerState {
    fn set_listening(&self, listening: bool) {
        self.listening.store(listening, Ordering::SeqCst);
    }

    fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    fn set_error(&self, error: &ModbusError) {
        if let Ok(mut last_error) = self.last_error.lock() {
            *last_error = Some(error.to_string());
        }
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|e| e.clone())
    }

    fn update(&self, f: impl FnOnce(&mut ListenerStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }

    fn snapshot(&self) -> ListenerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// Whether a read or write error ends the serving loop
fn ends_session(kind: TransportKind, error: &ModbusError) -> bool {
    match kind {
        // A byte stream is out of step after any framing failure
        TransportKind::Tcp => true,
        TransportKind::Udp => matches!(error, ModbusError::Connection { .. } | ModbusError::ConnectionClosed),
        TransportKind::Serial => error.is_connection_lost(),
    }
}

/// Serve requests on one transport until shutdown or a session-ending error
///
/// Returns the error that ended the session, if any; a clean close by the
/// peer is not an error. The transport is closed before returning.
async fn serve<T: ModbusTransport>(
    transport: &mut T,
    slave: &ModbusSlave,
    state: &ListenerState,
    shutdown: &mut broadcast::Receiver<()>,
) -> Option<ModbusError> {
    let kind = transport.kind();

    let outcome = loop {
        let result = tokio::select! {
            biased;
            _ = shutdown.recv() => break None,
            result = transport.read_request() => result,
        };

        let request = match result {
            Ok(request) => request,
            Err(ModbusError::Timeout { .. }) => continue,
            Err(ModbusError::ConnectionClosed) => break None,
            Err(e) => {
                state.update(|s| s.transport_errors += 1);
                if ends_session(kind, &e) {
                    break Some(e);
                }
                debug!("Dropping {} frame: {}", kind.tag(), e);
                continue;
            }
        };

        let started = Instant::now();
        let response = slave.handle_request(&request, kind);
        let elapsed = started.elapsed();
        let is_exception = response.as_ref().map_or(false, |r| r.is_exception());
        state.update(|s| {
            s.requests += 1;
            if is_exception {
                s.exception_responses += 1;
            }
            s.latency.record(elapsed);
        });

        if let Some(response) = response {
            if let Err(e) = transport.write_message(&response).await {
                state.update(|s| s.transport_errors += 1);
                if ends_session(kind, &e) {
                    break Some(e);
                }
                warn!("Failed to send {} response: {}", kind.tag(), e);
            }
        }
    };

    if let Err(e) = transport.close().await {
        debug!("Ignoring error while closing {} transport: {}", kind.tag(), e);
    }
    outcome
}

/// Signal a background task and wait for it
async fn shut_down(shutdown_tx: &mut Option<broadcast::Sender<()>>, task: &mut Option<JoinHandle<()>>) {
    if let Some(tx) = shutdown_tx.take() {
        let _ = tx.send(());
    }
    if let Some(task) = task.take() {
        if let Err(e) = task.await {
            error!("Listener task failed: {}", e);
        }
    }
}

/// Modbus TCP listener
pub struct ModbusTcpListener {
    config: TcpListenerConfig,
    slave: Arc<ModbusSlave>,
    state: Arc<ListenerState>,
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ModbusTcpListener {
    pub fn new(config: TcpListenerConfig, slave: Arc<ModbusSlave>) -> Self {
        Self {
            config,
            slave,
            state: Arc::new(ListenerState::default()),
            local_addr: None,
            shutdown_tx: None,
            task: None,
        }
    }

    pub fn slave(&self) -> &Arc<ModbusSlave> {
        &self.slave
    }
}

#[async_trait]
impl ModbusListener for ModbusTcpListener {
    async fn start(&mut self) -> ModbusResult<()> {
        if self.state.is_listening() {
            return Err(ModbusError::protocol("TCP listener is already running"));
        }

        let listener = match TcpListener::bind(self.config.bind_address).await {
            Ok(listener) => listener,
            Err(e) => {
                let err = ModbusError::connection(format!("Failed to bind to {}: {}", self.config.bind_address, e));
                self.state.set_error(&err);
                return Err(err);
            }
        };
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());
        self.state.set_listening(true);

        info!(
            "Modbus TCP listener started on {} (max connections {}, headless {})",
            local_addr, self.config.max_connections, self.config.headless
        );

        let config = self.config.clone();
        let slave = Arc::clone(&self.slave);
        let state = Arc::clone(&self.state);
        let limit = Arc::new(Semaphore::new(config.max_connections));

        self.task = Some(tokio::spawn(async move {
            loop {
                let permit = tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    permit = Arc::clone(&limit).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };
                let accepted = tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    accepted = listener.accept() => accepted,
                };

                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        let err = ModbusError::connection(format!("Failed to accept connection: {}", e));
                        error!("{}", err);
                        state.set_error(&err);
                        continue;
                    }
                };

                info!("Accepted Modbus TCP connection from {}", peer);
                state.update(|s| s.connections += 1);

                let mut transport = TcpTransport::new(stream, config.timeout);
                transport.set_headless(config.headless);
                transport.set_packet_logging(config.packet_logging);

                let slave = Arc::clone(&slave);
                let state = Arc::clone(&state);
                let mut handler_shutdown = shutdown_tx.subscribe();
                tokio::spawn(async move {
                    match serve(&mut transport, &slave, &state, &mut handler_shutdown).await {
                        Some(e) => warn!("Connection from {} ended: {}", peer, e),
                        None => info!("Connection from {} closed", peer),
                    }
                    drop(permit);
                });
            }

            state.set_listening(false);
            info!("Modbus TCP listener on {} stopped", local_addr);
        }));

        Ok(())
    }

    async fn stop(&mut self) -> ModbusResult<()> {
        shut_down(&mut self.shutdown_tx, &mut self.task).await;
        self.state.set_listening(false);
        Ok(())
    }

    fn is_listening(&self) -> bool {
        self.state.is_listening()
    }

    fn last_error(&self) -> Option<String> {
        self.state.last_error()
    }

    fn get_stats(&self) -> ListenerStats {
        self.state.snapshot()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

/// Modbus UDP listener
pub struct ModbusUdpListener {
    config: UdpListenerConfig,
    slave: Arc<ModbusSlave>,
    state: Arc<ListenerState>,
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ModbusUdpListener {
    pub fn new(config: UdpListenerConfig, slave: Arc<ModbusSlave>) -> Self {
        Self {
            config,
            slave,
            state: Arc::new(ListenerState::default()),
            local_addr: None,
            shutdown_tx: None,
            task: None,
        }
    }
}

#[async_trait]
impl ModbusListener for ModbusUdpListener {
    async fn start(&mut self) -> ModbusResult<()> {
        if self.state.is_listening() {
            return Err(ModbusError::protocol("UDP listener is already running"));
        }

        let socket = match UdpSocket::bind(self.config.bind_address).await {
            Ok(socket) => socket,
            Err(e) => {
                let err = ModbusError::connection(format!("Failed to bind to {}: {}", self.config.bind_address, e));
                self.state.set_error(&err);
                return Err(err);
            }
        };
        let local_addr = socket.local_addr()?;
        self.local_addr = Some(local_addr);

        let mut transport = UdpTransport::new(Arc::new(socket), self.config.timeout);
        transport.set_packet_logging(self.config.packet_logging);

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx);
        self.state.set_listening(true);
        info!("Modbus UDP listener started on {}", local_addr);

        let slave = Arc::clone(&self.slave);
        let state = Arc::clone(&self.state);
        self.task = Some(tokio::spawn(async move {
            if let Some(e) = serve(&mut transport, &slave, &state, &mut shutdown_rx).await {
                error!("Modbus UDP listener on {} failed: {}", local_addr, e);
                state.set_error(&e);
            }
            state.set_listening(false);
            info!("Modbus UDP listener on {} stopped", local_addr);
        }));

        Ok(())
    }

    async fn stop(&mut self) -> ModbusResult<()> {
        shut_down(&mut self.shutdown_tx, &mut self.task).await;
        self.state.set_listening(false);
        Ok(())
    }

    fn is_listening(&self) -> bool {
        self.state.is_listening()
    }

    fn last_error(&self) -> Option<String> {
        self.state.last_error()
    }

    fn get_stats(&self) -> ListenerStats {
        self.state.snapshot()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

/// Modbus serial listener owning one port
pub struct ModbusSerialListener<S = SerialStream> {
    params: SerialParameters,
    opener: PortOpener<S>,
    slave: Arc<ModbusSlave>,
    state: Arc<ListenerState>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ModbusSerialListener<SerialStream> {
    pub fn new(params: SerialParameters, slave: Arc<ModbusSlave>) -> Self {
        Self::with_opener(params, slave, Box::new(open_port))
    }
}

impl<S> ModbusSerialListener<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Create a listener whose port is produced by `opener`
    pub fn with_opener(params: SerialParameters, slave: Arc<ModbusSlave>, opener: PortOpener<S>) -> Self {
        Self {
            params,
            opener,
            slave,
            state: Arc::new(ListenerState::default()),
            shutdown_tx: None,
            task: None,
        }
    }

    pub fn parameters(&self) -> &SerialParameters {
        &self.params
    }
}

#[async_trait]
impl<S> ModbusListener for ModbusSerialListener<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn start(&mut self) -> ModbusResult<()> {
        if self.state.is_listening() {
            return Err(ModbusError::protocol("Serial listener is already running"));
        }

        let port = match (self.opener)(&self.params) {
            Ok(port) => port,
            Err(e) => {
                self.state.set_error(&e);
                return Err(e);
            }
        };
        let mut transport = SerialTransport::from_parameters(port, &self.params);

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx);
        self.state.set_listening(true);
        self.state.update(|s| s.connections += 1);

        let port_name = self.params.port_name.clone();
        info!(
            "Modbus serial listener started on {} ({:?}, {} baud)",
            port_name, self.params.encoding, self.params.baud_rate
        );

        let slave = Arc::clone(&self.slave);
        let state = Arc::clone(&self.state);
        self.task = Some(tokio::spawn(async move {
            if let Some(e) = serve(&mut transport, &slave, &state, &mut shutdown_rx).await {
                error!("Modbus serial listener on {} failed: {}", port_name, e);
                state.set_error(&e);
            }
            state.set_listening(false);
            info!("Modbus serial listener on {} stopped", port_name);
        }));

        Ok(())
    }

    async fn stop(&mut self) -> ModbusResult<()> {
        shut_down(&mut self.shutdown_tx, &mut self.task).await;
        self.state.set_listening(false);
        Ok(())
    }

    fn is_listening(&self) -> bool {
        self.state.is_listening()
    }

    fn last_error(&self) -> Option<String> {
        self.state.last_error()
    }

    fn get_stats(&self) -> ListenerStats {
        self.state.snapshot()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}
