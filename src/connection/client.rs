//! Client Connection
//!
//! A [`Connection`] is the host side of the link: it opens a transport,
//! authenticates with the shared secret, keeps the peer's watchdog fed and
//! publishes everything that happens as [`ConnectionEvent`]s.
//!
//! ## Lifecycle
//!
//! ```text
//!                 connect()
//!  Disconnected ─────────────> Unauthenticated ──┐ tick: send CONNECT(secret)
//!       ▲                          │     ▲       │
//!       │  CONNECT_RESULT(0)       │     └───────┘
//!       ├──────────────────────────┤
//!       │                          │ CONNECT_RESULT(1) → Connected event
//!       │                          ▼
//!       │   close() / error   Authenticated ──┐ tick: send WATCHDOG
//!       └─────────────────────────────────────┘<┘
//! ```
//!
//! ## Task Model
//!
//! Each connection runs one tokio task that selects over three sources:
//! transport reads, the liveness ticker, and the shutdown signal. One unit
//! of work (a read chunk or a tick) is handled per loop turn, so a tick
//! that blocks on a stuck transport also holds back reads.

use crate::connection::events::EventDispatcher;
use crate::filter::{DebounceConfig, DebounceFilter};
use crate::protocol::command::{command_type, CodecError, Command, CONNECT_SUCCESSFUL};
use crate::protocol::parser::{FrameParser, ParseError, DEFAULT_BUFFER_CAPACITY};
use crate::transport::{BaudRate, BoxedTransport, SerialTransport, Transport};
use bytes::BytesMut;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

/// Shared secret both ends of the link are flashed/configured with.
pub const DEFAULT_PASSWORD: &str = "iddqdidkfa";

/// Default period of the handshake retry / watchdog timer.
pub const DEFAULT_LIVENESS_INTERVAL: Duration = Duration::from_millis(1000);

/// Pin-change notification sent by the firmware, `[pin, value]`.
pub const DEFAULT_DEBOUNCE_TYPE: u8 = 0x71;

/// Read buffer size
const READ_BUFFER_SIZE: usize = 1024;

/// Configuration for a client [`Connection`].
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Shared secret sent in the CONNECT command
    pub password: String,

    /// Period of the liveness timer (default: 1s)
    pub liveness_interval: Duration,

    /// Send WATCHDOG frames once authenticated. The CONNECT retry runs
    /// regardless.
    pub watchdog_enabled: bool,

    /// Parser buffer capacity
    pub buffer_capacity: usize,

    /// Debounce settings for `debounce_type` notifications
    pub debounce: DebounceConfig,

    /// Command type filtered by the debouncer, keyed on its first payload
    /// byte. `None` disables debouncing entirely.
    pub debounce_type: Option<u8>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            password: DEFAULT_PASSWORD.to_string(),
            liveness_interval: DEFAULT_LIVENESS_INTERVAL,
            watchdog_enabled: true,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            debounce: DebounceConfig::default(),
            debounce_type: Some(DEFAULT_DEBOUNCE_TYPE),
        }
    }
}

/// Authentication state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport open
    Disconnected,
    /// Transport open, handshake in progress
    Unauthenticated,
    /// Handshake accepted by the peer
    Authenticated,
}

/// Events published by a [`Connection`].
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// The peer accepted the handshake
    Connected,
    /// The transport was closed; this is always the last event
    Disconnected,
    /// A command arrived from the peer
    Command(Command),
    /// Something went wrong. Fatal errors are followed by `Disconnected`.
    Error(String),
}

/// Errors that can occur on a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("not connected")]
    NotConnected,

    /// Only the handshake may be sent before authentication
    #[error("command {0:#04x} rejected: connection is not authenticated")]
    NotAuthenticated(u8),

    #[error("already connected")]
    AlreadyConnected,

    #[error("Authentication error. Password incorrect")]
    AuthenticationFailed,

    #[error("connection closed by peer")]
    PeerClosed,

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

type Writer = WriteHalf<BoxedTransport>;
type Reader = ReadHalf<BoxedTransport>;

/// State shared between the connection handle and its task.
struct Shared {
    config: ConnectionConfig,
    state: Mutex<ConnectionState>,
    writer: tokio::sync::Mutex<Option<Writer>>,
    events: EventDispatcher<ConnectionEvent>,
    /// Current debounce settings; starts as `config.debounce`
    debounce: watch::Sender<DebounceConfig>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }

    async fn write(&self, command: &Command) -> Result<(), ConnectionError> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(ConnectionError::NotConnected)?;
        write_command(writer, command).await?;
        Ok(())
    }
}

/// Writes one encoded command and flushes it.
pub(crate) async fn write_command<W>(writer: &mut W, command: &Command) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(&command.encode()).await?;
    writer.flush().await?;
    trace!(command = %command, "Sent command");
    Ok(())
}

/// Host side of a command link.
///
/// # Example
///
/// ```ignore
/// use cmdlink::connection::{Connection, ConnectionConfig, ConnectionEvent};
/// use cmdlink::protocol::Command;
///
/// let mut link = Connection::new(ConnectionConfig::default());
/// let mut events = link.subscribe();
/// link.connect_tcp("127.0.0.1:8888").await?;
///
/// while let Some(event) = events.recv().await {
///     if event == ConnectionEvent::Connected {
///         link.send(&Command::from_string(63, "Hello, server!!!")?).await?;
///     }
/// }
/// ```
pub struct Connection {
    shared: Arc<Shared>,
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl Connection {
    pub fn new(config: ConnectionConfig) -> Self {
        let (debounce, _) = watch::channel(config.debounce.clone());
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(ConnectionState::Disconnected),
                writer: tokio::sync::Mutex::new(None),
                events: EventDispatcher::new(),
                debounce,
            }),
            shutdown: None,
            task: None,
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    /// Subscribes to this connection's events.
    ///
    /// Subscriptions end when the connection closes; subscribe again
    /// before reconnecting.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == ConnectionState::Authenticated
    }

    /// Current debounce settings.
    pub fn debounce(&self) -> DebounceConfig {
        self.shared.debounce.borrow().clone()
    }

    /// Changes the debounce settings, including on a live connection.
    ///
    /// Applies to every pin notification read after the call and survives
    /// reconnects.
    pub fn set_debounce(&self, config: DebounceConfig) {
        debug!(enabled = config.enabled, interval = ?config.interval, "Debounce updated");
        self.shared.debounce.send_replace(config);
    }

    /// Connects to a relay server over TCP.
    pub async fn connect_tcp<A: ToSocketAddrs>(
        &mut self,
        addr: A,
    ) -> Result<(), ConnectionError> {
        self.ensure_disconnected()?;
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        self.connect_with(stream)
    }

    /// Opens a serial port to the microcontroller.
    pub fn connect_serial(
        &mut self,
        path: &str,
        baud_rate: BaudRate,
    ) -> Result<(), ConnectionError> {
        self.ensure_disconnected()?;
        let transport = SerialTransport::open(path, baud_rate)?;
        self.connect_with(transport)
    }

    /// Starts the connection over an already open transport.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect_with<T: Transport>(&mut self, transport: T) -> Result<(), ConnectionError> {
        self.ensure_disconnected()?;
        let hello = Command::connect(&self.shared.config.password)?;

        let (reader, writer) = tokio::io::split(Box::new(transport) as BoxedTransport);

        // The previous task, if any, has finished its teardown
        self.task = None;

        let writer_slot = self.shared.writer.try_lock();
        match writer_slot {
            Ok(mut slot) => *slot = Some(writer),
            Err(_) => return Err(ConnectionError::AlreadyConnected),
        }
        self.shared.set_state(ConnectionState::Unauthenticated);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut debounce_updates = self.shared.debounce.subscribe();
        let debounce = DebounceFilter::new(debounce_updates.borrow_and_update().clone());
        let task = ConnectionTask {
            shared: Arc::clone(&self.shared),
            reader,
            parser: FrameParser::new(self.shared.config.buffer_capacity),
            debounce,
            debounce_updates,
            hello,
            shutdown: shutdown_rx,
        };

        self.task = Some(tokio::spawn(task.run()));
        self.shutdown = Some(shutdown_tx);

        info!("Transport open, authenticating");
        Ok(())
    }

    /// Sends a command to the peer.
    ///
    /// Fails immediately if the transport is not open, or if the
    /// connection is not yet authenticated and `command` is not CONNECT.
    pub async fn send(&self, command: &Command) -> Result<(), ConnectionError> {
        match self.state() {
            ConnectionState::Disconnected => return Err(ConnectionError::NotConnected),
            ConnectionState::Unauthenticated
                if command.command_type() != command_type::CONNECT =>
            {
                return Err(ConnectionError::NotAuthenticated(command.command_type()))
            }
            _ => {}
        }

        match self.shared.write(command).await {
            Err(ConnectionError::Io(e)) => {
                let message = format!("I/O error: {}", e);
                self.shared.events.publish(ConnectionEvent::Error(message));
                if let Some(shutdown) = &self.shutdown {
                    let _ = shutdown.send(true);
                }
                Err(ConnectionError::Io(e))
            }
            other => other,
        }
    }

    /// Closes the connection and waits for its task to finish.
    ///
    /// Publishes `Disconnected` (if the connection was open) and ends all
    /// event subscriptions.
    pub async fn close(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Connection task failed");
            }
        }
    }

    fn ensure_disconnected(&self) -> Result<(), ConnectionError> {
        if self.state() != ConnectionState::Disconnected {
            return Err(ConnectionError::AlreadyConnected);
        }
        Ok(())
    }
}

/// The per-connection task: read loop, liveness timer and protocol logic.
struct ConnectionTask {
    shared: Arc<Shared>,
    reader: Reader,
    parser: FrameParser,
    debounce: DebounceFilter<u8>,
    debounce_updates: watch::Receiver<DebounceConfig>,
    hello: Command,
    shutdown: watch::Receiver<bool>,
}

impl ConnectionTask {
    async fn run(mut self) {
        let result = self.main_loop().await;

        match &result {
            Ok(()) => debug!("Connection closed"),
            Err(ConnectionError::PeerClosed) => info!("Connection closed by peer"),
            Err(e) => {
                warn!(error = %e, "Connection error");
                self.shared.events.publish(ConnectionEvent::Error(e.to_string()));
            }
        }

        self.teardown().await;
    }

    async fn main_loop(&mut self) -> Result<(), ConnectionError> {
        let mut ticker = tokio::time::interval(self.shared.config.liveness_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return Ok(());
                    }
                }
                _ = ticker.tick() => self.on_tick().await?,
                read = self.reader.read_buf(&mut buffer) => {
                    if read? == 0 {
                        return Err(ConnectionError::PeerClosed);
                    }
                    trace!(bytes = buffer.len(), "Read data");
                    let results = self.parser.feed(&buffer);
                    buffer.clear();
                    for result in results {
                        match result {
                            Ok(command) => self.on_command(command)?,
                            Err(e) if e.is_fatal() => return Err(e.into()),
                            Err(e) => {
                                let message = e.to_string();
                                self.shared.events.publish(ConnectionEvent::Error(message));
                            }
                        }
                    }
                }
            }
        }
    }

    /// Liveness timer: retry the handshake, or feed the peer's watchdog.
    async fn on_tick(&mut self) -> Result<(), ConnectionError> {
        match self.shared.state() {
            ConnectionState::Unauthenticated => {
                trace!("Sending CONNECT");
                self.shared.write(&self.hello).await
            }
            ConnectionState::Authenticated if self.shared.config.watchdog_enabled => {
                self.shared.write(&Command::watchdog()).await
            }
            _ => Ok(()),
        }
    }

    fn on_command(&mut self, command: Command) -> Result<(), ConnectionError> {
        let events = &self.shared.events;

        match command.command_type() {
            command_type::CONNECT_RESULT => {
                if self.shared.state() != ConnectionState::Unauthenticated {
                    debug!("Ignoring CONNECT_RESULT on authenticated link");
                    return Ok(());
                }
                if command.integer_data(4, 0).ok() != Some(u64::from(CONNECT_SUCCESSFUL)) {
                    return Err(ConnectionError::AuthenticationFailed);
                }
                self.shared.set_state(ConnectionState::Authenticated);
                info!("Authenticated");
                events.publish(ConnectionEvent::Connected);
            }
            command_type::DEVICE_ERROR => {
                let message = String::from_utf8_lossy(command.payload()).into_owned();
                warn!(message = %message, "Device reported an error");
                events.publish(ConnectionEvent::Error(message));
                events.publish(ConnectionEvent::Command(command));
            }
            t if Some(t) == self.shared.config.debounce_type => {
                self.refresh_debounce();
                let passes = match command.payload().first() {
                    Some(&key) => self.debounce.should_dispatch(key, Instant::now()),
                    None => true,
                };
                if passes {
                    self.shared.events.publish(ConnectionEvent::Command(command));
                } else {
                    trace!(command = %command, "Debounced");
                }
            }
            _ => events.publish(ConnectionEvent::Command(command)),
        }

        Ok(())
    }

    /// Picks up settings changed through `Connection::set_debounce`.
    fn refresh_debounce(&mut self) {
        if self.debounce_updates.has_changed().unwrap_or(false) {
            let config = self.debounce_updates.borrow_and_update().clone();
            self.debounce.set_enabled(config.enabled);
            self.debounce.set_interval(config.interval);
        }
    }

    async fn teardown(&mut self) {
        // Writer goes first: a reconnect is only possible once the state
        // reads Disconnected, and it installs a new writer
        if let Some(mut writer) = self.shared.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.parser.clear();

        self.shared.set_state(ConnectionState::Disconnected);
        self.shared
            .events
            .publish_final(ConnectionEvent::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio::time::timeout;
    use tokio_test::{assert_err, assert_ok};

    const WAIT: Duration = Duration::from_secs(2);

    /// The far end of an in-memory link.
    struct Peer {
        stream: DuplexStream,
        parser: FrameParser,
        pending: VecDeque<Command>,
    }

    impl Peer {
        async fn next_command(&mut self) -> Command {
            loop {
                if let Some(command) = self.pending.pop_front() {
                    return command;
                }
                let mut buf = [0u8; 256];
                let n = timeout(WAIT, self.stream.read(&mut buf))
                    .await
                    .expect("timed out waiting for a frame")
                    .unwrap();
                assert!(n > 0, "connection closed");
                for result in self.parser.feed(&buf[..n]) {
                    self.pending.push_back(result.unwrap());
                }
            }
        }

        async fn send(&mut self, command: Command) {
            self.write_raw(&command.encode()).await;
        }

        async fn write_raw(&mut self, data: &[u8]) {
            self.stream.write_all(data).await.unwrap();
        }
    }

    fn test_config() -> ConnectionConfig {
        ConnectionConfig {
            password: "correct-secret".to_string(),
            liveness_interval: Duration::from_millis(50),
            ..Default::default()
        }
    }

    fn open(
        config: ConnectionConfig,
    ) -> (Connection, mpsc::UnboundedReceiver<ConnectionEvent>, Peer) {
        let (local, remote) = tokio::io::duplex(4096);
        let mut connection = Connection::new(config);
        let events = connection.subscribe();
        connection.connect_with(local).unwrap();
        let peer = Peer {
            stream: remote,
            parser: FrameParser::default(),
            pending: VecDeque::new(),
        };
        (connection, events, peer)
    }

    async fn next_event(
        events: &mut mpsc::UnboundedReceiver<ConnectionEvent>,
    ) -> Option<ConnectionEvent> {
        timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for an event")
    }

    async fn authenticate(peer: &mut Peer, events: &mut mpsc::UnboundedReceiver<ConnectionEvent>) {
        let hello = peer.next_command().await;
        assert_eq!(hello.command_type(), command_type::CONNECT);
        peer.send(Command::connect_result(true)).await;
        assert_eq!(next_event(events).await, Some(ConnectionEvent::Connected));
    }

    #[tokio::test]
    async fn test_handshake_success() {
        let (mut connection, mut events, mut peer) = open(test_config());
        assert_eq!(connection.state(), ConnectionState::Unauthenticated);

        let hello = peer.next_command().await;
        assert_eq!(hello.command_type(), command_type::CONNECT);
        assert_eq!(hello.string_data().unwrap(), "correct-secret");

        peer.send(Command::connect_result(true)).await;
        assert_eq!(next_event(&mut events).await, Some(ConnectionEvent::Connected));
        assert!(connection.is_authenticated());

        // Retries queued before the reply may still be in flight; after
        // them only watchdog frames follow
        let mut next = peer.next_command().await;
        while next.command_type() == command_type::CONNECT {
            next = peer.next_command().await;
        }
        assert_eq!(next, Command::watchdog());
        assert_eq!(peer.next_command().await, Command::watchdog());

        connection.close().await;
        assert_eq!(next_event(&mut events).await, Some(ConnectionEvent::Disconnected));
        assert_eq!(next_event(&mut events).await, None);
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_handshake_retried_every_tick() {
        let (mut connection, _events, mut peer) = open(test_config());

        for _ in 0..3 {
            let hello = peer.next_command().await;
            assert_eq!(hello.command_type(), command_type::CONNECT);
        }
        assert_eq!(connection.state(), ConnectionState::Unauthenticated);
        connection.close().await;
    }

    #[tokio::test]
    async fn test_handshake_failure() {
        let (connection, mut events, mut peer) = open(test_config());

        peer.next_command().await;
        peer.send(Command::connect_result(false)).await;

        assert_eq!(
            next_event(&mut events).await,
            Some(ConnectionEvent::Error(
                "Authentication error. Password incorrect".to_string()
            ))
        );
        assert_eq!(next_event(&mut events).await, Some(ConnectionEvent::Disconnected));
        assert_eq!(next_event(&mut events).await, None);
        assert_eq!(connection.state(), ConnectionState::Disconnected);

        let err = connection.send(&Command::from_integer(0x51, 1)).await;
        assert!(matches!(err, Err(ConnectionError::NotConnected)));
        let err = connection.send(&Command::connect("x").unwrap()).await;
        assert!(matches!(err, Err(ConnectionError::NotConnected)));
    }

    #[tokio::test]
    async fn test_send_requires_authentication() {
        let (mut connection, mut events, mut peer) = open(test_config());

        let err = connection.send(&Command::from_integer(0x51, 1)).await;
        assert!(matches!(err, Err(ConnectionError::NotAuthenticated(0x51))));

        // The handshake itself is allowed through
        assert_ok!(connection.send(&Command::connect("correct-secret").unwrap()).await);

        authenticate(&mut peer, &mut events).await;
        assert_ok!(connection.send(&Command::from_integer(0x51, 1)).await);

        connection.close().await;
    }

    #[tokio::test]
    async fn test_send_before_connect() {
        let connection = Connection::new(test_config());
        assert_err!(connection.send(&Command::connect("x").unwrap()).await);
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_inbound_commands_are_published() {
        let (mut connection, mut events, mut peer) = open(test_config());
        authenticate(&mut peer, &mut events).await;

        let cmd = Command::from_float(61, 12.67);
        peer.send(cmd.clone()).await;
        assert_eq!(next_event(&mut events).await, Some(ConnectionEvent::Command(cmd)));

        connection.close().await;
    }

    #[tokio::test]
    async fn test_device_error_is_reported() {
        let (mut connection, mut events, mut peer) = open(test_config());

        let report = Command::from_string(command_type::DEVICE_ERROR, "motor stalled").unwrap();
        peer.send(report.clone()).await;

        assert_eq!(
            next_event(&mut events).await,
            Some(ConnectionEvent::Error("motor stalled".to_string()))
        );
        assert_eq!(next_event(&mut events).await, Some(ConnectionEvent::Command(report)));
        assert_eq!(connection.state(), ConnectionState::Unauthenticated);

        connection.close().await;
    }

    #[tokio::test]
    async fn test_pin_notifications_are_debounced() {
        let (mut connection, mut events, mut peer) = open(test_config());

        let pin3_high = Command::new(DEFAULT_DEBOUNCE_TYPE, vec![3, 1]).unwrap();
        let pin3_low = Command::new(DEFAULT_DEBOUNCE_TYPE, vec![3, 0]).unwrap();
        let pin4_high = Command::new(DEFAULT_DEBOUNCE_TYPE, vec![4, 1]).unwrap();
        let marker = Command::new(0x10, vec![]).unwrap();

        let mut burst = Vec::new();
        for cmd in [&pin3_high, &pin3_low, &pin3_high, &pin4_high, &marker] {
            burst.extend_from_slice(&cmd.encode());
        }
        peer.write_raw(&burst).await;

        assert_eq!(next_event(&mut events).await, Some(ConnectionEvent::Command(pin3_high)));
        assert_eq!(next_event(&mut events).await, Some(ConnectionEvent::Command(pin4_high)));
        assert_eq!(next_event(&mut events).await, Some(ConnectionEvent::Command(marker)));

        connection.close().await;
    }

    #[tokio::test]
    async fn test_debounce_can_be_disabled() {
        let config = ConnectionConfig {
            debounce_type: None,
            ..test_config()
        };
        let (mut connection, mut events, mut peer) = open(config);

        let pin = Command::new(DEFAULT_DEBOUNCE_TYPE, vec![3, 1]).unwrap();
        peer.send(pin.clone()).await;
        peer.send(pin.clone()).await;

        assert_eq!(next_event(&mut events).await, Some(ConnectionEvent::Command(pin.clone())));
        assert_eq!(next_event(&mut events).await, Some(ConnectionEvent::Command(pin)));

        connection.close().await;
    }

    #[tokio::test]
    async fn test_debounce_reconfigured_at_runtime() {
        let (mut connection, mut events, mut peer) = open(test_config());

        let pin = Command::new(DEFAULT_DEBOUNCE_TYPE, vec![5, 1]).unwrap();
        let marker = Command::new(0x10, vec![]).unwrap();

        peer.send(pin.clone()).await;
        peer.send(pin.clone()).await;
        peer.send(marker.clone()).await;
        assert_eq!(next_event(&mut events).await, Some(ConnectionEvent::Command(pin.clone())));
        assert_eq!(next_event(&mut events).await, Some(ConnectionEvent::Command(marker.clone())));

        connection.set_debounce(DebounceConfig {
            enabled: false,
            ..DebounceConfig::default()
        });
        assert!(!connection.debounce().enabled);

        peer.send(pin.clone()).await;
        peer.send(pin.clone()).await;
        assert_eq!(next_event(&mut events).await, Some(ConnectionEvent::Command(pin.clone())));
        assert_eq!(next_event(&mut events).await, Some(ConnectionEvent::Command(pin.clone())));

        // Back on with a window long enough to swallow the repeat
        connection.set_debounce(DebounceConfig {
            enabled: true,
            interval: Duration::from_secs(60),
        });
        peer.send(pin.clone()).await;
        peer.send(pin.clone()).await;
        peer.send(marker.clone()).await;
        assert_eq!(next_event(&mut events).await, Some(ConnectionEvent::Command(pin)));
        assert_eq!(next_event(&mut events).await, Some(ConnectionEvent::Command(marker)));

        connection.close().await;
    }

    #[tokio::test]
    async fn test_malformed_frame_is_not_fatal() {
        let (mut connection, mut events, mut peer) = open(test_config());

        peer.write_raw(&[0x78, 0x78, 0x09, 0x01, 0xAA, 0x0D, 0x0A]).await;
        let good = Command::new(0x02, vec![0xBB]).unwrap();
        peer.send(good.clone()).await;

        assert!(matches!(
            next_event(&mut events).await,
            Some(ConnectionEvent::Error(_))
        ));
        assert_eq!(next_event(&mut events).await, Some(ConnectionEvent::Command(good)));
        assert_eq!(connection.state(), ConnectionState::Unauthenticated);

        connection.close().await;
    }

    #[tokio::test]
    async fn test_overflow_closes_connection() {
        let config = ConnectionConfig {
            buffer_capacity: 16,
            ..test_config()
        };
        let (connection, mut events, mut peer) = open(config);

        peer.write_raw(&[0x11u8; 20]).await;

        match next_event(&mut events).await {
            Some(ConnectionEvent::Error(message)) => assert!(message.contains("overflow")),
            other => panic!("expected overflow error, got {:?}", other),
        }
        assert_eq!(next_event(&mut events).await, Some(ConnectionEvent::Disconnected));
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_peer_close_disconnects() {
        let (connection, mut events, mut peer) = open(test_config());
        peer.next_command().await;
        drop(peer);

        assert_eq!(next_event(&mut events).await, Some(ConnectionEvent::Disconnected));
        assert_eq!(next_event(&mut events).await, None);
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_reconnect_after_close() {
        let (mut connection, _events, _peer) = open(test_config());

        let (again, _) = tokio::io::duplex(64);
        assert!(matches!(
            connection.connect_with(again),
            Err(ConnectionError::AlreadyConnected)
        ));

        connection.close().await;
        assert_eq!(connection.state(), ConnectionState::Disconnected);

        let (local, remote) = tokio::io::duplex(4096);
        let mut events = connection.subscribe();
        connection.connect_with(local).unwrap();
        let mut peer = Peer {
            stream: remote,
            parser: FrameParser::default(),
            pending: VecDeque::new(),
        };
        authenticate(&mut peer, &mut events).await;

        connection.close().await;
    }

    #[tokio::test]
    async fn test_oversized_password_is_rejected() {
        let config = ConnectionConfig {
            password: "x".repeat(300),
            ..test_config()
        };
        let mut connection = Connection::new(config);
        let (local, _remote) = tokio::io::duplex(64);

        assert!(matches!(
            connection.connect_with(local),
            Err(ConnectionError::Codec(CodecError::PayloadTooLarge { .. }))
        ));
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }
}
