//! Per-Client Handler
//!
//! Every accepted socket gets a [`ClientHandle`] (registered with the
//! server, used for sends and shutdown), a [`ClientTask`] that owns the
//! read half, the frame parser and the server side of the handshake, and a
//! writer task that drains the client's outbound queue into the write half.
//!
//! Sends never wait on the socket. They go into a bounded queue; a client
//! whose queue fills up, or whose socket does not accept a frame within
//! `write_timeout`, is closed without holding up anyone else.
//!
//! ## Client Lifecycle
//!
//! ```text
//! 1. Socket accepted, id assigned, handle registered
//!        │
//!        ▼
//! 2. Unauthenticated ──── CONNECT(secret) ───┬── match ──> CONNECT_RESULT(1)
//!        │                                    │             ClientConnected
//!        │ other commands: Error event,       │                 │
//!        │ dropped                            └─ mismatch ─> CONNECT_RESULT(0)
//!        │                                                  close
//!        ▼
//! 3. Authenticated: commands → Command events, WATCHDOG consumed
//!        │
//!        ▼
//! 4. EOF / error / close_client / stop
//!        │
//!        ▼
//! 5. Deregistered, ClientDisconnected
//! ```

use crate::connection::client::write_command;
use crate::connection::{ConnectionError, ConnectionState, EventDispatcher};
use crate::protocol::command::{command_type, Command};
use crate::protocol::parser::FrameParser;
use crate::server::listener::{ServerConfig, ServerError, ServerEvent};
use crate::server::registry::{ClientId, ClientRegistry};
use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

/// Read buffer size
const READ_BUFFER_SIZE: usize = 1024;

/// State shared by the listener and every client task.
pub(crate) struct ServerShared {
    pub(crate) config: ServerConfig,
    pub(crate) registry: ClientRegistry<ClientHandle>,
    pub(crate) events: EventDispatcher<ServerEvent>,
}

/// The server's handle on one connected client.
pub struct ClientHandle {
    id: ClientId,
    addr: SocketAddr,
    state: Mutex<ConnectionState>,
    outbound: Mutex<Option<mpsc::Sender<Command>>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ClientHandle {
    fn new(
        id: ClientId,
        addr: SocketAddr,
        outbound: mpsc::Sender<Command>,
        shutdown: watch::Sender<bool>,
    ) -> Self {
        Self {
            id,
            addr,
            state: Mutex::new(ConnectionState::Unauthenticated),
            outbound: Mutex::new(Some(outbound)),
            shutdown,
            task: Mutex::new(None),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == ConnectionState::Authenticated
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }

    /// Queues a command for this client.
    ///
    /// Only CONNECT_RESULT may go to a client that has not authenticated.
    /// A full queue means the client stopped reading: it is told to close
    /// and `SendQueueFull` is returned.
    pub(crate) fn send(&self, command: &Command) -> Result<(), ServerError> {
        match self.state() {
            ConnectionState::Disconnected => return Err(ServerError::ClientClosed(self.id)),
            ConnectionState::Unauthenticated
                if command.command_type() != command_type::CONNECT_RESULT =>
            {
                return Err(ServerError::NotAuthenticated(self.id))
            }
            _ => {}
        }
        self.enqueue(command.clone())
    }

    fn enqueue(&self, command: Command) -> Result<(), ServerError> {
        let outbound = self.outbound.lock().unwrap_or_else(|p| p.into_inner());
        let tx = outbound.as_ref().ok_or(ServerError::ClientClosed(self.id))?;

        match tx.try_send(command) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let _ = self.shutdown.send(true);
                Err(ServerError::SendQueueFull(self.id))
            }
            Err(TrySendError::Closed(_)) => Err(ServerError::ClientClosed(self.id)),
        }
    }

    /// Drops the queue sender; the writer task flushes what is queued and exits.
    fn close_outbound(&self) {
        self.outbound.lock().unwrap_or_else(|p| p.into_inner()).take();
    }

    /// Signals the client task to stop and waits for its teardown.
    ///
    /// Must not be called from the client's own task.
    pub(crate) async fn close(&self) {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(client_id = self.id, error = %e, "Client task failed");
            }
        }
    }

    fn set_task(&self, task: JoinHandle<()>) {
        *self.task.lock().unwrap_or_else(|p| p.into_inner()) = Some(task);
    }
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("state", &self.state())
            .finish()
    }
}

/// Registers an accepted socket and starts its reader and writer tasks.
pub(crate) fn spawn_client(
    shared: &Arc<ServerShared>,
    stream: tokio::net::TcpStream,
    addr: SocketAddr,
) -> ClientId {
    let id = shared.registry.allocate_id();
    if let Err(e) = stream.set_nodelay(true) {
        debug!(client_id = id, error = %e, "Failed to set TCP_NODELAY");
    }

    let (reader, writer) = stream.into_split();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (outbound_tx, outbound_rx) = mpsc::channel(shared.config.send_queue_depth.max(1));
    let handle = Arc::new(ClientHandle::new(id, addr, outbound_tx, shutdown_tx));
    shared.registry.insert(id, Arc::clone(&handle));

    let writer_task = tokio::spawn(write_loop(
        Arc::clone(shared),
        Arc::clone(&handle),
        writer,
        outbound_rx,
    ));

    let task = ClientTask {
        shared: Arc::clone(shared),
        handle: Arc::clone(&handle),
        reader,
        parser: FrameParser::new(shared.config.buffer_capacity),
        shutdown: shutdown_rx,
        writer_task: Some(writer_task),
    };
    handle.set_task(tokio::spawn(task.run()));

    info!(client = %addr, client_id = id, "Client connected");
    id
}

/// Drains a client's outbound queue into its socket.
///
/// Ends when the queue sender is dropped or a write fails or times out. A
/// failed write is reported and stops the reader too.
async fn write_loop(
    shared: Arc<ServerShared>,
    handle: Arc<ClientHandle>,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Command>,
) {
    let write_timeout = shared.config.write_timeout;

    while let Some(command) = outbound.recv().await {
        let result = match timeout(write_timeout, write_command(&mut writer, &command)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("client did not accept a frame within {:?}", write_timeout),
            )),
        };

        if let Err(e) = result {
            warn!(client = %handle.addr, client_id = handle.id, error = %e, "Client write failed");
            shared.events.publish(ServerEvent::Error {
                client_id: handle.id,
                message: ServerError::Io(e).to_string(),
            });
            let _ = handle.shutdown.send(true);
            return;
        }
    }

    let _ = writer.shutdown().await;
}

/// Read loop and server-side protocol for one client.
struct ClientTask {
    shared: Arc<ServerShared>,
    handle: Arc<ClientHandle>,
    reader: OwnedReadHalf,
    parser: FrameParser,
    shutdown: watch::Receiver<bool>,
    writer_task: Option<JoinHandle<()>>,
}

impl ClientTask {
    async fn run(mut self) {
        let id = self.handle.id;
        let addr = self.handle.addr;

        match self.main_loop().await {
            Ok(()) => debug!(client = %addr, client_id = id, "Client closed"),
            Err(ConnectionError::PeerClosed) => {
                info!(client = %addr, client_id = id, "Client disconnected")
            }
            Err(e) => {
                warn!(client = %addr, client_id = id, error = %e, "Client error");
                self.publish_error(e.to_string());
            }
        }

        self.teardown().await;
    }

    async fn main_loop(&mut self) -> Result<(), ConnectionError> {
        let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return Ok(());
                    }
                }
                read = self.reader.read_buf(&mut buffer) => {
                    if read? == 0 {
                        return Err(ConnectionError::PeerClosed);
                    }
                    trace!(client_id = self.handle.id, bytes = buffer.len(), "Read data");
                    let results = self.parser.feed(&buffer);
                    buffer.clear();
                    for result in results {
                        match result {
                            Ok(command) => self.on_command(command)?,
                            Err(e) if e.is_fatal() || self.close_on_malformed() => {
                                return Err(e.into())
                            }
                            Err(e) => self.publish_error(e.to_string()),
                        }
                    }
                }
            }
        }
    }

    fn on_command(&mut self, command: Command) -> Result<(), ConnectionError> {
        let id = self.handle.id;

        match (command.command_type(), self.handle.state()) {
            (command_type::CONNECT, ConnectionState::Unauthenticated) => {
                let secret = command.string_data().ok();
                let accepted = secret == Some(self.shared.config.password.as_str());
                self.reply(Command::connect_result(accepted))?;
                if !accepted {
                    return Err(ConnectionError::AuthenticationFailed);
                }
                self.handle.set_state(ConnectionState::Authenticated);
                info!(client = %self.handle.addr, client_id = id, "Client authenticated");
                self.shared.events.publish(ServerEvent::ClientConnected(id));
            }
            (command_type::CONNECT, _) => {
                trace!(client_id = id, "Ignoring repeated CONNECT");
            }
            (command_type::WATCHDOG, ConnectionState::Authenticated) => {
                trace!(client_id = id, "Watchdog");
            }
            (t, ConnectionState::Authenticated) => {
                trace!(client_id = id, command_type = t, "Received command");
                self.shared.events.publish(ServerEvent::Command {
                    client_id: id,
                    command,
                });
            }
            (t, _) => {
                debug!(client_id = id, command_type = t, "Dropping unauthenticated command");
                self.publish_error(ConnectionError::NotAuthenticated(t).to_string());
            }
        }

        Ok(())
    }

    fn reply(&self, command: Command) -> Result<(), ConnectionError> {
        self.handle
            .enqueue(command)
            .map_err(|_| ConnectionError::NotConnected)
    }

    fn close_on_malformed(&self) -> bool {
        self.shared.config.close_on_malformed_frame
    }

    fn publish_error(&self, message: String) {
        self.shared.events.publish(ServerEvent::Error {
            client_id: self.handle.id,
            message,
        });
    }

    async fn teardown(&mut self) {
        let id = self.handle.id;
        self.shared.registry.remove(id);
        self.handle.set_state(ConnectionState::Disconnected);
        self.parser.clear();

        // Let queued frames (e.g. a failed CONNECT_RESULT) go out, but never
        // wait on a client that stopped reading
        self.handle.close_outbound();
        if let Some(mut writer_task) = self.writer_task.take() {
            if timeout(self.shared.config.write_timeout, &mut writer_task)
                .await
                .is_err()
            {
                debug!(client_id = id, "Writer still blocked, aborting");
                writer_task.abort();
            }
        }

        self.shared.events.publish(ServerEvent::ClientDisconnected(id));
    }
}
