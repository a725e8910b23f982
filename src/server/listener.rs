//! Connection Server
//!
//! Listens on a TCP port and runs one [`ClientTask`](super::handler) per
//! accepted socket. Per-client events are fanned in to a single
//! subscriber stream, tagged with the client id.

use crate::connection::{EventDispatcher, DEFAULT_PASSWORD};
use crate::protocol::command::Command;
use crate::protocol::parser::DEFAULT_BUFFER_CAPACITY;
use crate::server::handler::{spawn_client, ClientHandle, ServerShared};
use crate::server::registry::{ClientId, ClientRegistry};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Default relay port
pub const DEFAULT_PORT: u16 = 8888;

/// Frames queued per client before it counts as stalled
pub const DEFAULT_SEND_QUEUE_DEPTH: usize = 64;

/// How long one frame may take to reach a client's socket
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for a [`ConnectionServer`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind to (default: all interfaces)
    pub host: String,

    /// Port to listen on; 0 picks an ephemeral port
    pub port: u16,

    /// Shared secret clients must present in CONNECT
    pub password: String,

    /// Parser buffer capacity per client
    pub buffer_capacity: usize,

    /// Close a client whose stream contains a malformed frame. When false
    /// the frame is reported as an `Error` event and the client stays up.
    pub close_on_malformed_frame: bool,

    /// Connections beyond this many are dropped on accept
    pub max_clients: usize,

    /// Outbound frames buffered per client. A client whose queue is full
    /// is closed.
    pub send_queue_depth: usize,

    /// A client whose socket blocks a single write longer than this is
    /// closed
    pub write_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            password: DEFAULT_PASSWORD.to_string(),
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            close_on_malformed_frame: true,
            max_clients: 64,
            send_queue_depth: DEFAULT_SEND_QUEUE_DEPTH,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

impl ServerConfig {
    /// Returns the bind address as a string
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Events published by a [`ConnectionServer`].
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// A client completed the handshake
    ClientConnected(ClientId),
    /// A client's socket was closed
    ClientDisconnected(ClientId),
    /// A command arrived from an authenticated client
    Command { client_id: ClientId, command: Command },
    /// A client misbehaved or its transport failed
    Error { client_id: ClientId, message: String },
    /// The server stopped; this is always the last event
    Stopped,
}

/// Errors returned by [`ConnectionServer`] operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("server already started")]
    AlreadyStarted,

    #[error("server not started")]
    NotStarted,

    #[error("no client with id {0}")]
    UnknownClient(ClientId),

    #[error("client {0} has not authenticated")]
    NotAuthenticated(ClientId),

    #[error("client {0} is closed")]
    ClientClosed(ClientId),

    /// The client stopped reading and was disconnected
    #[error("client {0} is not keeping up, send queue full")]
    SendQueueFull(ClientId),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Multi-client TCP endpoint of the command protocol.
///
/// # Example
///
/// ```ignore
/// use cmdlink::server::{ConnectionServer, ServerConfig, ServerEvent};
///
/// let mut server = ConnectionServer::new(ServerConfig::default());
/// let mut events = server.subscribe();
/// server.start().await?;
///
/// while let Some(event) = events.recv().await {
///     if let ServerEvent::Command { client_id, command } = event {
///         server.send(&command, client_id)?;
///     }
/// }
/// ```
pub struct ConnectionServer {
    shared: Arc<ServerShared>,
    shutdown: Option<watch::Sender<bool>>,
    accept_task: Option<JoinHandle<TcpListener>>,
    local_addr: Option<SocketAddr>,
}

impl ConnectionServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            shared: Arc::new(ServerShared {
                config,
                registry: ClientRegistry::new(),
                events: EventDispatcher::new(),
            }),
            shutdown: None,
            accept_task: None,
            local_addr: None,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Subscribes to server events.
    ///
    /// Subscriptions end after `Stopped`.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ServerEvent> {
        self.shared.events.subscribe()
    }

    /// Binds the listening socket and starts accepting clients.
    ///
    /// Returns the bound address, which differs from the configured one
    /// when port 0 was requested.
    pub async fn start(&mut self) -> Result<SocketAddr, ServerError> {
        if self.accept_task.is_some() {
            return Err(ServerError::AlreadyStarted);
        }

        let listener = TcpListener::bind(self.shared.config.bind_address()).await?;
        let addr = listener.local_addr()?;
        info!(address = %addr, "Listening");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::clone(&self.shared);
        self.accept_task = Some(tokio::spawn(accept_loop(listener, shared, shutdown_rx)));
        self.shutdown = Some(shutdown_tx);
        self.local_addr = Some(addr);

        Ok(addr)
    }

    pub fn is_running(&self) -> bool {
        self.accept_task.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Queues a command for one client.
    ///
    /// Returns once the command is queued; the client's writer task puts
    /// it on the wire.
    pub fn send(&self, command: &Command, client_id: ClientId) -> Result<(), ServerError> {
        let handle = self
            .shared
            .registry
            .get(client_id)
            .ok_or(ServerError::UnknownClient(client_id))?;
        self.deliver(&handle, command)
    }

    /// Queues a command for every authenticated client.
    ///
    /// A client that cannot take it is logged and skipped. Returns how many
    /// clients the command was queued for.
    pub fn broadcast(&self, command: &Command) -> usize {
        let mut delivered = 0;

        for handle in self.shared.registry.snapshot() {
            if !handle.is_authenticated() {
                continue;
            }
            match self.deliver(&handle, command) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(client_id = handle.id(), error = %e, "Broadcast skipped client"),
            }
        }

        trace!(command = %command, clients = delivered, "Broadcast");
        delivered
    }

    fn deliver(&self, handle: &ClientHandle, command: &Command) -> Result<(), ServerError> {
        let result = handle.send(command);
        if let Err(e @ ServerError::SendQueueFull(_)) = &result {
            self.shared.events.publish(ServerEvent::Error {
                client_id: handle.id(),
                message: e.to_string(),
            });
        }
        result
    }

    /// Disconnects one client and waits until it is deregistered.
    pub async fn close_client(&self, client_id: ClientId) -> Result<(), ServerError> {
        let handle = self
            .shared
            .registry
            .get(client_id)
            .ok_or(ServerError::UnknownClient(client_id))?;
        handle.close().await;
        Ok(())
    }

    /// Ids of all registered clients, authenticated or not.
    pub fn client_ids(&self) -> Vec<ClientId> {
        self.shared.registry.ids()
    }

    pub fn client_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Stops accepting, closes every client, then closes the listening socket.
    ///
    /// Each client fires `ClientDisconnected`; `Stopped` comes last and ends
    /// all subscriptions.
    pub async fn stop(&mut self) -> Result<(), ServerError> {
        let task = self.accept_task.take().ok_or(ServerError::NotStarted)?;
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }

        let listener = match task.await {
            Ok(listener) => Some(listener),
            Err(e) => {
                error!(error = %e, "Accept loop failed");
                None
            }
        };

        for handle in self.shared.registry.snapshot() {
            handle.close().await;
        }
        drop(listener);

        self.local_addr = None;
        info!("Server stopped");
        self.shared.events.publish_final(ServerEvent::Stopped);
        Ok(())
    }
}

/// Accepts clients until shutdown is signalled, then hands the listener
/// back so the caller decides when the socket closes.
async fn accept_loop(
    listener: TcpListener,
    shared: Arc<ServerShared>,
    mut shutdown: watch::Receiver<bool>,
) -> TcpListener {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let max = shared.config.max_clients;
                    if shared.registry.len() >= max {
                        warn!(client = %addr, max, "Client limit reached, dropping connection");
                        drop(stream);
                        continue;
                    }
                    spawn_client(&shared, stream, addr);
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }

    debug!("Accept loop stopped");
    listener
}
