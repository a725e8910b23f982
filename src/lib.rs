//! # cmdlink - A Framed Command Link for Microcontrollers
//!
//! cmdlink connects a host program to a microcontroller (over a serial
//! line) or to other host programs (over TCP) using a small length-prefixed
//! binary protocol. Both ends authenticate with a shared secret and the
//! host keeps a watchdog on the device fed.
//!
//! ## Features
//!
//! - **Framed Protocol**: `78 78 LEN TYPE PAYLOAD 0D 0A`, resynchronizing on garbage
//! - **Authenticated Links**: CONNECT handshake retried until the peer accepts
//! - **Watchdog**: periodic heartbeat once authenticated
//! - **Multi-Client Server**: per-client isolation, broadcast and targeted sends
//! - **Debouncing**: per-pin filtering of noisy input notifications
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                              cmdlink                                 │
//! │                                                                      │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐               │
//! │  │  Transport  │───>│ FrameParser │───>│ Connection  │──> events     │
//! │  │ serial/TCP  │<───│   Command   │<───│ (handshake, │<── send()     │
//! │  └─────────────┘    │   codec     │    │  watchdog)  │               │
//! │                     └─────────────┘    └──────┬──────┘               │
//! │                                               │ DebounceFilter       │
//! │                                                                      │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐               │
//! │  │ TcpListener │───>│ ClientTask  │───>│ Connection  │──> events     │
//! │  │             │    │  per socket │    │   Server    │<── broadcast()│
//! │  └─────────────┘    └─────────────┘    └─────────────┘               │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use cmdlink::{Command, Connection, ConnectionConfig, ConnectionEvent};
//! use cmdlink::transport::BaudRate;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut arduino = Connection::new(ConnectionConfig::default());
//!     let mut events = arduino.subscribe();
//!     arduino.connect_serial("/dev/ttyACM0", BaudRate::B115200)?;
//!
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             ConnectionEvent::Connected => {
//!                 arduino.send(&Command::from_integer(0x10, 13)).await?;
//!             }
//!             ConnectionEvent::Command(cmd) => println!("{}", cmd),
//!             other => println!("{:?}", other),
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`protocol`]: command codec and streaming frame parser
//! - [`connection`]: client side of a link
//! - [`server`]: multi-client TCP endpoint
//! - [`transport`]: serial port bridge and the transport trait
//! - [`filter`]: debounce filter for pin notifications

pub mod connection;
pub mod filter;
pub mod protocol;
pub mod server;
pub mod transport;

// Re-export commonly used types for convenience
pub use connection::{
    Connection, ConnectionConfig, ConnectionError, ConnectionEvent, ConnectionState,
};
pub use filter::{DebounceConfig, DebounceFilter};
pub use protocol::{command_type, CodecError, Command, FrameParser, ParseError};
pub use server::{ClientId, ConnectionServer, ServerConfig, ServerError, ServerEvent, DEFAULT_PORT};

/// The default host the relay server binds to
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Version of cmdlink
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
