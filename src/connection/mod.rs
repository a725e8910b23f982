//! Connection Module
//!
//! This module implements the client role of the link: the host program
//! that talks to a microcontroller over a serial line, or to a relay
//! server over TCP.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Connection                            │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐      │
//! │  │ Read bytes  │───>│ FrameParser │───>│  Protocol   │      │
//! │  └─────────────┘    └─────────────┘    │ (auth, dbnc)│      │
//! │         ▲                              └──────┬──────┘      │
//! │         │                                     │             │
//! │  ┌─────────────┐                              ▼             │
//! │  │ Liveness    │ CONNECT / WATCHDOG   ┌─────────────┐       │
//! │  │ ticker      │──────────> transport │ Event       │──> subscribers
//! │  └─────────────┘                      │ dispatcher  │       │
//! │                                       └─────────────┘       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use cmdlink::connection::{Connection, ConnectionConfig, ConnectionEvent};
//! use cmdlink::transport::BaudRate;
//!
//! let mut arduino = Connection::new(ConnectionConfig::default());
//! let mut events = arduino.subscribe();
//! arduino.connect_serial("/dev/ttyACM0", BaudRate::B115200)?;
//!
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! ```

pub mod client;
pub mod events;

// Re-export commonly used types
pub use client::{
    Connection, ConnectionConfig, ConnectionError, ConnectionEvent, ConnectionState,
    DEFAULT_LIVENESS_INTERVAL, DEFAULT_PASSWORD,
};
pub use events::EventDispatcher;
