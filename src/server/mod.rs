//! Server Module
//!
//! The server role of the link: a TCP endpoint that many clients connect
//! to, each authenticating with the shared secret before its commands are
//! accepted.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     ConnectionServer                         │
//! │                                                              │
//! │  ┌─────────────┐  spawn   ┌─────────────┐                    │
//! │  │ Accept loop │─────────>│ ClientTask 0│──┐                 │
//! │  └──────┬──────┘          ├─────────────┤  │  ┌───────────┐  │
//! │         │ insert          │ ClientTask 1│──┼─>│  Event    │──> subscribers
//! │         ▼                 ├─────────────┤  │  │ dispatcher│  │
//! │  ┌─────────────┐  remove  │ ClientTask N│──┘  └───────────┘  │
//! │  │  Registry   │<─────────┴─────────────┘                    │
//! │  │ id → handle │<──── send / broadcast / close_client        │
//! │  └─────────────┘                                             │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each client has its own parser and handshake state. A client that
//! sends garbage or the wrong password is closed on its own; the accept
//! loop and the other clients carry on.

pub mod handler;
pub mod listener;
pub mod registry;

// Re-export commonly used types
pub use handler::ClientHandle;
pub use listener::{ConnectionServer, ServerConfig, ServerError, ServerEvent, DEFAULT_PORT};
pub use registry::{ClientId, ClientRegistry};
