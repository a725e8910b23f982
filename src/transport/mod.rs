//! Byte Transports
//!
//! A connection only needs an ordered, bidirectional byte stream. Anything
//! implementing tokio's `AsyncRead + AsyncWrite` qualifies:
//!
//! - `tokio::net::TcpStream` for the socket relay
//! - [`SerialTransport`] for the microcontroller link
//! - `tokio::io::DuplexStream` for in-memory tests

pub mod serial;

use tokio::io::{AsyncRead, AsyncWrite};

pub use serial::{BaudRate, SerialTransport};

/// An async byte stream a connection can run over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// A type-erased transport.
pub type BoxedTransport = Box<dyn Transport>;
