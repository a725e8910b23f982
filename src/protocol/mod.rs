//! Link Protocol Implementation
//!
//! This module implements the framing layer shared by the serial link and
//! the TCP relay.
//!
//! ## Modules
//!
//! - `command`: the `Command` value, frame constants and reserved type tags
//! - `parser`: streaming parser that recovers commands from a noisy byte stream
//!
//! ## Example
//!
//! ```
//! use cmdlink::protocol::{Command, FrameParser};
//!
//! // Encoding an outgoing command
//! let frame = Command::from_integer(0x35, 2000).encode();
//!
//! // Parsing incoming bytes
//! let mut parser = FrameParser::default();
//! let decoded: Vec<Command> = parser
//!     .feed(&frame)
//!     .into_iter()
//!     .filter_map(Result::ok)
//!     .collect();
//! assert_eq!(decoded[0].integer_data(4, 0).unwrap(), 2000);
//! ```

pub mod command;
pub mod parser;

// Re-export commonly used types for convenience
pub use command::{command_type, CodecError, Command, MAX_PAYLOAD_LEN};
pub use parser::{FrameParser, ParseError, ParseResult, DEFAULT_BUFFER_CAPACITY};
