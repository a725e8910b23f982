//! Streaming Frame Parser
//!
//! Serial lines deliver bytes in arbitrary chunks, and may deliver garbage
//! (line noise, a reset mid-frame, a device that started talking before we
//! opened the port). The parser accumulates bytes in a bounded linear
//! buffer and looks for frames using only the start and stop markers:
//!
//! 1. `0x0A` after a buffered `0x0D` closes a frame: the buffer is checked
//!    (markers + length byte) and then cleared whatever the outcome.
//! 2. `0x78` after a buffered `0x78` is a fresh start sequence: stale bytes
//!    are discarded and the buffer restarts as `[0x78, 0x78]` (resync).
//! 3. Anything else is appended. Exceeding the capacity clears the buffer
//!    and reports an overflow.
//!
//! A frame that fails validation is dropped whole. There is no attempt to
//! find another frame inside the dropped bytes.

use crate::protocol::command::{
    Command, FRAME_OVERHEAD, MAX_FRAME_LEN, START_1, START_2, STOP_1, STOP_2,
};
use thiserror::Error;
use tracing::{trace, warn};

/// Default parser buffer capacity, the largest frame the length byte allows.
pub const DEFAULT_BUFFER_CAPACITY: usize = MAX_FRAME_LEN;

/// Errors that can occur while parsing the byte stream.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    /// A stop sequence closed a buffer that is not a valid frame
    #[error("malformed frame: length byte {declared:?}, {buffered} bytes buffered")]
    MalformedFrame {
        declared: Option<u8>,
        buffered: usize,
    },

    /// More bytes arrived than the buffer holds without a frame completing
    #[error("parser buffer overflow (capacity: {capacity} bytes)")]
    BufferOverflow { capacity: usize },
}

impl ParseError {
    /// Returns true if the owning connection should be closed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ParseError::BufferOverflow { .. })
    }
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Byte-stream frame parser.
///
/// # Example
///
/// ```
/// use cmdlink::protocol::FrameParser;
///
/// let mut parser = FrameParser::new(255);
/// let results = parser.feed(&[0x78, 0x78, 0x07, 0x01, 0xAA, 0x0D, 0x0A]);
/// let command = results.into_iter().next().unwrap().unwrap();
/// assert_eq!(command.payload(), &[0xAA]);
/// ```
#[derive(Debug)]
pub struct FrameParser {
    buffer: Vec<u8>,
    capacity: usize,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}

impl FrameParser {
    /// Creates a parser with a fixed buffer capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Discards any partially accumulated frame.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Feeds a chunk of bytes and returns everything it produced, in order.
    ///
    /// The whole chunk is always consumed; errors do not stop parsing of
    /// the bytes that follow them.
    pub fn feed(&mut self, data: &[u8]) -> Vec<ParseResult<Command>> {
        let mut results = Vec::new();
        for &byte in data {
            if let Some(result) = self.push(byte) {
                results.push(result);
            }
        }
        results
    }

    /// Processes a single byte.
    pub fn push(&mut self, byte: u8) -> Option<ParseResult<Command>> {
        let last = self.buffer.last().copied();

        if byte == STOP_2 && last == Some(STOP_1) {
            if let Err(e) = self.append(byte) {
                return Some(Err(e));
            }
            let result = self.detect_frame();
            self.buffer.clear();
            return Some(result);
        }

        if byte == START_2 && last == Some(START_1) {
            if self.buffer.len() > 1 {
                trace!(discarded = self.buffer.len() - 1, "Resync on start sequence");
            }
            self.buffer.clear();
            self.buffer.push(START_1);
            self.buffer.push(START_2);
            return None;
        }

        self.append(byte).err().map(Err)
    }

    fn append(&mut self, byte: u8) -> ParseResult<()> {
        if self.buffer.len() + 1 > self.capacity {
            self.buffer.clear();
            warn!(capacity = self.capacity, "Parser buffer overflow");
            return Err(ParseError::BufferOverflow {
                capacity: self.capacity,
            });
        }
        self.buffer.push(byte);
        Ok(())
    }

    /// Validates the buffer as a complete frame.
    fn detect_frame(&self) -> ParseResult<Command> {
        let buf = &self.buffer;
        let buffered = buf.len();

        if buffered < FRAME_OVERHEAD {
            return Err(ParseError::MalformedFrame {
                declared: buf.get(2).copied(),
                buffered,
            });
        }

        let declared = buf[2];
        let valid = buf[0] == START_1
            && buf[1] == START_2
            && buf[buffered - 2] == STOP_1
            && buf[buffered - 1] == STOP_2
            && declared as usize == buffered;

        if !valid {
            warn!(declared, buffered, "Bad frame dropped");
            return Err(ParseError::MalformedFrame {
                declared: Some(declared),
                buffered,
            });
        }

        let command = Command::from_frame_parts(buf[3], &buf[4..buffered - 2]);
        trace!(command = %command, "Frame detected");
        Ok(command)
    }
}
