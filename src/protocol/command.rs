//! Command Frames
//!
//! A [`Command`] is the unit of the link protocol: a one-byte type tag plus
//! an opaque payload. On the wire every command travels inside a frame:
//!
//! ```text
//! ┌──────┬──────┬─────┬──────┬───────────────────┬──────┬──────┐
//! │ 0x78 │ 0x78 │ LEN │ TYPE │ PAYLOAD (LEN - 6) │ 0x0D │ 0x0A │
//! └──────┴──────┴─────┴──────┴───────────────────┴──────┴──────┘
//! ```
//!
//! `LEN` is the total frame length including the start and stop markers,
//! so a frame is at most 255 bytes long and carries at most 249 payload
//! bytes.
//!
//! ## Payload Encodings
//!
//! - Integers: 4 bytes, big-endian
//! - Floats: IEEE-754 single precision, **little-endian** (the byte order
//!   of the AVR/ARM microcontrollers on the other end of the link)
//! - Strings: UTF-8

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;

/// First start marker byte.
pub const START_1: u8 = 0x78;
/// Second start marker byte.
pub const START_2: u8 = 0x78;
/// First stop marker byte (`\r`).
pub const STOP_1: u8 = 0x0D;
/// Second stop marker byte (`\n`).
pub const STOP_2: u8 = 0x0A;

/// Bytes in a frame that are not payload: start(2) + len(1) + type(1) + stop(2).
pub const FRAME_OVERHEAD: usize = 6;

/// Largest frame the single-byte length field can describe.
pub const MAX_FRAME_LEN: usize = u8::MAX as usize;

/// Largest payload that fits in a frame.
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_LEN - FRAME_OVERHEAD;

/// Width of integer payloads produced by [`Command::from_integer`].
pub const INTEGER_BYTES: usize = 4;

/// Command type tags owned by the protocol layer.
///
/// Device command sets share the same one-byte namespace and must not
/// reuse these values.
pub mod command_type {
    /// Authentication request, payload is the shared secret.
    pub const CONNECT: u8 = 0x70;
    /// Authentication reply, payload is a 4-byte integer (1 = ok, 0 = rejected).
    pub const CONNECT_RESULT: u8 = 0x53;
    /// Error report from the device, payload is UTF-8 text.
    pub const DEVICE_ERROR: u8 = 0x60;
    /// Liveness heartbeat, payload `[0]`.
    pub const WATCHDOG: u8 = 0x80;

    /// Returns true if `tag` is reserved by the protocol layer.
    pub const fn is_reserved(tag: u8) -> bool {
        matches!(tag, CONNECT | CONNECT_RESULT | DEVICE_ERROR | WATCHDOG)
    }
}

/// `CONNECT_RESULT` payload for an accepted handshake.
pub const CONNECT_SUCCESSFUL: u32 = 1;
/// `CONNECT_RESULT` payload for a rejected handshake.
pub const CONNECT_FAILED: u32 = 0;

/// Errors produced while building, decoding or reading commands.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CodecError {
    #[error("payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("frame too short: {0} bytes")]
    FrameTooShort(usize),

    #[error("bad frame markers")]
    BadMarkers,

    #[error("length mismatch: header says {declared}, frame has {actual} bytes")]
    LengthMismatch { declared: usize, actual: usize },

    /// A slice accessor asked for bytes past the end of the payload
    #[error("payload range {start}..{end} out of bounds (payload is {len} bytes)")]
    OutOfRange { start: usize, end: usize, len: usize },

    #[error("unsupported width: {0} bytes")]
    UnsupportedWidth(usize),

    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(String),
}

/// A single protocol command.
///
/// Commands are immutable. The payload is a `Bytes` handle so cloning a
/// command for fan-out (broadcast, event subscribers) never copies it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    command_type: u8,
    payload: Bytes,
}

impl Command {
    /// Creates a command from a raw payload.
    ///
    /// # Example
    /// ```
    /// use cmdlink::protocol::Command;
    /// let cmd = Command::new(0x51, vec![13, 1]).unwrap();
    /// assert_eq!(cmd.payload(), &[13, 1]);
    /// ```
    pub fn new(command_type: u8, payload: impl Into<Bytes>) -> Result<Self, CodecError> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(CodecError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }
        Ok(Self {
            command_type,
            payload,
        })
    }

    /// Creates a command carrying a 4-byte big-endian integer.
    pub fn from_integer(command_type: u8, value: u32) -> Self {
        Self {
            command_type,
            payload: Bytes::copy_from_slice(&value.to_be_bytes()),
        }
    }

    /// Creates a command carrying a little-endian `f32`.
    pub fn from_float(command_type: u8, value: f32) -> Self {
        Self {
            command_type,
            payload: Bytes::copy_from_slice(&value.to_le_bytes()),
        }
    }

    /// Creates a command carrying UTF-8 text.
    pub fn from_string(command_type: u8, text: &str) -> Result<Self, CodecError> {
        Self::new(command_type, Bytes::copy_from_slice(text.as_bytes()))
    }

    /// Handshake request carrying the shared secret.
    pub fn connect(secret: &str) -> Result<Self, CodecError> {
        Self::from_string(command_type::CONNECT, secret)
    }

    /// Handshake reply.
    pub fn connect_result(accepted: bool) -> Self {
        let value = if accepted {
            CONNECT_SUCCESSFUL
        } else {
            CONNECT_FAILED
        };
        Self::from_integer(command_type::CONNECT_RESULT, value)
    }

    /// Heartbeat sent by an authenticated peer.
    pub fn watchdog() -> Self {
        Self {
            command_type: command_type::WATCHDOG,
            payload: Bytes::from_static(&[0]),
        }
    }

    /// Builds a command from the parts of an already validated frame.
    pub(crate) fn from_frame_parts(command_type: u8, payload: &[u8]) -> Self {
        Self {
            command_type,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    pub fn command_type(&self) -> u8 {
        self.command_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Returns a cheap handle to the payload bytes.
    pub fn payload_bytes(&self) -> Bytes {
        self.payload.clone()
    }

    /// Total length of the encoded frame.
    pub fn frame_len(&self) -> usize {
        self.payload.len() + FRAME_OVERHEAD
    }

    /// Encodes the command into a wire frame.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.frame_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Encodes the command into an existing buffer.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.frame_len());
        buf.put_u8(START_1);
        buf.put_u8(START_2);
        // Fits: payload length is capped at MAX_PAYLOAD_LEN on construction
        buf.put_u8(self.frame_len() as u8);
        buf.put_u8(self.command_type);
        buf.put_slice(&self.payload);
        buf.put_u8(STOP_1);
        buf.put_u8(STOP_2);
    }

    /// Decodes exactly one complete frame.
    ///
    /// Applies the same validation as the streaming parser: both start
    /// markers, both stop markers, and the length byte must all agree.
    pub fn decode(frame: &[u8]) -> Result<Self, CodecError> {
        if frame.len() < FRAME_OVERHEAD {
            return Err(CodecError::FrameTooShort(frame.len()));
        }

        let end = frame.len();
        if frame[0] != START_1
            || frame[1] != START_2
            || frame[end - 2] != STOP_1
            || frame[end - 1] != STOP_2
        {
            return Err(CodecError::BadMarkers);
        }

        let declared = frame[2] as usize;
        if declared != end {
            return Err(CodecError::LengthMismatch {
                declared,
                actual: end,
            });
        }

        Ok(Self::from_frame_parts(frame[3], &frame[4..end - 2]))
    }

    /// Reads a big-endian unsigned integer of `byte_count` bytes (1..=8)
    /// starting at `start_byte` of the payload.
    ///
    /// Frames that pack several fields (e.g. `[index:1][value:4]`) are read
    /// by calling this with different offsets.
    pub fn integer_data(&self, byte_count: usize, start_byte: usize) -> Result<u64, CodecError> {
        if byte_count == 0 || byte_count > 8 {
            return Err(CodecError::UnsupportedWidth(byte_count));
        }
        let bytes = self.slice(start_byte, byte_count)?;
        Ok(bytes
            .iter()
            .fold(0u64, |acc, &b| (acc << 8) | u64::from(b)))
    }

    /// Reads a little-endian float starting at `start_byte`.
    ///
    /// `byte_count` selects the width: 4 for `f32` (what the firmware
    /// sends), 8 for `f64`.
    pub fn float_data(&self, byte_count: usize, start_byte: usize) -> Result<f64, CodecError> {
        let bytes = self.slice(start_byte, byte_count)?;
        match byte_count {
            4 => {
                let mut raw = [0u8; 4];
                raw.copy_from_slice(bytes);
                Ok(f64::from(f32::from_le_bytes(raw)))
            }
            8 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                Ok(f64::from_le_bytes(raw))
            }
            other => Err(CodecError::UnsupportedWidth(other)),
        }
    }

    /// Interprets the whole payload as UTF-8.
    pub fn string_data(&self) -> Result<&str, CodecError> {
        std::str::from_utf8(&self.payload).map_err(|e| CodecError::InvalidUtf8(e.to_string()))
    }

    fn slice(&self, start: usize, count: usize) -> Result<&[u8], CodecError> {
        let end = start.saturating_add(count);
        if end > self.payload.len() {
            return Err(CodecError::OutOfRange {
                start,
                end,
                len: self.payload.len(),
            });
        }
        Ok(&self.payload[start..end])
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "type={:#04x} len={}",
            self.command_type,
            self.payload.len()
        )
    }
}
