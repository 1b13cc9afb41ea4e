//! Frame codec for the Arcam IP control protocol.
//!
//! Commands travel client to device, responses device to client:
//!
//! ```text
//! command:  0x21 <zone> <code> <len> <payload...> 0x0D
//! response: 0x21 <zone> <code> <answer> <len> <payload...> 0x0D
//! ```
//!
//! The two directions differ only by the answer byte, so [`encode`] always
//! produces command frames and [`decode`] always parses response frames.

use crate::error::{ArcamError, Result};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Frame start marker (`'!'`)
pub const START_BYTE: u8 = 0x21;

/// Frame end marker (`'\r'`)
pub const END_BYTE: u8 = 0x0D;

/// Largest payload a single frame can carry
pub const MAX_PAYLOAD: usize = 255;

/// Main zone
pub const ZONE_MAIN: u8 = 0x01;

/// Second zone
pub const ZONE_2: u8 = 0x02;

/// Start, zone, code, answer and length bytes
const RESPONSE_HEADER_LEN: usize = 5;

/// Smallest possible response frame (empty payload)
pub const MIN_RESPONSE_LEN: usize = RESPONSE_HEADER_LEN + 1;

/// A command addressed to one zone of the receiver
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Command {
    zone: u8,
    code: u8,
    payload: Vec<u8>,
}

impl Command {
    /// Create a command. Zone and payload length are checked by [`encode`].
    pub fn new(zone: u8, code: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            zone,
            code,
            payload: payload.into(),
        }
    }

    pub fn zone(&self) -> u8 {
        self.zone
    }

    pub fn code(&self) -> u8 {
        self.code
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Whether `response` answers this command (same zone and command code)
    pub fn matches(&self, response: &Response) -> bool {
        self.zone == response.zone && self.code == response.code
    }
}

/// A decoded response frame, solicited or broadcast
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Response {
    pub zone: u8,
    /// Echo of the command code this frame refers to
    pub code: u8,
    /// Raw answer byte, `0x00` on success
    pub answer: u8,
    pub payload: Vec<u8>,
}

impl Response {
    /// Check if the answer code indicates success
    pub fn is_success(&self) -> bool {
        self.answer == AnswerCode::Ok.code()
    }

    /// Get the answer code as a typed value
    pub fn answer_code(&self) -> AnswerCode {
        AnswerCode::from(self.answer)
    }

    /// Serialize this response in device-to-client framing.
    ///
    /// Only device simulators need this; clients never send responses.
    /// Fails with [`ArcamError::Encoding`] for payloads longer than 255 bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        check_payload_len(&self.payload)?;

        let mut buf = BytesMut::with_capacity(MIN_RESPONSE_LEN + self.payload.len());
        buf.put_u8(START_BYTE);
        buf.put_u8(self.zone);
        buf.put_u8(self.code);
        buf.put_u8(self.answer);
        buf.put_u8(self.payload.len() as u8);
        buf.put_slice(&self.payload);
        buf.put_u8(END_BYTE);
        Ok(buf.to_vec())
    }
}

/// Answer byte of a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnswerCode {
    Ok,
    ZoneInvalid,
    CommandNotRecognized,
    ParameterNotRecognized,
    CommandInvalidAtThisTime,
    InvalidDataLength,
    /// Non-zero code outside the documented set
    Unknown(u8),
}

impl AnswerCode {
    /// Get the wire value
    pub fn code(self) -> u8 {
        match self {
            AnswerCode::Ok => 0x00,
            AnswerCode::ZoneInvalid => 0x82,
            AnswerCode::CommandNotRecognized => 0x83,
            AnswerCode::ParameterNotRecognized => 0x84,
            AnswerCode::CommandInvalidAtThisTime => 0x85,
            AnswerCode::InvalidDataLength => 0x86,
            AnswerCode::Unknown(code) => code,
        }
    }
}

impl From<u8> for AnswerCode {
    fn from(code: u8) -> Self {
        match code {
            0x00 => AnswerCode::Ok,
            0x82 => AnswerCode::ZoneInvalid,
            0x83 => AnswerCode::CommandNotRecognized,
            0x84 => AnswerCode::ParameterNotRecognized,
            0x85 => AnswerCode::CommandInvalidAtThisTime,
            0x86 => AnswerCode::InvalidDataLength,
            other => AnswerCode::Unknown(other),
        }
    }
}

impl fmt::Display for AnswerCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnswerCode::Ok => write!(f, "ok"),
            AnswerCode::ZoneInvalid => write!(f, "invalid zone specified"),
            AnswerCode::CommandNotRecognized => write!(f, "command not recognized"),
            AnswerCode::ParameterNotRecognized => write!(f, "parameter not recognized"),
            AnswerCode::CommandInvalidAtThisTime => write!(f, "command invalid at this time"),
            AnswerCode::InvalidDataLength => write!(f, "invalid data length"),
            AnswerCode::Unknown(code) => write!(f, "unknown device error 0x{:02X}", code),
        }
    }
}

/// Outcome of a decode attempt on an accumulating buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// One complete frame and the number of bytes it occupied
    Frame(Response, usize),
    /// The buffer holds a frame prefix; read more
    NeedMoreBytes,
}

/// Malformed framing at the head of a buffer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("expected start byte 0x21, found 0x{0:02X}")]
    MissingStart(u8),

    #[error("expected end byte 0x0D at offset {offset}, found 0x{found:02X}")]
    MissingEnd { offset: usize, found: u8 },
}

/// Encode a command into its wire bytes.
///
/// Fails with [`ArcamError::Encoding`] for zones other than 1 and 2 or
/// payloads longer than 255 bytes.
pub fn encode(command: &Command) -> Result<Vec<u8>> {
    if !(ZONE_MAIN..=ZONE_2).contains(&command.zone) {
        return Err(ArcamError::Encoding(format!("invalid zone: {}", command.zone)));
    }
    check_payload_len(&command.payload)?;

    let mut buf = BytesMut::with_capacity(5 + command.payload.len());
    buf.put_u8(START_BYTE);
    buf.put_u8(command.zone);
    buf.put_u8(command.code);
    buf.put_u8(command.payload.len() as u8);
    buf.put_slice(&command.payload);
    buf.put_u8(END_BYTE);
    Ok(buf.to_vec())
}

fn check_payload_len(payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_PAYLOAD {
        return Err(ArcamError::Encoding(format!(
            "payload too long: {} bytes (max {})",
            payload.len(),
            MAX_PAYLOAD
        )));
    }
    Ok(())
}

/// Decode one response frame from the head of `buf`.
///
/// The buffer must begin with a start byte. The length field is a single
/// byte so a declared payload can never exceed [`MAX_PAYLOAD`]; the frame is
/// rejected when its end byte is not where the length says it is.
pub fn decode(buf: &[u8]) -> std::result::Result<Decoded, ParseError> {
    let Some(&first) = buf.first() else {
        return Ok(Decoded::NeedMoreBytes);
    };
    if first != START_BYTE {
        return Err(ParseError::MissingStart(first));
    }
    if buf.len() < RESPONSE_HEADER_LEN {
        return Ok(Decoded::NeedMoreBytes);
    }

    let len = buf[4] as usize;
    let total = RESPONSE_HEADER_LEN + len + 1;
    if buf.len() < total {
        return Ok(Decoded::NeedMoreBytes);
    }

    let end = buf[total - 1];
    if end != END_BYTE {
        return Err(ParseError::MissingEnd {
            offset: total - 1,
            found: end,
        });
    }

    let response = Response {
        zone: buf[1],
        code: buf[2],
        answer: buf[3],
        payload: buf[RESPONSE_HEADER_LEN..total - 1].to_vec(),
    };
    Ok(Decoded::Frame(response, total))
}

/// Accumulates socket reads and yields complete response frames.
///
/// Malformed data is skipped up to the next start byte instead of being
/// treated as fatal, so one corrupt frame never costs the connection. A
/// truncated frame reads the bytes of the frame behind it as its own length
/// field, so an incomplete head is abandoned as soon as a complete frame
/// starts further along the buffer.
pub struct FrameBuffer {
    buffer: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(1024),
        }
    }

    /// Append `data` and extract every complete frame now available
    pub fn push(&mut self, data: &[u8]) -> Vec<Response> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame() {
            frames.push(frame);
        }
        frames
    }

    /// Extract the next complete frame, skipping over garbage
    pub fn next_frame(&mut self) -> Option<Response> {
        loop {
            match decode(&self.buffer) {
                Ok(Decoded::Frame(response, used)) => {
                    tracing::debug!("Received frame: {}", hex(&self.buffer[..used]));
                    self.buffer.advance(used);
                    return Some(response);
                }
                Ok(Decoded::NeedMoreBytes) => {
                    let skipped = self.complete_frame_after_head()?;
                    self.buffer.advance(skipped);
                    tracing::warn!("Discarded {} byte(s) of truncated frame", skipped);
                }
                Err(e) => {
                    let skipped = self.resync();
                    tracing::warn!("Discarded {} byte(s) of malformed data: {}", skipped, e);
                }
            }
        }
    }

    /// Offset of the first later start byte that begins a complete frame
    fn complete_frame_after_head(&self) -> Option<usize> {
        self.buffer
            .iter()
            .enumerate()
            .skip(1)
            .filter(|&(_, &b)| b == START_BYTE)
            .map(|(pos, _)| pos)
            .find(|&pos| matches!(decode(&self.buffer[pos..]), Ok(Decoded::Frame(..))))
    }

    /// Drop the byte at the head and everything up to the next start byte
    fn resync(&mut self) -> usize {
        let skip = self
            .buffer
            .iter()
            .skip(1)
            .position(|&b| b == START_BYTE)
            .map(|pos| pos + 1)
            .unwrap_or(self.buffer.len());
        self.buffer.advance(skip);
        skip
    }

    /// Number of buffered bytes not yet consumed
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Forget any partial frame (used when the connection is replaced)
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
