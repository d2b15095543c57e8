//! Opaque canvas messages and the Fresco wire framing.
//!
//! Wire format (big-endian length prefix):
//! ```text
//! ┌─────────────┬────────┬────────────┬──────────┐
//! │ payload_len │ type   │ context_id │ payload  │
//! │ u16 BE      │ u8     │ u8         │ variable │
//! └─────────────┴────────┴────────────┴──────────┘
//! ```
//!
//! The session history treats messages as opaque records: it only looks at
//! `length()`, the type classification, and the context id. Payloads are
//! shared immutable bytes, so cloning a message is cheap.

use std::fmt;
use std::sync::Arc;

/// Fixed header size: length prefix + type + context id.
pub const HEADER_LEN: usize = 4;

/// Maximum payload size representable by the u16 length prefix.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Message type tags.
///
/// Types below 32 are control messages (never part of the canvas state),
/// 32..64 are server meta messages, 64 and up are canvas commands. The
/// canvas command tags exist so that producers and tests have realistic
/// types to work with; the session history never interprets their payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    ServerCommand = 0,
    Disconnect = 1,
    Ping = 2,
    Join = 32,
    Leave = 33,
    SessionOwner = 34,
    Chat = 35,
    TrustedUsers = 36,
    SoftReset = 37,
    PrivateChat = 38,
    ResetStream = 39,
    CanvasResize = 64,
    LayerCreate = 65,
    PutImage = 66,
    DrawDabs = 67,
    Undo = 68,
    Fill = 69,
}

impl MessageType {
    /// Parse a raw wire tag.
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::ServerCommand),
            1 => Some(Self::Disconnect),
            2 => Some(Self::Ping),
            32 => Some(Self::Join),
            33 => Some(Self::Leave),
            34 => Some(Self::SessionOwner),
            35 => Some(Self::Chat),
            36 => Some(Self::TrustedUsers),
            37 => Some(Self::SoftReset),
            38 => Some(Self::PrivateChat),
            39 => Some(Self::ResetStream),
            64 => Some(Self::CanvasResize),
            65 => Some(Self::LayerCreate),
            66 => Some(Self::PutImage),
            67 => Some(Self::DrawDabs),
            68 => Some(Self::Undo),
            69 => Some(Self::Fill),
            _ => None,
        }
    }

    /// Control messages are transport-level and never part of canvas state.
    pub fn is_control(self) -> bool {
        (self as u8) < 32
    }

    /// Server meta messages carry session-level state (joins, chat, resets).
    pub fn is_server_meta(self) -> bool {
        let raw = self as u8;
        (32..64).contains(&raw)
    }
}

/// Errors from decoding wire bytes into messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    /// Not enough bytes for a complete header or payload.
    Truncated,
    /// Unrecognized type tag.
    UnknownType(u8),
    /// Payload exceeds the u16 length prefix.
    PayloadTooLarge(usize),
}

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageError::Truncated => write!(f, "truncated message"),
            MessageError::UnknownType(raw) => write!(f, "unknown message type {raw}"),
            MessageError::PayloadTooLarge(len) => {
                write!(f, "payload of {len} bytes exceeds wire limit")
            }
        }
    }
}

impl std::error::Error for MessageError {}

/// An opaque session message: type tag, origin context id, shared payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    msg_type: MessageType,
    context_id: u8,
    payload: Arc<[u8]>,
}

impl Message {
    /// Create a message from parts. The payload must fit the wire framing.
    pub fn new(msg_type: MessageType, context_id: u8, payload: impl Into<Arc<[u8]>>) -> Self {
        let payload = payload.into();
        assert!(
            payload.len() <= MAX_PAYLOAD_LEN,
            "payload of {} bytes exceeds wire limit",
            payload.len()
        );
        Self {
            msg_type,
            context_id,
            payload,
        }
    }

    /// A soft reset marker, emitted when a streamed reset begins.
    pub fn make_soft_reset(context_id: u8) -> Self {
        Self::new(MessageType::SoftReset, context_id, Vec::new())
    }

    /// Wrap a JSON document into a `ServerCommand` message.
    pub fn make_server_command(context_id: u8, data: &serde_json::Value) -> Self {
        Self::new(
            MessageType::ServerCommand,
            context_id,
            data.to_string().into_bytes(),
        )
    }

    pub fn msg_type(&self) -> MessageType {
        self.msg_type
    }

    pub fn context_id(&self) -> u8 {
        self.context_id
    }

    /// Reattribute the message to a different context id.
    pub fn set_context_id(&mut self, context_id: u8) {
        self.context_id = context_id;
    }

    /// Total wire length, header included. This is the unit of all size
    /// accounting in the session history.
    pub fn length(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn is_control(&self) -> bool {
        self.msg_type.is_control()
    }

    pub fn is_server_meta(&self) -> bool {
        self.msg_type.is_server_meta()
    }

    /// Payload view of a `ResetStream` chunk. `None` for other types.
    pub fn reset_stream_data(&self) -> Option<&[u8]> {
        if self.msg_type == MessageType::ResetStream {
            Some(&self.payload)
        } else {
            None
        }
    }

    /// Payload view of a `ServerCommand` message. `None` for other types.
    pub fn server_command_payload(&self) -> Option<&[u8]> {
        if self.msg_type == MessageType::ServerCommand {
            Some(&self.payload)
        } else {
            None
        }
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.length());
        out.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        out.push(self.msg_type as u8);
        out.push(self.context_id);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decode one message from the front of `bytes`.
    ///
    /// Returns the message and the number of bytes consumed. `Truncated`
    /// means more bytes are needed; callers accumulating a stream should
    /// retry once more data arrives.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize), MessageError> {
        if bytes.len() < HEADER_LEN {
            return Err(MessageError::Truncated);
        }
        let payload_len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
        let total = HEADER_LEN + payload_len;
        if bytes.len() < total {
            return Err(MessageError::Truncated);
        }
        let msg_type =
            MessageType::from_raw(bytes[2]).ok_or(MessageError::UnknownType(bytes[2]))?;
        let context_id = bytes[3];
        let msg = Self::new(msg_type, context_id, bytes[HEADER_LEN..total].to_vec());
        Ok((msg, total))
    }
}
