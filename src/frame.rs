//! Frame codec for the multiplexing protocol.
//!
//! Every binary websocket message carries exactly one frame. A frame is a
//! fixed 9-byte header optionally followed by a payload (DATA frames only):
//!
//! ```text
//! +--------+----------------+----------------+------------------+
//! | opcode |  stream id u32 |   value u32    |  payload (DATA)  |
//! +--------+----------------+----------------+------------------+
//! ```
//!
//! The meaning of `value` depends on the opcode: the opener's receive window
//! for OPEN, the payload length for DATA, the credit increment for
//! WINDOW_UPDATE, a reset code for RESET and an opaque nonce for PING/PONG.
//!
//! The codec holds no state. Each call is independent.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Frame opcodes
pub mod opcode {
    pub const OPEN: u8 = 0x0;
    pub const DATA: u8 = 0x1;
    pub const WINDOW_UPDATE: u8 = 0x2;
    pub const CLOSE: u8 = 0x3;
    pub const RESET: u8 = 0x4;
    pub const PING: u8 = 0x5;
    pub const PONG: u8 = 0x6;
}

/// Codes carried in the value field of RESET frames
pub mod reset_code {
    /// The stream was abandoned by the application.
    pub const CANCEL: u32 = 0x0;
    pub const PROTOCOL_ERROR: u32 = 0x1;
    pub const FLOW_CONTROL_ERROR: u32 = 0x2;
    /// The accept backlog overflowed before the stream was accepted.
    pub const REFUSED_STREAM: u32 = 0x3;
}

/// Length of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 9;

/// Decoding failures. All of them mean the message cannot be trusted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame too short: {len} bytes, header needs 9")]
    Truncated { len: usize },
    #[error("DATA frame declares {declared} payload bytes but carries {actual}")]
    LengthMismatch { declared: u32, actual: usize },
    #[error("frame with opcode {opcode:#x} carries {extra} unexpected trailing bytes")]
    TrailingBytes { opcode: u8, extra: usize },
    #[error("unknown opcode {0:#x}")]
    UnknownOpcode(u8),
}

/// A parsed frame header (9 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub opcode: u8,
    pub stream_id: u32,
    /// Length, window, increment, code or nonce depending on `opcode`.
    pub value: u32,
}

impl FrameHeader {
    /// Parse a 9-byte frame header
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_LEN {
            return None;
        }

        let opcode = data[0];
        let stream_id = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
        let value = u32::from_be_bytes([data[5], data[6], data[7], data[8]]);

        Some(Self {
            opcode,
            stream_id,
            value,
        })
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(self.opcode);
        buf.put_u32(self.stream_id);
        buf.put_u32(self.value);
    }

    /// Total frame size including header, as declared by the header.
    pub fn total_size(&self) -> usize {
        if self.opcode == opcode::DATA {
            HEADER_LEN + self.value as usize
        } else {
            HEADER_LEN
        }
    }
}

/// A decoded protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// The sender allocated `stream_id` and can buffer `window` bytes on it.
    Open { stream_id: u32, window: u32 },
    Data { stream_id: u32, payload: Bytes },
    WindowUpdate { stream_id: u32, increment: u32 },
    /// The sender will write no more data on `stream_id`.
    Close { stream_id: u32 },
    Reset { stream_id: u32, code: u32 },
    Ping { nonce: u32 },
    Pong { nonce: u32 },
}

impl Frame {
    /// Stream the frame addresses, or 0 for session-level frames.
    pub fn stream_id(&self) -> u32 {
        match self {
            Frame::Open { stream_id, .. }
            | Frame::Data { stream_id, .. }
            | Frame::WindowUpdate { stream_id, .. }
            | Frame::Close { stream_id }
            | Frame::Reset { stream_id, .. } => *stream_id,
            Frame::Ping { .. } | Frame::Pong { .. } => 0,
        }
    }

    pub fn header(&self) -> FrameHeader {
        let (opcode, value) = match self {
            Frame::Open { window, .. } => (opcode::OPEN, *window),
            Frame::Data { payload, .. } => (opcode::DATA, payload.len() as u32),
            Frame::WindowUpdate { increment, .. } => (opcode::WINDOW_UPDATE, *increment),
            Frame::Close { .. } => (opcode::CLOSE, 0),
            Frame::Reset { code, .. } => (opcode::RESET, *code),
            Frame::Ping { nonce } => (opcode::PING, *nonce),
            Frame::Pong { nonce } => (opcode::PONG, *nonce),
        };
        FrameHeader {
            opcode,
            stream_id: self.stream_id(),
            value,
        }
    }

    /// Serialize into one transport message.
    pub fn encode(&self) -> Bytes {
        let header = self.header();
        let mut buf = BytesMut::with_capacity(header.total_size());
        header.encode_into(&mut buf);
        if let Frame::Data { payload, .. } = self {
            buf.extend_from_slice(payload);
        }
        buf.freeze()
    }

    /// Parse one transport message. The DATA payload shares the message buffer.
    pub fn decode(message: Bytes) -> Result<Frame, FrameError> {
        let header = FrameHeader::parse(&message).ok_or(FrameError::Truncated {
            len: message.len(),
        })?;
        let body = message.len() - HEADER_LEN;

        if header.opcode == opcode::DATA {
            if body != header.value as usize {
                return Err(FrameError::LengthMismatch {
                    declared: header.value,
                    actual: body,
                });
            }
            return Ok(Frame::Data {
                stream_id: header.stream_id,
                payload: message.slice(HEADER_LEN..),
            });
        }

        let frame = match header.opcode {
            opcode::OPEN => Frame::Open {
                stream_id: header.stream_id,
                window: header.value,
            },
            opcode::WINDOW_UPDATE => Frame::WindowUpdate {
                stream_id: header.stream_id,
                increment: header.value,
            },
            opcode::CLOSE => Frame::Close {
                stream_id: header.stream_id,
            },
            opcode::RESET => Frame::Reset {
                stream_id: header.stream_id,
                code: header.value,
            },
            opcode::PING => Frame::Ping {
                nonce: header.value,
            },
            opcode::PONG => Frame::Pong {
                nonce: header.value,
            },
            other => return Err(FrameError::UnknownOpcode(other)),
        };

        if body != 0 {
            return Err(FrameError::TrailingBytes {
                opcode: header.opcode,
                extra: body,
            });
        }
        Ok(frame)
    }
}
