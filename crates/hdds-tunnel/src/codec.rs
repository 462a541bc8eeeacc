// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Tunnel framing codec.
//!
//! TCP is a stream protocol without message boundaries. Every frame carries a
//! fixed-size header with its kind and an explicit payload length, so payload
//! bytes are never scanned or escaped:
//!
//! ```text
//! Ping / Pong (13 bytes, no payload):
//! +----------+----------------+----------------------+
//! | Kind (1) | Length (4B BE) | Sequence (8B BE)     |
//! +----------+----------------+----------------------+
//!
//! Data (9 bytes + payload):
//! +----------+----------------+----------------+-----------------+
//! | Kind (1) | Length (4B BE) | Domain (4B BE) | Payload (Length)|
//! +----------+----------------+----------------+-----------------+
//! ```
//!
//! Kinds: `1` = Ping, `2` = Pong, `3` = Data. The length of a control frame
//! must be zero; the length of a data frame must not exceed the configured
//! maximum (anti-OOM protection against a corrupted length field).

use crate::error::ProtocolAnomaly;

/// Kind byte + length field, shared by every frame.
pub const COMMON_HEADER_SIZE: usize = 5;

/// Full header of a Ping/Pong frame.
pub const CONTROL_HEADER_SIZE: usize = COMMON_HEADER_SIZE + 8;

/// Full header of a Data frame.
pub const DATA_HEADER_SIZE: usize = COMMON_HEADER_SIZE + 4;

/// Default maximum payload size (16 MB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Frame kind byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Ping = 1,
    Pong = 2,
    Data = 3,
}

impl FrameKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Ping),
            2 => Some(Self::Pong),
            3 => Some(Self::Data),
            _ => None,
        }
    }

    /// Size of the full header for this kind.
    pub fn header_size(self) -> usize {
        match self {
            Self::Ping | Self::Pong => CONTROL_HEADER_SIZE,
            Self::Data => DATA_HEADER_SIZE,
        }
    }
}

/// One unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Heartbeat probe from the initiator.
    Ping { sequence: u64 },
    /// Heartbeat reply carrying the probe's sequence.
    Pong { sequence: u64 },
    /// Opaque DDS payload tagged with its domain.
    Data { domain_id: u32, payload: Vec<u8> },
}

impl Frame {
    pub fn data(domain_id: u32, payload: impl Into<Vec<u8>>) -> Self {
        Self::Data {
            domain_id,
            payload: payload.into(),
        }
    }

    pub fn kind(&self) -> FrameKind {
        match self {
            Self::Ping { .. } => FrameKind::Ping,
            Self::Pong { .. } => FrameKind::Pong,
            Self::Data { .. } => FrameKind::Data,
        }
    }

    pub fn is_control(&self) -> bool {
        !matches!(self, Self::Data { .. })
    }

    /// Payload length as written in the header.
    pub fn payload_len(&self) -> usize {
        match self {
            Self::Data { payload, .. } => payload.len(),
            _ => 0,
        }
    }

    /// Total number of bytes this frame occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        self.kind().header_size() + self.payload_len()
    }
}

/// Outcome of a decode attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decode {
    /// A complete frame; `consumed` bytes belong to it.
    Complete { frame: Frame, consumed: usize },
    /// The buffer holds a valid prefix of a frame.
    NeedMoreData,
    /// The header is malformed; the frame cannot be delimited.
    Corrupt(ProtocolAnomaly),
}

/// Incremental frame decoder with an accumulation buffer.
///
/// Bytes read from the socket are [`feed`](Self::feed)-ed in whatever chunks
/// they arrive; [`next_frame`](Self::next_frame) is then called until it
/// returns [`Decode::NeedMoreData`].
#[derive(Debug)]
pub struct FrameCodec {
    /// Maximum allowed payload length
    max_frame_size: u32,

    /// Accumulated, not yet decoded bytes
    buffer: Vec<u8>,

    /// Read position in `buffer`
    pos: usize,

    frames_decoded: u64,
    bytes_decoded: u64,
    frames_rejected: u64,
}

impl FrameCodec {
    /// Create a new codec with the specified max payload size.
    pub fn new(max_frame_size: u32) -> Self {
        Self {
            max_frame_size,
            buffer: Vec::with_capacity(16384),
            pos: 0,
            frames_decoded: 0,
            bytes_decoded: 0,
            frames_rejected: 0,
        }
    }

    /// Create a codec with default max size (16 MB).
    pub fn with_default_max() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    /// Number of frames successfully decoded.
    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    /// Total payload bytes decoded.
    pub fn bytes_decoded(&self) -> u64 {
        self.bytes_decoded
    }

    /// Number of corrupt headers encountered.
    pub fn frames_rejected(&self) -> u64 {
        self.frames_rejected
    }

    /// Bytes buffered but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buffer.len() - self.pos
    }

    /// Drop any partial state (e.g. after a connection reset).
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.pos = 0;
    }

    /// Encode a frame into a new buffer.
    pub fn encode(frame: &Frame) -> Vec<u8> {
        let mut buf = Vec::with_capacity(frame.encoded_len());
        Self::encode_into(frame, &mut buf);
        buf
    }

    /// Append an encoded frame to `buf`.
    ///
    /// Payload size limits are enforced by the submitting side; a payload
    /// longer than `u32::MAX` cannot be represented and must never get here.
    pub fn encode_into(frame: &Frame, buf: &mut Vec<u8>) {
        buf.push(frame.kind() as u8);
        buf.extend_from_slice(&(frame.payload_len() as u32).to_be_bytes());
        match frame {
            Frame::Ping { sequence } | Frame::Pong { sequence } => {
                buf.extend_from_slice(&sequence.to_be_bytes());
            }
            Frame::Data { domain_id, payload } => {
                buf.extend_from_slice(&domain_id.to_be_bytes());
                buf.extend_from_slice(payload);
            }
        }
    }

    /// Try to decode one frame from the start of `buf`.
    ///
    /// Never returns [`Decode::Corrupt`] for a truncated buffer whose header
    /// bytes seen so far are valid.
    pub fn decode(buf: &[u8], max_frame_size: u32) -> Decode {
        let Some(&kind_byte) = buf.first() else {
            return Decode::NeedMoreData;
        };
        let Some(kind) = FrameKind::from_u8(kind_byte) else {
            return Decode::Corrupt(ProtocolAnomaly::UnknownKind(kind_byte));
        };
        if buf.len() < COMMON_HEADER_SIZE {
            return Decode::NeedMoreData;
        }

        let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        match kind {
            FrameKind::Ping | FrameKind::Pong if len != 0 => {
                return Decode::Corrupt(ProtocolAnomaly::ControlPayload(len));
            }
            FrameKind::Data if len > max_frame_size => {
                return Decode::Corrupt(ProtocolAnomaly::Oversize {
                    len,
                    max: max_frame_size,
                });
            }
            _ => {}
        }

        let header_size = kind.header_size();
        let total = header_size + len as usize;
        if buf.len() < total {
            return Decode::NeedMoreData;
        }

        let frame = match kind {
            FrameKind::Ping | FrameKind::Pong => {
                let mut seq = [0u8; 8];
                seq.copy_from_slice(&buf[COMMON_HEADER_SIZE..CONTROL_HEADER_SIZE]);
                let sequence = u64::from_be_bytes(seq);
                if kind == FrameKind::Ping {
                    Frame::Ping { sequence }
                } else {
                    Frame::Pong { sequence }
                }
            }
            FrameKind::Data => Frame::Data {
                domain_id: u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]),
                payload: buf[DATA_HEADER_SIZE..total].to_vec(),
            },
        };

        Decode::Complete {
            frame,
            consumed: total,
        }
    }

    /// Feed raw stream bytes into the accumulation buffer.
    pub fn feed(&mut self, data: &[u8]) {
        // Compact the buffer if we've consumed a lot
        if self.pos > 0 && self.pos > self.buffer.len() / 2 {
            self.buffer.drain(..self.pos);
            self.pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Decode the next frame from the accumulation buffer.
    ///
    /// On [`Decode::Corrupt`] the offending byte is discarded along with any
    /// following bytes that cannot start a frame, so the next call resumes at
    /// a plausible frame boundary.
    pub fn next_frame(&mut self) -> Decode {
        let available = &self.buffer[self.pos..];
        let result = Self::decode(available, self.max_frame_size);
        match &result {
            Decode::Complete { frame, consumed } => {
                self.pos += consumed;
                self.frames_decoded += 1;
                self.bytes_decoded += frame.payload_len() as u64;
            }
            Decode::NeedMoreData => {}
            Decode::Corrupt(_) => {
                self.frames_rejected += 1;
                let skip = available[1..]
                    .iter()
                    .position(|b| FrameKind::from_u8(*b).is_some())
                    .map_or(available.len(), |i| i + 1);
                self.pos += skip;
            }
        }
        if self.pos == self.buffer.len() {
            self.buffer.clear();
            self.pos = 0;
        }
        result
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::with_default_max()
    }
}
