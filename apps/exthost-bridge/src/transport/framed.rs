use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::metrics;

/// `[kind:u8][id:u32][ack:u32][len:u32]`, big-endian.
pub const HEADER_LEN: usize = 13;
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    Regular = 1,
    Ack = 2,
    KeepAlive = 3,
    Disconnect = 4,
}

impl FrameKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameKind::Regular => "regular",
            FrameKind::Ack => "ack",
            FrameKind::KeepAlive => "keep_alive",
            FrameKind::Disconnect => "disconnect",
        }
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = FramingError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(FrameKind::Regular),
            2 => Ok(FrameKind::Ack),
            3 => Ok(FrameKind::KeepAlive),
            4 => Ok(FrameKind::Disconnect),
            other => Err(FramingError::UnknownKind(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    /// Sequence number of a regular frame; 0 for control frames.
    pub id: u32,
    /// Highest regular id the sender has received so far.
    pub ack: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn regular(id: u32, ack: u32, payload: Bytes) -> Self {
        Self {
            kind: FrameKind::Regular,
            id,
            ack,
            payload,
        }
    }

    pub fn control(kind: FrameKind, ack: u32) -> Self {
        Self {
            kind,
            id: 0,
            ack,
            payload: Bytes::new(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_u8(self.kind as u8);
        dst.put_u32(self.id);
        dst.put_u32(self.ack);
        dst.put_u32(self.payload.len() as u32);
        dst.put_slice(&self.payload);
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("unknown frame kind {0}")]
    UnknownKind(u8),
    #[error("frame of {len} bytes exceeds limit of {max}")]
    TooLarge { len: usize, max: usize },
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}

/// Accumulates raw socket reads and yields whole frames.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    max_frame_len: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
            max_frame_len,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Undecoded bytes, starting at the next frame header.
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    pub fn next_frame(&mut self) -> Result<Option<Frame>, FramingError> {
        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }
        let mut header = &self.buffer[..HEADER_LEN];
        let kind = FrameKind::try_from(header.get_u8()).map_err(|err| {
            metrics::FRAMING_ERRORS.with_label_values(&["unknown_kind"]).inc();
            err
        })?;
        let id = header.get_u32();
        let ack = header.get_u32();
        let len = header.get_u32() as usize;
        if len > self.max_frame_len {
            metrics::FRAMING_ERRORS.with_label_values(&["too_large"]).inc();
            return Err(FramingError::TooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        match kind {
            FrameKind::Regular if id == 0 => {
                metrics::FRAMING_ERRORS.with_label_values(&["malformed"]).inc();
                return Err(FramingError::Malformed("regular frame without id"));
            }
            FrameKind::Ack | FrameKind::KeepAlive | FrameKind::Disconnect if len != 0 => {
                metrics::FRAMING_ERRORS.with_label_values(&["malformed"]).inc();
                return Err(FramingError::Malformed("control frame with payload"));
            }
            _ => {}
        }
        if self.buffer.len() < HEADER_LEN + len {
            self.buffer.reserve(HEADER_LEN + len - self.buffer.len());
            return Ok(None);
        }
        self.buffer.advance(HEADER_LEN);
        let payload = self.buffer.split_to(len).freeze();
        Ok(Some(Frame {
            kind,
            id,
            ack,
            payload,
        }))
    }
}
