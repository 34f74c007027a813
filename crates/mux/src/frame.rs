//! Mux wire framing
//!
//! Every frame starts with an 8-byte header:
//!
//! ```text
//! +--------+-------+----------+--------+
//! | length | flags | reserved |  cid   |
//! |  u16   |  u8   |    u8    |  u32   |
//! +--------+-------+----------+--------+
//! ```
//!
//! followed by `length` payload bytes (only Data frames carry payload).
//! Integers are in host byte order on both peers.

use std::mem::size_of;

use bytes::{Buf, BufMut, BytesMut};

use crate::{MuxError, Result};

pub const FRAME_HEADER_LEN: usize = 8;

/// Largest payload a single frame can carry.
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// Limit on unparsed input buffered for one physical connection, and on
/// frames queued for it while it cannot be written.
pub const MAX_MAIN_CHANNEL_BUFFER: usize = 1024 * 1024;

const _: () = assert!(size_of::<u16>() + 2 * size_of::<u8>() + size_of::<u32>() == FRAME_HEADER_LEN);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameFlag {
    Open = 0,
    Close = 1,
    FlowPause = 2,
    FlowResume = 3,
    Data = 4,
}

impl TryFrom<u8> for FrameFlag {
    type Error = MuxError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(FrameFlag::Open),
            1 => Ok(FrameFlag::Close),
            2 => Ok(FrameFlag::FlowPause),
            3 => Ok(FrameFlag::FlowResume),
            4 => Ok(FrameFlag::Data),
            other => Err(MuxError::UnknownFlag(other)),
        }
    }
}

/// Decoded header. `flags` is kept raw; validation is up to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u16,
    pub flags: u8,
    pub cid: u32,
}

impl FrameHeader {
    pub fn new(cid: u32, flag: FrameFlag, length: u16) -> Self {
        Self { length, flags: flag as u8, cid }
    }

    pub fn to_bytes(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut out = [0u8; FRAME_HEADER_LEN];
        out[0..2].copy_from_slice(&self.length.to_ne_bytes());
        out[2] = self.flags;
        out[3] = 0;
        out[4..8].copy_from_slice(&self.cid.to_ne_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; FRAME_HEADER_LEN]) -> Self {
        Self {
            length: u16::from_ne_bytes([bytes[0], bytes[1]]),
            flags: bytes[2],
            cid: u32::from_ne_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }

    /// Header plus payload size on the wire.
    pub fn frame_len(&self) -> usize {
        FRAME_HEADER_LEN + self.length as usize
    }
}

/// Encode a header for a frame carrying `payload_len` bytes.
pub fn encode_header(cid: u32, flag: FrameFlag, payload_len: usize) -> Result<[u8; FRAME_HEADER_LEN]> {
    let length = u16::try_from(payload_len).map_err(|_| MuxError::PayloadTooLarge(payload_len))?;
    Ok(FrameHeader::new(cid, flag, length).to_bytes())
}

/// Decode a header. Returns `(length, flags, cid)`.
pub fn decode_header(bytes: &[u8; FRAME_HEADER_LEN]) -> (u16, u8, u32) {
    let header = FrameHeader::from_bytes(bytes);
    (header.length, header.flags, header.cid)
}

/// A complete frame taken off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub flag: FrameFlag,
    pub cid: u32,
    pub payload: BytesMut,
}

impl Frame {
    pub fn control(flag: FrameFlag, cid: u32) -> Self {
        Self { flag, cid, payload: BytesMut::new() }
    }

    pub fn data(cid: u32, payload: impl AsRef<[u8]>) -> Self {
        Self { flag: FrameFlag::Data, cid, payload: BytesMut::from(payload.as_ref()) }
    }

    /// Serialize header and payload into one buffer.
    pub fn encode(&self) -> Result<BytesMut> {
        let header = encode_header(self.cid, self.flag, self.payload.len())?;
        let mut out = BytesMut::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        out.put_slice(&header);
        out.put_slice(&self.payload);
        Ok(out)
    }
}

/// Build a Data frame from a chunk no larger than [`MAX_FRAME_PAYLOAD`].
pub(crate) fn data_frame(cid: u32, chunk: &[u8]) -> BytesMut {
    debug_assert!(chunk.len() <= MAX_FRAME_PAYLOAD);
    let header = FrameHeader::new(cid, FrameFlag::Data, chunk.len() as u16);
    let mut out = BytesMut::with_capacity(FRAME_HEADER_LEN + chunk.len());
    out.put_slice(&header.to_bytes());
    out.put_slice(chunk);
    out
}

pub(crate) fn control_frame(cid: u32, flag: FrameFlag) -> BytesMut {
    BytesMut::from(&FrameHeader::new(cid, flag, 0).to_bytes()[..])
}

/// Accumulates bytes from a physical connection and yields whole frames.
#[derive(Debug)]
pub struct FrameReader {
    buf: BytesMut,
    limit: usize,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new(MAX_MAIN_CHANNEL_BUFFER)
    }
}

impl FrameReader {
    pub fn new(limit: usize) -> Self {
        Self { buf: BytesMut::new(), limit }
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Append received bytes. Fails once more than `limit` bytes are waiting.
    pub fn push(&mut self, data: BytesMut) -> Result<()> {
        if self.buf.is_empty() {
            self.buf = data;
        } else {
            self.buf.extend_from_slice(&data);
        }
        if self.buf.len() > self.limit {
            return Err(MuxError::ReadOverflow(self.buf.len(), self.limit));
        }
        Ok(())
    }

    /// Take the next complete frame, if one is fully buffered.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let mut raw = [0u8; FRAME_HEADER_LEN];
        raw.copy_from_slice(&self.buf[..FRAME_HEADER_LEN]);
        let header = FrameHeader::from_bytes(&raw);
        if self.buf.len() < header.frame_len() {
            return Ok(None);
        }
        let flag = FrameFlag::try_from(header.flags)?;

        let mut frame = self.buf.split_to(header.frame_len());
        frame.advance(FRAME_HEADER_LEN);
        Ok(Some(Frame { flag, cid: header.cid, payload: frame }))
    }
}
