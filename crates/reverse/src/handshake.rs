use bytes::{Buf, BufMut, BytesMut};

use crate::{ReverseError, Result, HANDSHAKE_BYTE, HANDSHAKE_LEN};

/// The preamble a reverse client sends right after connecting.
pub fn preamble() -> BytesMut {
    let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
    buf.put_bytes(HANDSHAKE_BYTE, HANDSHAKE_LEN);
    buf
}

/// Consumes the preamble at the start of an inbound peer connection.
///
/// Only the first byte is checked; the rest of the preamble is skipped
/// whatever it contains.
#[derive(Debug, Default)]
pub struct HandshakeReader {
    consumed: usize,
}

impl HandshakeReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_complete(&self) -> bool {
        self.consumed == HANDSHAKE_LEN
    }

    /// Feed received bytes. Returns the bytes following the preamble once it
    /// has been fully consumed, `None` while more preamble is expected.
    pub fn feed(&mut self, mut data: BytesMut) -> Result<Option<BytesMut>> {
        if self.is_complete() {
            return Ok(Some(data));
        }
        if self.consumed == 0 {
            match data.first() {
                None => return Ok(None),
                Some(&b) if b != HANDSHAKE_BYTE => return Err(ReverseError::HandshakeRejected(b)),
                Some(_) => {}
            }
        }
        let take = (HANDSHAKE_LEN - self.consumed).min(data.len());
        data.advance(take);
        self.consumed += take;
        if self.is_complete() {
            Ok(Some(data))
        } else {
            Ok(None)
        }
    }
}
