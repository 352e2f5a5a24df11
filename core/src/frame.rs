//! Length-prefixed framing.
//!
//! Frame format:
//! - Length: 4 bytes (big-endian u32), size of the encoded body
//! - Body: `length` bytes of prost-encoded message

use crate::error::WireError;
use prost::Message;

pub const FRAME_HEADER_LEN: usize = 4;

/// Largest frame body accepted from a peer unless configured otherwise.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

/// Encode a message into a single frame ready to be written to the socket.
pub fn encode_frame<M: Message>(msg: &M) -> Result<Vec<u8>, WireError> {
    let len = msg.encoded_len();
    let header = u32::try_from(len).map_err(|_| WireError::FrameTooLarge {
        len,
        max: u32::MAX as usize,
    })?;

    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + len);
    buf.extend_from_slice(&header.to_be_bytes());
    msg.encode(&mut buf)?;
    Ok(buf)
}

/// Reassembles frames from bytes read off a non-blocking stream.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_len: usize,
}

impl FrameDecoder {
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_len,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Pop the next complete frame body, if one is buffered.
    ///
    /// The declared length is checked against the limit as soon as the
    /// header is available, before the body arrives.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, WireError> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let mut header = [0u8; FRAME_HEADER_LEN];
        header.copy_from_slice(&self.buf[..FRAME_HEADER_LEN]);
        let len = u32::from_be_bytes(header) as usize;
        if len > self.max_len {
            return Err(WireError::FrameTooLarge {
                len,
                max: self.max_len,
            });
        }

        if self.buf.len() < FRAME_HEADER_LEN + len {
            return Ok(None);
        }

        let body = self.buf[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len].to_vec();
        self.buf.drain(..FRAME_HEADER_LEN + len);
        Ok(Some(body))
    }

    pub fn decode_next<M: Message + Default>(&mut self) -> Result<Option<M>, WireError> {
        match self.next_frame()? {
            Some(body) => Ok(Some(M::decode(body.as_slice())?)),
            None => Ok(None),
        }
    }

    /// Called once the peer has closed its side: any leftover bytes are a
    /// frame that will never complete.
    pub fn finish(&self) -> Result<(), WireError> {
        if self.buf.is_empty() {
            return Ok(());
        }

        let expected = if self.buf.len() >= FRAME_HEADER_LEN {
            let mut header = [0u8; FRAME_HEADER_LEN];
            header.copy_from_slice(&self.buf[..FRAME_HEADER_LEN]);
            FRAME_HEADER_LEN + u32::from_be_bytes(header) as usize
        } else {
            FRAME_HEADER_LEN
        };

        Err(WireError::Truncated {
            buffered: self.buf.len(),
            expected,
        })
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}
