//! Netstring framing: `<decimal length>:<payload>,`
//!
//!   "5:hello,"   → b"hello"
//!   "0:,"        → empty message, used as a terminator by convention
//!
//! The length is at most [`MAX_LENGTH_DIGITS`] ASCII digits with no leading
//! zeros: a `0` must be followed by a non-digit. Anything other than a digit
//! before `:` or a missing `,` after the payload is a framing error.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Longest accepted length prefix.
pub const MAX_LENGTH_DIGITS: usize = 9;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("netstring length has more than {MAX_LENGTH_DIGITS} digits")]
    TooManyDigits,
    #[error("netstring length has a leading zero")]
    LeadingZero,
    #[error("netstring length contains {0:#04x}")]
    BadLength(u8),
    #[error("netstring payload of {len} bytes exceeds limit of {max}")]
    TooLarge { len: usize, max: usize },
    #[error("netstring missing trailing comma (found {0:#04x})")]
    MissingComma(u8),
    #[error("connection closed mid-netstring")]
    UnexpectedEof,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Incremental parser for the `<digits>:` prefix.
///
/// Feed bytes one at a time; it yields the declared length once `:` arrives.
#[derive(Debug, Default)]
pub struct LengthParser {
    len: usize,
    digits: usize,
    leading_zero: bool,
}

impl LengthParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one prefix byte. `Ok(Some(len))` when the prefix is complete.
    pub fn push(&mut self, byte: u8) -> Result<Option<usize>, FrameError> {
        match byte {
            b'0'..=b'9' => {
                if self.leading_zero {
                    return Err(FrameError::LeadingZero);
                }
                if self.digits == MAX_LENGTH_DIGITS {
                    return Err(FrameError::TooManyDigits);
                }
                if self.digits == 0 && byte == b'0' {
                    self.leading_zero = true;
                }
                self.len = self.len * 10 + (byte - b'0') as usize;
                self.digits += 1;
                Ok(None)
            }
            b':' if self.digits > 0 => Ok(Some(self.len)),
            other => Err(FrameError::BadLength(other)),
        }
    }

    /// True once at least one byte has been consumed.
    pub fn started(&self) -> bool {
        self.digits > 0
    }
}

/// Bytes needed to frame a payload of `len` bytes.
pub fn encoded_len(len: usize) -> usize {
    let mut digits = 1;
    let mut n = len / 10;
    while n > 0 {
        digits += 1;
        n /= 10;
    }
    digits + 1 + len + 1
}

/// Append one framed payload to `dst`.
pub fn encode(payload: &[u8], dst: &mut BytesMut) {
    dst.reserve(encoded_len(payload.len()));
    dst.put_slice(payload.len().to_string().as_bytes());
    dst.put_u8(b':');
    dst.put_slice(payload);
    dst.put_u8(b',');
}

/// Convenience wrapper around [`encode`].
pub fn to_bytes(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::new();
    encode(payload, &mut buf);
    buf.freeze()
}

/// Decode one netstring from the front of `src`.
///
/// Returns `Ok(None)` when `src` holds only part of a frame; nothing is
/// consumed in that case. On success the frame is split off `src`.
pub fn decode(src: &mut BytesMut, max_len: usize) -> Result<Option<Bytes>, FrameError> {
    let mut parser = LengthParser::new();
    let mut len = None;
    let mut prefix = 0;
    for &byte in src.iter() {
        prefix += 1;
        if let Some(n) = parser.push(byte)? {
            len = Some(n);
            break;
        }
    }
    let Some(len) = len else {
        return Ok(None);
    };
    if len > max_len {
        return Err(FrameError::TooLarge { len, max: max_len });
    }
    if src.len() < prefix + len + 1 {
        return Ok(None);
    }
    let comma = src[prefix + len];
    if comma != b',' {
        return Err(FrameError::MissingComma(comma));
    }

    src.advance(prefix);
    let payload = src.split_to(len).freeze();
    src.advance(1);
    Ok(Some(payload))
}
