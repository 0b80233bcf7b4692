//! Length-prefixed frames: a little-endian `u32` byte count followed by that
//! many bytes of JSON.

use bytes::{BufMut, Bytes, BytesMut};

use super::ProtocolError;

pub const LENGTH_PREFIX_LEN: usize = 4;

/// Outcome of reading the length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthPrefix {
    /// A usable body length.
    Body(u32),
    /// A zero-length frame; carries no message.
    Empty,
    /// Fewer than four bytes arrived.
    Truncated { read: usize },
}

/// Outcome of reading a frame body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyRead {
    Complete(Bytes),
    Truncated { expected: u32, read: usize },
}

pub fn encode_frame(body: &[u8]) -> Result<Bytes, ProtocolError> {
    let len = u32::try_from(body.len()).map_err(|_| ProtocolError::FrameTooLarge(body.len()))?;
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + body.len());
    buf.put_u32_le(len);
    buf.put_slice(body);
    Ok(buf.freeze())
}

pub fn decode_length(buf: &[u8]) -> LengthPrefix {
    let Ok(prefix) = <[u8; LENGTH_PREFIX_LEN]>::try_from(buf) else {
        return LengthPrefix::Truncated { read: buf.len() };
    };
    match u32::from_le_bytes(prefix) {
        0 => LengthPrefix::Empty,
        len => LengthPrefix::Body(len),
    }
}

pub fn check_body(expected: u32, buf: Bytes) -> BodyRead {
    if buf.len() < expected as usize {
        BodyRead::Truncated {
            expected,
            read: buf.len(),
        }
    } else {
        BodyRead::Complete(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_prefix_is_little_endian() {
        let frame = encode_frame(b"{\"type\":3}").unwrap();
        assert_eq!(&frame[..4], &[10, 0, 0, 0]);
        assert_eq!(&frame[4..], b"{\"type\":3}");
    }

    #[test]
    fn zero_length_is_reported_as_empty() {
        assert_eq!(decode_length(&[0, 0, 0, 0]), LengthPrefix::Empty);
    }

    #[test]
    fn short_prefix_is_truncated() {
        assert_eq!(decode_length(&[1, 2]), LengthPrefix::Truncated { read: 2 });
        assert_eq!(decode_length(&[]), LengthPrefix::Truncated { read: 0 });
    }

    #[test]
    fn large_lengths_decode() {
        assert_eq!(
            decode_length(&[0x00, 0x01, 0x00, 0x80]),
            LengthPrefix::Body(0x8000_0100)
        );
    }

    #[test]
    fn short_body_is_truncated() {
        let read = check_body(10, Bytes::from_static(b"abc"));
        assert_eq!(
            read,
            BodyRead::Truncated {
                expected: 10,
                read: 3
            }
        );
        assert_eq!(
            check_body(3, Bytes::from_static(b"abc")),
            BodyRead::Complete(Bytes::from_static(b"abc"))
        );
    }
}
