//! Router-style multipart messages.
//!
//! A multipart message is a counted sequence of binary parts. On the wire:
//! a big-endian `u32` part count, then for each part a big-endian `u32`
//! length and the raw bytes. Empty parts are legal and significant; the
//! worker wire uses one as the delimiter after the route token.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{DecodeError, EncodeError};
use crate::fits_item_limit;

/// Hard cap on parts per message. Nothing on the worker wire is longer than
/// six parts; the cap only guards against corrupt counts.
const MAX_PARTS: u32 = 64;

pub type Multipart = Vec<Bytes>;

/// Encode a multipart message into one contiguous buffer.
pub fn encode(parts: &[Bytes]) -> Result<Bytes, EncodeError> {
    if parts.len() as u32 > MAX_PARTS {
        return Err(EncodeError::Unrepresentable(format!(
            "{} parts exceeds the multipart cap",
            parts.len()
        )));
    }
    for part in parts {
        if !fits_item_limit(part.len() as u64) {
            return Err(EncodeError::OversizedItem {
                size: part.len() as u64,
            });
        }
    }

    let total: usize = parts.iter().map(|p| 4 + p.len()).sum();
    let mut buf = BytesMut::with_capacity(4 + total);
    buf.put_u32(parts.len() as u32);
    for part in parts {
        buf.put_u32(part.len() as u32);
        buf.put_slice(part);
    }
    Ok(buf.freeze())
}

/// Incremental multipart decoder, same contract as the frame decoder:
/// partial messages are retained across feeds.
#[derive(Debug, Default)]
pub struct MultipartDecoder {
    buf: BytesMut,
}

impl MultipartDecoder {
    pub fn new() -> Self {
        MultipartDecoder {
            buf: BytesMut::new(),
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn next(&mut self) -> Result<Option<Multipart>, DecodeError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }

        let count = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        if count > MAX_PARTS {
            return Err(DecodeError::Parse(format!(
                "part count {} exceeds the multipart cap",
                count
            )));
        }

        // First pass: make sure the whole message is buffered.
        let mut offset = 4usize;
        for _ in 0..count {
            if self.buf.len() < offset + 4 {
                return Ok(None);
            }
            let len = u32::from_be_bytes([
                self.buf[offset],
                self.buf[offset + 1],
                self.buf[offset + 2],
                self.buf[offset + 3],
            ]) as usize;
            offset += 4;
            if self.buf.len() < offset + len {
                return Ok(None);
            }
            offset += len;
        }

        // Second pass: split it out.
        let mut message = self.buf.split_to(offset);
        let _ = message.split_to(4);
        let mut parts = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let len = u32::from_be_bytes([message[0], message[1], message[2], message[3]]) as usize;
            let _ = message.split_to(4);
            parts.push(message.split_to(len).freeze());
        }

        Ok(Some(parts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let parts: Multipart = vec![
            Bytes::from_static(b"route/1"),
            Bytes::new(),
            Bytes::from_static(&[1, 2, 3]),
        ];
        let wire = encode(&parts).unwrap();

        let mut decoder = MultipartDecoder::new();
        decoder.feed(&wire);
        assert_eq!(decoder.next().unwrap().unwrap(), parts);
        assert!(decoder.next().unwrap().is_none());
    }

    #[test]
    fn empty_message() {
        let wire = encode(&[]).unwrap();
        let mut decoder = MultipartDecoder::new();
        decoder.feed(&wire);
        assert_eq!(decoder.next().unwrap().unwrap(), Vec::<Bytes>::new());
    }

    #[test]
    fn partial_parts_are_retained() {
        let parts: Multipart = vec![Bytes::from_static(b"abc"), Bytes::from_static(b"defg")];
        let wire = encode(&parts).unwrap();

        let mut decoder = MultipartDecoder::new();
        for chunk in wire.chunks(3) {
            decoder.feed(chunk);
        }
        assert_eq!(decoder.next().unwrap().unwrap(), parts);
    }

    #[test]
    fn corrupt_count_is_an_error() {
        let mut decoder = MultipartDecoder::new();
        decoder.feed(&u32::MAX.to_be_bytes());
        assert!(matches!(decoder.next(), Err(DecodeError::Parse(_))));
    }

    #[test]
    fn back_to_back_messages() {
        let a = encode(&[Bytes::from_static(b"one")]).unwrap();
        let b = encode(&[Bytes::from_static(b"two")]).unwrap();

        let mut decoder = MultipartDecoder::new();
        decoder.feed(&a);
        decoder.feed(&b);
        assert_eq!(decoder.next().unwrap().unwrap()[0], &b"one"[..]);
        assert_eq!(decoder.next().unwrap().unwrap()[0], &b"two"[..]);
    }
}
