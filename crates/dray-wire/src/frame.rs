//! The multiplexed RPC frame: `[channel_id, message_id, args]`.
//!
//! On the wire a frame is a big-endian `u32` length prefix followed by a
//! msgpack array of exactly three elements: the channel id (unsigned, fits
//! `u64`), the message id (unsigned, fits `u32`) and the argument array.

use bytes::{BufMut, Bytes, BytesMut};
use rmpv::Value;
use serde::de::DeserializeOwned;

use crate::error::{DecodeError, EncodeError};
use crate::fits_item_limit;

/// Length prefix size in bytes.
const PREFIX: usize = 4;

/// One decoded RPC frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub channel: u64,
    pub message: u32,
    pub args: Vec<Value>,
}

impl Frame {
    pub fn new(channel: u64, message: u32, args: Vec<Value>) -> Self {
        Frame {
            channel,
            message,
            args,
        }
    }

    /// Unpack the argument array into a typed tuple.
    ///
    /// Incompatible field kinds surface as [`DecodeError::DataTypeMismatch`].
    pub fn args_as<T: DeserializeOwned>(&self) -> Result<T, DecodeError> {
        rmpv::ext::from_value(Value::Array(self.args.clone()))
            .map_err(|e| DecodeError::DataTypeMismatch(e.to_string()))
    }
}

/// Encode one frame into a length-prefixed buffer.
///
/// The only failure mode is an argument item past the 2 GiB limit.
pub fn encode(channel: u64, message: u32, args: &[Value]) -> Result<Bytes, EncodeError> {
    for item in args {
        check_item(item)?;
    }

    let value = Value::Array(vec![
        Value::from(channel),
        Value::from(message),
        Value::Array(args.to_vec()),
    ]);

    let mut body = Vec::new();
    rmpv::encode::write_value(&mut body, &value)
        .map_err(|e| EncodeError::Unrepresentable(e.to_string()))?;

    let mut buf = BytesMut::with_capacity(PREFIX + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
    Ok(buf.freeze())
}

fn check_item(value: &Value) -> Result<(), EncodeError> {
    let size = match value {
        Value::Binary(b) => b.len() as u64,
        Value::String(s) => s.as_bytes().len() as u64,
        Value::Array(items) => {
            for item in items {
                check_item(item)?;
            }
            return Ok(());
        }
        Value::Map(entries) => {
            for (k, v) in entries {
                check_item(k)?;
                check_item(v)?;
            }
            return Ok(());
        }
        _ => return Ok(()),
    };

    if fits_item_limit(size) {
        Ok(())
    } else {
        Err(EncodeError::OversizedItem { size })
    }
}

/// Incremental frame decoder.
///
/// Feed it transport bytes as they arrive and drain complete frames with
/// [`FrameDecoder::next`]. Partial frames are retained until the remainder
/// shows up.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        FrameDecoder {
            buf: BytesMut::new(),
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pull the next complete frame out of the buffer, if any.
    pub fn next(&mut self) -> Result<Option<Frame>, DecodeError> {
        if self.buf.len() < PREFIX {
            return Ok(None);
        }

        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len == 0 {
            return Err(DecodeError::Parse("zero-length frame".into()));
        }
        if self.buf.len() < PREFIX + len {
            return Ok(None);
        }

        let body = self.buf.split_to(PREFIX + len).split_off(PREFIX);
        let frame = parse_body(&body)?;
        Ok(Some(frame))
    }
}

fn parse_body(body: &[u8]) -> Result<Frame, DecodeError> {
    let mut cursor = body;
    let value =
        rmpv::decode::read_value(&mut cursor).map_err(|e| DecodeError::Parse(e.to_string()))?;
    if !cursor.is_empty() {
        return Err(DecodeError::Parse("trailing bytes after frame body".into()));
    }

    let items = match value {
        Value::Array(items) => items,
        _ => return Err(DecodeError::FrameFormat("frame is not an array")),
    };
    let [channel, message, args]: [Value; 3] = items
        .try_into()
        .map_err(|_| DecodeError::FrameFormat("frame is not an array of three elements"))?;

    let channel = match channel {
        Value::Integer(n) => n
            .as_u64()
            .ok_or(DecodeError::FrameFormat("channel id is not unsigned"))?,
        _ => return Err(DecodeError::FrameFormat("channel id is not an integer")),
    };
    let message = match message {
        Value::Integer(n) => {
            let wide = n
                .as_u64()
                .ok_or(DecodeError::FrameFormat("message id is not unsigned"))?;
            u32::try_from(wide)
                .map_err(|_| DecodeError::FrameFormat("message id does not fit 32 bits"))?
        }
        _ => return Err(DecodeError::FrameFormat("message id is not an integer")),
    };
    let args = match args {
        Value::Array(args) => args,
        _ => return Err(DecodeError::FrameFormat("frame args is not an array")),
    };

    Ok(Frame::new(channel, message, args))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: &Frame) -> Frame {
        let bytes = encode(frame.channel, frame.message, &frame.args).unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.feed(&bytes);
        let out = decoder.next().unwrap().unwrap();
        assert!(decoder.next().unwrap().is_none());
        out
    }

    #[test]
    fn encode_decode_roundtrip() {
        let frames = [
            Frame::new(0, 0, vec![]),
            Frame::new(1, 3, vec![Value::from("invoke"), Value::from(42)]),
            Frame::new(
                u64::MAX,
                u32::MAX,
                vec![
                    Value::Binary(vec![0, 1, 2, 255]),
                    Value::Array(vec![Value::from(true), Value::Nil]),
                    Value::Map(vec![(Value::from("k"), Value::from(1.5))]),
                ],
            ),
        ];

        for frame in &frames {
            assert_eq!(&roundtrip(frame), frame);
        }
    }

    #[test]
    fn zero_length_payload_item() {
        let frame = Frame::new(7, 0, vec![Value::Binary(vec![])]);
        assert_eq!(&roundtrip(&frame), &frame);
    }

    #[test]
    fn partial_input_is_retained() {
        let bytes = encode(9, 2, &[Value::from("hello")]).unwrap();
        let mut decoder = FrameDecoder::new();

        let (head, tail) = bytes.split_at(bytes.len() / 2);
        decoder.feed(head);
        assert!(decoder.next().unwrap().is_none());
        decoder.feed(tail);

        let frame = decoder.next().unwrap().unwrap();
        assert_eq!(frame.channel, 9);
        assert_eq!(frame.message, 2);
    }

    #[test]
    fn several_frames_in_one_feed() {
        let a = encode(1, 0, &[]).unwrap();
        let b = encode(2, 1, &[Value::from(7)]).unwrap();

        let mut decoder = FrameDecoder::new();
        let mut joined = Vec::new();
        joined.extend_from_slice(&a);
        joined.extend_from_slice(&b);
        decoder.feed(&joined);

        assert_eq!(decoder.next().unwrap().unwrap().channel, 1);
        assert_eq!(decoder.next().unwrap().unwrap().channel, 2);
        assert!(decoder.next().unwrap().is_none());
    }

    #[test]
    fn rejects_non_array_frame() {
        let mut body = Vec::new();
        rmpv::encode::write_value(&mut body, &Value::from("nope")).unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
        buf.extend_from_slice(&body);

        let mut decoder = FrameDecoder::new();
        decoder.feed(&buf);
        match decoder.next() {
            Err(DecodeError::FrameFormat(_)) => {}
            other => panic!("expected frame format error, got {:?}", other),
        }
    }

    #[test]
    fn rejects_wrong_arity() {
        let mut body = Vec::new();
        let value = Value::Array(vec![Value::from(1u64), Value::from(2u32)]);
        rmpv::encode::write_value(&mut body, &value).unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
        buf.extend_from_slice(&body);

        let mut decoder = FrameDecoder::new();
        decoder.feed(&buf);
        assert!(matches!(
            decoder.next(),
            Err(DecodeError::FrameFormat(_))
        ));
    }

    #[test]
    fn rejects_garbage() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&8u32.to_be_bytes());
        buf.extend_from_slice(&[0xc1; 8]); // 0xc1 is never valid msgpack

        let mut decoder = FrameDecoder::new();
        decoder.feed(&buf);
        assert!(matches!(decoder.next(), Err(DecodeError::Parse(_))));
    }

    #[test]
    fn typed_unpack() {
        let frame = Frame::new(3, 1, vec![Value::from(404), Value::from("not found")]);
        let (code, message): (i32, String) = frame.args_as().unwrap();
        assert_eq!(code, 404);
        assert_eq!(message, "not found");
    }

    #[test]
    fn typed_unpack_mismatch() {
        let frame = Frame::new(3, 1, vec![Value::from("not a number")]);
        let result: Result<(i32,), _> = frame.args_as();
        assert!(matches!(result, Err(DecodeError::DataTypeMismatch(_))));
    }
}
