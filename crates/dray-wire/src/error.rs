use std::fmt;

/// Errors produced while encoding a wire unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// A single item exceeded the 2 GiB wire limit.
    OversizedItem { size: u64 },
    /// The value could not be represented in the wire format.
    Unrepresentable(String),
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::OversizedItem { size } => {
                write!(f, "wire item of {} bytes exceeds the 2 GiB limit", size)
            }
            EncodeError::Unrepresentable(what) => {
                write!(f, "value is not representable on the wire: {}", what)
            }
        }
    }
}

impl std::error::Error for EncodeError {}

/// Errors produced while decoding a wire unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The incoming bytes are not valid msgpack or the length prefix is
    /// nonsensical.
    Parse(String),
    /// The unit decoded but does not have the expected framing, e.g. the
    /// outer value is not a three element array.
    FrameFormat(&'static str),
    /// A typed unpack found a field of an incompatible kind.
    DataTypeMismatch(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Parse(detail) => {
                write!(f, "unable to parse the incoming data: {}", detail)
            }
            DecodeError::FrameFormat(detail) => {
                write!(f, "message has an unexpected framing: {}", detail)
            }
            DecodeError::DataTypeMismatch(detail) => {
                write!(f, "message has an unexpected payload: {}", detail)
            }
        }
    }
}

impl std::error::Error for DecodeError {}
