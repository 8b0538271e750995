//! Compact packing of typed values into standalone msgpack buffers.
//!
//! Multipart wires carry msgpack-packed scalars and tuples in individual
//! parts (a uuid, an rpc code, a policy tuple). These helpers keep the
//! serde plumbing in one place.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{DecodeError, EncodeError};

/// Pack a value as msgpack. Structs and tuples come out as positional
/// arrays.
pub fn pack<T: Serialize>(value: &T) -> Result<Vec<u8>, EncodeError> {
    rmp_serde::to_vec(value).map_err(|e| EncodeError::Unrepresentable(e.to_string()))
}

/// Unpack a msgpack buffer into a typed value.
pub fn unpack<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, DecodeError> {
    rmp_serde::from_slice(bytes).map_err(|e| DecodeError::DataTypeMismatch(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_roundtrip() {
        let bytes = pack(&"a-uuid-string").unwrap();
        let back: String = unpack(&bytes).unwrap();
        assert_eq!(back, "a-uuid-string");

        let bytes = pack(&5u32).unwrap();
        let back: u32 = unpack(&bytes).unwrap();
        assert_eq!(back, 5);
    }

    #[test]
    fn tuple_roundtrip() {
        let tuple = (false, true, false, 1.5f64, 0.0f64, 3u32);
        let bytes = pack(&tuple).unwrap();
        let back: (bool, bool, bool, f64, f64, u32) = unpack(&bytes).unwrap();
        assert_eq!(back, tuple);
    }

    #[test]
    fn kind_mismatch() {
        let bytes = pack(&"text").unwrap();
        let back: Result<u64, _> = unpack(&bytes);
        assert!(matches!(back, Err(DecodeError::DataTypeMismatch(_))));
    }
}
