//! Wire Encoding
//!
//! Every structured message (handshake envelopes, sealed frames, control
//! replies) is encoded with bincode using fixed-width integers. Trailing
//! bytes are rejected so a datagram or frame decodes to exactly one value.
//! Stream frames are delimited with a 4-byte big-endian length prefix.

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::codec::LengthDelimitedCodec;

use crate::error::{NetworkError, NetworkResult};

/// Upper bound on any single decoded value
pub const MAX_ENCODED_SIZE: u64 = 4 * 1024 * 1024;

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_ENCODED_SIZE)
        .reject_trailing_bytes()
}

/// Encode a value to bytes
pub fn encode<T: Serialize>(value: &T) -> NetworkResult<Vec<u8>> {
    options()
        .serialize(value)
        .map_err(|e| NetworkError::Encoding(e.to_string()))
}

/// Decode a value, failing if any input is left over
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> NetworkResult<T> {
    options()
        .deserialize(bytes)
        .map_err(|e| NetworkError::Encoding(e.to_string()))
}

/// Length-prefixed framing used on gossip streams
pub fn frame_codec(max_frame_len: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(max_frame_len)
        .new_codec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        id: String,
        value: u64,
    }

    #[test]
    fn test_fixed_width_integers() {
        let bytes = encode(&1u64).unwrap();
        assert_eq!(bytes.len(), 8);
    }

    #[test]
    fn test_rejects_trailing_bytes() {
        let sample = Sample { id: "a".into(), value: 7 };
        let mut bytes = encode(&sample).unwrap();
        assert_eq!(decode::<Sample>(&bytes).unwrap(), sample);

        bytes.push(0);
        assert!(matches!(decode::<Sample>(&bytes), Err(NetworkError::Encoding(_))));
    }

    #[test]
    fn test_rejects_truncated_input() {
        let bytes = encode(&Sample { id: "abc".into(), value: 1 }).unwrap();
        assert!(decode::<Sample>(&bytes[..bytes.len() - 1]).is_err());
    }
}
