//! Record serialization for the backing medium.
//!
//! The store persists elements as newline-separated records, so any codec
//! whose output contains no raw `\n` byte can plug in. [`JsonCodec`] is the
//! default: one JSON document per line, which replays in append order with
//! a plain line scan.

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

/// Encodes and decodes single records for an
/// [`AppendStore`](crate::AppendStore) medium.
///
/// Implementations must be pure per record: `decode(encode(v)) == v`, and
/// the encoded form must not contain the record separator (`\n`).
pub trait Codec<T>: Send + Sync + 'static {
    /// Encodes one element into a record, without the trailing separator.
    fn encode(&self, value: &T) -> Result<Bytes>;

    /// Decodes one record back into an element.
    fn decode(&self, record: &[u8]) -> Result<T>;
}

/// JSON-lines codec: one `serde_json` document per record.
///
/// JSON escapes embedded newlines, so the separator invariant holds for
/// any serializable type.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<T> Codec<T> for JsonCodec
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn encode(&self, value: &T) -> Result<Bytes> {
        let encoded = serde_json::to_vec(value).map_err(|e| Error::Codec(e.to_string()))?;
        Ok(Bytes::from(encoded))
    }

    fn decode(&self, record: &[u8]) -> Result<T> {
        serde_json::from_slice(record).map_err(|e| Error::Codec(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_round_trip_string_rows() {
        // given
        let codec = JsonCodec;
        let row = vec!["a".to_string(), "b\nwith newline".to_string()];

        // when
        let encoded: Bytes = codec.encode(&row).unwrap();
        let decoded: Vec<String> = codec.decode(&encoded).unwrap();

        // then - the record contains no raw separator and round-trips
        assert!(!encoded.contains(&b'\n'));
        assert_eq!(decoded, row);
    }

    #[test]
    fn should_report_malformed_record() {
        // given
        let codec = JsonCodec;

        // when
        let result: Result<Vec<String>> = codec.decode(b"not json");

        // then
        assert!(matches!(result, Err(Error::Codec(_))));
    }
}
