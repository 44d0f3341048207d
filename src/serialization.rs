//! JSON serialization helpers for the intake payload

use serde::{Serialize, Serializer};
use std::fmt::Debug;
use thiserror::Error;

/// Longest diagnostic dump kept in a [`SerializationError`]
const MAX_DATA_DUMP_LENGTH: usize = 4096;

/// Integer timestamps are used when the host integer width can hold a
/// microsecond epoch timestamp without precision loss.
pub const TIMESTAMP_AS_INTEGER: bool = usize::BITS >= 64;

/// A value could not be encoded as JSON
#[derive(Error, Debug)]
#[error("Serialization failed: {source} (data: {data_dump})")]
pub struct SerializationError {
    #[source]
    source: serde_json::Error,
    data_dump: String,
}

impl SerializationError {
    /// `{:?}` rendering of the value that failed to serialize
    pub fn data_dump(&self) -> &str {
        &self.data_dump
    }

    pub fn encoding_error(&self) -> &serde_json::Error {
        &self.source
    }
}

/// Encode `data` as a single-line JSON string
///
/// Either the whole value is encoded or an error is returned; no partial
/// output is ever produced.
pub fn serialize_as_json<T>(data: &T) -> Result<String, SerializationError>
where
    T: Serialize + Debug + ?Sized,
{
    serde_json::to_string(data).map_err(|source| {
        let mut data_dump = format!("{:?}", data);
        if data_dump.len() > MAX_DATA_DUMP_LENGTH {
            let mut cut = MAX_DATA_DUMP_LENGTH;
            while !data_dump.is_char_boundary(cut) {
                cut -= 1;
            }
            data_dump.truncate(cut);
            data_dump.push_str("...");
        }
        SerializationError { source, data_dump }
    })
}

/// Timestamp representation on the wire
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AdaptedTimestamp {
    Integer(i64),
    Float(f64),
}

/// Convert a microsecond timestamp to its wire representation
pub fn adapt_timestamp(timestamp: f64) -> AdaptedTimestamp {
    if TIMESTAMP_AS_INTEGER {
        AdaptedTimestamp::Integer(timestamp as i64)
    } else {
        AdaptedTimestamp::Float(timestamp)
    }
}

/// `serialize_with` adapter for microsecond timestamp fields
pub fn serialize_timestamp<S: Serializer>(
    timestamp: &f64,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    adapt_timestamp(*timestamp).serialize(serializer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intercepted::RawText;
    use std::collections::BTreeMap;

    #[test]
    fn test_serialize_plain_values() {
        let mut map = BTreeMap::new();
        map.insert("a", 1);
        map.insert("b", 2);
        assert_eq!(serialize_as_json(&map).unwrap(), r#"{"a":1,"b":2}"#);
    }

    #[test]
    fn test_serialize_invalid_utf8_fails_with_dump() {
        let value = vec![RawText::from("fine"), RawText::from_bytes(vec![0xc3, 0x28])];
        let err = serialize_as_json(&value).unwrap_err();

        assert!(err.data_dump().contains("fine"));
        assert!(err.data_dump().contains("invalid UTF-8"));
        assert!(err.to_string().starts_with("Serialization failed"));
        assert!(err.encoding_error().to_string().contains("not valid UTF-8"));
    }

    #[test]
    fn test_data_dump_is_bounded() {
        let mut value = vec![RawText::from("x".repeat(10_000))];
        value.push(RawText::from_bytes(vec![0xff]));
        let err = serialize_as_json(&value).unwrap_err();
        assert!(err.data_dump().len() <= MAX_DATA_DUMP_LENGTH + 3);
    }

    #[test]
    fn test_adapt_timestamp_uses_integer_on_64_bit_hosts() {
        let adapted = adapt_timestamp(1_700_000_000_123_456.0);
        if TIMESTAMP_AS_INTEGER {
            assert_eq!(adapted, AdaptedTimestamp::Integer(1_700_000_000_123_456));
            assert_eq!(
                serde_json::to_string(&adapted).unwrap(),
                "1700000000123456"
            );
        } else {
            assert_eq!(adapted, AdaptedTimestamp::Float(1_700_000_000_123_456.0));
        }
    }
}
