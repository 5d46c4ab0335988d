//! Base64 helpers for binary fields that cross JSON.
//!
//! Ciphertexts, public keys and signatures are opaque byte strings on the
//! wire. They are carried as base64 through `#[serde(with = "serde_base64")]`
//! instead of being re-interpreted as text anywhere.

use base64ct::{Base64, Encoding};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serializer};

pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&Base64::encode_string(bytes))
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    Base64::decode_vec(&encoded).map_err(|_| D::Error::custom("invalid base64 value"))
}

/// Same as the parent module for `Option<Vec<u8>>` fields.
pub mod option {
    use super::*;

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_str(&Base64::encode_string(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?;
        match encoded {
            Some(encoded) => Base64::decode_vec(&encoded)
                .map(Some)
                .map_err(|_| D::Error::custom("invalid base64 value")),
            None => Ok(None),
        }
    }
}
