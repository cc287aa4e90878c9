use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseIdError {
    #[error("expected 64 hex characters, got {0}")]
    BadLength(usize),

    #[error("invalid hex character {0:?}")]
    BadCharacter(char),
}

/// Validates a 64-character hex string and canonicalizes it to lowercase.
///
/// Comparison of identifiers is case-insensitive across the wire, so every
/// identifier is normalized at the parsing boundary and stays lowercase for
/// the rest of its life. Whitespace is not trimmed; padded values fail.
fn canonical_hex64(value: &str) -> Result<String, ParseIdError> {
    if value.len() != 64 {
        return Err(ParseIdError::BadLength(value.len()));
    }
    if let Some(bad) = value.chars().find(|c| !c.is_ascii_hexdigit()) {
        return Err(ParseIdError::BadCharacter(bad));
    }
    Ok(value.to_ascii_lowercase())
}

macro_rules! hex64_newtype {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                Ok(Self(canonical_hex64(value)?))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let value = String::deserialize(deserializer)?;
                value.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

hex64_newtype!(
    StoreId,
    "Identifier of a store, the hex-encoded 32-byte id of its on-network registration."
);

hex64_newtype!(
    RootHash,
    "Merkle root of one committed snapshot of a store."
);

hex64_newtype!(
    Digest,
    "A hex-encoded sha-256 digest; used both for content digests and Merkle leaf hashes."
);

impl RootHash {
    /// The root declared by a commitment with no leaves.
    pub fn zero() -> Self {
        Self("0".repeat(64))
    }

    pub fn is_zero(&self) -> bool {
        self.0.bytes().all(|b| b == b'0')
    }
}

impl Digest {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(hex::encode(bytes))
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        hex::decode_to_slice(&self.0, &mut out).expect("digest is validated hex");
        out
    }
}
