use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::TypeError;

/// Number of raw digest bytes in a [`ContentHash`].
pub const HASH_LEN: usize = 32;

const PREFIX: &str = "0x";

/// Content-addressed identifier of a stored bundle.
///
/// A `ContentHash` is the BLAKE3 digest of a tree's names, structure, file
/// bytes and executable bits. Identical content always produces the same
/// hash. The canonical text form is `"0x"` followed by 64 lowercase hex
/// characters; that string is also the entry's directory name under `data/`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; HASH_LEN]);

impl ContentHash {
    /// Create a `ContentHash` from a pre-computed digest.
    pub fn from_hash(hash: [u8; HASH_LEN]) -> Self {
        Self(hash)
    }

    /// The raw 32-byte digest.
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Hex digest without the `0x` prefix.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short form for log lines (`0x` + first 8 hex characters).
    pub fn short_hex(&self) -> String {
        format!("{PREFIX}{}", hex::encode(&self.0[..4]))
    }

    /// Parse the canonical `0x`-prefixed form.
    pub fn parse(s: &str) -> Result<Self, TypeError> {
        let digits = s
            .strip_prefix(PREFIX)
            .ok_or_else(|| TypeError::MissingPrefix(s.to_string()))?;
        let bytes = hex::decode(digits).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        if bytes.len() != HASH_LEN {
            return Err(TypeError::InvalidLength {
                expected: HASH_LEN,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; HASH_LEN];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Returns `true` if `name` is a well-formed content hash.
    ///
    /// Used when walking `data/` to skip foreign entries.
    pub fn is_valid(name: &str) -> bool {
        Self::parse(name).is_ok()
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.short_hex())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PREFIX}{}", self.to_hex())
    }
}

impl FromStr for ContentHash {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<[u8; HASH_LEN]> for ContentHash {
    fn from(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
