use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TypeError;

/// Identifier of a record that references stored content (e.g. a bundle uuid).
///
/// The store never interprets owner ids; it only compares them against the
/// exclusion set passed to a data sweep.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh `0x`-prefixed UUID v7 owner id.
    pub fn generate() -> Self {
        Self(format!("0x{}", Uuid::now_v7().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OwnerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Name of an entry under `temp/`.
///
/// A `TempId` is a single path component: non-empty, no separators, and not
/// `.` or `..`, so `temp/<id>` can never escape the temporary area.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TempId(String);

impl TempId {
    pub fn new(id: impl Into<String>) -> Result<Self, TypeError> {
        let id = id.into();
        let reason = if id.is_empty() {
            Some("empty")
        } else if id == "." || id == ".." {
            Some("relative path component")
        } else if id.contains('/') || id.contains('\\') {
            Some("contains a path separator")
        } else if id.contains('\0') {
            Some("contains a NUL byte")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(TypeError::InvalidIdentifier { value: id, reason }),
            None => Ok(Self(id)),
        }
    }

    /// A fresh UUID v7 identifier. Time-ordered, so `temp/` lists oldest first.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().simple().to_string())
    }

    /// A fresh identifier with a readable suffix, e.g. `<uuid>-upload`.
    pub fn generate_with_suffix(suffix: &str) -> Result<Self, TypeError> {
        Self::new(format!("{}-{suffix}", Uuid::now_v7().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TempId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TempId {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for TempId {
    type Error = TypeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<TempId> for String {
    fn from(id: TempId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_temp_ids_are_unique() {
        let a = TempId::generate();
        let b = TempId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn temp_id_rejects_separators() {
        assert!(TempId::new("a/b").is_err());
        assert!(TempId::new("..").is_err());
        assert!(TempId::new("").is_err());
        assert!(TempId::new("upload-7").is_ok());
    }

    #[test]
    fn temp_id_suffix() {
        let id = TempId::generate_with_suffix("upload").unwrap();
        assert!(id.as_str().ends_with("-upload"));
    }

    #[test]
    fn temp_id_serde_validates() {
        let bad: Result<TempId, _> = serde_json::from_str("\"../escape\"");
        assert!(bad.is_err());
        let good: TempId = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(good.as_str(), "abc");
    }

    #[test]
    fn owner_id_generate_is_prefixed() {
        let id = OwnerId::generate();
        assert!(id.as_str().starts_with("0x"));
        assert_eq!(id.as_str().len(), 2 + 32);
    }

    #[test]
    fn owner_id_serde_is_transparent() {
        let id = OwnerId::new("0xbundle");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"0xbundle\"");
    }
}
