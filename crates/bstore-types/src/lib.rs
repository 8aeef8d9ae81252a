//! Foundation types for the bundle store.
//!
//! Every other `bstore-*` crate depends on `bstore-types`.
//!
//! # Key Types
//!
//! - [`ContentHash`] -- `0x`-prefixed BLAKE3 digest of a stored tree; the store's primary key
//! - [`OwnerId`] -- opaque identifier of a record that references a content hash
//! - [`TempId`] -- caller-chosen name of an entry in the temporary area
//! - [`DataMetadata`] -- statistics computed once at publish time

pub mod error;
pub mod hash;
pub mod identifier;
pub mod metadata;

pub use error::TypeError;
pub use hash::ContentHash;
pub use identifier::{OwnerId, TempId};
pub use metadata::DataMetadata;
