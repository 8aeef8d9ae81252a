//! Content hashing for the bundle store.
//!
//! Hashes a [`TreeListing`](bstore_fs::TreeListing) into a
//! [`ContentHash`](bstore_types::ContentHash). File bytes are streamed through
//! BLAKE3 in fixed-size chunks; no file is ever held in memory whole.

pub mod hasher;

pub use hasher::{ContentHasher, HashError, HashResult};
