//! Filesystem primitives for the bundle store.
//!
//! The store has no database protecting its on-disk state, so every
//! guarantee it makes is built from the operations in this crate:
//!
//! - [`TreeListing`] -- one deterministic walk of a tree, shared by hashing and sizing
//! - [`copy_tree`] / [`move_path`] -- staging copies honoring symlink policy and excludes
//! - [`rename_no_replace`] -- the promotion primitive; never overwrites a published entry
//! - [`remove_path`] -- idempotent deletion
//! - [`CancelToken`] -- cooperative cancellation with optional deadlines
//!
//! Long-running loops check their [`CancelToken`] between files and between
//! chunks, so no single walk or copy can pin a caller indefinitely.

pub mod cancel;
pub mod error;
pub mod listing;
pub mod ops;

pub use cancel::CancelToken;
pub use error::{FsError, FsResult, IoResultExt};
pub use listing::{EntryKind, ListedEntry, TreeListing};
pub use ops::{
    age_of, copy_tree, entries_older_than, move_path, remove_path, rename_no_replace, touch,
    CopyOptions, ExcludeSet, RenameOutcome,
};
