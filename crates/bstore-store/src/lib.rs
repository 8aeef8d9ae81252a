//! Content-addressed bundle store.
//!
//! A store is a root directory holding exactly two subdirectories:
//!
//! - `data/<hash>`: immutable, fully written bundles keyed by [`ContentHash`]
//! - `temp/<id>`: transient staging areas owned by one in-flight operation
//!
//! # Components
//!
//! - [`StoreLayout`] -- pure location resolution plus temp-location creation
//! - [`Publisher`] -- hashes a staged tree and promotes it with a no-replace
//!   rename, treating "already there" as deduplication
//! - [`GarbageCollector`] -- data and temp sweeps; asks a
//!   [`ReferenceAuthority`] before every stored-entry deletion
//! - [`BundleStore`] -- the public operation surface tying them together
//!
//! # Design Rules
//!
//! 1. Nothing partially written is ever visible under `data/`.
//! 2. Two publishers of identical content both succeed with the same hash.
//! 3. The filesystem carries no ownership metadata; liveness comes only from
//!    the reference authority, queried fresh every time.
//! 4. GC is best-effort: one failed deletion never aborts a sweep.
//!
//! [`ContentHash`]: bstore_types::ContentHash

pub mod authority;
pub mod config;
pub mod error;
pub mod gc;
pub mod layout;
pub mod publish;
pub mod store;

pub use authority::{InMemoryReferenceAuthority, ManifestAuthority, ReferenceAuthority};
pub use config::{DataSweep, StoreConfig};
pub use error::{ErrorKind, StoreError, StoreResult};
pub use gc::{GarbageCollector, GcAction, GcArea, GcFailure, GcReport};
pub use layout::StoreLayout;
pub use publish::{PublishOutcome, PublishReceipt, PublishState, Publisher};
pub use store::BundleStore;
