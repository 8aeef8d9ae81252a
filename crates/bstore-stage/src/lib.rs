//! Staging for the bundle store.
//!
//! The [`Assembler`] turns an ordered list of [`SourceSpec`]s into a single
//! tree inside the store's temp area. Sources may be local paths, URLs,
//! git repositories or archives; each one is staged under its base name.
//!
//! # Collapsing
//!
//! One source: the staged subpath *is* the result and the wrapping temp
//! directory goes on the cleanup list. Several sources: the wrapper itself is
//! the result, holding every staged subpath side by side.
//!
//! # Failure
//!
//! Local sources are validated before anything is staged, and the first
//! failing source aborts the batch. Nothing staged here is ever visible
//! under `data/`; promotion is the store's job.

pub mod archive;
pub mod assembler;
pub mod error;
pub mod source;
pub mod transfer;

pub use archive::ArchiveFormat;
pub use assembler::{Assembled, Assembler, UploadOptions};
pub use error::{StageError, StageResult};
pub use source::SourceSpec;
pub use transfer::{NetworkTransfer, Transfer, TransferConfig};
