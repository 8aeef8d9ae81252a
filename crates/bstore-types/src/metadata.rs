use serde::{Deserialize, Serialize};

/// Statistics computed once when content is published.
///
/// The store does not persist this; callers attach it to their own record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataMetadata {
    /// Total bytes of every file in the tree.
    pub data_size: u64,
}
