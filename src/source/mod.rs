//! Read side of the live data layer.
//!
//! The collector that populates the operational store lives outside this
//! crate; the engine only needs a consistent snapshot of a collection and the
//! committed deltas past a watermark.

mod directory;
mod memory;

pub use directory::DirectorySource;
pub use memory::MemorySource;

use crate::core::{CommittedDelta, Result};
use async_trait::async_trait;

#[async_trait]
pub trait CollectionSource: Send + Sync {
    /// A point-in-time serialized view of `collection`.
    async fn read_consistent_snapshot(&self, collection: &str) -> Result<Vec<u8>>;

    /// Committed deltas with `seq` greater than `watermark` (all of them when
    /// `None`), ordered by `seq`.
    async fn read_deltas_since(
        &self,
        collection: &str,
        watermark: Option<u64>,
    ) -> Result<Vec<CommittedDelta>>;
}
