//! Block storage abstraction for MST nodes and records

use std::collections::BTreeMap;

use crate::error::Result;
use bytes::Bytes;
use cid::Cid as IpldCid;

/// Async block storage trait
///
/// Provides CID-keyed block storage for MST nodes and record data.
/// Implementations might use:
/// - In-memory map ([`MemoryBlockStore`])
/// - An overlay on another store ([`LayeredBlockStore`])
/// - SQLite/RocksDB (user-provided)
/// - Remote HTTP storage (user-provided)
///
/// The tree never retries: errors returned here propagate unchanged.
///
/// # WASM Compatibility
///
/// The trait uses `trait_variant` to conditionally require `Send` only on non-WASM targets,
/// allowing it to work in browser environments where `Send` is not available.
///
/// # Example
///
/// ```rust,ignore
/// use jacquard_mst::storage::{BlockStore, MemoryBlockStore};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let storage = MemoryBlockStore::new();
///
/// let data = b"hello world";
/// let cid = storage.put(data).await?;
///
/// if let Some(retrieved) = storage.get(&cid).await? {
///     assert_eq!(retrieved, data);
/// }
/// # Ok(())
/// # }
/// ```
#[trait_variant::make(Send)]
pub trait BlockStore: Clone {
    /// Get a block by CID
    ///
    /// Returns `None` if the block is not found.
    async fn get(&self, cid: &IpldCid) -> Result<Option<Bytes>>;

    /// Put a block, return its CID
    ///
    /// The CID is calculated from the data using SHA-256 hash and DAG-CBOR codec,
    /// so putting identical bytes twice is a no-op.
    async fn put(&self, data: &[u8]) -> Result<IpldCid>;

    /// Check if a block exists without retrieving it
    async fn has(&self, cid: &IpldCid) -> Result<bool>;

    /// Put many blocks at once
    ///
    /// The provided CIDs should match the data, but implementations may choose to
    /// recalculate and validate them.
    async fn put_many(
        &self,
        blocks: impl IntoIterator<Item = (IpldCid, Bytes)> + Send,
    ) -> Result<()>;

    /// Get multiple blocks at once
    ///
    /// Returns a vec of the same length as the input, with `None` for missing blocks.
    async fn get_many(&self, cids: &[IpldCid]) -> Result<Vec<Option<Bytes>>>;

    /// Apply a set of block writes and deletions
    ///
    /// Writes happen before deletes. Implementations should make this atomic
    /// where they can.
    async fn apply_writes(&self, writes: BlockWrites) -> Result<()>;
}

/// Blocks to persist and blocks to drop, typically built from an
/// [`MstDiff`](crate::mst::MstDiff)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockWrites {
    /// New blocks to write
    pub blocks: BTreeMap<IpldCid, Bytes>,
    /// Blocks no longer reachable from the new root
    pub deleted_cids: Vec<IpldCid>,
}

impl BlockWrites {
    /// Whether there is nothing to write or delete
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.deleted_cids.is_empty()
    }
}

pub mod layered;
pub mod memory;

pub use layered::LayeredBlockStore;
pub use memory::MemoryBlockStore;
