//! In-memory block store

use crate::error::Result;
use crate::storage::{BlockStore, BlockWrites};
use bytes::Bytes;
use cid::Cid as IpldCid;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Block store held entirely in memory
///
/// Blocks are kept in CID order, so [`blocks`](Self::blocks) snapshots are
/// stable across runs. Clones share the same map; a tree and a test can hold
/// the same store and both see every write.
///
/// ```rust,ignore
/// use jacquard_mst::{Mst, MemoryBlockStore};
/// use std::sync::Arc;
///
/// # async fn example(record: cid::Cid) -> Result<(), Box<dyn std::error::Error>> {
/// let store = Arc::new(MemoryBlockStore::new());
/// let root = Mst::new(store.clone())
///     .upsert("app.bsky.feed.post/3k2a", record)
///     .await?
///     .persist()
///     .await?;
/// assert!(store.blocks().contains_key(&root));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct MemoryBlockStore {
    blocks: Arc<RwLock<BTreeMap<IpldCid, Bytes>>>,
}

impl MemoryBlockStore {
    /// Empty store
    pub fn new() -> Self {
        Self::new_from_blocks(BTreeMap::new())
    }

    /// Store seeded with existing blocks
    ///
    /// The blocks are taken as given; nothing re-hashes them.
    pub fn new_from_blocks(blocks: BTreeMap<IpldCid, Bytes>) -> Self {
        Self {
            blocks: Arc::new(RwLock::new(blocks)),
        }
    }

    /// Number of blocks held
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether no blocks are held
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Drop every block
    pub fn clear(&self) {
        self.write().clear();
    }

    /// Snapshot of every stored block
    pub fn blocks(&self) -> BTreeMap<IpldCid, Bytes> {
        self.read().clone()
    }

    /// Store `data` under an arbitrary CID, skipping the hash
    #[cfg(test)]
    pub(crate) async fn put_with_cid(&self, cid: IpldCid, data: impl Into<Bytes>) -> Result<()> {
        self.write().insert(cid, data.into());
        Ok(())
    }

    // A panic while holding the lock cannot leave the map half-written,
    // so a poisoned lock is still safe to use.
    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<IpldCid, Bytes>> {
        self.blocks.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<IpldCid, Bytes>> {
        self.blocks.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryBlockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockStore for MemoryBlockStore {
    async fn get(&self, cid: &IpldCid) -> Result<Option<Bytes>> {
        Ok(self.read().get(cid).cloned())
    }

    async fn put(&self, data: &[u8]) -> Result<IpldCid> {
        let cid = crate::mst::util::compute_cid(data)?;
        self.write().insert(cid, Bytes::copy_from_slice(data));
        Ok(cid)
    }

    async fn has(&self, cid: &IpldCid) -> Result<bool> {
        Ok(self.read().contains_key(cid))
    }

    async fn put_many(
        &self,
        blocks: impl IntoIterator<Item = (IpldCid, Bytes)> + Send,
    ) -> Result<()> {
        let mut store = self.write();
        for (cid, data) in blocks {
            store.insert(cid, data);
        }
        Ok(())
    }

    async fn get_many(&self, cids: &[IpldCid]) -> Result<Vec<Option<Bytes>>> {
        let store = self.read();
        Ok(cids.iter().map(|cid| store.get(cid).cloned()).collect())
    }

    async fn apply_writes(&self, writes: BlockWrites) -> Result<()> {
        let mut store = self.write();
        store.extend(writes.blocks);
        for cid in &writes.deleted_cids {
            store.remove(cid);
        }
        Ok(())
    }
}
