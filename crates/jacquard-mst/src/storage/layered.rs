//! Overlay block store for staging tree edits

use std::sync::Arc;

use crate::error::Result;
use crate::storage::{BlockStore, BlockWrites};
use bytes::Bytes;
use cid::Cid as IpldCid;

/// Block store that reads through to a base store it never writes
///
/// Open a tree over this to stage edits against an existing tree: fetches
/// fall back to `base`, and every node the edits produce lands in
/// `writable`. Dropping the overlay discards the staged nodes.
///
/// ```rust,ignore
/// use jacquard_mst::{LayeredBlockStore, MemoryBlockStore, Mst, MstOptions};
/// use std::sync::Arc;
///
/// # async fn example(base: Arc<MemoryBlockStore>, root: cid::Cid, record: cid::Cid) -> jacquard_mst::Result<()> {
/// let staged = Arc::new(LayeredBlockStore::new(MemoryBlockStore::new(), base));
/// let options = MstOptions::new().persist_on_write(true).build();
/// let tree = Mst::load_with_options(staged.clone(), root, options)
///     .upsert("app.bsky.feed.like/3k2b", record)
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct LayeredBlockStore<W: BlockStore, B: BlockStore> {
    writable: W,
    base: Arc<B>,
}

impl<W: BlockStore, B: BlockStore> LayeredBlockStore<W, B> {
    /// Overlay `writable` on `base`
    pub fn new(writable: W, base: Arc<B>) -> Self {
        Self { writable, base }
    }

    /// Overlay receiving all writes
    pub fn writable(&self) -> &W {
        &self.writable
    }

    /// Read-only fallback
    pub fn base(&self) -> &Arc<B> {
        &self.base
    }
}

impl<W: BlockStore + Sync + 'static, B: BlockStore + Sync + Send + 'static> BlockStore
    for LayeredBlockStore<W, B>
{
    async fn get(&self, cid: &IpldCid) -> Result<Option<Bytes>> {
        if let Some(data) = self.writable.get(cid).await? {
            return Ok(Some(data));
        }
        self.base.get(cid).await
    }

    async fn put(&self, data: &[u8]) -> Result<IpldCid> {
        self.writable.put(data).await
    }

    async fn has(&self, cid: &IpldCid) -> Result<bool> {
        if self.writable.has(cid).await? {
            return Ok(true);
        }
        self.base.has(cid).await
    }

    async fn put_many(
        &self,
        blocks: impl IntoIterator<Item = (IpldCid, Bytes)> + Send,
    ) -> Result<()> {
        self.writable.put_many(blocks).await
    }

    async fn get_many(&self, cids: &[IpldCid]) -> Result<Vec<Option<Bytes>>> {
        let mut found = self.writable.get_many(cids).await?;
        for (cid, slot) in cids.iter().zip(found.iter_mut()) {
            if slot.is_none() {
                *slot = self.base.get(cid).await?;
            }
        }
        Ok(found)
    }

    async fn apply_writes(&self, writes: BlockWrites) -> Result<()> {
        // base is read-only; deletes only reach blocks the overlay holds
        self.writable.apply_writes(writes).await
    }
}
