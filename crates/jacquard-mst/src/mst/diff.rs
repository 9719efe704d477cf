//! MST diff calculation

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use cid::Cid as IpldCid;
use smol_str::SmolStr;

use super::cursor::{CursorPosition, MstCursor};
use super::tree::{Mst, WriteOp};
use super::util::compare_keys;
use crate::error::{MstError, Result};
use crate::storage::{BlockStore, BlockWrites};

/// Maximum record operations per commit in the sync protocol
pub const MAX_DIFF_OPS: usize = 200;

/// Diff between two MST states
///
/// Represents the changes needed to transform one tree into another.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MstDiff {
    /// New records created (key, new CID)
    pub creates: Vec<(SmolStr, IpldCid)>,

    /// Records updated (key, new CID, old CID)
    pub updates: Vec<(SmolStr, IpldCid, IpldCid)>,

    /// Records deleted (key, old CID)
    pub deletes: Vec<(SmolStr, IpldCid)>,

    /// Record CIDs that are newly referenced (from creates + updates)
    ///
    /// These need to be available in storage for the new tree.
    pub new_leaf_cids: Vec<IpldCid>,

    /// Record CIDs that are no longer referenced (from deletes + updates)
    ///
    /// These can be garbage collected if not referenced elsewhere.
    pub removed_cids: Vec<IpldCid>,

    /// MST node blocks reachable from the new root but not the old one
    pub new_mst_blocks: BTreeMap<IpldCid, Bytes>,

    /// MST node blocks reachable from the old root but not the new one
    pub removed_mst_blocks: Vec<IpldCid>,
}

impl MstDiff {
    /// Create empty diff
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if diff is empty (no record changes)
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    /// Count total operations
    pub fn op_count(&self) -> usize {
        self.creates.len() + self.updates.len() + self.deletes.len()
    }

    /// Validate against sync v1.1 limits
    ///
    /// The sync protocol has a 200 operation limit per commit.
    pub fn validate_limits(&self) -> Result<()> {
        if self.op_count() > MAX_DIFF_OPS {
            return Err(MstError::too_large(
                "diff operation count",
                self.op_count(),
                MAX_DIFF_OPS,
            ));
        }
        Ok(())
    }

    /// Convert diff to write operations
    ///
    /// Update and delete operations carry the old value as `prev`, so
    /// applying them with [`Mst::batch`] to anything but the old tree fails.
    pub fn to_write_ops(&self) -> Vec<WriteOp> {
        let mut ops = Vec::with_capacity(self.op_count());

        for (key, cid) in &self.creates {
            ops.push(WriteOp::Create {
                key: key.clone(),
                cid: *cid,
            });
        }

        for (key, new_cid, old_cid) in &self.updates {
            ops.push(WriteOp::Update {
                key: key.clone(),
                cid: *new_cid,
                prev: Some(*old_cid),
            });
        }

        for (key, old_cid) in &self.deletes {
            ops.push(WriteOp::Delete {
                key: key.clone(),
                prev: Some(*old_cid),
            });
        }

        ops
    }

    /// Node blocks to write and to drop to move a store from the old tree
    /// to the new one
    pub fn to_block_writes(&self) -> BlockWrites {
        BlockWrites {
            blocks: self.new_mst_blocks.clone(),
            deleted_cids: self.removed_mst_blocks.clone(),
        }
    }

    /// Fetch new record data blocks from storage
    ///
    /// Returns a map of CID → bytes for all new record data (creates + updates).
    /// Records missing from `storage` are left out.
    pub async fn fetch_new_blocks<S: BlockStore>(
        &self,
        storage: &S,
    ) -> Result<BTreeMap<IpldCid, Bytes>> {
        let found = storage.get_many(&self.new_leaf_cids).await?;

        Ok(self
            .new_leaf_cids
            .iter()
            .zip(found)
            .filter_map(|(cid, block)| block.map(|b| (*cid, b)))
            .collect())
    }

    fn record_create(&mut self, key: SmolStr, cid: IpldCid) {
        self.new_leaf_cids.push(cid);
        self.creates.push((key, cid));
    }

    fn record_delete(&mut self, key: SmolStr, cid: IpldCid) {
        self.removed_cids.push(cid);
        self.deletes.push((key, cid));
    }

    fn record_update(&mut self, key: SmolStr, new: IpldCid, old: IpldCid) {
        self.new_leaf_cids.push(new);
        self.removed_cids.push(old);
        self.updates.push((key, new, old));
    }
}

/// Accumulates node blocks entered on each side of a diff
#[derive(Default)]
struct NodeTracker {
    added: BTreeMap<IpldCid, Bytes>,
    removed: BTreeSet<IpldCid>,
}

impl NodeTracker {
    async fn enter_new<S: BlockStore + Sync + 'static>(
        &mut self,
        cursor: &mut MstCursor<'_, S>,
    ) -> Result<()> {
        if let Some(node) = cursor.step_into().await? {
            self.added.insert(*node.cid(), node.bytes().clone());
        }
        Ok(())
    }

    async fn enter_old<S: BlockStore + Sync + 'static>(
        &mut self,
        cursor: &mut MstCursor<'_, S>,
    ) -> Result<()> {
        if let Some(node) = cursor.step_into().await? {
            self.removed.insert(*node.cid());
        }
        Ok(())
    }

    /// Nodes entered on both sides are unchanged
    fn finish(mut self, diff: &mut MstDiff) {
        let unchanged: Vec<IpldCid> = self
            .removed
            .iter()
            .filter(|cid| self.added.contains_key(*cid))
            .copied()
            .collect();

        for cid in &unchanged {
            self.added.remove(cid);
            self.removed.remove(cid);
        }

        diff.new_mst_blocks = self.added;
        diff.removed_mst_blocks = self.removed.into_iter().collect();
    }
}

impl<S: BlockStore + Sync + 'static> Mst<S> {
    /// Compute diff from this tree to another
    ///
    /// Returns operations needed to transform `self` into `other`.
    /// - Creates: keys in `other` but not in `self`
    /// - Updates: keys in both but with different CIDs
    /// - Deletes: keys in `self` but not in `other`
    ///
    /// Walks both trees in key order with one cursor each. Subtrees with the
    /// same CID at the same layer are skipped on both sides without being
    /// fetched, so the cost is proportional to what changed.
    pub async fn diff(&self, other: &Mst<S>) -> Result<MstDiff> {
        let mut diff = MstDiff::new();
        if self.root()? == other.root()? {
            return Ok(diff);
        }

        let mut old = self.walk().await?;
        let mut new = other.walk().await?;
        let mut nodes = NodeTracker::default();

        loop {
            let old_pos = old.current().clone();
            let new_pos = new.current().clone();

            match (old_pos, new_pos) {
                (CursorPosition::End, CursorPosition::End) => break,

                // Only new entries remain - all adds
                (CursorPosition::End, CursorPosition::Leaf { key, cid }) => {
                    diff.record_create(key, cid);
                    new.advance().await?;
                }
                (CursorPosition::End, CursorPosition::Tree { .. }) => {
                    nodes.enter_new(&mut new).await?;
                }

                // Only old entries remain - all deletes
                (CursorPosition::Leaf { key, cid }, CursorPosition::End) => {
                    diff.record_delete(key, cid);
                    old.advance().await?;
                }
                (CursorPosition::Tree { .. }, CursorPosition::End) => {
                    nodes.enter_old(&mut old).await?;
                }

                // Key comparison takes precedence over layers
                (
                    CursorPosition::Leaf {
                        key: old_key,
                        cid: old_cid,
                    },
                    CursorPosition::Leaf {
                        key: new_key,
                        cid: new_cid,
                    },
                ) => match compare_keys(&old_key, &new_key) {
                    Ordering::Equal => {
                        if old_cid != new_cid {
                            diff.record_update(new_key, new_cid, old_cid);
                        }
                        old.advance().await?;
                        new.advance().await?;
                    }
                    Ordering::Less => {
                        diff.record_delete(old_key, old_cid);
                        old.advance().await?;
                    }
                    Ordering::Greater => {
                        diff.record_create(new_key, new_cid);
                        new.advance().await?;
                    }
                },

                // At least one side is on a subtree: step into the side that
                // can still hold smaller keys, or skip if both are identical
                (old_pos, new_pos) => {
                    let old_layer = old.layer();
                    let new_layer = new.layer();

                    match (old_pos, new_pos) {
                        (
                            CursorPosition::Tree { subtree: old_tree, .. },
                            CursorPosition::Tree { subtree: new_tree, .. },
                        ) if old_layer == new_layer => {
                            if old_tree.cid() == new_tree.cid() {
                                old.skip_subtree()?;
                                new.skip_subtree()?;
                            } else {
                                nodes.enter_old(&mut old).await?;
                                nodes.enter_new(&mut new).await?;
                            }
                        }
                        (CursorPosition::Tree { .. }, CursorPosition::Tree { .. }) => {
                            if old_layer > new_layer {
                                nodes.enter_old(&mut old).await?;
                            } else {
                                nodes.enter_new(&mut new).await?;
                            }
                        }
                        (CursorPosition::Leaf { .. }, CursorPosition::Tree { .. }) => {
                            nodes.enter_new(&mut new).await?;
                        }
                        (CursorPosition::Tree { .. }, CursorPosition::Leaf { .. }) => {
                            nodes.enter_old(&mut old).await?;
                        }
                        _ => {
                            return Err(MstError::invalid_mst(
                                "diff cursors reached an impossible pairing",
                            ));
                        }
                    }
                }
            }
        }

        nodes.finish(&mut diff);

        #[cfg(feature = "tracing")]
        tracing::debug!(
            creates = diff.creates.len(),
            updates = diff.updates.len(),
            deletes = diff.deletes.len(),
            new_blocks = diff.new_mst_blocks.len(),
            removed_blocks = diff.removed_mst_blocks.len(),
            "computed MST diff"
        );

        Ok(diff)
    }

    /// Compute diff from this tree to empty (all deletes)
    ///
    /// Every node of this tree is reported removed, and the empty node is
    /// the single new block.
    pub async fn diff_to_empty(&self) -> Result<MstDiff> {
        let empty = Mst::with_options(self.storage().clone(), *self.options());
        self.diff(&empty).await
    }
}
