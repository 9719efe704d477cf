//! Persistent Merkle Search Tree operations

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bon::Builder;
use bytes::Bytes;
use cid::Cid as IpldCid;
use smol_str::SmolStr;

use super::cache::{NodeCache, child_layer};
use super::cursor::MstCursor;
use super::node::{Node, NodeEntry, Subtree, find_gt_or_equal_leaf_index, is_empty_node_cid};
use super::util;
use crate::error::{MstError, Result};
use crate::storage::BlockStore;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Tree behaviour switches
///
/// - `verify_layers`: if true (default), every decoded leaf must sit in a node
///   at the layer its key hashes to; blocks that disagree fail with `InvalidMst`.
/// - `persist_on_write`: if true, each mutation writes its new nodes to the
///   block store before returning. Off by default; call [`Mst::persist`] instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Builder)]
#[builder(start_fn = new)]
pub struct MstOptions {
    /// Check leaf layers on every decoded node
    #[builder(default = true)]
    pub verify_layers: bool,
    /// Write new nodes to storage at the end of every mutation
    #[builder(default)]
    pub persist_on_write: bool,
}

impl Default for MstOptions {
    fn default() -> Self {
        Self::new().build()
    }
}

/// Write operation for batch application
///
/// `prev`, when present, must match the value currently stored under the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Create new record (error if exists)
    Create {
        /// Record key (collection/rkey)
        key: SmolStr,
        /// Record CID
        cid: IpldCid,
    },

    /// Update existing record (error if not exists)
    Update {
        /// Record key (collection/rkey)
        key: SmolStr,
        /// New record CID
        cid: IpldCid,
        /// Expected current CID
        prev: Option<IpldCid>,
    },

    /// Delete record (error if not exists)
    Delete {
        /// Record key (collection/rkey)
        key: SmolStr,
        /// Expected current CID
        prev: Option<IpldCid>,
    },
}

impl WriteOp {
    /// Key this operation touches
    pub fn key(&self) -> &str {
        match self {
            WriteOp::Create { key, .. } | WriteOp::Update { key, .. } | WriteOp::Delete { key, .. } => {
                key.as_str()
            }
        }
    }
}

/// Persistent Merkle Search Tree
///
/// Mutations return new tree handles, leaving the original unchanged. Nodes
/// are immutable and shared between versions, so an old handle stays valid
/// and cheap to keep around.
///
/// # Layer-based structure
///
/// Keys are hashed (SHA-256) and leading zero bits determine layer:
/// - More leading zeros = higher layer (closer to the root)
/// - Layer = floor(leading_zeros / 2) for ~4 fanout
/// - Deterministic and insertion-order independent
///
/// # Storage access
///
/// Nodes not held in memory are fetched from the block store through a
/// [`NodeCache`] created for each operation. New nodes stay in memory until
/// [`persist`](Mst::persist) (or `persist_on_write`) writes them out.
pub struct Mst<S: BlockStore> {
    storage: Arc<S>,
    /// `None` is the empty tree
    root: Option<Subtree>,
    options: MstOptions,
}

impl<S: BlockStore> Clone for Mst<S> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            root: self.root.clone(),
            options: self.options,
        }
    }
}

impl<S: BlockStore> fmt::Debug for Mst<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mst")
            .field("root", &self.root)
            .field("options", &self.options)
            .finish()
    }
}

impl<S: BlockStore + Sync + 'static> Mst<S> {
    /// Create an empty tree
    pub fn new(storage: Arc<S>) -> Self {
        Self::with_options(storage, MstOptions::default())
    }

    /// Create an empty tree with options
    pub fn with_options(storage: Arc<S>, options: MstOptions) -> Self {
        Self {
            storage,
            root: None,
            options,
        }
    }

    /// Open the tree rooted at `cid`
    ///
    /// Nothing is fetched until the first operation. The empty node CID
    /// opens the empty tree.
    pub fn load(storage: Arc<S>, cid: IpldCid) -> Self {
        Self::load_with_options(storage, cid, MstOptions::default())
    }

    /// Open the tree rooted at `cid` with options
    pub fn load_with_options(storage: Arc<S>, cid: IpldCid, options: MstOptions) -> Self {
        let root = (!is_empty_node_cid(&cid)).then(|| Subtree::stored(cid));
        Self {
            storage,
            root,
            options,
        }
    }

    /// Root CID
    ///
    /// The empty tree reports the CID of the empty node.
    pub fn root(&self) -> Result<IpldCid> {
        match &self.root {
            Some(root) => Ok(*root.cid()),
            None => Ok(*Node::empty()?.cid()),
        }
    }

    /// Whether the tree holds no records
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Get reference to the block store
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Options this tree was opened with
    pub fn options(&self) -> &MstOptions {
        &self.options
    }

    fn cache(&self) -> NodeCache<'_, S> {
        NodeCache::new(self.storage.as_ref(), self.options.verify_layers)
    }

    /// Root pointer with the empty tree materialised as the empty node
    pub(crate) fn root_subtree(&self) -> Result<Subtree> {
        match &self.root {
            Some(root) => Ok(root.clone()),
            None => Ok(Subtree::from(Node::empty()?)),
        }
    }

    async fn derive(&self, root: Option<Subtree>) -> Result<Mst<S>> {
        let tree = Self {
            storage: self.storage.clone(),
            root,
            options: self.options,
        };
        if self.options.persist_on_write {
            tree.persist().await?;
        }
        Ok(tree)
    }

    /// Get the value stored under `key`
    ///
    /// Fails with `KeyNotFound` if absent. See [`find`](Mst::find) for the
    /// non-failing variant.
    pub async fn get(&self, key: &str) -> Result<IpldCid> {
        self.find(key)
            .await?
            .ok_or_else(|| MstError::key_not_found(key))
    }

    /// Look up `key`, returning `None` if absent
    pub async fn find(&self, key: &str) -> Result<Option<IpldCid>> {
        util::validate_key(key)?;
        find_in(&mut self.cache(), self.root.as_ref(), key).await
    }

    /// Insert a new record, failing with `KeyExists` if the key is taken
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(key = %key)))]
    pub async fn insert_or_fail(&self, key: &str, value: IpldCid) -> Result<Mst<S>> {
        util::validate_key(key)?;
        let mut cache = self.cache();

        if find_in(&mut cache, self.root.as_ref(), key).await?.is_some() {
            return Err(MstError::key_exists(key));
        }

        let root = insert_in(&mut cache, self.root.as_ref(), key, value).await?;
        self.derive(Some(root)).await
    }

    /// Insert or overwrite a record
    ///
    /// Writing the value already stored is a no-op and returns the same root.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(key = %key)))]
    pub async fn upsert(&self, key: &str, value: IpldCid) -> Result<Mst<S>> {
        util::validate_key(key)?;
        let mut cache = self.cache();

        if find_in(&mut cache, self.root.as_ref(), key).await? == Some(value) {
            return Ok(self.clone());
        }

        let root = insert_in(&mut cache, self.root.as_ref(), key, value).await?;
        self.derive(Some(root)).await
    }

    /// Overwrite an existing record, failing with `KeyNotFound` if absent
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(key = %key)))]
    pub async fn update(&self, key: &str, value: IpldCid) -> Result<Mst<S>> {
        util::validate_key(key)?;
        let mut cache = self.cache();

        match find_in(&mut cache, self.root.as_ref(), key).await? {
            None => Err(MstError::key_not_found(key)),
            Some(current) if current == value => Ok(self.clone()),
            Some(_) => {
                let root = insert_in(&mut cache, self.root.as_ref(), key, value).await?;
                self.derive(Some(root)).await
            }
        }
    }

    /// Delete a record, failing with `KeyNotFound` if absent
    ///
    /// Deleting the last record gives the empty tree.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(key = %key)))]
    pub async fn delete(&self, key: &str) -> Result<Mst<S>> {
        util::validate_key(key)?;
        let root = remove_in(&mut self.cache(), self.root.as_ref(), key).await?;
        self.derive(root).await
    }

    /// Apply a batch of write operations in order (returns new tree)
    ///
    /// All operations share one node cache, so nodes on common paths are
    /// fetched once.
    ///
    /// # Validation
    ///
    /// - Create: errors if key already exists
    /// - Update: errors if key doesn't exist or `prev` doesn't match
    /// - Delete: errors if key doesn't exist or `prev` doesn't match
    ///
    /// The first failing operation aborts the batch; `self` is unchanged.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(ops = ops.len())))]
    pub async fn batch(&self, ops: &[WriteOp]) -> Result<Mst<S>> {
        if ops.is_empty() {
            return Ok(self.clone());
        }

        let mut cache = self.cache();
        let mut root = self.root.clone();

        for op in ops {
            let key = op.key();
            util::validate_key(key)?;
            let current = find_in(&mut cache, root.as_ref(), key).await?;

            root = match op {
                WriteOp::Create { cid, .. } => {
                    if current.is_some() {
                        return Err(MstError::key_exists(key));
                    }
                    Some(insert_in(&mut cache, root.as_ref(), key, *cid).await?)
                }
                WriteOp::Update { cid, prev, .. } => {
                    let current = current.ok_or_else(|| MstError::key_not_found(key))?;
                    check_prev(key, *prev, current)?;
                    if current == *cid {
                        root
                    } else {
                        Some(insert_in(&mut cache, root.as_ref(), key, *cid).await?)
                    }
                }
                WriteOp::Delete { prev, .. } => {
                    let current = current.ok_or_else(|| MstError::key_not_found(key))?;
                    check_prev(key, *prev, current)?;
                    remove_in(&mut cache, root.as_ref(), key).await?
                }
            };
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(fetched = cache.len(), "applied batch");

        self.derive(root).await
    }

    /// Cursor over the tree in sorted order, positioned at the root
    pub async fn walk(&self) -> Result<MstCursor<'_, S>> {
        MstCursor::new(
            self.storage.as_ref(),
            self.root_subtree()?,
            self.options.verify_layers,
        )
        .await
    }

    /// Get all leaf entries (key-CID pairs) in lexicographic order
    pub async fn leaves(&self) -> Result<Vec<(SmolStr, IpldCid)>> {
        let mut cursor = self.walk().await?;
        let mut result = Vec::new();
        while let Some(leaf) = cursor.next_leaf().await? {
            result.push(leaf);
        }
        Ok(result)
    }

    /// Every node reachable from the root, as `(cid, bytes)`, root first
    pub async fn node_blocks(&self) -> Result<Vec<(IpldCid, Bytes)>> {
        let mut cache = self.cache();
        let root = cache.resolve_root(&self.root_subtree()?).await?;

        let mut blocks = Vec::new();
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            blocks.push((*node.cid(), node.bytes().clone()));

            let layer = node.layer();
            let mut children = Vec::new();
            for subtree in node.entries().iter().filter_map(NodeEntry::subtree) {
                children.push(cache.resolve(subtree, child_layer(layer)?).await?);
            }
            stack.extend(children.into_iter().rev());
        }

        Ok(blocks)
    }

    /// Get all CIDs in the merkle path to a key
    ///
    /// Returns the node CIDs from the root down to the node where `key`
    /// lives or would live, followed by the record CID if the key exists.
    /// The node blocks along this path prove the key's presence or absence.
    pub async fn cids_for_path(&self, key: &str) -> Result<Vec<IpldCid>> {
        util::validate_key(key)?;
        let mut cache = self.cache();
        let mut node = cache.resolve_root(&self.root_subtree()?).await?;
        let mut cids = Vec::new();

        loop {
            cids.push(*node.cid());
            let entries = node.entries();
            let index = find_gt_or_equal_leaf_index(entries, key);

            if let Some(NodeEntry::Leaf { key: leaf_key, value }) = entries.get(index) {
                if leaf_key.as_str() == key {
                    cids.push(*value);
                    return Ok(cids);
                }
            }

            let Some(prev) = prev_subtree(entries, index) else {
                return Ok(cids);
            };
            let layer = child_layer(node.layer())?;
            node = cache.resolve(&prev, layer).await?;
        }
    }

    /// Collect in-memory nodes that are not yet in storage
    ///
    /// Stops descending at the first node the store already has; stored
    /// subtree pointers are never fetched.
    ///
    /// Returns (root_cid, blocks) where blocks is a map of CID → bytes.
    pub async fn collect_blocks(&self) -> Result<(IpldCid, BTreeMap<IpldCid, Bytes>)> {
        let root = self.root_subtree()?;
        let mut blocks = BTreeMap::new();
        let mut stack: Vec<Arc<Node>> = root.node().cloned().into_iter().collect();

        while let Some(node) = stack.pop() {
            if blocks.contains_key(node.cid()) || self.storage.has(node.cid()).await? {
                continue;
            }
            blocks.insert(*node.cid(), node.bytes().clone());
            stack.extend(
                node.entries()
                    .iter()
                    .filter_map(NodeEntry::subtree)
                    .filter_map(|t| t.node().cloned()),
            );
        }

        Ok((*root.cid(), blocks))
    }

    /// Persist all unstored blocks to storage
    ///
    /// Convenience method that calls `collect_blocks()` and `put_many()`.
    /// Returns the root CID after persisting.
    pub async fn persist(&self) -> Result<IpldCid> {
        let (root_cid, blocks) = self.collect_blocks().await?;

        #[cfg(feature = "tracing")]
        tracing::debug!(root = %root_cid, blocks = blocks.len(), "persisting MST nodes");

        if !blocks.is_empty() {
            self.storage.put_many(blocks).await?;
        }

        Ok(root_cid)
    }
}

fn check_prev(key: &str, prev: Option<IpldCid>, current: IpldCid) -> Result<()> {
    match prev {
        Some(prev) if prev != current => Err(MstError::prev_mismatch(key, prev, current)),
        _ => Ok(()),
    }
}

fn prev_subtree(entries: &[NodeEntry], index: usize) -> Option<Subtree> {
    index
        .checked_sub(1)
        .and_then(|i| entries[i].subtree())
        .cloned()
}

fn tree_entry(node: Node) -> NodeEntry {
    NodeEntry::Tree(Subtree::from(node))
}

async fn find_in<S: BlockStore + Sync + 'static>(
    cache: &mut NodeCache<'_, S>,
    root: Option<&Subtree>,
    key: &str,
) -> Result<Option<IpldCid>> {
    let Some(root) = root else {
        return Ok(None);
    };
    let mut node = cache.resolve_root(root).await?;

    loop {
        let entries = node.entries();
        let index = find_gt_or_equal_leaf_index(entries, key);

        if let Some(NodeEntry::Leaf { key: leaf_key, value }) = entries.get(index) {
            if leaf_key.as_str() == key {
                return Ok(Some(*value));
            }
        }

        let Some(prev) = prev_subtree(entries, index) else {
            return Ok(None);
        };
        let layer = child_layer(node.layer())?;
        node = cache.resolve(&prev, layer).await?;
    }
}

async fn insert_in<S: BlockStore + Sync + 'static>(
    cache: &mut NodeCache<'_, S>,
    root: Option<&Subtree>,
    key: &str,
    value: IpldCid,
) -> Result<Subtree> {
    let node = match root {
        Some(root) => cache.resolve_root(root).await?,
        None => Arc::new(Node::empty()?),
    };
    Ok(Subtree::from(add(cache, node, key, value).await?))
}

/// `Ok(None)` means the tree is now empty
async fn remove_in<S: BlockStore + Sync + 'static>(
    cache: &mut NodeCache<'_, S>,
    root: Option<&Subtree>,
    key: &str,
) -> Result<Option<Subtree>> {
    let Some(root) = root else {
        return Err(MstError::key_not_found(key));
    };
    let node = cache.resolve_root(root).await?;
    match delete_recurse(cache, node, key).await? {
        Some(altered) => trim_top(cache, altered).await,
        None => Err(MstError::key_not_found(key)),
    }
}

/// Add or replace a leaf below `node`
fn add<'a, 'c: 'a, S: BlockStore + Sync + 'static>(
    cache: &'a mut NodeCache<'c, S>,
    node: Arc<Node>,
    key: &'a str,
    value: IpldCid,
) -> BoxFuture<'a, Node> {
    Box::pin(async move {
        let layer = node.layer();
        let key_layer = util::layer_for_key(key);
        let leaf = NodeEntry::leaf(key, value);

        if key_layer > layer {
            // Key belongs above this node: it becomes the new root, with the
            // old contents split around it and lifted through empty layers.
            let (mut left, mut right) = split_around(cache, node, key).await?;
            for parent_layer in layer + 1..key_layer {
                left = left
                    .map(|n| Node::new(parent_layer, vec![tree_entry(n)]))
                    .transpose()?;
                right = right
                    .map(|n| Node::new(parent_layer, vec![tree_entry(n)]))
                    .transpose()?;
            }

            let mut entries = Vec::with_capacity(3);
            entries.extend(left.map(tree_entry));
            entries.push(leaf);
            entries.extend(right.map(tree_entry));
            return Node::new(key_layer, entries);
        }

        let mut entries = node.to_entries();
        let index = find_gt_or_equal_leaf_index(&entries, key);
        let prev = prev_subtree(&entries, index);

        if key_layer == layer {
            if let Some(NodeEntry::Leaf { key: leaf_key, .. }) = entries.get(index) {
                if leaf_key.as_str() == key {
                    entries[index] = leaf;
                    return Node::new(layer, entries);
                }
            }

            match prev {
                Some(prev) => {
                    // The subtree left of the insertion point straddles the key
                    let child = cache.resolve(&prev, child_layer(layer)?).await?;
                    let (left, right) = split_around(cache, child, key).await?;

                    let mut replacement = Vec::with_capacity(3);
                    replacement.extend(left.map(tree_entry));
                    replacement.push(leaf);
                    replacement.extend(right.map(tree_entry));
                    entries.splice(index - 1..index, replacement);
                }
                None => entries.insert(index, leaf),
            }
            return Node::new(layer, entries);
        }

        let below = child_layer(layer)?;
        match prev {
            Some(prev) => {
                let child = cache.resolve(&prev, below).await?;
                let updated = add(cache, child, key, value).await?;
                entries[index - 1] = tree_entry(updated);
            }
            None => {
                let child = Arc::new(Node::new(below, Vec::new())?);
                let created = add(cache, child, key, value).await?;
                entries.insert(index, tree_entry(created));
            }
        }
        Node::new(layer, entries)
    })
}

/// Split `node` into the parts below and above `key`
///
/// Either side is `None` if empty. `key` must not be present.
fn split_around<'a, 'c: 'a, S: BlockStore + Sync + 'static>(
    cache: &'a mut NodeCache<'c, S>,
    node: Arc<Node>,
    key: &'a str,
) -> BoxFuture<'a, (Option<Node>, Option<Node>)> {
    Box::pin(async move {
        let layer = node.layer();
        let entries = node.entries();
        let index = find_gt_or_equal_leaf_index(entries, key);

        let mut left = entries[..index].to_vec();
        let mut right = entries[index..].to_vec();

        // A subtree at the cut straddles the key: split it too
        if let Some(NodeEntry::Tree(last)) = left.last().cloned() {
            left.pop();
            let child = cache.resolve(&last, child_layer(layer)?).await?;
            let (split_left, split_right) = split_around(cache, child, key).await?;
            left.extend(split_left.map(tree_entry));
            if let Some(split_right) = split_right {
                right.insert(0, tree_entry(split_right));
            }
        }

        let build = |entries: Vec<NodeEntry>| -> Result<Option<Node>> {
            if entries.is_empty() {
                Ok(None)
            } else {
                Node::new(layer, entries).map(Some)
            }
        };
        Ok((build(left)?, build(right)?))
    })
}

/// Remove `key` below `node`
///
/// `Ok(None)` means the key was not found. The returned node may be empty.
fn delete_recurse<'a, 'c: 'a, S: BlockStore + Sync + 'static>(
    cache: &'a mut NodeCache<'c, S>,
    node: Arc<Node>,
    key: &'a str,
) -> BoxFuture<'a, Option<Node>> {
    Box::pin(async move {
        let layer = node.layer();
        let mut entries = node.to_entries();
        let index = find_gt_or_equal_leaf_index(&entries, key);

        let found = matches!(
            entries.get(index),
            Some(NodeEntry::Leaf { key: leaf_key, .. }) if leaf_key.as_str() == key
        );

        if found {
            let prev = prev_subtree(&entries, index);
            let next = entries.get(index + 1).and_then(NodeEntry::subtree).cloned();

            match (prev, next) {
                (Some(prev), Some(next)) => {
                    // The leaf kept two subtrees apart; they become one
                    let below = child_layer(layer)?;
                    let left = cache.resolve(&prev, below).await?;
                    let right = cache.resolve(&next, below).await?;
                    let merged = append_merge(cache, left, right).await?;
                    entries.splice(index - 1..=index + 1, [tree_entry(merged)]);
                }
                _ => {
                    entries.remove(index);
                }
            }
            return Node::new(layer, entries).map(Some);
        }

        let Some(prev) = prev_subtree(&entries, index) else {
            return Ok(None);
        };
        let child = cache.resolve(&prev, child_layer(layer)?).await?;

        match delete_recurse(cache, child, key).await? {
            None => Ok(None),
            Some(updated) if updated.is_empty() => {
                entries.remove(index - 1);
                Node::new(layer, entries).map(Some)
            }
            Some(updated) => {
                entries[index - 1] = tree_entry(updated);
                Node::new(layer, entries).map(Some)
            }
        }
    })
}

/// Merge two adjacent subtrees
///
/// All keys in `right` must be greater than all keys in `left`.
fn append_merge<'a, 'c: 'a, S: BlockStore + Sync + 'static>(
    cache: &'a mut NodeCache<'c, S>,
    left: Arc<Node>,
    right: Arc<Node>,
) -> BoxFuture<'a, Node> {
    Box::pin(async move {
        let layer = left.layer();
        if layer != right.layer() {
            return Err(MstError::invalid_mst(format!(
                "cannot merge nodes from layers {} and {}",
                layer,
                right.layer()
            )));
        }

        let mut entries = left.to_entries();
        let tail = right.entries();

        let seam = match (entries.last(), tail.first()) {
            (Some(NodeEntry::Tree(l)), Some(NodeEntry::Tree(r))) => Some((l.clone(), r.clone())),
            _ => None,
        };

        match seam {
            Some((l, r)) => {
                let below = child_layer(layer)?;
                let l = cache.resolve(&l, below).await?;
                let r = cache.resolve(&r, below).await?;
                let merged = append_merge(cache, l, r).await?;

                entries.pop();
                entries.push(tree_entry(merged));
                entries.extend_from_slice(&tail[1..]);
            }
            None => entries.extend_from_slice(tail),
        }

        Node::new(layer, entries)
    })
}

/// Drop root nodes that hold nothing but a single subtree pointer
async fn trim_top<S: BlockStore + Sync + 'static>(
    cache: &mut NodeCache<'_, S>,
    node: Node,
) -> Result<Option<Subtree>> {
    let mut node = Arc::new(node);
    loop {
        if node.is_empty() {
            return Ok(None);
        }
        let only = match node.entries() {
            [NodeEntry::Tree(only)] => only.clone(),
            _ => break,
        };
        let layer = child_layer(node.layer())?;
        node = cache.resolve(&only, layer).await?;
    }
    Ok(Some(Subtree::loaded(node)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MstErrorKind;
    use crate::mst::node::EMPTY_NODE_CID;
    use crate::storage::MemoryBlockStore;
    use crate::{DAG_CBOR_CID_CODEC, SHA2_256_CODE};

    fn test_cid(n: u8) -> IpldCid {
        let data = vec![n; 32];
        let mh = multihash::Multihash::wrap(SHA2_256_CODE, &data).unwrap();
        IpldCid::new_v1(DAG_CBOR_CID_CODEC, mh)
    }

    fn new_tree() -> Mst<MemoryBlockStore> {
        Mst::new(Arc::new(MemoryBlockStore::new()))
    }

    // layers: 0000 -> 0, 0001 -> 1, 0019 -> 3, 0024 -> 2, 16963 -> 7
    const L0_A: &str = "com.example.record/0000";
    const L0_B: &str = "com.example.record/0002";
    const L1: &str = "com.example.record/0001";
    const L2: &str = "com.example.record/0024";
    const L3: &str = "com.example.record/0019";
    const L7: &str = "com.example.record/16963";

    async fn build(keys: &[&str]) -> Mst<MemoryBlockStore> {
        let mut tree = new_tree();
        for (i, key) in keys.iter().enumerate() {
            tree = tree.insert_or_fail(key, test_cid(i as u8)).await.unwrap();
        }
        tree
    }

    #[tokio::test]
    async fn test_empty_tree() {
        let tree = new_tree();
        assert!(tree.is_empty());
        assert_eq!(tree.root().unwrap().to_string(), EMPTY_NODE_CID);
        assert!(tree.leaves().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_from_empty() {
        let tree = new_tree();
        assert_eq!(tree.find("com.example.test/key1").await.unwrap(), None);
        let err = tree.get("com.example.test/key1").await.unwrap_err();
        assert_eq!(err.kind(), &MstErrorKind::KeyNotFound);
    }

    #[tokio::test]
    async fn test_insert_single_key() {
        let tree = new_tree()
            .insert_or_fail(L0_A, test_cid(1))
            .await
            .unwrap();
        assert!(!tree.is_empty());
        assert_eq!(tree.get(L0_A).await.unwrap(), test_cid(1));
        assert_eq!(tree.find(L0_B).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_insert_or_fail_existing() {
        let tree = build(&[L0_A]).await;
        let err = tree.insert_or_fail(L0_A, test_cid(9)).await.unwrap_err();
        assert_eq!(err.kind(), &MstErrorKind::KeyExists);
        assert!(err.kind().is_client_error());
    }

    #[tokio::test]
    async fn test_upsert() {
        let tree = build(&[L0_A, L1]).await;
        let root = tree.root().unwrap();

        let same = tree.upsert(L0_A, test_cid(0)).await.unwrap();
        assert_eq!(same.root().unwrap(), root);

        let changed = tree.upsert(L0_A, test_cid(7)).await.unwrap();
        assert_ne!(changed.root().unwrap(), root);
        assert_eq!(changed.get(L0_A).await.unwrap(), test_cid(7));
        // old handle is untouched
        assert_eq!(tree.get(L0_A).await.unwrap(), test_cid(0));

        let inserted = tree.upsert(L2, test_cid(5)).await.unwrap();
        assert_eq!(inserted.get(L2).await.unwrap(), test_cid(5));
    }

    #[tokio::test]
    async fn test_update() {
        let tree = build(&[L0_A]).await;

        let err = tree.update(L0_B, test_cid(1)).await.unwrap_err();
        assert_eq!(err.kind(), &MstErrorKind::KeyNotFound);

        let updated = tree.update(L0_A, test_cid(3)).await.unwrap();
        assert_eq!(updated.get(L0_A).await.unwrap(), test_cid(3));
    }

    #[tokio::test]
    async fn test_delete_single_key() {
        let tree = build(&[L0_A]).await;
        let tree = tree.delete(L0_A).await.unwrap();
        assert!(tree.is_empty());
        assert_eq!(tree.root().unwrap().to_string(), EMPTY_NODE_CID);
    }

    #[tokio::test]
    async fn test_delete_nonexistent_key() {
        let tree = build(&[L0_A, L1]).await;
        let err = tree.delete(L0_B).await.unwrap_err();
        assert_eq!(err.kind(), &MstErrorKind::KeyNotFound);

        let err = new_tree().delete(L0_B).await.unwrap_err();
        assert_eq!(err.kind(), &MstErrorKind::KeyNotFound);
    }

    #[tokio::test]
    async fn test_invalid_keys_rejected() {
        let tree = build(&[L0_A]).await;
        for key in ["", "nokey", "a/b/c", "coll/ke\ty"] {
            let err = tree.upsert(key, test_cid(1)).await.unwrap_err();
            assert_eq!(err.kind(), &MstErrorKind::InvalidKey);
            let err = tree.get(key).await.unwrap_err();
            assert_eq!(err.kind(), &MstErrorKind::InvalidKey);
            let err = tree.delete(key).await.unwrap_err();
            assert_eq!(err.kind(), &MstErrorKind::InvalidKey);
        }
    }

    #[tokio::test]
    async fn test_insertion_order_determinism() {
        let keys = [L0_A, L0_B, L1, L2, L3];
        let mut values: Vec<(&str, IpldCid)> =
            keys.iter().enumerate().map(|(i, k)| (*k, test_cid(i as u8))).collect();

        let mut roots = Vec::new();
        for _ in 0..4 {
            let mut tree = new_tree();
            for (key, value) in &values {
                tree = tree.upsert(key, *value).await.unwrap();
            }
            roots.push(tree.root().unwrap());
            values.rotate_left(2);
            values.swap(0, 3);
        }

        assert!(roots.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_delete_restores_previous_root() {
        let before = build(&[L0_A, L1, L3]).await;
        for key in [L0_B, L2, L7] {
            let added = before.upsert(key, test_cid(42)).await.unwrap();
            assert_ne!(added.root().unwrap(), before.root().unwrap());

            let removed = added.delete(key).await.unwrap();
            assert_eq!(removed.root().unwrap(), before.root().unwrap());
        }
    }

    #[tokio::test]
    async fn test_high_layer_key_wraps_lower_layers() {
        let tree = build(&[L0_A, L0_B, L7]).await;

        // root at layer 7, layer-0 leaves six empty layers below
        let path = tree.cids_for_path(L0_A).await.unwrap();
        assert_eq!(path.len(), 8 + 1);
        assert_eq!(path.last(), Some(&test_cid(0)));

        assert_eq!(tree.node_blocks().await.unwrap().len(), 8);

        let trimmed = tree.delete(L7).await.unwrap();
        assert_eq!(trimmed.cids_for_path(L0_A).await.unwrap().len(), 2);
        assert_eq!(trimmed.root().unwrap(), build(&[L0_A, L0_B]).await.root().unwrap());
    }

    #[tokio::test]
    async fn test_cids_for_path_absent_key() {
        let tree = build(&[L0_A, L3]).await;
        let path = tree.cids_for_path(L0_B).await.unwrap();
        // root (layer 3) down to layer 0, no record
        assert_eq!(path.len(), 4);
        assert_eq!(path[0], tree.root().unwrap());
        assert!(!path.contains(&test_cid(0)));
    }

    #[tokio::test]
    async fn test_batch_mixed_operations() {
        let tree = build(&[L0_A, L1]).await;
        let ops = vec![
            WriteOp::Create {
                key: L2.into(),
                cid: test_cid(20),
            },
            WriteOp::Update {
                key: L0_A.into(),
                cid: test_cid(21),
                prev: Some(test_cid(0)),
            },
            WriteOp::Delete {
                key: L1.into(),
                prev: None,
            },
        ];

        let batched = tree.batch(&ops).await.unwrap();
        let stepwise = tree
            .insert_or_fail(L2, test_cid(20))
            .await
            .unwrap()
            .update(L0_A, test_cid(21))
            .await
            .unwrap()
            .delete(L1)
            .await
            .unwrap();

        assert_eq!(batched.root().unwrap(), stepwise.root().unwrap());
        assert_eq!(batched.find(L1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_batch_validation_errors() {
        let tree = build(&[L0_A]).await;

        let err = tree
            .batch(&[WriteOp::Create {
                key: L0_A.into(),
                cid: test_cid(1),
            }])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), &MstErrorKind::KeyExists);

        let err = tree
            .batch(&[WriteOp::Update {
                key: L0_B.into(),
                cid: test_cid(1),
                prev: None,
            }])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), &MstErrorKind::KeyNotFound);

        let err = tree
            .batch(&[WriteOp::Delete {
                key: L0_A.into(),
                prev: Some(test_cid(99)),
            }])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), &MstErrorKind::PrevMismatch);

        let same = tree.batch(&[]).await.unwrap();
        assert_eq!(same.root().unwrap(), tree.root().unwrap());
    }

    #[tokio::test]
    async fn test_persist_and_load_roundtrip() {
        let storage = Arc::new(MemoryBlockStore::new());
        let mut tree = Mst::new(storage.clone());
        for (i, key) in [L0_A, L0_B, L1, L2, L3].iter().enumerate() {
            tree = tree.upsert(key, test_cid(i as u8)).await.unwrap();
        }

        let root = tree.persist().await.unwrap();
        assert_eq!(root, tree.root().unwrap());
        assert_eq!(storage.len(), tree.node_blocks().await.unwrap().len());

        // persisting again writes nothing new
        let (_, pending) = tree.collect_blocks().await.unwrap();
        assert!(pending.is_empty());

        let loaded = Mst::load(storage.clone(), root);
        assert_eq!(loaded.leaves().await.unwrap(), tree.leaves().await.unwrap());
        assert_eq!(loaded.get(L3).await.unwrap(), test_cid(4));

        let edited = loaded.delete(L2).await.unwrap();
        let expected = tree.delete(L2).await.unwrap();
        assert_eq!(edited.root().unwrap(), expected.root().unwrap());
    }

    #[tokio::test]
    async fn test_load_missing_root() {
        let storage = Arc::new(MemoryBlockStore::new());
        let tree = Mst::load(storage, test_cid(5));
        let err = tree.get(L0_A).await.unwrap_err();
        assert_eq!(err.kind(), &MstErrorKind::BlockNotFound);
    }

    #[tokio::test]
    async fn test_load_empty_root() {
        let storage = Arc::new(MemoryBlockStore::new());
        let empty = new_tree().root().unwrap();
        let tree = Mst::load(storage, empty);
        assert!(tree.is_empty());
        assert_eq!(tree.find(L0_A).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_persist_on_write() {
        let storage = Arc::new(MemoryBlockStore::new());
        let options = MstOptions::new().persist_on_write(true).build();
        assert!(options.verify_layers);

        let tree = Mst::with_options(storage.clone(), options)
            .upsert(L1, test_cid(1))
            .await
            .unwrap();
        assert!(storage.has(&tree.root().unwrap()).await.unwrap());

        let tree = tree.delete(L1).await.unwrap();
        assert!(storage.has(&tree.root().unwrap()).await.unwrap());
    }

    #[test]
    fn test_default_options() {
        let options = MstOptions::default();
        assert!(options.verify_layers);
        assert!(!options.persist_on_write);
    }
}
