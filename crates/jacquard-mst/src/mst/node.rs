//! MST node data structures

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use cid::Cid as IpldCid;
use smol_str::SmolStr;

use super::util::{common_prefix_len, compute_cid, layer_for_key};
use crate::error::{MstError, NodeError, Result};
use crate::{DAG_CBOR_CID_CODEC, SHA2_256_CODE};

/// CID of the empty node `{e: [], l: null}`
pub const EMPTY_NODE_CID: &str = "bafyreie5737gdxlw5i64vzichcalba3z2v5n6icifvx5xytvske7mr3hpm";

/// Canonical DAG-CBOR bytes of the empty node
pub const EMPTY_NODE_BYTES: &[u8] = &[0xa2, 0x61, 0x65, 0x80, 0x61, 0x6c, 0xf6];

/// Whether `cid` addresses the empty node
pub fn is_empty_node_cid(cid: &IpldCid) -> bool {
    use sha2::{Digest, Sha256};

    cid.codec() == DAG_CBOR_CID_CODEC
        && cid.hash().code() == SHA2_256_CODE
        && cid.hash().digest() == Sha256::digest(EMPTY_NODE_BYTES).as_slice()
}

/// Pointer to a child node one layer down
///
/// The CID is always known. The node itself is present when it was built
/// by a mutation or loaded in memory; otherwise it is fetched on demand
/// through a [`NodeCache`](super::cache::NodeCache).
#[derive(Clone)]
pub struct Subtree {
    cid: IpldCid,
    node: Option<Arc<Node>>,
}

impl Subtree {
    /// Pointer to a node that lives only in storage
    pub fn stored(cid: IpldCid) -> Self {
        Self { cid, node: None }
    }

    /// Pointer to an in-memory node
    pub fn loaded(node: Arc<Node>) -> Self {
        Self {
            cid: *node.cid(),
            node: Some(node),
        }
    }

    /// CID of the child node
    pub fn cid(&self) -> &IpldCid {
        &self.cid
    }

    /// The child node, if held in memory
    pub fn node(&self) -> Option<&Arc<Node>> {
        self.node.as_ref()
    }
}

impl From<Node> for Subtree {
    fn from(node: Node) -> Self {
        Subtree::loaded(Arc::new(node))
    }
}

impl fmt::Debug for Subtree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.node.is_some() { "loaded" } else { "stored" };
        write!(f, "Subtree({}, {})", self.cid, state)
    }
}

/// Entry in an MST node - either a subtree or a leaf
///
/// This is the in-memory representation used for tree operations.
/// MST operations work on flat `Vec<NodeEntry>` where entries are interleaved:
/// `[Tree, Leaf, Tree, Leaf, Leaf, Tree]` etc.
///
/// The wire format (CBOR) is different - see `NodeData` and `TreeEntry`.
#[derive(Clone)]
pub enum NodeEntry {
    /// Subtree reference
    Tree(Subtree),

    /// Leaf node with key-value pair
    Leaf {
        /// Full key (not prefix-compressed in memory)
        key: SmolStr,
        /// CID of the record value
        value: IpldCid,
    },
}

impl fmt::Debug for NodeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeEntry::Tree(t) => write!(f, "{:?}", t),
            NodeEntry::Leaf { key, value } => {
                write!(f, "Leaf {{ key: {}, value: {} }}", key, value)
            }
        }
    }
}

impl NodeEntry {
    /// Leaf entry
    pub fn leaf(key: impl Into<SmolStr>, value: IpldCid) -> Self {
        NodeEntry::Leaf {
            key: key.into(),
            value,
        }
    }

    /// Check if this is a tree entry
    pub fn is_tree(&self) -> bool {
        matches!(self, NodeEntry::Tree(_))
    }

    /// Check if this is a leaf entry
    pub fn is_leaf(&self) -> bool {
        matches!(self, NodeEntry::Leaf { .. })
    }

    /// Get the key if this is a leaf
    pub fn leaf_key(&self) -> Option<&str> {
        match self {
            NodeEntry::Leaf { key, .. } => Some(key.as_str()),
            NodeEntry::Tree(_) => None,
        }
    }

    /// Get the subtree pointer if this is a tree
    pub fn subtree(&self) -> Option<&Subtree> {
        match self {
            NodeEntry::Tree(t) => Some(t),
            NodeEntry::Leaf { .. } => None,
        }
    }
}

/// Find index of first leaf >= key
///
/// Binary search over interleaved entries. A subtree sorts with the leaf
/// that follows it; subtrees are never adjacent, so a hit on a subtree is
/// bumped to that leaf. Returns `entries.len()` if all leaves are < key.
pub fn find_gt_or_equal_leaf_index(entries: &[NodeEntry], key: &str) -> usize {
    let probe = |i: usize| -> Option<&str> {
        match &entries[i] {
            NodeEntry::Leaf { key, .. } => Some(key.as_str()),
            NodeEntry::Tree(_) => entries.get(i + 1).and_then(NodeEntry::leaf_key),
        }
    };

    let (mut lo, mut hi) = (0, entries.len());
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        match probe(mid) {
            Some(k) if k < key => lo = mid + 1,
            _ => hi = mid,
        }
    }

    if matches!(entries.get(lo), Some(NodeEntry::Tree(_))) {
        lo + 1
    } else {
        lo
    }
}

/// Immutable, content-addressed MST node
///
/// CID and canonical bytes are computed once at construction. Any change
/// to a node's entries means building a new node, so every ancestor on the
/// changed path is rebuilt and gets a new CID.
pub struct Node {
    layer: usize,
    entries: Vec<NodeEntry>,
    cid: IpldCid,
    bytes: Bytes,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("cid", &self.cid.to_string())
            .field("layer", &self.layer)
            .field("entries", &self.entries)
            .finish()
    }
}

impl Node {
    /// Build a node, checking structure and computing its CID
    pub fn new(layer: usize, entries: Vec<NodeEntry>) -> Result<Self> {
        check_structure(layer, &entries)?;
        debug_assert!(
            entries
                .iter()
                .filter_map(NodeEntry::leaf_key)
                .all(|k| layer_for_key(k) == layer),
            "leaf placed at wrong layer"
        );

        let data = NodeData::from_entries(&entries)?;
        let cbor = serde_ipld_dagcbor::to_vec(&data).map_err(MstError::serialization)?;
        let cid = compute_cid(&cbor)?;

        Ok(Self {
            layer,
            entries,
            cid,
            bytes: Bytes::from(cbor),
        })
    }

    /// Empty node at layer 0
    pub fn empty() -> Result<Self> {
        Self::new(0, Vec::new())
    }

    /// Decode a node block fetched by `cid`
    ///
    /// Fails with `CidMismatch` if `bytes` do not hash to `cid`. Subtree
    /// pointers come back unloaded. With `verify_layers`, every leaf must
    /// hash to `layer`.
    pub fn decode(cid: IpldCid, bytes: Bytes, layer: usize, verify_layers: bool) -> Result<Self> {
        let data = NodeData::decode(&cid, &bytes)?;
        Self::from_data(cid, bytes, data, layer, verify_layers)
    }

    /// Build a node from already decoded and CID-checked wire data
    pub(crate) fn from_data(
        cid: IpldCid,
        bytes: Bytes,
        data: NodeData,
        layer: usize,
        verify_layers: bool,
    ) -> Result<Self> {
        let entries = data.into_entries()?;
        check_structure(layer, &entries)?;

        if verify_layers {
            for key in entries.iter().filter_map(NodeEntry::leaf_key) {
                let expected = layer_for_key(key);
                if expected != layer {
                    return Err(NodeError::LayerMismatch {
                        key: key.to_string(),
                        expected,
                        actual: layer,
                    }
                    .into());
                }
            }
        }

        Ok(Self {
            layer,
            entries,
            cid,
            bytes,
        })
    }

    /// Layer of this node
    pub fn layer(&self) -> usize {
        self.layer
    }

    /// Entries in sorted order
    pub fn entries(&self) -> &[NodeEntry] {
        &self.entries
    }

    /// CID of the canonical encoding
    pub fn cid(&self) -> &IpldCid {
        &self.cid
    }

    /// Canonical DAG-CBOR encoding
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Whether the node has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of leaves held directly in this node
    pub fn leaf_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_leaf()).count()
    }

    /// Copy of the entries, for building a modified node
    pub(crate) fn to_entries(&self) -> Vec<NodeEntry> {
        self.entries.clone()
    }
}

fn check_structure(layer: usize, entries: &[NodeEntry]) -> Result<()> {
    let mut prev_tree = false;
    let mut prev_key: Option<&str> = None;

    for entry in entries {
        match entry {
            NodeEntry::Tree(_) => {
                if prev_tree {
                    return Err(NodeError::AdjacentSubtrees.into());
                }
                if layer == 0 {
                    return Err(NodeError::SubtreeBelowZero.into());
                }
                prev_tree = true;
            }
            NodeEntry::Leaf { key, .. } => {
                if let Some(prev) = prev_key {
                    if prev >= key.as_str() {
                        return Err(NodeError::UnsortedKeys {
                            prev: prev.to_string(),
                            next: key.to_string(),
                        }
                        .into());
                    }
                }
                prev_key = Some(key.as_str());
                prev_tree = false;
            }
        }
    }

    Ok(())
}

// ============================================================================
// Wire format structures (for CBOR serialization)
// ============================================================================

/// Wire format entry (prefix-compressed leaf with optional subtree pointer)
///
/// Fields are declared in DAG-CBOR canonical key order (k, p, t, v).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TreeEntry {
    /// Key suffix after prefix
    ///
    /// Serialized as a CBOR byte string (major type 2), not an array of integers
    #[serde(rename = "k", with = "serde_bytes")]
    pub key_suffix: Vec<u8>,

    /// Prefix length (bytes shared with previous key in node)
    #[serde(rename = "p")]
    pub prefix_len: usize,

    /// Optional subtree pointer to the right of this leaf
    ///
    /// Serializes as explicit `null` when None.
    #[serde(rename = "t")]
    pub tree: Option<IpldCid>,

    /// CID of the record value
    #[serde(rename = "v")]
    pub value: IpldCid,
}

/// Wire format node data (serialized as DAG-CBOR)
///
/// # Conversion rules
///
/// **Serialization (flat → wire):**
/// - First entry if `Tree` → becomes `left` pointer
/// - Each `Leaf` → becomes entry in `entries`
/// - `Tree` after `Leaf` → becomes that leaf's `tree` pointer
///
/// **Deserialization (wire → flat):**
/// - `left` if present → prepend `Tree` entry
/// - Each entry → append `Leaf`
/// - Each `tree` if present → append `Tree` entry
///
/// All `Option` fields serialize as explicit `null`, never skipped.
/// Skipping produces different bytes and therefore a different CID.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NodeData {
    /// Entries in this node (sorted by full key, prefix-compressed)
    #[serde(rename = "e")]
    pub entries: Vec<TreeEntry>,

    /// Left-most subtree pointer
    #[serde(rename = "l")]
    pub left: Option<IpldCid>,
}

impl NodeData {
    /// Serialize flat entries to wire format (with prefix compression)
    pub fn from_entries(entries: &[NodeEntry]) -> Result<Self> {
        let mut data = NodeData {
            left: None,
            entries: Vec::new(),
        };

        let mut i = 0;
        if let Some(NodeEntry::Tree(tree)) = entries.first() {
            data.left = Some(*tree.cid());
            i += 1;
        }

        let mut last_key = "";
        while i < entries.len() {
            let NodeEntry::Leaf { key, value } = &entries[i] else {
                return Err(NodeError::AdjacentSubtrees.into());
            };
            i += 1;

            let prefix_len = common_prefix_len(last_key, key.as_str());
            let tree = match entries.get(i) {
                Some(NodeEntry::Tree(tree)) => {
                    i += 1;
                    Some(*tree.cid())
                }
                _ => None,
            };

            data.entries.push(TreeEntry {
                key_suffix: key.as_bytes()[prefix_len..].to_vec(),
                prefix_len,
                tree,
                value: *value,
            });

            last_key = key.as_str();
        }

        Ok(data)
    }

    /// Parse a node block, checking that it hashes to `cid`
    pub fn decode(cid: &IpldCid, bytes: &[u8]) -> Result<Self> {
        let actual = compute_cid(bytes)?;
        if actual != *cid {
            #[cfg(feature = "tracing")]
            tracing::warn!(expected = %cid, actual = %actual, "MST block failed CID check");
            return Err(MstError::cid_mismatch(cid, actual));
        }

        serde_ipld_dagcbor::from_slice(bytes)
            .map_err(|e| NodeError::Cbor(Box::new(e)).into())
    }

    /// Number of leaves in this node
    pub fn leaf_count(&self) -> usize {
        self.entries.len()
    }

    /// Reconstruct the full key of the first entry, if any
    pub fn first_key(&self) -> Result<Option<String>> {
        match self.entries.first() {
            Some(entry) => Ok(Some(
                String::from_utf8(entry.key_suffix.clone()).map_err(NodeError::InvalidUtf8)?,
            )),
            None => Ok(None),
        }
    }

    /// Deserialize wire format to flat entries
    ///
    /// Subtree pointers come back as stored (unloaded) subtrees.
    pub fn into_entries(self) -> Result<Vec<NodeEntry>> {
        let mut entries = Vec::with_capacity(self.entries.len() * 2 + 1);

        if let Some(left) = self.left {
            entries.push(NodeEntry::Tree(Subtree::stored(left)));
        }

        let mut last_key: Vec<u8> = Vec::new();
        for entry in self.entries {
            if entry.prefix_len > last_key.len() {
                return Err(NodeError::PrefixOutOfRange {
                    prefix_len: entry.prefix_len,
                    prev_len: last_key.len(),
                }
                .into());
            }

            let mut full_key = last_key[..entry.prefix_len].to_vec();
            full_key.extend_from_slice(&entry.key_suffix);
            let key = String::from_utf8(full_key).map_err(NodeError::InvalidUtf8)?;

            entries.push(NodeEntry::leaf(key.as_str(), entry.value));
            last_key = key.into_bytes();

            if let Some(tree) = entry.tree {
                entries.push(NodeEntry::Tree(Subtree::stored(tree)));
            }
        }

        Ok(entries)
    }
}
