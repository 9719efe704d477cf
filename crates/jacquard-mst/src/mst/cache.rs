//! Operation-scoped node cache
//!
//! Every tree operation creates one [`NodeCache`] and threads it through its
//! recursion. It is the only place the MST touches storage, and it lives
//! exactly as long as the operation that created it.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use cid::Cid as IpldCid;

use super::node::{Node, NodeData, Subtree};
use super::util::layer_for_key;
use crate::error::{MstError, NodeError, Result};
use crate::storage::BlockStore;

/// Nodes fetched during a single operation, keyed by CID
pub struct NodeCache<'a, S> {
    storage: &'a S,
    verify_layers: bool,
    nodes: HashMap<IpldCid, Arc<Node>>,
}

impl<'a, S: BlockStore + Sync + 'static> NodeCache<'a, S> {
    /// Create an empty cache over `storage`
    pub fn new(storage: &'a S, verify_layers: bool) -> Self {
        Self {
            storage,
            verify_layers,
            nodes: HashMap::new(),
        }
    }

    /// Number of distinct nodes fetched so far
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether nothing has been fetched yet
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Resolve a child pointer whose layer is known from its parent
    pub async fn resolve(&mut self, subtree: &Subtree, layer: usize) -> Result<Arc<Node>> {
        if let Some(node) = subtree.node() {
            return Ok(node.clone());
        }
        self.load(subtree.cid(), Some(layer)).await
    }

    /// Resolve a root pointer, inferring its layer from its contents
    pub async fn resolve_root(&mut self, root: &Subtree) -> Result<Arc<Node>> {
        if let Some(node) = root.node() {
            return Ok(node.clone());
        }
        self.load(root.cid(), None).await
    }

    /// Fetch, verify and decode a node
    ///
    /// With `layer` unset the layer comes from the first leaf, or from the
    /// left-most descendant for nodes that hold only a subtree pointer.
    pub fn load<'b>(
        &'b mut self,
        cid: &'b IpldCid,
        layer: Option<usize>,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<Node>>> + Send + 'b>>
    where
        'a: 'b,
    {
        Box::pin(async move {
            if let Some(node) = self.nodes.get(cid) {
                if let Some(expected) = layer {
                    if node.layer() != expected {
                        return Err(MstError::invalid_mst(format!(
                            "node {} reached at layer {} but holds layer {}",
                            cid,
                            expected,
                            node.layer()
                        )));
                    }
                }
                return Ok(node.clone());
            }

            let bytes = self.fetch(cid).await?;
            let data = NodeData::decode(cid, &bytes)?;

            let layer = match layer {
                Some(layer) => layer,
                None => self.infer_layer(&data).await?,
            };

            #[cfg(feature = "tracing")]
            tracing::trace!(%cid, layer, leaves = data.leaf_count(), "loaded MST node");

            let node = Arc::new(Node::from_data(
                *cid,
                bytes,
                data,
                layer,
                self.verify_layers,
            )?);
            self.nodes.insert(*cid, node.clone());
            Ok(node)
        })
    }

    async fn fetch(&self, cid: &IpldCid) -> Result<Bytes> {
        self.storage
            .get(cid)
            .await?
            .ok_or_else(|| MstError::block_not_found("MST node", cid))
    }

    fn infer_layer<'b>(
        &'b mut self,
        data: &'b NodeData,
    ) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + 'b>>
    where
        'a: 'b,
    {
        Box::pin(async move {
            if let Some(key) = data.first_key()? {
                return Ok(layer_for_key(&key));
            }

            // No leaves: layer is one above whatever the left pointer holds
            match &data.left {
                Some(left) => {
                    let child = self.load(left, None).await?;
                    Ok(child.layer() + 1)
                }
                None => Ok(0),
            }
        })
    }
}

/// Child layer under a node, or an error for layer 0
pub(crate) fn child_layer(layer: usize) -> Result<usize> {
    layer
        .checked_sub(1)
        .ok_or_else(|| NodeError::SubtreeBelowZero.into())
}
