//! MST cursor for efficient tree traversal

use std::sync::Arc;

use cid::Cid as IpldCid;
use smol_str::SmolStr;

use super::cache::{NodeCache, child_layer};
use super::node::{Node, NodeEntry, Subtree};
use crate::error::Result;
use crate::storage::BlockStore;

/// Position within an MST traversal
#[derive(Debug, Clone)]
pub enum CursorPosition {
    /// Pointing at a leaf entry
    Leaf {
        /// Leaf key
        key: SmolStr,
        /// Leaf CID (record value)
        cid: IpldCid,
    },

    /// Pointing at a subtree pointer
    Tree {
        /// The subtree
        subtree: Subtree,
        /// Layer of the subtree's root node
        layer: usize,
    },

    /// Past the end of traversal
    End,
}

fn position_of(entry: &NodeEntry, node_layer: usize) -> Result<CursorPosition> {
    Ok(match entry {
        NodeEntry::Leaf { key, value } => CursorPosition::Leaf {
            key: key.clone(),
            cid: *value,
        },
        NodeEntry::Tree(subtree) => CursorPosition::Tree {
            subtree: subtree.clone(),
            layer: child_layer(node_layer)?,
        },
    })
}

/// Cursor for navigating an MST in sorted order
///
/// Maintains a position in the tree and supports efficient navigation:
/// - `advance()`: Move to next item in sorted order
/// - `skip_subtree()`: Skip entire subtree at current position
/// - `current()`: Get current position without moving
///
/// The cursor owns the node cache for its traversal, so every node is
/// fetched at most once while it walks.
///
/// # Example traversal
///
/// ```ignore
/// let mut cursor = tree.walk().await?;
///
/// while !cursor.is_end() {
///     match cursor.current() {
///         CursorPosition::Leaf { key, cid } => {
///             println!("Leaf: {} -> {}", key, cid);
///         }
///         CursorPosition::Tree { layer, .. } => {
///             println!("Subtree at layer {}", layer);
///         }
///         CursorPosition::End => break,
///     }
///     cursor.advance().await?;
/// }
/// ```
pub struct MstCursor<'a, S> {
    cache: NodeCache<'a, S>,
    /// Nodes stepped into, with the index of the current entry in each
    path: Vec<(Arc<Node>, usize)>,
    current: CursorPosition,
}

impl<'a, S: BlockStore + Sync + 'static> MstCursor<'a, S> {
    /// Create new cursor at the root of a tree
    ///
    /// Initial position is the root itself (a Tree position).
    /// Call `advance()` to move to the first entry.
    pub async fn new(storage: &'a S, root: Subtree, verify_layers: bool) -> Result<Self> {
        let mut cache = NodeCache::new(storage, verify_layers);
        let node = cache.resolve_root(&root).await?;
        let layer = node.layer();

        Ok(Self {
            cache,
            path: Vec::new(),
            current: CursorPosition::Tree {
                subtree: Subtree::loaded(node),
                layer,
            },
        })
    }

    /// Get current position without advancing
    pub fn current(&self) -> &CursorPosition {
        &self.current
    }

    /// Check if cursor is at end
    pub fn is_end(&self) -> bool {
        matches!(self.current, CursorPosition::End)
    }

    /// Get key at current position (if pointing at leaf)
    pub fn key(&self) -> Option<&str> {
        match &self.current {
            CursorPosition::Leaf { key, .. } => Some(key.as_str()),
            _ => None,
        }
    }

    /// Layer the current position lives at
    ///
    /// Inside a node this is that node's layer. Positioned on the root
    /// (before stepping in) it is one above the root's layer.
    pub fn layer(&self) -> usize {
        match (self.path.last(), &self.current) {
            (Some((node, _)), _) => node.layer(),
            (None, CursorPosition::Tree { layer, .. }) => layer + 1,
            (None, _) => 0,
        }
    }

    /// Advance to next position in sorted order
    ///
    /// - If at Leaf: move to next sibling or pop up
    /// - If at Tree: descend into it (step into first entry)
    /// - If at End: stay at End
    pub async fn advance(&mut self) -> Result<()> {
        match self.current {
            CursorPosition::End => Ok(()),
            CursorPosition::Leaf { .. } => self.step_over(),
            CursorPosition::Tree { .. } => self.step_into().await.map(|_| ()),
        }
    }

    /// Skip entire subtree at current position
    ///
    /// If pointing at a Tree, skips all its contents without fetching them.
    /// If pointing at a Leaf, equivalent to `advance()`.
    pub fn skip_subtree(&mut self) -> Result<()> {
        self.step_over()
    }

    /// Descend into the subtree at the current position
    ///
    /// Returns the node stepped into, or `None` if the cursor is not on a
    /// subtree. An empty node is stepped over straight away.
    pub async fn step_into(&mut self) -> Result<Option<Arc<Node>>> {
        let (subtree, layer) = match &self.current {
            CursorPosition::Tree { subtree, layer } => (subtree.clone(), *layer),
            _ => return Ok(None),
        };
        let node = self.cache.resolve(&subtree, layer).await?;

        match node.entries().first() {
            Some(first) => {
                self.current = position_of(first, node.layer())?;
                self.path.push((node.clone(), 0));
            }
            None => self.step_over()?,
        }

        Ok(Some(node))
    }

    /// Advance to the next leaf and return it, stepping into subtrees
    ///
    /// Returns `None` once the traversal is exhausted.
    pub async fn next_leaf(&mut self) -> Result<Option<(SmolStr, IpldCid)>> {
        loop {
            match &self.current {
                CursorPosition::End => return Ok(None),
                CursorPosition::Leaf { key, cid } => {
                    let leaf = (key.clone(), *cid);
                    self.step_over()?;
                    return Ok(Some(leaf));
                }
                CursorPosition::Tree { .. } => {
                    self.step_into().await?;
                }
            }
        }
    }

    /// Move to next sibling or pop up
    fn step_over(&mut self) -> Result<()> {
        loop {
            let Some((node, index)) = self.path.last_mut() else {
                self.current = CursorPosition::End;
                return Ok(());
            };

            *index += 1;
            if let Some(entry) = node.entries().get(*index) {
                let next = position_of(entry, node.layer())?;
                self.current = next;
                return Ok(());
            }

            self.path.pop();
        }
    }
}
