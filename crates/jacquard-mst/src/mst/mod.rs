//! Merkle Search Tree implementation

pub mod cache;
pub mod cursor;
pub mod diff;
pub mod node;
pub mod tree;
pub mod util;

pub use cache::NodeCache;
pub use cursor::{CursorPosition, MstCursor};
pub use diff::MstDiff;
pub use node::{EMPTY_NODE_CID, Node, NodeData, NodeEntry, Subtree, TreeEntry};
pub use tree::{Mst, MstOptions, WriteOp};
