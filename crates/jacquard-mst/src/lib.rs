//! AT Protocol Merkle Search Tree
//!
//! A deterministic, content-addressed sorted map from record keys
//! (`collection/rkey`) to record CIDs. Any two implementations holding the
//! same key/value set produce byte-identical nodes and the same root CID,
//! regardless of the order the keys went in.
//!
//! - **MST**: persistent tree operations; every mutation returns a new handle
//!   and leaves the old one valid
//! - **Diff**: record and node-block changes between two roots
//! - **Storage**: pluggable async block storage with in-memory and layered
//!   implementations
//!
//! # Example
//!
//! ```rust,ignore
//! use jacquard_mst::{Mst, MemoryBlockStore};
//! use std::sync::Arc;
//!
//! # async fn example(record: cid::Cid) -> Result<(), Box<dyn std::error::Error>> {
//! let mst = Mst::new(Arc::new(MemoryBlockStore::new()));
//!
//! let mst = mst.insert_or_fail("app.bsky.feed.post/abc123", record).await?;
//! assert_eq!(mst.get("app.bsky.feed.post/abc123").await?, record);
//!
//! // write new nodes to the store
//! mst.persist().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod error;
/// Merkle Search Tree implementation
pub mod mst;
/// Block storage abstraction
pub mod storage;

pub use error::{MstError, MstErrorKind, Result};
pub use mst::{Mst, MstDiff, MstOptions, WriteOp};
pub use storage::{BlockStore, BlockWrites, LayeredBlockStore, MemoryBlockStore};

/// DAG-CBOR codec identifier for CIDs (0x71)
pub const DAG_CBOR_CID_CODEC: u64 = 0x71;

/// SHA2-256 multihash code (0x12)
pub const SHA2_256_CODE: u64 = 0x12;
