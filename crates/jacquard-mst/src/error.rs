//! Error types for MST operations

use std::error::Error;
use std::fmt;

/// Boxed error type for error sources
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Result type alias for MST operations
pub type Result<T> = std::result::Result<T, MstError>;

/// MST operation error with rich diagnostics
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub struct MstError {
    kind: MstErrorKind,
    #[source]
    source: Option<BoxError>,
    #[help]
    help: Option<String>,
    context: Option<String>,
}

/// Error categories for MST operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MstErrorKind {
    /// Key does not match `collection/rkey` format
    InvalidKey,
    /// Key is not present in the tree
    KeyNotFound,
    /// Strict insert hit an existing key
    KeyExists,
    /// A block referenced by the tree is missing from storage
    BlockNotFound,
    /// Block bytes could not be decoded as an MST node
    Decoding,
    /// Fetched block does not hash to the CID it was fetched by
    CidMismatch,
    /// Tree structure violates MST invariants
    InvalidMst,
    /// Expected previous value did not match the tree
    PrevMismatch,
    /// Serialization failed
    Serialization,
    /// Storage operation failed
    Storage,
    /// Data too large (exceeds protocol limits)
    TooLarge,
}

impl MstErrorKind {
    /// Whether this error is caused by the request rather than the store
    ///
    /// At a protocol boundary these map to client errors. Everything else
    /// (missing blocks, corrupt blocks, storage failures) is a server-side fault.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            MstErrorKind::InvalidKey
                | MstErrorKind::KeyNotFound
                | MstErrorKind::KeyExists
                | MstErrorKind::PrevMismatch
                | MstErrorKind::TooLarge
        )
    }
}

impl MstError {
    /// Create a new error with the given kind and optional source
    pub fn new(kind: MstErrorKind, source: Option<BoxError>) -> Self {
        Self {
            kind,
            source,
            help: None,
            context: None,
        }
    }

    /// Add a help message to the error
    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    /// Add context information to the error
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Get the error kind
    pub fn kind(&self) -> &MstErrorKind {
        &self.kind
    }

    /// Create an invalid key error from a granular cause
    pub fn invalid_key(key: &str, cause: KeyError) -> Self {
        Self::new(MstErrorKind::InvalidKey, Some(Box::new(cause)))
            .with_help("MST keys must be `collection/rkey`, printable ASCII, max 1024 bytes")
            .with_context(format!("key: {:?}", key))
    }

    /// Create a key not found error
    pub fn key_not_found(key: impl fmt::Display) -> Self {
        Self::new(MstErrorKind::KeyNotFound, None).with_context(format!("key not found: {}", key))
    }

    /// Create a key exists error
    pub fn key_exists(key: impl fmt::Display) -> Self {
        Self::new(MstErrorKind::KeyExists, None)
            .with_context(format!("key already exists: {}", key))
    }

    /// Create a block not found error
    pub fn block_not_found(what: &str, cid: impl fmt::Display) -> Self {
        Self::new(MstErrorKind::BlockNotFound, None)
            .with_context(format!("{} block not found: {}", what, cid))
            .with_help("the block store is missing blocks reachable from this root")
    }

    /// Create a decoding error
    pub fn decoding(source: impl Error + Send + Sync + 'static) -> Self {
        Self::new(MstErrorKind::Decoding, Some(Box::new(source)))
    }

    /// Create a CID mismatch error
    pub fn cid_mismatch(expected: impl fmt::Display, actual: impl fmt::Display) -> Self {
        Self::new(MstErrorKind::CidMismatch, None)
            .with_context(format!("expected {}, block hashes to {}", expected, actual))
            .with_help("block store contents are corrupt or were tampered with")
    }

    /// Create an invalid MST error
    pub fn invalid_mst(msg: impl Into<String>) -> Self {
        Self::new(MstErrorKind::InvalidMst, Some(msg.into().into()))
            .with_help("MST nodes must follow protocol structure")
    }

    /// Create a prev mismatch error
    pub fn prev_mismatch(key: &str, expected: impl fmt::Display, actual: impl fmt::Display) -> Self {
        Self::new(MstErrorKind::PrevMismatch, None).with_context(format!(
            "prev mismatch for {}: expected {}, found {}",
            key, expected, actual
        ))
    }

    /// Create a serialization error
    pub fn serialization(source: impl Error + Send + Sync + 'static) -> Self {
        Self::new(MstErrorKind::Serialization, Some(Box::new(source)))
    }

    /// Create a storage error
    pub fn storage(source: impl Error + Send + Sync + 'static) -> Self {
        Self::new(MstErrorKind::Storage, Some(Box::new(source)))
    }

    /// Create a too large error
    pub fn too_large(what: &str, size: usize, max: usize) -> Self {
        Self::new(MstErrorKind::TooLarge, None)
            .with_context(format!("{} is {}, max {}", what, size, max))
            .with_help("See sync v1.1 protocol limits")
    }
}

impl fmt::Display for MstError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;

        if let Some(ctx) = &self.context {
            write!(f, ": {}", ctx)?;
        }

        if let Some(src) = &self.source {
            write!(f, ": {}", src)?;
        }

        Ok(())
    }
}

// Internal granular errors

/// Key validation failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, miette::Diagnostic)]
pub enum KeyError {
    /// Empty key not allowed
    #[error("empty key not allowed")]
    Empty,

    /// Key too long
    #[error("key too long: {len} bytes (max {max})")]
    TooLong {
        /// Actual key length
        len: usize,
        /// Maximum allowed length
        max: usize,
    },

    /// Byte outside printable ASCII
    #[error("byte 0x{byte:02x} at offset {offset} is not printable ASCII")]
    NonPrintable {
        /// Offending byte
        byte: u8,
        /// Byte offset in the key
        offset: usize,
    },

    /// No `/` separator
    #[error("missing `/` between collection and rkey")]
    MissingSeparator,

    /// More than one `/`
    #[error("rkey must not contain `/`")]
    ExtraSeparator,

    /// Nothing before the `/`
    #[error("empty collection")]
    EmptyCollection,

    /// Nothing after the `/`
    #[error("empty rkey")]
    EmptyRkey,
}

/// Node structure and wire format errors
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum NodeError {
    /// Two subtree pointers next to each other
    #[error("two subtrees adjacent in node entries")]
    AdjacentSubtrees,

    /// Keys not strictly increasing within a node
    #[error("keys out of order: {prev:?} then {next:?}")]
    UnsortedKeys {
        /// Previous key
        prev: String,
        /// Key that should have been greater
        next: String,
    },

    /// Prefix length longer than the previous key
    #[error("prefix length {prefix_len} exceeds previous key length {prev_len}")]
    PrefixOutOfRange {
        /// Encoded prefix length
        prefix_len: usize,
        /// Length of the previous key
        prev_len: usize,
    },

    /// Reconstructed key is not UTF-8
    #[error("key is not valid UTF-8")]
    InvalidUtf8(#[source] std::string::FromUtf8Error),

    /// Leaf sits at the wrong layer
    #[error("key {key:?} hashes to layer {expected} but sits at layer {actual}")]
    LayerMismatch {
        /// Offending key
        key: String,
        /// Layer the key hashes to
        expected: usize,
        /// Layer of the node holding it
        actual: usize,
    },

    /// Layer 0 node pointing at a subtree
    #[error("layer 0 node has a subtree pointer")]
    SubtreeBelowZero,

    /// Malformed DAG-CBOR
    #[error("malformed node block")]
    Cbor(#[source] BoxError),
}

impl From<KeyError> for MstError {
    fn from(e: KeyError) -> Self {
        MstError::new(MstErrorKind::InvalidKey, Some(Box::new(e)))
    }
}

impl From<NodeError> for MstError {
    fn from(e: NodeError) -> Self {
        match &e {
            NodeError::Cbor(_) | NodeError::InvalidUtf8(_) | NodeError::PrefixOutOfRange { .. } => {
                MstError::decoding(e)
            }
            NodeError::AdjacentSubtrees
            | NodeError::UnsortedKeys { .. }
            | NodeError::LayerMismatch { .. }
            | NodeError::SubtreeBelowZero => MstError::new(MstErrorKind::InvalidMst, Some(Box::new(e)))
                .with_help("MST nodes must follow protocol structure"),
        }
    }
}
