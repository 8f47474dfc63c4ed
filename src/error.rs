//! Error types for the remote objects protocol.
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Disconnected` | Yes | Channel dropped before a reply/fetch arrived |
//! | `Io` | Yes | Socket level failure |
//! | `NoSuchSource` | Yes | Peer does not (yet) host the requested name |
//! | `DuplicateName` | No | Name already registered by another location |
//! | `SignatureMismatch` | No | Source and replica disagree on the API |
//! | `InvalidIndex` | No | Model index outside the confirmed structure |
//! | `Codec` / `FrameTooLarge` | No | Malformed or oversized packet |
//!
//! Transport errors are recovered at the binding level and never bring the
//! node down; see [`RemoteObjectsError::is_retryable()`].

use thiserror::Error;

/// Result type alias for remote object operations.
pub type Result<T> = std::result::Result<T, RemoteObjectsError>;

#[derive(Error, Debug)]
pub enum RemoteObjectsError {
    /// A source name is already registered by a different location.
    #[error("duplicate source name {name}: registered at {existing}, rejected {rejected}")]
    DuplicateName {
        name: String,
        existing: String,
        rejected: String,
    },

    /// Source and replica were compiled from different interface definitions.
    #[error("signature mismatch for {type_name}: source {expected}, replica {actual}")]
    SignatureMismatch {
        type_name: String,
        expected: String,
        actual: String,
    },

    /// The channel carrying a binding was lost.
    ///
    /// Every pending call and model fetch on that binding is rejected with
    /// this error; the replica keeps its last known values.
    #[error("channel disconnected")]
    Disconnected,

    #[error("invalid model index: {0}")]
    InvalidIndex(String),

    #[error("unknown property index {index} on {type_name}")]
    UnknownProperty { type_name: String, index: usize },

    #[error("unknown method index {index} on {type_name}")]
    UnknownMethod { type_name: String, index: usize },

    #[error("property {name} of {type_name} is not writable from a replica")]
    NotWritable { type_name: String, name: String },

    /// Operation attempted on a replica outside the `Valid` state.
    #[error("replica {name} is not valid (state {state})")]
    NotValid { name: String, state: String },

    #[error("no source named {0}")]
    NoSuchSource(String),

    /// Error returned by the source-side invocation.
    #[error("remote invocation failed: {0}")]
    Remote(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("frame too large: max {max_frame_bytes} got {got_bytes}")]
    FrameTooLarge {
        max_frame_bytes: usize,
        got_bytes: usize,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl RemoteObjectsError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Disconnected => true,
            Self::Io(_) => true,
            Self::NoSuchSource(_) => true,
            Self::DuplicateName { .. } => false,
            Self::SignatureMismatch { .. } => false,
            Self::InvalidIndex(_) => false,
            Self::UnknownProperty { .. } => false,
            Self::UnknownMethod { .. } => false,
            Self::NotWritable { .. } => false,
            Self::NotValid { .. } => false,
            Self::Remote(_) => false,
            Self::Codec(_) => false,
            Self::FrameTooLarge { .. } => false,
            Self::Persistence(_) => false,
            Self::Config(_) => false,
        }
    }
}
