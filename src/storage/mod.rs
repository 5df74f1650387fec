//! Content-addressable object storage
//!
//! This module defines the Store trait and the on-disk implementation.

pub mod path;
pub mod store;

use std::io::{self, Read};
use std::path::PathBuf;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found: {key}")]
    NotFound { key: String },

    #[error("{op} {key}: {source}")]
    Io {
        op: &'static str,
        key: String,
        #[source]
        source: io::Error,
    },

    #[error("refusing to clear unsafe root path {0:?}")]
    UnsafeRoot(PathBuf),
}

impl StoreError {
    pub(crate) fn io(op: &'static str, key: &str, source: io::Error) -> Self {
        StoreError::Io {
            op,
            key: key.to_string(),
            source,
        }
    }

    /// Whether this is the "absent object" class
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Object store trait - keyed access to streamed blobs
pub trait Store: Send + Sync {
    /// Check whether an object exists for `key`.
    fn has(&self, key: &str) -> StoreResult<bool>;

    /// Stream `reader` into the object for `key`, replacing any previous
    /// content. Returns the number of bytes written.
    fn write(&self, key: &str, reader: &mut dyn Read) -> StoreResult<u64>;

    /// Open the object for `key`. The handle is closed when dropped.
    fn read(&self, key: &str) -> StoreResult<Box<dyn Read + Send>>;

    /// Remove the object for `key`. Absent keys are not an error.
    fn delete(&self, key: &str) -> StoreResult<()>;

    /// Remove everything under the store root.
    fn clear(&self) -> StoreResult<()>;
}

pub use path::{HashAlgorithm, PathResolver, ResolvedPath, ShardedPathResolver};
pub use store::{ObjectStore, StoreConfig};
