//! Key to path resolution
//!
//! Maps a store key to a sharded directory path and a canonical file name.

use sha2::{Digest, Sha256};
use std::path::PathBuf;

/// Length of a hex-encoded 256-bit digest
const HEX_DIGEST_LEN: usize = 64;

/// Default width of a directory segment in hex characters
pub const DEFAULT_SEGMENT_LEN: usize = 2;

/// Location of an object relative to the store root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    /// Nested directory names, outermost first
    pub segments: Vec<String>,
    /// Canonical object id (the full hash)
    pub file_name: String,
}

impl ResolvedPath {
    /// Directory part, e.g. `a8/d7/82/...`
    pub fn dir_path(&self) -> PathBuf {
        self.segments.iter().collect()
    }

    /// Directory part joined with the file name
    pub fn full_path(&self) -> PathBuf {
        self.dir_path().join(&self.file_name)
    }

    /// Segment at `index`, if any
    pub fn segment(&self, index: usize) -> Option<&str> {
        self.segments.get(index).map(String::as_str)
    }
}

/// Strategy for turning a key into a [`ResolvedPath`].
///
/// Implementations must be pure and deterministic: the directory layout is
/// the only index the store keeps.
pub trait PathResolver: Send + Sync {
    fn resolve(&self, key: &str) -> ResolvedPath;
}

impl<F> PathResolver for F
where
    F: Fn(&str) -> ResolvedPath + Send + Sync,
{
    fn resolve(&self, key: &str) -> ResolvedPath {
        self(key)
    }
}

/// Hash function used by [`ShardedPathResolver`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Blake3,
}

impl HashAlgorithm {
    fn hex_digest(self, key: &str) -> String {
        match self {
            HashAlgorithm::Sha256 => hex::encode(Sha256::digest(key.as_bytes())),
            HashAlgorithm::Blake3 => blake3::hash(key.as_bytes()).to_hex().to_string(),
        }
    }
}

/// Hash-sharded resolver
///
/// Hashes the key, hex-encodes the digest and splits it into fixed-width
/// segments used as nested directories. The full digest is the file name:
///
/// ```text
/// a8d78228... => a8/d7/82/28/.../a8d78228...
/// ```
#[derive(Debug, Clone, Copy)]
pub struct ShardedPathResolver {
    algorithm: HashAlgorithm,
    segment_len: usize,
}

impl ShardedPathResolver {
    /// Create a resolver; `segment_len` must be non-zero and divide 64,
    /// otherwise the default width is used.
    pub fn new(algorithm: HashAlgorithm, segment_len: usize) -> Self {
        let segment_len = if is_valid_segment_len(segment_len) {
            segment_len
        } else {
            DEFAULT_SEGMENT_LEN
        };
        Self {
            algorithm,
            segment_len,
        }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }
}

impl Default for ShardedPathResolver {
    fn default() -> Self {
        Self::new(HashAlgorithm::Sha256, DEFAULT_SEGMENT_LEN)
    }
}

impl PathResolver for ShardedPathResolver {
    fn resolve(&self, key: &str) -> ResolvedPath {
        let digest = self.algorithm.hex_digest(key);

        // hex output is ASCII, so byte chunks are valid segment boundaries
        let segments = digest
            .as_bytes()
            .chunks(self.segment_len)
            .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
            .collect();

        ResolvedPath {
            segments,
            file_name: digest,
        }
    }
}

/// Whether `len` evenly splits a hex digest into segments
pub fn is_valid_segment_len(len: usize) -> bool {
    len > 0 && HEX_DIGEST_LEN % len == 0
}
