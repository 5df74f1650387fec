//! On-disk object store
//!
//! Objects live at `root/<segments...>/<file_name>` as produced by the
//! configured [`PathResolver`]. There is no index beyond the directory
//! layout; every call goes straight to the filesystem.
//!
//! Writes go directly to the final file name. A crash mid-write can leave a
//! partial object behind under its final name.

use super::path::{PathResolver, ResolvedPath, ShardedPathResolver};
use super::{Store, StoreError, StoreResult};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Root used when none is configured
pub const DEFAULT_ROOT: &str = "destore_storage";

/// Number of lock stripes serializing same-key writers
const LOCK_STRIPES: usize = 64;

/// Attempts at creating an object file before giving up
const CREATE_ATTEMPTS: usize = 3;

/// Store construction options
#[derive(Clone, Default)]
pub struct StoreConfig {
    /// Root directory; empty means [`DEFAULT_ROOT`]
    pub root: PathBuf,
    /// Path strategy; `None` means SHA-256 sharding
    pub resolver: Option<Arc<dyn PathResolver>>,
}

/// Filesystem-backed content-addressable store
pub struct ObjectStore {
    root: PathBuf,
    resolver: Arc<dyn PathResolver>,
    locks: [Mutex<()>; LOCK_STRIPES],
}

impl ObjectStore {
    /// Create a store. The root directory is created lazily on first write.
    pub fn new(config: StoreConfig) -> Self {
        let root = if config.root.as_os_str().is_empty() {
            PathBuf::from(DEFAULT_ROOT)
        } else {
            config.root
        };
        let resolver = config
            .resolver
            .unwrap_or_else(|| Arc::new(ShardedPathResolver::default()));

        Self {
            root,
            resolver,
            locks: std::array::from_fn(|_| Mutex::new(())),
        }
    }

    /// Store rooted at `root` with the default resolver
    pub fn with_root<P: AsRef<Path>>(root: P) -> Self {
        Self::new(StoreConfig {
            root: root.as_ref().to_path_buf(),
            resolver: None,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute-or-relative location of the object for `key`
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(self.resolver.resolve(key).full_path())
    }

    fn lock_for(&self, resolved: &ResolvedPath) -> MutexGuard<'_, ()> {
        let stripe = resolved
            .file_name
            .bytes()
            .fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize))
            % LOCK_STRIPES;
        self.locks[stripe]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn create_object(&self, key: &str, dir: &Path, path: &Path) -> StoreResult<File> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            fs::create_dir_all(dir).map_err(|e| StoreError::io("write", key, e))?;
            match File::create(path) {
                Ok(file) => return Ok(file),
                // a concurrent delete of a sibling object may prune the fresh directories
                Err(e) if e.kind() == io::ErrorKind::NotFound && attempt < CREATE_ATTEMPTS => {
                    continue
                }
                Err(e) => return Err(StoreError::io("write", key, e)),
            }
        }
    }

    /// Remove empty directories from `start` upward, stopping at the root.
    /// Best-effort: the first failure ends the walk.
    fn prune_empty_dirs(&self, start: &Path) {
        let mut current = Some(start);
        while let Some(dir) = current {
            if dir == self.root || !dir.starts_with(&self.root) {
                break;
            }
            if fs::remove_dir(dir).is_err() {
                break;
            }
            current = dir.parent();
        }
    }
}

impl Store for ObjectStore {
    fn has(&self, key: &str) -> StoreResult<bool> {
        match fs::metadata(self.path_for(key)) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io("has", key, e)),
        }
    }

    fn write(&self, key: &str, reader: &mut dyn Read) -> StoreResult<u64> {
        let resolved = self.resolver.resolve(key);
        let dir = self.root.join(resolved.dir_path());
        let path = dir.join(&resolved.file_name);

        let _guard = self.lock_for(&resolved);
        let mut file = self.create_object(key, &dir, &path)?;
        let written = io::copy(reader, &mut file).map_err(|e| StoreError::io("write", key, e))?;
        file.sync_all()
            .map_err(|e| StoreError::io("write", key, e))?;

        Ok(written)
    }

    fn read(&self, key: &str) -> StoreResult<Box<dyn Read + Send>> {
        match File::open(self.path_for(key)) {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound {
                key: key.to_string(),
            }),
            Err(e) => Err(StoreError::io("read", key, e)),
        }
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        let resolved = self.resolver.resolve(key);
        let dir = self.root.join(resolved.dir_path());
        let path = dir.join(&resolved.file_name);

        let _guard = self.lock_for(&resolved);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StoreError::io("delete", key, e)),
        }

        self.prune_empty_dirs(&dir);
        Ok(())
    }

    fn clear(&self) -> StoreResult<()> {
        if !is_safe_clear_root(&self.root) {
            return Err(StoreError::UnsafeRoot(self.root.clone()));
        }

        match fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io("clear", &self.root.to_string_lossy(), e)),
        }
    }
}

/// Heuristic guard for recursive removal: relative, at least three
/// characters, and made only of plain components.
fn is_safe_clear_root(root: &Path) -> bool {
    if root.as_os_str().len() < 3 || root.is_absolute() || root.has_root() {
        return false;
    }
    root.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}
