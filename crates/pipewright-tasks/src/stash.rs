//! Content-addressable artifact stash and build-hash ledger
//!
//! Two separate concerns live here:
//! - the persistent cache, keyed by an input fingerprint ([`DeterminantHash`]),
//!   which survives across runs and processes;
//! - the per-run ledger mapping output paths to their content ([`FileHash`]),
//!   so consumers do not re-read artifacts that were just written.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use pipewright_core::{DeterminantHash, FileHash, HashError};

use crate::artifact::ArtifactHeader;

/// Result type for stash operations
pub type Result<T> = std::result::Result<T, StashError>;

/// Cache contract used by task bodies.
///
/// Shared by every task running concurrently, so implementations must be
/// safe to call from multiple threads. Writes are last-writer-wins per
/// `(path, determinant)` entry.
pub trait Stash: Send + Sync {
    /// Content hash of `path`, computed once per run and then served from the ledger
    fn get_build_hash_code(&self, path: &Path) -> Result<FileHash>;

    /// Seed the ledger entry for `path`
    fn set_build_hash_code(&self, path: &Path, hash: FileHash);

    /// Re-hash `path` from disk and seed the ledger with the result
    fn refresh_build_hash_code(&self, path: &Path) -> Result<FileHash>;

    /// Copy the current content of `path` into the cache under `determinant`
    fn stash(&self, path: &Path, determinant: &DeterminantHash) -> Result<()>;

    /// Materialize the entry for `determinant` at `path`.
    ///
    /// Returns false and leaves `path` untouched on a miss. A corrupt entry is
    /// a miss.
    fn restore(&self, path: &Path, determinant: &DeterminantHash) -> bool;

    /// Like [`Stash::restore`], but also a miss when the cached artifact's
    /// header does not equal `expected`
    fn restore_artifact(
        &self,
        path: &Path,
        determinant: &DeterminantHash,
        expected: &ArtifactHeader,
    ) -> bool;

    /// Snapshot of the ledger
    fn build_hash_codes(&self) -> BTreeMap<PathBuf, FileHash>;
}

/// Metadata stored beside each cache entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StashEntry {
    /// Output path the entry was stashed from
    pub path: PathBuf,
    /// Input fingerprint the entry is keyed by
    pub determinant: DeterminantHash,
    /// When this entry was written
    pub created_at: DateTime<Utc>,
}

/// On-disk stash
#[derive(Debug)]
pub struct FileStash {
    dir: PathBuf,
    ledger: Mutex<HashMap<PathBuf, FileHash>>,
}

impl FileStash {
    /// Open a stash rooted at `dir`. The directory is created lazily.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ledger: Mutex::new(HashMap::new()),
        }
    }

    /// Stash directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn ledger(&self) -> MutexGuard<'_, HashMap<PathBuf, FileHash>> {
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Forget every ledger entry. Called at the start of a run.
    pub fn reset_build_hash_codes(&self) {
        self.ledger().clear();
    }

    /// Seed the ledger, typically from a prior run's result
    pub fn seed_build_hash_codes<I>(&self, hashes: I)
    where
        I: IntoIterator<Item = (PathBuf, FileHash)>,
    {
        let mut ledger = self.ledger();
        let before = ledger.len();
        ledger.extend(hashes);
        debug!(seeded = ledger.len() - before, "seeded build hash ledger");
    }

    fn entry_path(&self, path: &Path, determinant: &DeterminantHash) -> PathBuf {
        let key = determinant.combine_str(&path.to_string_lossy()).to_string();
        self.dir.join(&key[..2]).join(key)
    }

    fn load_entry(&self, path: &Path, determinant: &DeterminantHash) -> Option<Vec<u8>> {
        let entry = self.entry_path(path, determinant);
        match fs::read(&entry) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), %determinant, "stash miss");
                None
            }
            Err(e) => {
                warn!(entry = %entry.display(), error = %e, "unreadable stash entry, treating as miss");
                None
            }
        }
    }

    fn materialize(&self, path: &Path, bytes: &[u8]) -> bool {
        match write_atomic(path, bytes) {
            Ok(()) => true,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to restore from stash");
                false
            }
        }
    }

    /// Remove entries older than `max_age`
    pub fn prune(&self, max_age: Duration) -> Result<PruneStats> {
        info!(max_age_secs = max_age.as_secs(), "pruning stash");
        let mut stats = PruneStats::default();
        if !self.dir.exists() {
            return Ok(stats);
        }

        let cutoff = Utc::now() - chrono::Duration::from_std(max_age).unwrap_or_default();

        for meta_path in self.metadata_files() {
            stats.total += 1;

            let expired = fs::read_to_string(&meta_path)
                .ok()
                .and_then(|contents| serde_json::from_str::<StashEntry>(&contents).ok())
                .is_some_and(|entry| entry.created_at < cutoff);

            if expired {
                let entry_path = meta_path.with_extension("");
                let removed = fs::remove_file(&entry_path).is_ok();
                if fs::remove_file(&meta_path).is_ok() || removed {
                    stats.removed += 1;
                    continue;
                }
            }
            stats.kept += 1;
        }

        info!(total = stats.total, removed = stats.removed, kept = stats.kept, "stash prune complete");
        Ok(stats)
    }

    /// Entry count and disk usage
    pub fn status(&self) -> Result<StashStats> {
        let mut stats = StashStats::default();
        if !self.dir.exists() {
            return Ok(stats);
        }

        for entry in WalkDir::new(&self.dir).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            if entry.path().extension().is_some_and(|e| e == "json") {
                stats.entries += 1;
            }
            if let Ok(meta) = entry.metadata() {
                stats.total_size += meta.len();
            }
        }
        Ok(stats)
    }

    /// Delete the whole stash directory
    pub fn clean(&self) -> Result<StashStats> {
        let stats = self.status()?;
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)?;
        }
        info!(entries = stats.entries, dir = %self.dir.display(), "stash cleaned");
        Ok(stats)
    }

    fn metadata_files(&self) -> Vec<PathBuf> {
        WalkDir::new(&self.dir)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| p.extension().is_some_and(|e| e == "json"))
            .collect()
    }
}

impl Stash for FileStash {
    fn get_build_hash_code(&self, path: &Path) -> Result<FileHash> {
        if let Some(hash) = self.ledger().get(path) {
            return Ok(*hash);
        }
        // Hash outside the lock; two tasks racing on the same path compute the same value.
        let hash = FileHash::of_file(path)?;
        self.ledger().insert(path.to_path_buf(), hash);
        Ok(hash)
    }

    fn set_build_hash_code(&self, path: &Path, hash: FileHash) {
        self.ledger().insert(path.to_path_buf(), hash);
    }

    fn refresh_build_hash_code(&self, path: &Path) -> Result<FileHash> {
        let hash = FileHash::of_file(path)?;
        self.set_build_hash_code(path, hash);
        Ok(hash)
    }

    fn stash(&self, path: &Path, determinant: &DeterminantHash) -> Result<()> {
        let bytes = fs::read(path).map_err(|source| StashError::Source {
            path: path.to_path_buf(),
            source,
        })?;
        let entry_path = self.entry_path(path, determinant);

        write_atomic(&entry_path, &bytes)?;
        let metadata = StashEntry {
            path: path.to_path_buf(),
            determinant: *determinant,
            created_at: Utc::now(),
        };
        write_atomic(
            &entry_path.with_extension("json"),
            &serde_json::to_vec_pretty(&metadata)?,
        )?;

        debug!(path = %path.display(), %determinant, bytes = bytes.len(), "stashed artifact");
        Ok(())
    }

    fn restore(&self, path: &Path, determinant: &DeterminantHash) -> bool {
        match self.load_entry(path, determinant) {
            Some(bytes) => {
                let restored = self.materialize(path, &bytes);
                if restored {
                    debug!(path = %path.display(), %determinant, "restored from stash");
                }
                restored
            }
            None => false,
        }
    }

    fn restore_artifact(
        &self,
        path: &Path,
        determinant: &DeterminantHash,
        expected: &ArtifactHeader,
    ) -> bool {
        let Some(bytes) = self.load_entry(path, determinant) else {
            return false;
        };

        match ArtifactHeader::read_from(&bytes) {
            Some((header, _)) if &header == expected => self.materialize(path, &bytes),
            Some((header, _)) => {
                debug!(
                    path = %path.display(),
                    cached_schema = header.schema,
                    cached_version = %header.tool_version,
                    "stashed artifact version mismatch, treating as miss"
                );
                false
            }
            None => {
                warn!(path = %path.display(), "stashed artifact has corrupt header, treating as miss");
                false
            }
        }
    }

    fn build_hash_codes(&self) -> BTreeMap<PathBuf, FileHash> {
        self.ledger()
            .iter()
            .map(|(path, hash)| (path.clone(), *hash))
            .collect()
    }
}

impl<S: Stash + ?Sized> Stash for &S {
    fn get_build_hash_code(&self, path: &Path) -> Result<FileHash> {
        (**self).get_build_hash_code(path)
    }

    fn set_build_hash_code(&self, path: &Path, hash: FileHash) {
        (**self).set_build_hash_code(path, hash)
    }

    fn refresh_build_hash_code(&self, path: &Path) -> Result<FileHash> {
        (**self).refresh_build_hash_code(path)
    }

    fn stash(&self, path: &Path, determinant: &DeterminantHash) -> Result<()> {
        (**self).stash(path, determinant)
    }

    fn restore(&self, path: &Path, determinant: &DeterminantHash) -> bool {
        (**self).restore(path, determinant)
    }

    fn restore_artifact(
        &self,
        path: &Path,
        determinant: &DeterminantHash,
        expected: &ArtifactHeader,
    ) -> bool {
        (**self).restore_artifact(path, determinant, expected)
    }

    fn build_hash_codes(&self) -> BTreeMap<PathBuf, FileHash> {
        (**self).build_hash_codes()
    }
}

/// Stash wrapper that never restores, forcing every task to rebuild.
///
/// Everything else, including writing new entries, goes to the inner stash.
#[derive(Debug)]
pub struct NoRestoreStash<S> {
    inner: S,
}

impl<S: Stash> NoRestoreStash<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: Stash> Stash for NoRestoreStash<S> {
    fn get_build_hash_code(&self, path: &Path) -> Result<FileHash> {
        self.inner.get_build_hash_code(path)
    }

    fn set_build_hash_code(&self, path: &Path, hash: FileHash) {
        self.inner.set_build_hash_code(path, hash)
    }

    fn refresh_build_hash_code(&self, path: &Path) -> Result<FileHash> {
        self.inner.refresh_build_hash_code(path)
    }

    fn stash(&self, path: &Path, determinant: &DeterminantHash) -> Result<()> {
        self.inner.stash(path, determinant)
    }

    fn restore(&self, _path: &Path, _determinant: &DeterminantHash) -> bool {
        false
    }

    fn restore_artifact(&self, _: &Path, _: &DeterminantHash, _: &ArtifactHeader) -> bool {
        false
    }

    fn build_hash_codes(&self) -> BTreeMap<PathBuf, FileHash> {
        self.inner.build_hash_codes()
    }
}

/// Write `bytes` to `path` through a temp file in the same directory
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;
    let mut temp = NamedTempFile::new_in(parent)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Statistics from a prune operation
#[derive(Debug, Default)]
pub struct PruneStats {
    /// Total entries found
    pub total: usize,
    /// Entries removed
    pub removed: usize,
    /// Entries kept
    pub kept: usize,
}

/// Stash statistics
#[derive(Debug, Default)]
pub struct StashStats {
    /// Number of stash entries
    pub entries: usize,
    /// Total size in bytes
    pub total_size: u64,
}

impl StashStats {
    /// Format total size in human-readable form
    pub fn formatted_size(&self) -> String {
        const KB: f64 = 1024.0;
        let size = self.total_size as f64;
        if size < KB {
            format!("{} B", self.total_size)
        } else if size < KB * KB {
            format!("{:.1} KB", size / KB)
        } else if size < KB * KB * KB {
            format!("{:.1} MB", size / (KB * KB))
        } else {
            format!("{:.1} GB", size / (KB * KB * KB))
        }
    }
}

/// Stash errors
#[derive(Debug, thiserror::Error)]
pub enum StashError {
    /// The file to stash could not be read
    #[error("Failed to read {path} for stashing: {source}")]
    Source {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A file could not be hashed
    #[error(transparent)]
    Hash(#[from] HashError),

    /// IO error
    #[error("Stash IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("Stash serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn determinant(seed: &str) -> DeterminantHash {
        DeterminantHash::from_seed(seed.as_bytes())
    }

    #[test]
    fn test_restore_after_stash_is_byte_identical() {
        let temp = TempDir::new().unwrap();
        let stash = FileStash::new(temp.path().join("stash"));
        let output = temp.path().join("out.bin");
        let content: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        fs::write(&output, &content).unwrap();

        let det = determinant("a");
        stash.stash(&output, &det).unwrap();
        fs::write(&output, b"clobbered").unwrap();

        assert!(stash.restore(&output, &det));
        assert_eq!(fs::read(&output).unwrap(), content);
    }

    #[test]
    fn test_restore_miss_leaves_path_untouched() {
        let temp = TempDir::new().unwrap();
        let stash = FileStash::new(temp.path().join("stash"));
        let output = temp.path().join("out.txt");
        fs::write(&output, b"original").unwrap();

        assert!(!stash.restore(&output, &determinant("never stashed")));
        assert_eq!(fs::read(&output).unwrap(), b"original");
    }

    #[test]
    fn test_entries_keyed_by_path_and_determinant() {
        let temp = TempDir::new().unwrap();
        let stash = FileStash::new(temp.path().join("stash"));
        let a = temp.path().join("a.txt");
        let b = temp.path().join("b.txt");
        fs::write(&a, b"a").unwrap();

        let det = determinant("shared");
        stash.stash(&a, &det).unwrap();
        assert!(!stash.restore(&b, &det));
        assert!(!stash.restore(&a, &determinant("other")));
        assert!(stash.restore(&a, &det));
    }

    #[test]
    fn test_restore_creates_parent_dirs() {
        let temp = TempDir::new().unwrap();
        let stash = FileStash::new(temp.path().join("stash"));
        let nested = temp.path().join("build").join("deep").join("out.txt");
        fs::create_dir_all(nested.parent().unwrap()).unwrap();
        fs::write(&nested, b"x").unwrap();
        let det = determinant("n");
        stash.stash(&nested, &det).unwrap();

        fs::remove_dir_all(temp.path().join("build")).unwrap();
        assert!(stash.restore(&nested, &det));
        assert_eq!(fs::read(&nested).unwrap(), b"x");
    }

    #[test]
    fn test_build_hash_code_is_cached_per_run() {
        let temp = TempDir::new().unwrap();
        let stash = FileStash::new(temp.path().join("stash"));
        let file = temp.path().join("f.txt");
        fs::write(&file, b"one").unwrap();

        let first = stash.get_build_hash_code(&file).unwrap();
        assert_eq!(stash.get_build_hash_code(&file).unwrap(), first);

        // The ledger is authoritative until refreshed.
        fs::write(&file, b"two").unwrap();
        assert_eq!(stash.get_build_hash_code(&file).unwrap(), first);
        let refreshed = stash.refresh_build_hash_code(&file).unwrap();
        assert_eq!(refreshed, FileHash::of_bytes(b"two"));
        assert_eq!(stash.get_build_hash_code(&file).unwrap(), refreshed);
    }

    #[test]
    fn test_missing_file_hash_is_error() {
        let temp = TempDir::new().unwrap();
        let stash = FileStash::new(temp.path().join("stash"));
        assert!(matches!(
            stash.get_build_hash_code(&temp.path().join("missing")),
            Err(StashError::Hash(_))
        ));
    }

    #[test]
    fn test_seed_reset_and_snapshot() {
        let temp = TempDir::new().unwrap();
        let stash = FileStash::new(temp.path().join("stash"));
        let seeded = FileHash::of_bytes(b"prior");

        stash.seed_build_hash_codes([(PathBuf::from("build/a.o"), seeded)]);
        assert_eq!(
            stash.get_build_hash_code(Path::new("build/a.o")).unwrap(),
            seeded
        );
        assert_eq!(stash.build_hash_codes().len(), 1);

        stash.reset_build_hash_codes();
        assert!(stash.build_hash_codes().is_empty());
    }

    #[test]
    fn test_restore_artifact_checks_header() {
        let temp = TempDir::new().unwrap();
        let stash = FileStash::new(temp.path().join("stash"));
        let output = temp.path().join("unit.obj");
        let current = ArtifactHeader::new(2, "0.1.0");
        fs::write(&output, current.wrap(b"payload").unwrap()).unwrap();

        let det = determinant("obj");
        stash.stash(&output, &det).unwrap();

        assert!(stash.restore_artifact(&output, &det, &current));
        assert!(!stash.restore_artifact(&output, &det, &ArtifactHeader::new(3, "0.1.0")));
        assert!(!stash.restore_artifact(&output, &det, &ArtifactHeader::new(2, "0.2.0")));
    }

    #[test]
    fn test_corrupted_artifact_header_is_miss() {
        let temp = TempDir::new().unwrap();
        let stash = FileStash::new(temp.path().join("stash"));
        let output = temp.path().join("unit.obj");
        let header = ArtifactHeader::new(1, "0.1.0");
        fs::write(&output, header.wrap(b"payload").unwrap()).unwrap();

        let det = determinant("obj");
        stash.stash(&output, &det).unwrap();

        let entry = stash.entry_path(&output, &det);
        let mut bytes = fs::read(&entry).unwrap();
        bytes[0] = b'X';
        fs::write(&entry, &bytes).unwrap();
        fs::write(&output, b"untouched").unwrap();

        assert!(!stash.restore_artifact(&output, &det, &header));
        assert_eq!(fs::read(&output).unwrap(), b"untouched");
        // A plain restore does not look at headers.
        assert!(stash.restore(&output, &det));
    }

    #[test]
    fn test_no_restore_stash() {
        let temp = TempDir::new().unwrap();
        let output = temp.path().join("out.txt");
        fs::write(&output, b"data").unwrap();
        let det = determinant("x");

        let stash = NoRestoreStash::new(FileStash::new(temp.path().join("stash")));
        stash.stash(&output, &det).unwrap();
        assert!(!stash.restore(&output, &det));

        let inner = stash.into_inner();
        assert!(inner.restore(&output, &det));
    }

    #[test]
    fn test_status_prune_and_clean() {
        let temp = TempDir::new().unwrap();
        let stash = FileStash::new(temp.path().join("stash"));
        assert_eq!(stash.status().unwrap().entries, 0);

        for name in ["a", "b", "c"] {
            let path = temp.path().join(name);
            fs::write(&path, name).unwrap();
            stash.stash(&path, &determinant(name)).unwrap();
        }

        let status = stash.status().unwrap();
        assert_eq!(status.entries, 3);
        assert!(status.total_size > 0);

        let kept = stash.prune(Duration::from_secs(3600)).unwrap();
        assert_eq!((kept.total, kept.removed, kept.kept), (3, 0, 3));

        let pruned = stash.prune(Duration::ZERO).unwrap();
        assert_eq!(pruned.removed, 3);
        assert_eq!(stash.status().unwrap().entries, 0);

        stash.clean().unwrap();
        assert!(!stash.dir().exists());
    }

    #[test]
    fn test_formatted_size() {
        let stats = StashStats {
            entries: 0,
            total_size: 1536,
        };
        assert_eq!(stats.formatted_size(), "1.5 KB");
        let stats = StashStats {
            entries: 0,
            total_size: 500,
        };
        assert_eq!(stats.formatted_size(), "500 B");
    }
}
