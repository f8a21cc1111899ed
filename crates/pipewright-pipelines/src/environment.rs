//! File-system view used by task bodies
//!
//! Paths come in two kinds: sources (read-only inputs under `source_dir`)
//! and build artifacts (under `build_dir`). Artifacts are only ever written
//! through [`TempOutput`], which lands the file in its final location with an
//! atomic rename on `commit` and removes the temp file on every other path.

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::debug;

/// A path relative to the source directory
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourcePath(PathBuf);

/// A path relative to the build directory
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BuildPath(PathBuf);

impl SourcePath {
    pub fn new(relative: impl Into<PathBuf>) -> Self {
        Self(relative.into())
    }

    pub fn relative(&self) -> &Path {
        &self.0
    }
}

impl BuildPath {
    pub fn new(relative: impl Into<PathBuf>) -> Self {
        Self(relative.into())
    }

    pub fn relative(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for SourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl fmt::Display for BuildPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// A path that can be resolved against a [`BuildEnvironment`]
pub trait LogicalPath {
    fn resolve(&self, env: &BuildEnvironment) -> PathBuf;
}

impl LogicalPath for SourcePath {
    fn resolve(&self, env: &BuildEnvironment) -> PathBuf {
        env.source_dir.join(&self.0)
    }
}

impl LogicalPath for BuildPath {
    fn resolve(&self, env: &BuildEnvironment) -> PathBuf {
        env.build_dir.join(&self.0)
    }
}

/// Source and build roots for one run
#[derive(Debug, Clone)]
pub struct BuildEnvironment {
    source_dir: PathBuf,
    build_dir: PathBuf,
}

impl BuildEnvironment {
    pub fn new(source_dir: impl Into<PathBuf>, build_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_dir: source_dir.into(),
            build_dir: build_dir.into(),
        }
    }

    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    pub fn build_dir(&self) -> &Path {
        &self.build_dir
    }

    /// Concrete location of a logical path
    pub fn path<P: LogicalPath>(&self, path: &P) -> PathBuf {
        path.resolve(self)
    }

    pub fn exists<P: LogicalPath>(&self, path: &P) -> bool {
        path.resolve(self).exists()
    }

    pub fn read<P: LogicalPath>(&self, path: &P) -> io::Result<Vec<u8>> {
        fs::read(path.resolve(self))
    }

    /// Open a temp file next to the artifact's final location
    pub fn write_temp(&self, path: &BuildPath) -> io::Result<TempOutput> {
        let target = path.resolve(self);
        let parent = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.build_dir.clone());
        fs::create_dir_all(&parent)?;
        let temp = tempfile::Builder::new()
            .prefix(".pw-tmp-")
            .tempfile_in(&parent)?;
        Ok(TempOutput { temp, target })
    }
}

/// Scoped temp file for an artifact being written.
///
/// Dropping without `commit` deletes the temp file and leaves the real
/// output untouched.
#[derive(Debug)]
pub struct TempOutput {
    temp: NamedTempFile,
    target: PathBuf,
}

impl TempOutput {
    /// Where the temp file lives, for tools that write by path
    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    /// Final location after commit
    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.temp.write_all(bytes)?;
        self.temp.flush()
    }

    /// Atomically move the temp file into place
    pub fn commit(self) -> io::Result<PathBuf> {
        let TempOutput { temp, target } = self;
        temp.as_file().sync_all()?;
        temp.persist(&target).map_err(|e| e.error)?;
        debug!(path = %target.display(), "committed output");
        Ok(target)
    }
}
