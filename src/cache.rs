//! The artifact caches.
//!
//! Artifacts are stored as opaque blobs under their cache key; sidecar
//! metadata blobs live alongside them under `{key}.{kind}`. The local
//! cache is a plain directory; writes go through a temporary file and
//! become visible atomically on commit, so a crashed or failed write
//! never leaves a partial artifact behind.

use crate::{
    artifact::Artifact,
    error::{BuildError, Result},
};
use std::{
    fs,
    io::{self, Read, Write},
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;

/// The always-present artifact cache on the local filesystem.
#[derive(Debug)]
pub struct LocalArtifactCache {
    dir: PathBuf,
}

impl LocalArtifactCache {
    /// Opens the cache, creating the directory when missing.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|err| BuildError::io(err, &dir))?;
        Ok(Self { dir })
    }

    /// The local filesystem location of an artifact, derived from its
    /// cache key only.
    pub fn artifact_filename(&self, artifact: &Artifact) -> Result<PathBuf> {
        Ok(self.dir.join(artifact.cache_key()?))
    }

    fn metadata_filename(&self, artifact: &Artifact, kind: &str) -> Result<PathBuf> {
        Ok(self.dir.join(format!("{}.{kind}", artifact.cache_key()?)))
    }

    pub fn has(&self, artifact: &Artifact) -> Result<bool> {
        Ok(self.artifact_filename(artifact)?.exists())
    }

    /// Opens an artifact blob for reading.
    pub fn get(&self, artifact: &Artifact) -> Result<fs::File> {
        let path = self.artifact_filename(artifact)?;
        fs::File::open(&path).map_err(|err| BuildError::io(err, path))
    }

    /// Opens a writer for an artifact blob.
    ///
    /// Nothing is visible in the cache until [`CacheWriter::commit`];
    /// dropping the writer discards the partial write.
    pub fn put(&self, artifact: &Artifact) -> Result<CacheWriter> {
        CacheWriter::create(&self.dir, self.artifact_filename(artifact)?)
    }

    pub fn has_artifact_metadata(&self, artifact: &Artifact, kind: &str) -> Result<bool> {
        Ok(self.metadata_filename(artifact, kind)?.exists())
    }

    pub fn get_artifact_metadata(&self, artifact: &Artifact, kind: &str) -> Result<fs::File> {
        let path = self.metadata_filename(artifact, kind)?;
        fs::File::open(&path).map_err(|err| BuildError::io(err, path))
    }

    pub fn put_artifact_metadata(&self, artifact: &Artifact, kind: &str) -> Result<CacheWriter> {
        CacheWriter::create(&self.dir, self.metadata_filename(artifact, kind)?)
    }
}

/// A pending cache write: a temporary file in the cache directory that
/// is renamed over the final path on commit.
#[derive(Debug)]
pub struct CacheWriter {
    file: NamedTempFile,
    dest: PathBuf,
}

impl CacheWriter {
    fn create(dir: &Path, dest: PathBuf) -> Result<Self> {
        let file = NamedTempFile::new_in(dir).map_err(|err| BuildError::io(err, dir))?;
        Ok(Self { file, dest })
    }

    /// Atomically publishes the written bytes under the final name.
    pub fn commit(self) -> Result<()> {
        let dest = self.dest;
        self.file.persist(&dest).map_err(|err| BuildError::io(err.error, dest))?;
        Ok(())
    }
}

impl Write for CacheWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// A read-only remote artifact cache.
///
/// The driver copies remote blobs into the local cache before use; the
/// remote is never written by this crate.
pub trait RemoteArtifactCache {
    fn has(&self, artifact: &Artifact) -> Result<bool>;

    fn get(&self, artifact: &Artifact) -> Result<Box<dyn Read>>;

    fn has_artifact_metadata(&self, artifact: &Artifact, kind: &str) -> Result<bool>;

    fn get_artifact_metadata(&self, artifact: &Artifact, kind: &str) -> Result<Box<dyn Read>>;
}
