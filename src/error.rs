use crate::morphology::Kind;
use std::{
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;

pub type Result<T, E = BuildError> = std::result::Result<T, E>;

/// Various errors raised while resolving, keying and building artifacts.
#[derive(Debug, Error)]
pub enum BuildError {
    /// A referenced recipe file is missing in the named `(repo, ref)`.
    #[error("recipe {filename} not found in {repo}:{reference}")]
    RecipeNotFound { repo: String, reference: String, filename: String },
    /// A recipe file exists but does not parse.
    #[error("malformed recipe {filename} in {repo}:{reference}: {source}")]
    RecipeMalformed {
        repo: String,
        reference: String,
        filename: String,
        #[source]
        source: serde_json::Error,
    },
    /// A cross-recipe reference resolves to a recipe of the wrong kind.
    #[error(
        "{referrer_kind} {referrer} references {repo}:{reference}:{filename} \
         which is a {got}, instead of a {expected}"
    )]
    CrossRefKindMismatch {
        referrer_kind: Kind,
        referrer: String,
        repo: String,
        reference: String,
        filename: String,
        expected: Kind,
        got: Kind,
    },
    /// Two distinct stratum recipes share a name.
    #[error(
        "conflicting versions of stratum '{0}' appear in the build; check the contents of the \
         system against the build-depends of the strata"
    )]
    ConflictingStrata(String),
    /// The root of the artifact graph is not a system.
    #[error("building a {0} directly is not supported")]
    UnsupportedRootKind(Kind),
    /// Cloning or fetching a repository failed.
    #[error("failed to fetch sources for repository {repo}: {reason}")]
    SourceFetch { repo: String, reason: String },
    /// Streaming an artifact from the remote cache failed.
    #[error("failed to fetch artifact {name} to the local cache: {reason}")]
    ArtifactFetch { name: String, reason: String },
    /// The external build step returned a failure.
    #[error("build of {name} failed: {reason}")]
    BuildFailed { name: String, reason: String },
    /// Installing dependencies into a staging area failed mid-way.
    ///
    /// The staging area has already been torn down when this surfaces.
    #[error("staging area setup failed for {name}")]
    StagingSetup {
        name: String,
        #[source]
        source: Box<BuildError>,
    },
    /// No artifact in the resolved graph is free of incoming edges.
    #[error("artifact graph has no root artifact")]
    NoRootArtifact,
    /// More than one artifact in the resolved graph has no incoming edge.
    #[error("artifact graph has multiple root artifacts: {}", .0.join(", "))]
    MultipleRootArtifacts(Vec<String>),
    /// The recipes describe artifacts that depend on each other.
    #[error("dependency cycle through artifact {0}")]
    DependencyCycle(String),
    /// A cache operation was attempted before cache keys were assigned.
    #[error("cache key for artifact {0} has not been computed")]
    UncomputedCacheKey(String),
    #[error(transparent)]
    Io(#[from] BuildIoError),
    #[error("{0}")]
    Message(String),
}

impl BuildError {
    pub fn io(err: io::Error, path: impl Into<PathBuf>) -> Self {
        BuildIoError::new(err, path).into()
    }

    pub fn msg(msg: impl Into<String>) -> Self {
        Self::Message(msg.into())
    }
}

/// An `io::Error` together with the path that produced it.
#[derive(Debug, Error)]
#[error("\"{}\": {io}", self.path.display())]
pub struct BuildIoError {
    io: io::Error,
    path: PathBuf,
}

impl BuildIoError {
    pub fn new(io: io::Error, path: impl Into<PathBuf>) -> Self {
        Self { io, path: path.into() }
    }

    /// The path at which the error occurred.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn io_error(&self) -> &io::Error {
        &self.io
    }
}

impl From<BuildIoError> for io::Error {
    fn from(err: BuildIoError) -> Self {
        err.io
    }
}
