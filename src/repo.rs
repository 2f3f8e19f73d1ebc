//! Interface to the local git repository cache.
//!
//! The actual git transport lives outside this crate; the loader and the
//! build driver only need the small surface below. Recipes name
//! repositories in short aliased form; the loader and driver expand them
//! with [`BuildSettings::expand_repo_url`] before calling in here, so
//! implementations always see pull URLs.
//!
//! [`BuildSettings::expand_repo_url`]: crate::config::BuildSettings::expand_repo_url

use crate::error::Result;

/// A local cache of git repositories, optionally backed by a remote
/// mirror service.
pub trait RepoCache {
    /// Whether the repository is present in the local cache.
    fn has_repo(&self, repo: &str) -> bool;

    /// Clones the repository into the local cache.
    fn cache_repo(&mut self, repo: &str) -> Result<()>;

    /// Refreshes an already-cached repository from its origin.
    fn update_repo(&mut self, repo: &str) -> Result<()>;

    /// Resolves a ref (branch, tag or commit id) to a full commit id.
    ///
    /// Resolving a commit id that is present returns it unchanged; an
    /// absent ref is an error.
    fn resolve_ref(&self, repo: &str, reference: &str) -> Result<String>;

    /// Reads a file out of a commit, `Ok(None)` when the commit has no
    /// such file.
    fn read_file(&self, repo: &str, sha1: &str, filename: &str) -> Result<Option<String>>;

    /// Caches the submodules referenced by the given commit, recursively.
    fn cache_submodules(&mut self, repo: &str, sha1: &str) -> Result<()>;
}
