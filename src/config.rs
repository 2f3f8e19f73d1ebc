//! Build settings and their builder.

use crate::error::{BuildError, Result};
use std::path::PathBuf;

/// Settings shared by every component of a build run.
#[derive(Clone, Debug)]
pub struct BuildSettings {
    /// Root of the artifact and repository caches.
    pub cachedir: PathBuf,
    /// Root for temporary state; staging areas live in `{tempdir}/staging`.
    pub tempdir: PathBuf,
    /// Maximum parallelism handed through to the external builder.
    pub max_jobs: Option<usize>,
    /// Use locally cached repositories as-is, without cloning or fetching.
    pub no_git_update: bool,
    /// Base URL of the remote artifact cache, if any.
    pub cache_server: Option<String>,
    /// Base URL for tarball fallbacks when cloning repositories.
    pub tarball_server: Option<String>,
    /// Repository alias expansion patterns.
    pub repo_aliases: Vec<RepoAlias>,
}

impl BuildSettings {
    pub fn builder() -> BuildSettingsBuilder {
        BuildSettingsBuilder::default()
    }

    /// Expands an aliased repository name (`prefix:rest`) to its pull URL.
    ///
    /// Names with no matching alias are returned unchanged.
    pub fn expand_repo_url(&self, repo: &str) -> String {
        if let Some((prefix, rest)) = repo.split_once(':') {
            for alias in &self.repo_aliases {
                if alias.prefix == prefix {
                    return alias.expand_pull(rest);
                }
            }
        }
        repo.to_string()
    }
}

/// One `prefix=pull#push` repository alias.
///
/// The pull and push patterns either contain `%s`, replaced by the part
/// after the alias prefix, or are base URLs the part is appended to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RepoAlias {
    pub prefix: String,
    pub pull: String,
    pub push: String,
}

impl RepoAlias {
    /// Parses the `prefix=pull#push` form; the `#push` part is optional.
    pub fn parse(spec: &str) -> Result<Self> {
        let (prefix, patterns) = spec
            .split_once('=')
            .ok_or_else(|| BuildError::msg(format!("invalid repo alias '{spec}'")))?;
        let (pull, push) = match patterns.split_once('#') {
            Some((pull, push)) => (pull, push),
            None => (patterns, patterns),
        };
        if prefix.is_empty() || pull.is_empty() {
            return Err(BuildError::msg(format!("invalid repo alias '{spec}'")));
        }
        Ok(Self { prefix: prefix.to_string(), pull: pull.to_string(), push: push.to_string() })
    }

    fn expand_pull(&self, rest: &str) -> String {
        if self.pull.contains("%s") {
            self.pull.replace("%s", rest)
        } else {
            format!("{}{rest}", self.pull)
        }
    }
}

/// Builder for [`BuildSettings`].
#[derive(Debug, Default)]
pub struct BuildSettingsBuilder {
    cachedir: Option<PathBuf>,
    tempdir: Option<PathBuf>,
    max_jobs: Option<usize>,
    no_git_update: bool,
    cache_server: Option<String>,
    tarball_server: Option<String>,
    repo_aliases: Vec<RepoAlias>,
}

impl BuildSettingsBuilder {
    pub fn cachedir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cachedir = Some(dir.into());
        self
    }

    pub fn tempdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tempdir = Some(dir.into());
        self
    }

    pub fn max_jobs(mut self, jobs: usize) -> Self {
        self.max_jobs = Some(jobs);
        self
    }

    pub fn no_git_update(mut self, no_update: bool) -> Self {
        self.no_git_update = no_update;
        self
    }

    pub fn cache_server(mut self, url: impl Into<String>) -> Self {
        self.cache_server = Some(url.into());
        self
    }

    pub fn tarball_server(mut self, url: impl Into<String>) -> Self {
        self.tarball_server = Some(url.into());
        self
    }

    /// Adds one `prefix=pull#push` alias.
    pub fn repo_alias(mut self, spec: &str) -> Result<Self> {
        self.repo_aliases.push(RepoAlias::parse(spec)?);
        Ok(self)
    }

    pub fn build(self) -> Result<BuildSettings> {
        let cachedir =
            self.cachedir.ok_or_else(|| BuildError::msg("build settings require a cachedir"))?;
        let tempdir =
            self.tempdir.ok_or_else(|| BuildError::msg("build settings require a tempdir"))?;
        Ok(BuildSettings {
            cachedir,
            tempdir,
            max_jobs: self.max_jobs,
            no_git_update: self.no_git_update,
            cache_server: self.cache_server,
            tarball_server: self.tarball_server,
            repo_aliases: self.repo_aliases,
        })
    }
}
