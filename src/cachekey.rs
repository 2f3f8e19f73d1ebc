//! Deterministic content-addressing of artifacts.
//!
//! An artifact's cache id collects everything that can influence its
//! bytes: the normalized recipe, the resolved commit, the build
//! environment and the cache keys of its dependencies. The cache key is
//! the hex SHA-1 of the cache id's canonical JSON form, so identical
//! inputs reuse cached artifacts and any changed input produces a new
//! key.

use crate::{
    artifact::{Artifact, ArtifactGraph, ArtifactId},
    config::BuildSettings,
    error::Result,
    morphology::{Kind, Morphology},
    source::{Source, SourcePool},
};
use serde::Serialize;
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;

/// The deterministic environment a build runs in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildEnvironment {
    arch: String,
    env: BTreeMap<String, String>,
}

impl BuildEnvironment {
    pub fn new(settings: &BuildSettings, arch: &str) -> Self {
        let mut env = BTreeMap::new();
        let mut set = |k: &str, v: &str| {
            env.insert(k.to_string(), v.to_string());
        };
        set("TERM", "dumb");
        set("SHELL", "/bin/sh");
        set("USER", "tomjon");
        set("USERNAME", "tomjon");
        set("LOGNAME", "tomjon");
        set("LC_ALL", "C");
        set("HOME", "/tmp");
        set("PATH", "/usr/bin:/bin:/usr/sbin:/sbin");
        set("TARGET", arch);
        if let Some(jobs) = settings.max_jobs {
            set("MAKEFLAGS", &format!("-j{jobs}"));
        }
        Self { arch: arch.to_string(), env }
    }

    pub fn arch(&self) -> &str {
        &self.arch
    }

    /// All variables, deterministically ordered.
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }
}

/// The structured dictionary a cache key is derived from.
///
/// Field order is the canonical serialization order.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CacheId {
    pub kind: Kind,
    pub name: String,
    /// The recipe normalized to sorted keys and compact whitespace.
    pub morphology: serde_json::Value,
    pub filename: String,
    pub source_sha1: String,
    pub arch: String,
    /// The full build environment, deterministically ordered.
    pub env: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    /// Dependency cache keys, in dependency order.
    pub dependency_keys: Vec<String>,
}

/// Computes cache ids and keys against one build environment.
#[derive(Debug)]
pub struct CacheKeyComputer<'a> {
    env: &'a BuildEnvironment,
}

impl<'a> CacheKeyComputer<'a> {
    pub fn new(env: &'a BuildEnvironment) -> Self {
        Self { env }
    }

    /// Computes the cache id and key for one artifact, given the keys of
    /// its direct dependencies in dependency order.
    pub fn compute(
        &self,
        artifact: &Artifact,
        source: &Source,
        dependency_keys: Vec<String>,
    ) -> Result<(CacheId, String)> {
        let is_chunk = matches!(source.morphology, Morphology::Chunk(_));
        let cache_id = CacheId {
            kind: source.kind(),
            name: artifact.name.clone(),
            morphology: source.morphology.canonical_value(),
            filename: source.filename.clone(),
            source_sha1: source.sha1.clone(),
            arch: self.env.arch.clone(),
            env: self.env.env.clone(),
            build_mode: is_chunk.then(|| source.build_mode.clone()),
            prefix: is_chunk.then(|| source.prefix.clone()),
            dependency_keys,
        };
        let serialized = serde_json::to_vec(&cache_id)
            .map_err(|err| crate::error::BuildError::msg(format!(
                "failed to serialize cache id for {}: {err}",
                artifact.name
            )))?;
        let key = hex::encode(Sha1::digest(&serialized));
        trace!("cache key for {} is {key}", artifact.name);
        Ok((cache_id, key))
    }
}

impl ArtifactGraph {
    /// Annotates every artifact reachable from `root` with its cache id
    /// and cache key, dependencies first.
    pub fn compute_cache_keys(
        &mut self,
        pool: &SourcePool,
        env: &BuildEnvironment,
        root: ArtifactId,
    ) -> Result<()> {
        let computer = CacheKeyComputer::new(env);
        for id in self.walk(root) {
            let artifact = self.get(id);
            let dependency_keys = artifact
                .dependencies()
                .iter()
                .map(|&dep| self.get(dep).cache_key().map(str::to_owned))
                .collect::<Result<Vec<_>>>()?;
            let (cache_id, key) =
                computer.compute(artifact, pool.get(artifact.source), dependency_keys)?;
            self.get_mut(id).set_cache_key(cache_id, key);
        }
        Ok(())
    }
}
