//! Artifacts and the artifact dependency graph.

use crate::{
    cachekey::{BuildEnvironment, CacheId},
    error::{BuildError, Result},
    source::{SourceId, SourcePool},
};
use std::io;

/// Index of an [`Artifact`] within its [`ArtifactGraph`].
///
/// Artifacts share the index space of their sources: the artifact built
/// from source `i` has id `i`.
pub type ArtifactId = usize;

/// A buildable output produced from one source.
///
/// Created by the resolver, then annotated exactly once with its cache
/// id and cache key, after which it is immutable.
#[derive(Clone, Debug)]
pub struct Artifact {
    pub name: String,
    pub source: SourceId,
    dependencies: Vec<ArtifactId>,
    cache_id: Option<CacheId>,
    cache_key: Option<String>,
    build_env: Option<BuildEnvironment>,
}

impl Artifact {
    pub(crate) fn new(name: String, source: SourceId) -> Self {
        Self { name, source, dependencies: Vec::new(), cache_id: None, cache_key: None, build_env: None }
    }

    /// Direct dependencies, in the order they were added during resolution.
    pub fn dependencies(&self) -> &[ArtifactId] {
        &self.dependencies
    }

    /// The content-address of this artifact.
    pub fn cache_key(&self) -> Result<&str> {
        self.cache_key
            .as_deref()
            .ok_or_else(|| BuildError::UncomputedCacheKey(self.name.clone()))
    }

    /// The structured dictionary the cache key was derived from, retained
    /// for diagnostics.
    pub fn cache_id(&self) -> Option<&CacheId> {
        self.cache_id.as_ref()
    }

    /// The build environment, present on the root artifact only.
    pub fn build_env(&self) -> Option<&BuildEnvironment> {
        self.build_env.as_ref()
    }

    /// Adds a dependency edge, ignoring duplicates.
    pub(crate) fn add_dependency(&mut self, dep: ArtifactId) {
        if !self.dependencies.contains(&dep) {
            self.dependencies.push(dep);
        }
    }

    pub(crate) fn set_cache_key(&mut self, cache_id: CacheId, cache_key: String) {
        self.cache_id = Some(cache_id);
        self.cache_key = Some(cache_key);
    }

    pub(crate) fn set_build_env(&mut self, env: BuildEnvironment) {
        self.build_env = Some(env);
    }
}

/// The artifact DAG for one resolved source pool.
#[derive(Debug, Default)]
pub struct ArtifactGraph {
    artifacts: Vec<Artifact>,
}

impl ArtifactGraph {
    pub(crate) fn from_artifacts(artifacts: Vec<Artifact>) -> Self {
        Self { artifacts }
    }

    pub fn get(&self, id: ArtifactId) -> &Artifact {
        &self.artifacts[id]
    }

    pub(crate) fn get_mut(&mut self, id: ArtifactId) -> &mut Artifact {
        &mut self.artifacts[id]
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ArtifactId, &Artifact)> {
        self.artifacts.iter().enumerate()
    }

    /// Returns a topological ordering of everything reachable from `root`,
    /// dependencies before dependents, `root` last.
    ///
    /// Ties are broken by the order dependencies were added during
    /// resolution, so the ordering is deterministic.
    pub fn walk(&self, root: ArtifactId) -> Vec<ArtifactId> {
        let mut done = vec![false; self.artifacts.len()];
        let mut order = Vec::new();
        self.depth_first(root, &mut done, &mut order);
        order
    }

    fn depth_first(&self, id: ArtifactId, done: &mut [bool], order: &mut Vec<ArtifactId>) {
        if done[id] {
            return;
        }
        done[id] = true;
        for &dep in &self.artifacts[id].dependencies {
            self.depth_first(dep, done, order);
        }
        order.push(id);
    }

    /// Finds the unique artifact with no incoming dependency edge.
    pub fn find_root(&self) -> Result<ArtifactId> {
        let mut candidate = vec![true; self.artifacts.len()];
        for artifact in &self.artifacts {
            for &dep in &artifact.dependencies {
                candidate[dep] = false;
            }
        }
        let mut roots = candidate.iter().enumerate().filter(|(_, &c)| c).map(|(id, _)| id);
        match (roots.next(), roots.next()) {
            (Some(root), None) => Ok(root),
            (None, _) => Err(BuildError::NoRootArtifact),
            (Some(first), Some(second)) => {
                let mut names = vec![
                    self.artifacts[first].name.clone(),
                    self.artifacts[second].name.clone(),
                ];
                names.extend(roots.map(|id| self.artifacts[id].name.clone()));
                Err(BuildError::MultipleRootArtifacts(names))
            }
        }
    }

    /// Rejects dependency cycles.
    pub(crate) fn ensure_acyclic(&self) -> Result<()> {
        const UNSEEN: u8 = 0;
        const OPEN: u8 = 1;
        const CLOSED: u8 = 2;

        fn visit(graph: &ArtifactGraph, id: ArtifactId, state: &mut [u8]) -> Result<()> {
            match state[id] {
                OPEN => return Err(BuildError::DependencyCycle(graph.artifacts[id].name.clone())),
                CLOSED => return Ok(()),
                _ => {}
            }
            state[id] = OPEN;
            for &dep in &graph.artifacts[id].dependencies {
                visit(graph, dep, state)?;
            }
            state[id] = CLOSED;
            Ok(())
        }

        let mut state = vec![UNSEEN; self.artifacts.len()];
        for id in 0..self.artifacts.len() {
            visit(self, id, &mut state)?;
        }
        Ok(())
    }

    /// Renders an artifact as `repo|ref|filename|name`.
    pub fn describe(&self, pool: &SourcePool, id: ArtifactId) -> String {
        let artifact = &self.artifacts[id];
        format!("{}|{}", pool.get(artifact.source), artifact.name)
    }

    /// Dumps the dependency tree reachable from `root`, dependents first,
    /// each artifact followed by its sorted direct dependencies.
    pub fn write_dependency_listing(
        &self,
        pool: &SourcePool,
        root: ArtifactId,
        out: &mut dyn io::Write,
    ) -> io::Result<()> {
        for id in self.walk(root).into_iter().rev() {
            writeln!(out, "  {}", self.describe(pool, id))?;
            let mut deps: Vec<String> =
                self.artifacts[id].dependencies.iter().map(|&d| self.describe(pool, d)).collect();
            deps.sort();
            for dep in deps {
                writeln!(out, "    -> {dep}")?;
            }
        }
        Ok(())
    }
}
