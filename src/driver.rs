//! Drives a build from a triple to a fully cached system image.
//!
//! The build of one triple proceeds in stages:
//!
//! 1. load the recipe graph into a [`SourcePool`] and validate every
//!    cross-recipe reference,
//! 2. resolve the artifact DAG and find its root, which must be a
//!    system,
//! 3. compute cache keys against the build environment for the system's
//!    architecture,
//! 4. walk the DAG dependencies-first: artifacts present in the local or
//!    remote cache are reused, everything else is built inside a fresh
//!    staging area populated with its chunk dependencies.
//!
//! The driver is sequential and holds all mutable state of a run; a
//! failure aborts the current triple.

use crate::{
    artifact::{Artifact, ArtifactGraph, ArtifactId},
    builder::Builder,
    cache::{CacheWriter, LocalArtifactCache, RemoteArtifactCache},
    cachekey::BuildEnvironment,
    config::BuildSettings,
    error::{BuildError, Result},
    loader::{SourceLoader, Triple},
    morphology::{BuildMode, Kind, Morphology},
    repo::RepoCache,
    report::{Reporter, StdoutReporter},
    source::SourcePool,
    staging::StagingArea,
    validate::validate_cross_refs,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    io,
    path::PathBuf,
};

/// The top-level build orchestrator.
pub struct BuildDriver<R: RepoCache, B: Builder> {
    settings: BuildSettings,
    repos: R,
    builder: B,
    local: LocalArtifactCache,
    remote: Option<Box<dyn RemoteArtifactCache>>,
    reporter: Box<dyn Reporter>,
    status_prefix: String,
}

impl<R: RepoCache, B: Builder> BuildDriver<R, B> {
    /// Creates a driver, opening the local artifact cache under
    /// `{cachedir}/artifacts`.
    pub fn new(settings: BuildSettings, repos: R, builder: B) -> Result<Self> {
        let local = LocalArtifactCache::new(settings.cachedir.join("artifacts"))?;
        Ok(Self {
            settings,
            repos,
            builder,
            local,
            remote: None,
            reporter: Box::new(StdoutReporter::new()),
            status_prefix: String::new(),
        })
    }

    /// Attaches a remote artifact cache.
    pub fn with_remote_cache(mut self, remote: Box<dyn RemoteArtifactCache>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_reporter(mut self, reporter: Box<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// The local artifact cache, for read-only consumers.
    pub fn local_cache(&self) -> &LocalArtifactCache {
        &self.local
    }

    /// Builds every triple in order, stopping at the first failure.
    pub fn build(&mut self, triples: &[Triple]) -> Result<()> {
        self.status("Build starts", true);
        for triple in triples {
            self.status(
                format!("Building {} {} {}", triple.repo, triple.reference, triple.filename),
                false,
            );
            self.build_triple(triple)?;
        }
        self.status("Build ends successfully", false);
        Ok(())
    }

    /// Builds one system triple.
    #[instrument(skip_all, fields(filename = %triple.filename))]
    pub fn build_triple(&mut self, triple: &Triple) -> Result<()> {
        self.status("Deciding on task order", false);
        let pool = self.create_source_pool(triple)?;
        let (graph, root) = self.resolve_artifacts(&pool)?;
        self.build_in_order(&pool, &graph, root)
    }

    /// Loads and validates the source pool for a triple.
    fn create_source_pool(&mut self, triple: &Triple) -> Result<SourcePool> {
        self.status("Creating source pool", true);
        let pool = SourceLoader::new(&mut self.repos, &self.settings).load(triple)?;
        self.status("Validating cross-morphology references", true);
        validate_cross_refs(&pool)?;
        Ok(pool)
    }

    /// Resolves the artifact DAG, checks the root and assigns cache keys.
    fn resolve_artifacts(&mut self, pool: &SourcePool) -> Result<(ArtifactGraph, ArtifactId)> {
        self.status("Resolving artifacts", true);
        let mut graph = crate::resolver::resolve(pool)?;

        self.status("Computing build order", true);
        let root = graph.find_root()?;
        let root_source = pool.get(graph.get(root).source);
        let Morphology::System(system) = &root_source.morphology else {
            return Err(BuildError::UnsupportedRootKind(root_source.kind()));
        };
        let arch = system.arch.clone();

        self.status(format!("Creating build environment for {arch}"), true);
        let env = BuildEnvironment::new(&self.settings, &arch);

        self.status("Computing cache keys", true);
        graph.compute_cache_keys(pool, &env, root)?;
        graph.get_mut(root).set_build_env(env);
        Ok((graph, root))
    }

    /// Builds everything reachable from the root, dependencies first.
    fn build_in_order(
        &mut self,
        pool: &SourcePool,
        graph: &ArtifactGraph,
        root: ArtifactId,
    ) -> Result<()> {
        self.status("Building a set of artifacts", true);
        let env = graph
            .get(root)
            .build_env()
            .cloned()
            .ok_or_else(|| BuildError::msg("root artifact has no build environment"))?;
        let order = graph.walk(root);
        let total = order.len();
        let old_prefix = self.status_prefix.clone();

        let result = (|| -> Result<()> {
            for (index, &id) in order.iter().enumerate() {
                let artifact = graph.get(id);
                let source = pool.get(artifact.source);
                let kind = source.kind();
                self.status_prefix =
                    format!("{old_prefix}[Build {}/{total}] [{}] ", index + 1, artifact.name);

                self.status(
                    format!("Checking if {kind} needs building {}", short(&source.sha1)),
                    false,
                );
                if self.is_built(artifact)? {
                    self.fetch_artifacts_locally(pool, graph, &[id])?;
                    let filename = self.local.artifact_filename(artifact)?;
                    self.status(
                        format!("The {kind} is cached at {}", short(&basename(&filename))),
                        false,
                    );
                } else {
                    self.status(format!("Building {kind} {}", artifact.name), false);
                    self.build_artifact(pool, graph, id, &env)?;
                }

                self.status(
                    format!(
                        "{kind} {} is cached at {}",
                        artifact.name,
                        self.local.artifact_filename(artifact)?.display()
                    ),
                    kind != Kind::System,
                );
            }
            Ok(())
        })();
        self.status_prefix = old_prefix;
        result
    }

    /// Does either cache already have the artifact?
    fn is_built(&self, artifact: &Artifact) -> Result<bool> {
        if self.local.has(artifact)? {
            return Ok(true);
        }
        match &self.remote {
            Some(remote) => remote.has(artifact),
            None => Ok(false),
        }
    }

    /// Builds one artifact whose dependencies are all cached.
    fn build_artifact(
        &mut self,
        pool: &SourcePool,
        graph: &ArtifactGraph,
        id: ArtifactId,
        env: &BuildEnvironment,
    ) -> Result<()> {
        self.ensure_sources(pool, graph, id)?;

        let mut deps = graph.walk(id);
        deps.pop();
        self.fetch_artifacts_locally(pool, graph, &deps)?;

        let artifact = graph.get(id);
        let source = pool.get(artifact.source);

        let (area, setup_mounts) = if source.kind() == Kind::Chunk {
            let mode = BuildMode::parse_lenient(&source.build_mode, &artifact.name);
            let use_chroot = mode == BuildMode::Staging;
            let setup_mounts = mode == BuildMode::Staging;

            let mut extra_env = BTreeMap::new();
            extra_env.insert("PREFIX".to_string(), source.prefix.clone());
            let extra_path: Vec<PathBuf> = dependency_prefixes(pool, graph, id)
                .into_iter()
                .map(|prefix| PathBuf::from(prefix).join("bin"))
                .collect();

            self.status("Creating staging area", false);
            let area =
                StagingArea::create(&self.settings.tempdir, env, use_chroot, extra_env, extra_path)?;
            if let Err(err) = self.install_dependencies(&area, pool, graph, &deps, id, mode) {
                if let Err(abort_err) = area.abort() {
                    warn!("failed to tear down staging area: {abort_err}");
                }
                return Err(BuildError::StagingSetup {
                    name: artifact.name.clone(),
                    source: Box::new(err),
                });
            }
            (area, setup_mounts)
        } else {
            self.status("Creating staging area", false);
            let area = StagingArea::create(
                &self.settings.tempdir,
                env,
                false,
                BTreeMap::new(),
                Vec::new(),
            )?;
            (area, false)
        };

        self.status(
            format!("Starting actual build: {} {}", artifact.name, short(&source.sha1)),
            false,
        );
        self.builder.build_and_cache(&area, artifact, source, &self.local, setup_mounts)?;

        self.status("Removing staging area", false);
        area.remove()
    }

    /// Installs chunk dependencies into a staging area.
    ///
    /// Only chunks matter as build dependencies; strata and systems are
    /// silently skipped. Bootstrap-mode chunks are installed only for
    /// targets in the same stratum. All artifacts must already be in the
    /// local cache.
    fn install_dependencies(
        &mut self,
        area: &StagingArea,
        pool: &SourcePool,
        graph: &ArtifactGraph,
        deps: &[ArtifactId],
        target: ArtifactId,
        target_mode: BuildMode,
    ) -> Result<()> {
        for &dep in deps {
            let artifact = graph.get(dep);
            let source = pool.get(artifact.source);
            if source.kind() != Kind::Chunk {
                continue;
            }
            if source.build_mode == "bootstrap" && !in_same_stratum(pool, graph, dep, target) {
                continue;
            }
            self.status(format!("Installing chunk {}", artifact.name), false);
            let handle = self.local.get(artifact)?;
            area.install_artifact(handle)?;
        }

        if target_mode == BuildMode::Staging {
            self.builder.ldconfig(area.dirname())?;
        }
        Ok(())
    }

    /// Updates the local git cache with the artifact's sources.
    fn ensure_sources(
        &mut self,
        pool: &SourcePool,
        graph: &ArtifactGraph,
        id: ArtifactId,
    ) -> Result<()> {
        let source = pool.get(graph.get(id).source);
        let repo = source.repo_name.clone();
        let sha1 = source.sha1.clone();
        let url = self.settings.expand_repo_url(&repo);

        if self.settings.no_git_update {
            self.status(
                format!(
                    "Not updating existing git repository {repo} because of no-git-update being set"
                ),
                true,
            );
            return Ok(());
        }

        if self.repos.has_repo(&url) {
            if self.repos.resolve_ref(&url, &sha1).is_ok() {
                self.status(
                    format!(
                        "Not updating git repository {repo} because it already contains commit {}",
                        short(&sha1)
                    ),
                    true,
                );
            } else {
                self.status(format!("Updating {repo}"), false);
                self.repos.update_repo(&url)?;
            }
        } else {
            self.status(format!("Cloning {repo}"), false);
            self.repos.cache_repo(&url)?;
        }

        self.repos.cache_submodules(&url, &sha1)
    }

    /// Copies artifacts missing from the local cache in from the remote,
    /// along with their metadata sidecars where the recipe requires them.
    fn fetch_artifacts_locally(
        &self,
        pool: &SourcePool,
        graph: &ArtifactGraph,
        ids: &[ArtifactId],
    ) -> Result<()> {
        for &id in ids {
            let artifact = graph.get(id);
            if !self.local.has(artifact)? {
                self.status(format!("Fetching to local cache: artifact {}", artifact.name), false);
                let remote = self.require_remote(artifact)?;
                let reader = remote.get(artifact)?;
                let writer = self.local.put(artifact)?;
                copy_into_cache(artifact, reader, writer)?;
            }

            let source = pool.get(artifact.source);
            if source.morphology.needs_artifact_metadata_cached()
                && !self.local.has_artifact_metadata(artifact, "meta")?
            {
                self.status(
                    format!("Fetching to local cache: artifact metadata {}", artifact.name),
                    false,
                );
                let remote = self.require_remote(artifact)?;
                let reader = remote.get_artifact_metadata(artifact, "meta")?;
                let writer = self.local.put_artifact_metadata(artifact, "meta")?;
                copy_into_cache(artifact, reader, writer)?;
            }
        }
        Ok(())
    }

    fn require_remote(&self, artifact: &Artifact) -> Result<&dyn RemoteArtifactCache> {
        self.remote.as_deref().ok_or_else(|| BuildError::ArtifactFetch {
            name: artifact.name.clone(),
            reason: "artifact is missing from the local cache and no remote cache is configured"
                .to_string(),
        })
    }

    fn status(&self, msg: impl AsRef<str>, chatty: bool) {
        self.reporter.report(&self.status_prefix, msg.as_ref(), chatty);
    }
}

/// Streams one blob from the remote into the local cache, atomically.
fn copy_into_cache(
    artifact: &Artifact,
    mut reader: Box<dyn io::Read>,
    mut writer: CacheWriter,
) -> Result<()> {
    io::copy(&mut reader, &mut writer).map_err(|err| BuildError::ArtifactFetch {
        name: artifact.name.clone(),
        reason: err.to_string(),
    })?;
    writer.commit()
}

/// Prefixes of the chunks the artifact directly depends on, for
/// extending `PATH` inside its staging area.
fn dependency_prefixes(pool: &SourcePool, graph: &ArtifactGraph, id: ArtifactId) -> BTreeSet<String> {
    graph
        .get(id)
        .dependencies()
        .iter()
        .filter_map(|&dep| {
            let source = pool.get(graph.get(dep).source);
            (source.kind() == Kind::Chunk).then(|| source.prefix.clone())
        })
        .collect()
}

fn stratum_dependency_count(pool: &SourcePool, graph: &ArtifactGraph, id: ArtifactId) -> usize {
    graph
        .get(id)
        .dependencies()
        .iter()
        .filter(|&&dep| pool.get(graph.get(dep).source).kind() == Kind::Stratum)
        .count()
}

/// Approximates "a and b belong to the same stratum" by comparing their
/// stratum dependency counts. Chunks of one stratum share the stratum's
/// build-depends, so the counts agree; chunks of different strata
/// usually differ.
fn in_same_stratum(
    pool: &SourcePool,
    graph: &ArtifactGraph,
    a: ArtifactId,
    b: ArtifactId,
) -> bool {
    stratum_dependency_count(pool, graph, a) == stratum_dependency_count(pool, graph, b)
}

/// The leading seven characters of a commit id or cache name.
fn short(s: &str) -> &str {
    &s[..s.len().min(7)]
}

fn basename(path: &std::path::Path) -> String {
    path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
}
