//! End-to-end build driver tests against in-memory mocks.

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::{
    cell::RefCell,
    collections::{HashMap, HashSet},
    fs,
    io::{self, Read, Write},
    path::{Path, PathBuf},
    rc::Rc,
};
use strata_build::{
    resolver, validate_cross_refs, Artifact, ArtifactGraph, BuildDriver, BuildEnvironment,
    BuildError, BuildSettings, Builder, Kind, LocalArtifactCache, RemoteArtifactCache, RepoCache,
    Reporter, Result, Source, SourceLoader, SourcePool, StagingArea, Triple,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

// ---- recipe fixtures -------------------------------------------------------

fn system(name: &str, strata: &[&str]) -> Value {
    json!({
        "kind": "system",
        "name": name,
        "arch": "x86_64",
        "strata": strata.iter().map(|s| json!({ "morph": s })).collect::<Vec<_>>(),
    })
}

fn stratum(name: &str, chunks: &[Value], build_depends: &[&str]) -> Value {
    json!({
        "kind": "stratum",
        "name": name,
        "chunks": chunks,
        "build-depends":
            build_depends.iter().map(|d| json!({ "morph": d })).collect::<Vec<_>>(),
    })
}

fn chunk_ref(morph: &str) -> Value {
    json!({ "morph": morph })
}

fn chunk_ref_mode(morph: &str, mode: &str) -> Value {
    json!({ "morph": morph, "build-mode": mode })
}

fn chunk(name: &str) -> Value {
    json!({
        "kind": "chunk",
        "name": name,
        "configure-commands": ["./configure"],
        "build-commands": ["make"],
        "install-commands": ["make DESTDIR=\"$DESTDIR\" install"],
    })
}

// ---- in-memory repo cache --------------------------------------------------

#[derive(Clone, Default)]
struct MemoryRepo {
    refs: HashMap<String, String>,
    files: HashMap<(String, String), String>,
}

#[derive(Clone, Default)]
struct MemoryRepoCache {
    upstream: HashMap<String, MemoryRepo>,
    cached: HashSet<String>,
}

impl MemoryRepoCache {
    /// Registers a repository whose `master` ref points at `sha1`.
    fn with_repo(mut self, name: &str, sha1: &str, files: Vec<(&str, Value)>) -> Self {
        let repo = self.upstream.entry(name.to_string()).or_default();
        repo.refs.insert("master".to_string(), sha1.to_string());
        repo.refs.insert(sha1.to_string(), sha1.to_string());
        for (filename, morph) in files {
            repo.files.insert((sha1.to_string(), filename.to_string()), morph.to_string());
        }
        self
    }
}

impl RepoCache for MemoryRepoCache {
    fn has_repo(&self, repo: &str) -> bool {
        self.cached.contains(repo)
    }

    fn cache_repo(&mut self, repo: &str) -> Result<()> {
        if self.upstream.contains_key(repo) {
            self.cached.insert(repo.to_string());
            Ok(())
        } else {
            Err(BuildError::SourceFetch {
                repo: repo.to_string(),
                reason: "unknown repository".to_string(),
            })
        }
    }

    fn update_repo(&mut self, _repo: &str) -> Result<()> {
        Ok(())
    }

    fn resolve_ref(&self, repo: &str, reference: &str) -> Result<String> {
        self.upstream
            .get(repo)
            .and_then(|r| r.refs.get(reference))
            .cloned()
            .ok_or_else(|| BuildError::SourceFetch {
                repo: repo.to_string(),
                reason: format!("unknown ref {reference}"),
            })
    }

    fn read_file(&self, repo: &str, sha1: &str, filename: &str) -> Result<Option<String>> {
        Ok(self
            .upstream
            .get(repo)
            .and_then(|r| r.files.get(&(sha1.to_string(), filename.to_string())))
            .cloned())
    }

    fn cache_submodules(&mut self, _repo: &str, _sha1: &str) -> Result<()> {
        Ok(())
    }
}

// ---- recording builder -----------------------------------------------------

fn chunk_tarball(name: &str) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let contents = name.as_bytes();
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, format!("chunks/{name}"), contents).unwrap();
    builder.into_inner().unwrap()
}

fn list_files(root: &Path) -> Vec<String> {
    fn visit(dir: &Path, root: &Path, out: &mut Vec<String>) {
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                visit(&path, root, out);
            } else {
                out.push(path.strip_prefix(root).unwrap().to_string_lossy().into_owned());
            }
        }
    }
    let mut out = Vec::new();
    visit(root, root, &mut out);
    out.sort();
    out
}

/// Shared view into what the builder was asked to do.
#[derive(Clone, Debug, Default)]
struct BuildLog {
    built: Rc<RefCell<Vec<String>>>,
    staged: Rc<RefCell<HashMap<String, Vec<String>>>>,
}

impl BuildLog {
    fn built(&self) -> Vec<String> {
        self.built.borrow().clone()
    }

    fn staged_files(&self, artifact: &str) -> Vec<String> {
        self.staged.borrow().get(artifact).cloned().unwrap_or_default()
    }
}

/// Writes a small tarball per artifact and records every invocation and
/// the staging area contents it saw.
#[derive(Debug, Default)]
struct RecordingBuilder {
    log: BuildLog,
    garbage_blobs: bool,
}

impl Builder for RecordingBuilder {
    fn build_and_cache(
        &mut self,
        area: &StagingArea,
        artifact: &Artifact,
        source: &Source,
        local: &LocalArtifactCache,
        _setup_mounts: bool,
    ) -> Result<()> {
        self.log.built.borrow_mut().push(artifact.name.clone());
        self.log.staged.borrow_mut().insert(artifact.name.clone(), list_files(area.dirname()));

        let blob = if self.garbage_blobs {
            b"not a tarball".to_vec()
        } else {
            chunk_tarball(&artifact.name)
        };
        let mut writer = local.put(artifact)?;
        writer.write_all(&blob).map_err(|err| BuildError::msg(err.to_string()))?;
        writer.commit()?;

        if source.morphology.needs_artifact_metadata_cached() {
            let mut meta = local.put_artifact_metadata(artifact, "meta")?;
            meta.write_all(b"{}\n").map_err(|err| BuildError::msg(err.to_string()))?;
            meta.commit()?;
        }
        Ok(())
    }
}

// ---- in-memory remote cache ------------------------------------------------

#[derive(Debug, Default)]
struct MemoryRemoteCache {
    blobs: HashMap<String, Vec<u8>>,
    metadata: HashMap<(String, String), Vec<u8>>,
}

impl RemoteArtifactCache for MemoryRemoteCache {
    fn has(&self, artifact: &Artifact) -> Result<bool> {
        Ok(self.blobs.contains_key(artifact.cache_key()?))
    }

    fn get(&self, artifact: &Artifact) -> Result<Box<dyn Read>> {
        let bytes = self.blobs.get(artifact.cache_key()?).cloned().ok_or_else(|| {
            BuildError::ArtifactFetch {
                name: artifact.name.clone(),
                reason: "not on the remote".to_string(),
            }
        })?;
        Ok(Box::new(io::Cursor::new(bytes)))
    }

    fn has_artifact_metadata(&self, artifact: &Artifact, kind: &str) -> Result<bool> {
        let key = (artifact.cache_key()?.to_string(), kind.to_string());
        Ok(self.metadata.contains_key(&key))
    }

    fn get_artifact_metadata(&self, artifact: &Artifact, kind: &str) -> Result<Box<dyn Read>> {
        let key = (artifact.cache_key()?.to_string(), kind.to_string());
        let bytes = self.metadata.get(&key).cloned().ok_or_else(|| BuildError::ArtifactFetch {
            name: artifact.name.clone(),
            reason: "metadata not on the remote".to_string(),
        })?;
        Ok(Box::new(io::Cursor::new(bytes)))
    }
}

// ---- harness ---------------------------------------------------------------

#[derive(Debug, Default)]
struct CapturingReporter {
    messages: Rc<RefCell<Vec<String>>>,
}

impl Reporter for CapturingReporter {
    fn report(&self, prefix: &str, msg: &str, chatty: bool) {
        if !chatty {
            self.messages.borrow_mut().push(format!("{prefix}{msg}"));
        }
    }
}

struct Harness {
    _dirs: tempfile::TempDir,
    cachedir: PathBuf,
    tempdir: PathBuf,
}

impl Harness {
    fn new() -> Self {
        init_tracing();
        let dirs = tempfile::tempdir().unwrap();
        let cachedir = dirs.path().join("cache");
        let tempdir = dirs.path().join("tmp");
        Self { _dirs: dirs, cachedir, tempdir }
    }

    fn settings(&self) -> BuildSettings {
        BuildSettings::builder()
            .cachedir(&self.cachedir)
            .tempdir(&self.tempdir)
            .build()
            .unwrap()
    }

    fn driver(&self, repos: MemoryRepoCache) -> (BuildDriver<MemoryRepoCache, RecordingBuilder>, BuildLog) {
        let builder = RecordingBuilder::default();
        let log = builder.log.clone();
        let driver = BuildDriver::new(self.settings(), repos, builder)
            .unwrap()
            .with_reporter(Box::new(strata_build::NullReporter));
        (driver, log)
    }

    fn artifact_count(&self) -> usize {
        fs::read_dir(self.cachedir.join("artifacts")).unwrap().count()
    }

    /// Resolves the triple's graph and returns it with cache keys
    /// assigned, without building anything.
    fn keyed_graph(
        &self,
        mut repos: MemoryRepoCache,
        triple: &Triple,
    ) -> (SourcePool, ArtifactGraph) {
        let settings = self.settings();
        let pool = SourceLoader::new(&mut repos, &settings).load(triple).unwrap();
        validate_cross_refs(&pool).unwrap();
        let mut graph = resolver::resolve(&pool).unwrap();
        let root = graph.find_root().unwrap();
        let env = BuildEnvironment::new(&settings, "x86_64");
        graph.compute_cache_keys(&pool, &env, root).unwrap();
        (pool, graph)
    }
}

fn linear_repos() -> MemoryRepoCache {
    MemoryRepoCache::default().with_repo(
        "morphs",
        "1e4f9c1e4f9c1e4f9c1e4f9c1e4f9c1e4f9c1e4f",
        vec![
            ("base.morph", system("base", &["core"])),
            ("core.morph", stratum("core", &[chunk_ref("busybox")], &[])),
            ("busybox.morph", chunk("busybox")),
        ],
    )
}

fn base_triple() -> Triple {
    Triple::new("morphs", "master", "base.morph")
}

// ---- scenarios -------------------------------------------------------------

#[test]
fn cold_cache_builds_everything_in_order() {
    let harness = Harness::new();
    let (mut driver, log) = harness.driver(linear_repos());

    driver.build(&[base_triple()]).unwrap();

    assert_eq!(log.built(), ["busybox", "core", "base"]);
    assert_eq!(harness.artifact_count(), 3);
}

#[test]
fn warm_cache_builds_nothing() {
    let harness = Harness::new();
    let (mut driver, log) = harness.driver(linear_repos());
    driver.build(&[base_triple()]).unwrap();
    assert_eq!(log.built().len(), 3);

    // Same cache directory, fresh driver.
    let (mut driver, log) = harness.driver(linear_repos());
    driver.build(&[base_triple()]).unwrap();

    assert_eq!(log.built(), Vec::<String>::new());
    assert_eq!(harness.artifact_count(), 3);
}

#[test]
fn remote_hit_skips_the_build_and_fills_the_local_cache() {
    let harness = Harness::new();
    let (pool, graph) = harness.keyed_graph(linear_repos(), &base_triple());
    let busybox = pool.lookup_id("morphs", "master", "busybox.morph").unwrap();
    let key = graph.get(busybox).cache_key().unwrap().to_string();

    let mut remote = MemoryRemoteCache::default();
    remote.blobs.insert(key, chunk_tarball("busybox"));

    let (driver, log) = harness.driver(linear_repos());
    let mut driver = driver.with_remote_cache(Box::new(remote));
    driver.build(&[base_triple()]).unwrap();

    assert_eq!(log.built(), ["core", "base"]);
    assert_eq!(harness.artifact_count(), 3);
}

#[test]
fn conflicting_strata_fail_before_any_resolution() {
    let harness = Harness::new();
    let repos = MemoryRepoCache::default()
        .with_repo(
            "morphs",
            "2b7d012b7d012b7d012b7d012b7d012b7d012b7d",
            vec![
                ("base.morph", system("base", &["u", "v"])),
                ("u.morph", stratum("u", &[], &[])),
                (
                    "v.morph",
                    json!({
                        "kind": "stratum",
                        "name": "v",
                        "chunks": [],
                        "build-depends": [{ "repo": "other", "morph": "u" }],
                    }),
                ),
            ],
        )
        .with_repo(
            "other",
            "3c8e023c8e023c8e023c8e023c8e023c8e023c8e",
            vec![("u.morph", stratum("u", &[], &[]))],
        );

    let (mut driver, log) = harness.driver(repos);
    let err = driver.build(&[base_triple()]).unwrap_err();

    assert!(matches!(err, BuildError::ConflictingStrata(name) if name == "u"));
    assert!(log.built().is_empty());
}

#[test]
fn stratum_slot_holding_a_chunk_is_a_kind_mismatch() {
    let harness = Harness::new();
    let repos = MemoryRepoCache::default().with_repo(
        "morphs",
        "4d9f034d9f034d9f034d9f034d9f034d9f034d9f",
        vec![
            ("base.morph", system("base", &["x"])),
            ("x.morph", chunk("x")),
        ],
    );

    let (mut driver, log) = harness.driver(repos);
    let err = driver.build(&[base_triple()]).unwrap_err();

    match err {
        BuildError::CrossRefKindMismatch { expected, got, .. } => {
            assert_eq!(expected, Kind::Stratum);
            assert_eq!(got, Kind::Chunk);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(log.built().is_empty());
}

#[test]
fn building_a_stratum_directly_is_unsupported() {
    let harness = Harness::new();
    let (mut driver, log) = harness.driver(linear_repos());

    let err = driver.build(&[Triple::new("morphs", "master", "core.morph")]).unwrap_err();

    assert!(matches!(err, BuildError::UnsupportedRootKind(Kind::Stratum)));
    assert!(log.built().is_empty());
}

#[test]
fn missing_recipe_is_reported() {
    let harness = Harness::new();
    let (mut driver, _) = harness.driver(linear_repos());
    let err = driver.build(&[Triple::new("morphs", "master", "nope.morph")]).unwrap_err();
    assert!(matches!(err, BuildError::RecipeNotFound { filename, .. } if filename == "nope.morph"));
}

#[test]
fn empty_stratum_still_builds() {
    let harness = Harness::new();
    let repos = MemoryRepoCache::default().with_repo(
        "morphs",
        "5eaf045eaf045eaf045eaf045eaf045eaf045eaf",
        vec![
            ("base.morph", system("base", &["core"])),
            ("core.morph", stratum("core", &[], &[])),
        ],
    );
    let (mut driver, log) = harness.driver(repos);
    driver.build(&[base_triple()]).unwrap();
    assert_eq!(log.built(), ["core", "base"]);
}

#[test]
fn build_depends_outside_the_system_are_pulled_in() {
    let harness = Harness::new();
    let repos = MemoryRepoCache::default().with_repo(
        "morphs",
        "6fb0056fb0056fb0056fb0056fb0056fb0056fb0",
        vec![
            ("base.morph", system("base", &["core"])),
            ("core.morph", stratum("core", &[], &["tools"])),
            ("tools.morph", stratum("tools", &[], &[])),
        ],
    );
    let (mut driver, log) = harness.driver(repos);
    driver.build(&[base_triple()]).unwrap();
    assert_eq!(log.built(), ["tools", "core", "base"]);
}

#[test]
fn aliased_repo_names_reach_the_repo_cache_expanded() {
    let harness = Harness::new();
    // The repo cache only knows the expanded pull URL.
    let repos = MemoryRepoCache::default().with_repo(
        "git://git.example.org/morphs",
        "b55210b55210b55210b55210b55210b55210b552",
        vec![
            ("base.morph", system("base", &["core"])),
            ("core.morph", stratum("core", &[chunk_ref("busybox")], &[])),
            ("busybox.morph", chunk("busybox")),
        ],
    );
    let settings = BuildSettings::builder()
        .cachedir(&harness.cachedir)
        .tempdir(&harness.tempdir)
        .repo_alias("bk=git://git.example.org/%s")
        .unwrap()
        .build()
        .unwrap();

    let builder = RecordingBuilder::default();
    let log = builder.log.clone();
    let mut driver = BuildDriver::new(settings, repos, builder)
        .unwrap()
        .with_reporter(Box::new(strata_build::NullReporter));
    driver.build(&[Triple::new("bk:morphs", "master", "base.morph")]).unwrap();

    assert_eq!(log.built(), ["busybox", "core", "base"]);
}

#[test]
fn second_system_reuses_a_shared_stratum() {
    let harness = Harness::new();
    let repos = MemoryRepoCache::default().with_repo(
        "morphs",
        "7cc1067cc1067cc1067cc1067cc1067cc1067cc1",
        vec![
            ("base.morph", system("base", &["core"])),
            ("devel.morph", system("devel", &["core"])),
            ("core.morph", stratum("core", &[chunk_ref("busybox")], &[])),
            ("busybox.morph", chunk("busybox")),
        ],
    );
    let (mut driver, log) = harness.driver(repos);
    driver
        .build(&[base_triple(), Triple::new("morphs", "master", "devel.morph")])
        .unwrap();
    assert_eq!(log.built(), ["busybox", "core", "base", "devel"]);
}

#[test]
fn bootstrap_chunks_are_not_installed_across_strata() {
    let harness = Harness::new();
    let repos = MemoryRepoCache::default().with_repo(
        "morphs",
        "8dd2078dd2078dd2078dd2078dd2078dd2078dd2",
        vec![
            ("base.morph", system("base", &["core", "apps"])),
            (
                "core.morph",
                stratum(
                    "core",
                    &[chunk_ref_mode("boot", "bootstrap"), chunk_ref("tool")],
                    &[],
                ),
            ),
            ("apps.morph", stratum("apps", &[chunk_ref("app")], &["core"])),
            ("boot.morph", chunk("boot")),
            ("tool.morph", chunk("tool")),
            ("app.morph", chunk("app")),
        ],
    );
    let (mut driver, log) = harness.driver(repos);
    driver.build(&[base_triple()]).unwrap();

    // tool follows boot in the same stratum, so the bootstrap chunk is
    // installed for it.
    assert_eq!(log.staged_files("tool"), ["chunks/boot"]);
    // app lives in another stratum: it sees tool but not the bootstrap
    // chunk.
    assert_eq!(log.staged_files("app"), ["chunks/tool"]);
}

#[test]
fn metadata_sidecars_are_mirrored_from_the_remote() {
    let harness = Harness::new();
    let meta_stratum = json!({
        "kind": "stratum",
        "name": "core",
        "chunks": [{ "morph": "busybox" }],
        "needs-artifact-metadata-cached": true,
    });
    let repos = MemoryRepoCache::default().with_repo(
        "morphs",
        "9ee3089ee3089ee3089ee3089ee3089ee3089ee3",
        vec![
            ("base.morph", system("base", &["core"])),
            ("core.morph", meta_stratum),
            ("busybox.morph", chunk("busybox")),
        ],
    );

    let (pool, graph) = harness.keyed_graph(repos.clone(), &base_triple());
    let core = pool.lookup_id("morphs", "master", "core.morph").unwrap();
    let key = graph.get(core).cache_key().unwrap().to_string();

    let mut remote = MemoryRemoteCache::default();
    remote.blobs.insert(key.clone(), chunk_tarball("core"));
    remote.metadata.insert((key.clone(), "meta".to_string()), b"{}\n".to_vec());

    let (driver, log) = harness.driver(repos);
    let mut driver = driver.with_remote_cache(Box::new(remote));
    driver.build(&[base_triple()]).unwrap();

    assert_eq!(log.built(), ["busybox", "base"]);
    assert!(harness.cachedir.join("artifacts").join(format!("{key}.meta")).exists());
}

#[test]
fn failed_dependency_install_aborts_the_staging_area() {
    let harness = Harness::new();
    let repos = MemoryRepoCache::default().with_repo(
        "morphs",
        "aff409aff409aff409aff409aff409aff409aff4",
        vec![
            ("base.morph", system("base", &["core"])),
            ("core.morph", stratum("core", &[chunk_ref("c1"), chunk_ref("c2")], &[])),
            ("c1.morph", chunk("c1")),
            ("c2.morph", chunk("c2")),
        ],
    );

    let builder = RecordingBuilder { garbage_blobs: true, ..Default::default() };
    let log = builder.log.clone();
    let mut driver = BuildDriver::new(harness.settings(), repos, builder)
        .unwrap()
        .with_reporter(Box::new(strata_build::NullReporter));

    // c1 builds (a garbage blob lands in the cache); installing it for
    // c2 then fails mid-setup.
    let err = driver.build(&[base_triple()]).unwrap_err();
    assert!(matches!(err, BuildError::StagingSetup { ref name, .. } if name == "c2"));
    assert_eq!(log.built(), ["c1"]);

    // No half-populated staging directories leak.
    let staging = harness.tempdir.join("staging");
    assert_eq!(fs::read_dir(staging).unwrap().count(), 0);
}

#[test]
fn status_prefix_counts_the_artifacts() {
    let harness = Harness::new();
    let reporter = CapturingReporter::default();
    let messages = reporter.messages.clone();

    let (driver, _) = harness.driver(linear_repos());
    let mut driver = driver.with_reporter(Box::new(reporter));
    driver.build(&[base_triple()]).unwrap();

    let messages = messages.borrow();
    assert!(messages.iter().any(|m| m.starts_with("[Build 1/3] [busybox] ")));
    assert!(messages.iter().any(|m| m.starts_with("[Build 3/3] [base] ")));
    // The prefix is restored once the set is done.
    assert_eq!(messages.last().unwrap(), "Build ends successfully");
}

#[test]
fn cache_keys_are_stable_across_runs_and_sensitive_to_recipes() {
    let harness = Harness::new();
    let (_pool_a, graph_a) = harness.keyed_graph(linear_repos(), &base_triple());
    let (_pool_b, graph_b) = harness.keyed_graph(linear_repos(), &base_triple());

    let root_a = graph_a.find_root().unwrap();
    let root_b = graph_b.find_root().unwrap();
    assert_eq!(
        graph_a.get(root_a).cache_key().unwrap(),
        graph_b.get(root_b).cache_key().unwrap()
    );

    // Changing the chunk recipe changes every key up to the root.
    let changed = MemoryRepoCache::default().with_repo(
        "morphs",
        "1e4f9c1e4f9c1e4f9c1e4f9c1e4f9c1e4f9c1e4f",
        vec![
            ("base.morph", system("base", &["core"])),
            ("core.morph", stratum("core", &[chunk_ref("busybox")], &[])),
            (
                "busybox.morph",
                json!({ "kind": "chunk", "name": "busybox", "build-commands": ["make -j1"] }),
            ),
        ],
    );
    let (_, graph_c) = harness.keyed_graph(changed, &base_triple());
    let root_c = graph_c.find_root().unwrap();
    assert_ne!(
        graph_a.get(root_a).cache_key().unwrap(),
        graph_c.get(root_c).cache_key().unwrap()
    );
}
