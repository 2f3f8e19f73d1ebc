//! Breadth-first loading of recipes into a [`SourcePool`].

use crate::{
    config::BuildSettings,
    error::{BuildError, Result},
    morphology::{default_build_mode, default_prefix, ChunkSpec, Morphology, StratumSpec},
    repo::RepoCache,
    source::{Source, SourcePool},
};
use std::collections::VecDeque;

/// A `(repo, ref, filename)` naming one buildable recipe.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Triple {
    pub repo: String,
    pub reference: String,
    pub filename: String,
}

impl Triple {
    pub fn new(
        repo: impl Into<String>,
        reference: impl Into<String>,
        filename: impl Into<String>,
    ) -> Self {
        Self { repo: repo.into(), reference: reference.into(), filename: filename.into() }
    }

    /// Groups command-line words into triples.
    ///
    /// Arguments come in groups of three: repo, ref, morphology name. The
    /// `.morph` suffix is appended when the name lacks it.
    pub fn parse_args<S: AsRef<str>>(args: &[S]) -> Result<Vec<Self>> {
        if args.len() % 3 != 0 {
            return Err(BuildError::msg(format!(
                "triples require arguments in groups of three (repo, ref, morphology), \
                 got {} arguments",
                args.len()
            )));
        }
        Ok(args
            .chunks(3)
            .map(|group| {
                let name = group[2].as_ref();
                let filename = if name.ends_with(".morph") {
                    name.to_string()
                } else {
                    format!("{name}.morph")
                };
                Self::new(group[0].as_ref(), group[1].as_ref(), filename)
            })
            .collect())
    }
}

/// A recipe reference queued for loading, with the build mode and prefix
/// its referencing chunk spec attached.
#[derive(Debug)]
struct PendingSource {
    repo: String,
    reference: String,
    filename: String,
    build_mode: String,
    prefix: String,
}

impl PendingSource {
    fn root(triple: &Triple) -> Self {
        Self {
            repo: triple.repo.clone(),
            reference: triple.reference.clone(),
            filename: triple.filename.clone(),
            build_mode: default_build_mode(),
            prefix: default_prefix(),
        }
    }

    fn stratum(spec: &StratumSpec, parent: &Source) -> Self {
        Self {
            repo: spec.repo.clone().unwrap_or_else(|| parent.repo_name.clone()),
            reference: spec.reference.clone().unwrap_or_else(|| parent.original_ref.clone()),
            filename: format!("{}.morph", spec.morph),
            build_mode: default_build_mode(),
            prefix: default_prefix(),
        }
    }

    fn chunk(spec: &ChunkSpec, parent: &Source) -> Self {
        Self {
            repo: spec.repo.clone().unwrap_or_else(|| parent.repo_name.clone()),
            reference: spec.reference.clone().unwrap_or_else(|| parent.original_ref.clone()),
            filename: format!("{}.morph", spec.morph),
            build_mode: spec.build_mode.clone(),
            prefix: spec.prefix.clone(),
        }
    }
}

/// Walks the recipe graph from a root triple, populating a source pool
/// that is closed under cross-recipe reference.
#[derive(Debug)]
pub struct SourceLoader<'a, R: RepoCache> {
    repos: &'a mut R,
    settings: &'a BuildSettings,
}

impl<'a, R: RepoCache> SourceLoader<'a, R> {
    pub fn new(repos: &'a mut R, settings: &'a BuildSettings) -> Self {
        Self { repos, settings }
    }

    #[instrument(skip_all, fields(repo = %triple.repo, filename = %triple.filename))]
    pub fn load(mut self, triple: &Triple) -> Result<SourcePool> {
        let mut pool = SourcePool::new();
        let mut queue = VecDeque::new();
        queue.push_back(PendingSource::root(triple));

        while let Some(pending) = queue.pop_front() {
            if pool.contains_triple(&pending.repo, &pending.reference, &pending.filename) {
                continue;
            }
            let source = self.fetch_source(&pending)?;
            let id = pool.add(source);
            let source = pool.get(id);

            match &source.morphology {
                Morphology::System(system) => {
                    for spec in &system.strata {
                        queue.push_back(PendingSource::stratum(spec, source));
                    }
                }
                Morphology::Stratum(stratum) => {
                    for spec in &stratum.build_depends {
                        queue.push_back(PendingSource::stratum(spec, source));
                    }
                    for spec in &stratum.chunks {
                        queue.push_back(PendingSource::chunk(spec, source));
                    }
                }
                Morphology::Chunk(_) => {}
            }
        }

        debug!("loaded {} sources", pool.len());
        Ok(pool)
    }

    fn fetch_source(&mut self, pending: &PendingSource) -> Result<Source> {
        trace!(
            "loading {}:{}:{}",
            pending.repo,
            pending.reference,
            pending.filename
        );
        let url = self.settings.expand_repo_url(&pending.repo);
        if !self.repos.has_repo(&url) {
            self.repos.cache_repo(&url)?;
        }
        let sha1 = self.resolve_ref(&url, &pending.reference)?;
        let text = self
            .repos
            .read_file(&url, &sha1, &pending.filename)?
            .ok_or_else(|| BuildError::RecipeNotFound {
                repo: pending.repo.clone(),
                reference: pending.reference.clone(),
                filename: pending.filename.clone(),
            })?;
        let morphology =
            Morphology::parse(&text).map_err(|source| BuildError::RecipeMalformed {
                repo: pending.repo.clone(),
                reference: pending.reference.clone(),
                filename: pending.filename.clone(),
                source,
            })?;
        Ok(Source {
            repo_name: pending.repo.clone(),
            original_ref: pending.reference.clone(),
            sha1,
            filename: pending.filename.clone(),
            morphology,
            build_mode: pending.build_mode.clone(),
            prefix: pending.prefix.clone(),
        })
    }

    /// Resolves a ref, refreshing the repository once when the ref is
    /// unknown to the cached copy.
    fn resolve_ref(&mut self, url: &str, reference: &str) -> Result<String> {
        match self.repos.resolve_ref(url, reference) {
            Ok(sha1) => Ok(sha1),
            Err(err) if !self.settings.no_git_update => {
                debug!("ref {reference} unknown in cached {url}, refreshing: {err}");
                self.repos.update_repo(url)?;
                self.repos.resolve_ref(url, reference)
            }
            Err(err) => Err(err),
        }
    }
}
