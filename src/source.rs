//! Sources and the deduplicated source pool.

use crate::morphology::{Kind, Morphology};
use std::{collections::HashMap, fmt};

/// Index of a [`Source`] within its [`SourcePool`].
pub type SourceId = usize;

/// A recipe situated in history: a morphology pinned to the commit the
/// original ref resolved to.
#[derive(Clone, Debug)]
pub struct Source {
    /// The (possibly aliased) repository name the recipe was loaded from.
    pub repo_name: String,
    /// The ref as written in the referencing recipe or triple.
    pub original_ref: String,
    /// The commit `original_ref` resolved to.
    pub sha1: String,
    /// The recipe file name within the repository.
    pub filename: String,
    pub morphology: Morphology,
    /// Raw build mode string from the referencing chunk spec.
    ///
    /// Only meaningful for chunk sources; defaults to `staging`.
    pub build_mode: String,
    /// Installation prefix from the referencing chunk spec.
    pub prefix: String,
}

impl Source {
    pub fn kind(&self) -> Kind {
        self.morphology.kind()
    }

    pub fn name(&self) -> &str {
        self.morphology.name()
    }

    /// The identity that deduplicates sources in the pool.
    fn identity(&self) -> (String, String, String) {
        (self.repo_name.clone(), self.sha1.clone(), self.filename.clone())
    }

    /// The triple under which lookups find this source.
    fn lookup_triple(&self) -> (String, String, String) {
        (self.repo_name.clone(), self.original_ref.clone(), self.filename.clone())
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.repo_name, self.original_ref, self.filename)
    }
}

/// A deduplicated collection of sources with insertion-order iteration.
///
/// Uniqueness is by resolved identity `(repo, sha1, filename)`: two refs
/// that resolve to the same commit share one source. Lookups use the
/// `(repo, ref, filename)` triple as written in the referencing recipe.
#[derive(Debug, Default)]
pub struct SourcePool {
    sources: Vec<Source>,
    by_triple: HashMap<(String, String, String), SourceId>,
    by_identity: HashMap<(String, String, String), SourceId>,
}

impl SourcePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a source, returning its id.
    ///
    /// Inserting a source whose identity is already present is a no-op
    /// that registers the new lookup triple as an alias and returns the
    /// existing id.
    pub fn add(&mut self, source: Source) -> SourceId {
        let identity = source.identity();
        let triple = source.lookup_triple();
        if let Some(&id) = self.by_identity.get(&identity) {
            trace!("deduplicated source {source} onto {}", self.sources[id]);
            self.by_triple.entry(triple).or_insert(id);
            return id;
        }
        let id = self.sources.len();
        self.sources.push(source);
        self.by_identity.insert(identity, id);
        self.by_triple.insert(triple, id);
        id
    }

    /// Looks up the source a `(repo, ref, filename)` reference resolves to.
    pub fn lookup(&self, repo: &str, reference: &str, filename: &str) -> Option<&Source> {
        self.lookup_id(repo, reference, filename).map(|id| &self.sources[id])
    }

    pub fn lookup_id(&self, repo: &str, reference: &str, filename: &str) -> Option<SourceId> {
        self.by_triple
            .get(&(repo.to_string(), reference.to_string(), filename.to_string()))
            .copied()
    }

    /// Whether a lookup triple is already registered.
    pub fn contains_triple(&self, repo: &str, reference: &str, filename: &str) -> bool {
        self.lookup_id(repo, reference, filename).is_some()
    }

    pub fn get(&self, id: SourceId) -> &Source {
        &self.sources[id]
    }

    /// Iterates sources in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (SourceId, &Source)> {
        self.sources.iter().enumerate()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[cfg(test)]
pub(crate) fn test_source(
    repo: &str,
    reference: &str,
    sha1: &str,
    filename: &str,
    morphology: Morphology,
) -> Source {
    Source {
        repo_name: repo.to_string(),
        original_ref: reference.to_string(),
        sha1: sha1.to_string(),
        filename: filename.to_string(),
        morphology,
        build_mode: "staging".to_string(),
        prefix: "/usr".to_string(),
    }
}
