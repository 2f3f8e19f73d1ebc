//! Cross-recipe reference validation.

use crate::{
    error::{BuildError, Result},
    morphology::{Kind, Morphology},
    source::{Source, SourcePool},
};

/// Validates every cross-recipe reference in the pool.
///
/// Systems must reference strata, strata must reference chunks, and no
/// two distinct stratum sources may share a name. A stratum may
/// build-depend on a stratum the target system does not list, and
/// multiple references to the same source are fine; both are handled by
/// the pool's deduplication.
pub fn validate_cross_refs(pool: &SourcePool) -> Result<()> {
    let mut stratum_names: Vec<&str> = Vec::new();

    for (_, source) in pool.iter() {
        match &source.morphology {
            Morphology::System(system) => {
                let refs = system.strata.iter().map(|s| (s.repo.as_deref(), s.reference.as_deref(), s.morph.as_str()));
                validate_refs(pool, source, refs, Kind::Stratum)?;
            }
            Morphology::Stratum(stratum) => {
                let refs = stratum.chunks.iter().map(|c| (c.repo.as_deref(), c.reference.as_deref(), c.morph.as_str()));
                validate_refs(pool, source, refs, Kind::Chunk)?;
            }
            Morphology::Chunk(_) => {
                warn!("no cross-reference validator for kind {}", Kind::Chunk);
            }
        }

        if source.kind() == Kind::Stratum {
            let name = source.name();
            if stratum_names.contains(&name) {
                return Err(BuildError::ConflictingStrata(name.to_string()));
            }
            stratum_names.push(name);
        }
    }

    Ok(())
}

fn validate_refs<'m>(
    pool: &SourcePool,
    referrer: &Source,
    refs: impl Iterator<Item = (Option<&'m str>, Option<&'m str>, &'m str)>,
    wanted: Kind,
) -> Result<()> {
    for (repo, reference, morph) in refs {
        let repo = repo.unwrap_or(&referrer.repo_name);
        let reference = reference.unwrap_or(&referrer.original_ref);
        let filename = format!("{morph}.morph");
        trace!("validating cross ref to {repo}:{reference}:{filename}");
        let other = pool.lookup(repo, reference, &filename).ok_or_else(|| {
            // The pool is closed under reference, so a miss here means the
            // loader and the validator disagree about reference expansion.
            BuildError::msg(format!(
                "{repo}:{reference}:{filename} referenced by {} is not in the source pool",
                referrer.name()
            ))
        })?;
        if other.kind() != wanted {
            return Err(BuildError::CrossRefKindMismatch {
                referrer_kind: referrer.kind(),
                referrer: referrer.name().to_string(),
                repo: repo.to_string(),
                reference: reference.to_string(),
                filename,
                expected: wanted,
                got: other.kind(),
            });
        }
    }
    Ok(())
}
