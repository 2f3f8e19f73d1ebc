//! Derives the artifact DAG from a source pool.

use crate::{
    artifact::{Artifact, ArtifactGraph, ArtifactId},
    error::{BuildError, Result},
    morphology::Morphology,
    source::{Source, SourceId, SourcePool},
};

/// Resolves the full artifact set for a validated source pool.
///
/// Every source yields exactly one artifact, sharing the source's index.
/// Dependency edges:
///
/// - a system depends on every stratum it names,
/// - a stratum depends on its build-depends strata and on every chunk it
///   names,
/// - a chunk depends on its stratum's build-depends strata and on every
///   chunk preceding it in the stratum's chunk list (chunks within a
///   stratum build sequentially).
///
/// Cycles are rejected here rather than left for [`ArtifactGraph::walk`]
/// to run into.
#[instrument(skip_all)]
pub fn resolve(pool: &SourcePool) -> Result<ArtifactGraph> {
    let artifacts = pool
        .iter()
        .map(|(id, source)| Artifact::new(source.name().to_string(), id))
        .collect();
    let mut graph = ArtifactGraph::from_artifacts(artifacts);

    for (id, source) in pool.iter() {
        match &source.morphology {
            Morphology::System(system) => {
                for spec in &system.strata {
                    let dep = resolve_ref(
                        pool,
                        source,
                        spec.repo.as_deref(),
                        spec.reference.as_deref(),
                        &spec.morph,
                    )?;
                    graph.get_mut(id).add_dependency(dep);
                }
            }
            Morphology::Stratum(stratum) => {
                let mut build_depends = Vec::with_capacity(stratum.build_depends.len());
                for spec in &stratum.build_depends {
                    let dep = resolve_ref(
                        pool,
                        source,
                        spec.repo.as_deref(),
                        spec.reference.as_deref(),
                        &spec.morph,
                    )?;
                    build_depends.push(dep);
                    graph.get_mut(id).add_dependency(dep);
                }

                let mut preceding: Vec<ArtifactId> = Vec::new();
                for spec in &stratum.chunks {
                    let chunk = resolve_ref(
                        pool,
                        source,
                        spec.repo.as_deref(),
                        spec.reference.as_deref(),
                        &spec.morph,
                    )?;
                    for &dep in &build_depends {
                        graph.get_mut(chunk).add_dependency(dep);
                    }
                    for &dep in &preceding {
                        graph.get_mut(chunk).add_dependency(dep);
                    }
                    preceding.push(chunk);
                    graph.get_mut(id).add_dependency(chunk);
                }
            }
            Morphology::Chunk(_) => {}
        }
    }

    graph.ensure_acyclic()?;
    debug!("resolved {} artifacts", graph.len());
    Ok(graph)
}

fn resolve_ref(
    pool: &SourcePool,
    referrer: &Source,
    repo: Option<&str>,
    reference: Option<&str>,
    morph: &str,
) -> Result<SourceId> {
    let repo = repo.unwrap_or(&referrer.repo_name);
    let reference = reference.unwrap_or(&referrer.original_ref);
    let filename = format!("{morph}.morph");
    pool.lookup_id(repo, reference, &filename).ok_or_else(|| {
        BuildError::msg(format!(
            "{repo}:{reference}:{filename} referenced by {} is not in the source pool",
            referrer.name()
        ))
    })
}
