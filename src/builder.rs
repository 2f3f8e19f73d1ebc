//! Interface to the external build step.

use crate::{
    artifact::Artifact, cache::LocalArtifactCache, error::Result, source::Source,
    staging::StagingArea,
};
use std::path::Path;

/// Runs recipe commands inside a staging area and writes the resulting
/// artifact blob through the local cache.
///
/// Implementations live outside this crate; the driver only relies on
/// `build_and_cache` having stored the artifact (and its metadata
/// sidecar, when the recipe asks for one) in `local` on success.
pub trait Builder {
    /// Builds one artifact and stores it in the local cache.
    ///
    /// `setup_mounts` is set for chunks built in staging mode, which run
    /// chrooted with the special filesystems mounted.
    fn build_and_cache(
        &mut self,
        area: &StagingArea,
        artifact: &Artifact,
        source: &Source,
        local: &LocalArtifactCache,
        setup_mounts: bool,
    ) -> Result<()>;

    /// Refreshes the dynamic linker cache of a staging area.
    ///
    /// Called after chunk dependencies were installed for a staging-mode
    /// build. The default is a no-op for builders without a runnable
    /// ldconfig.
    fn ldconfig(&mut self, staging_root: &Path) -> Result<()> {
        trace!("skipping ldconfig in {}", staging_root.display());
        Ok(())
    }
}
