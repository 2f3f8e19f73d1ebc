//! Staging areas: the temporary build roots chunks are built in.

use crate::{
    cachekey::BuildEnvironment,
    error::{BuildError, Result},
};
use std::{
    collections::BTreeMap,
    fs,
    io::Read,
    path::{Path, PathBuf},
};
use tempfile::TempDir;

/// A freshly created temporary directory scoped to one artifact build.
///
/// Dependency chunks are unpacked into it and the external builder runs
/// the recipe commands inside it, optionally chrooted. The directory is
/// removed on [`remove`](Self::remove), on [`abort`](Self::abort) and,
/// failing either, when the area is dropped, so creation and destruction
/// balance on every exit path.
#[derive(Debug)]
pub struct StagingArea {
    dir: TempDir,
    use_chroot: bool,
    env: BTreeMap<String, String>,
}

impl StagingArea {
    /// Creates a staging area under `{tempdir}/staging/<random>`.
    ///
    /// The command environment is the build environment with `extra_env`
    /// merged over it and `extra_path` prepended to `PATH`.
    pub fn create(
        tempdir: &Path,
        build_env: &BuildEnvironment,
        use_chroot: bool,
        extra_env: BTreeMap<String, String>,
        extra_path: Vec<PathBuf>,
    ) -> Result<Self> {
        let parent = tempdir.join("staging");
        fs::create_dir_all(&parent).map_err(|err| BuildError::io(err, &parent))?;
        let dir = TempDir::new_in(&parent).map_err(|err| BuildError::io(err, &parent))?;
        trace!("created staging area {}", dir.path().display());

        let mut env = build_env.env().clone();
        env.extend(extra_env);
        if !extra_path.is_empty() {
            let mut parts: Vec<String> =
                extra_path.iter().map(|p| p.display().to_string()).collect();
            if let Some(path) = env.get("PATH") {
                parts.push(path.clone());
            }
            env.insert("PATH".to_string(), parts.join(":"));
        }

        Ok(Self { dir, use_chroot, env })
    }

    /// The directory the build runs in (and is chrooted to, when
    /// [`use_chroot`](Self::use_chroot) is set).
    pub fn dirname(&self) -> &Path {
        self.dir.path()
    }

    pub fn use_chroot(&self) -> bool {
        self.use_chroot
    }

    /// The command environment for build commands run in this area.
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Unpacks a chunk artifact stream into the area.
    pub fn install_artifact(&self, reader: impl Read) -> Result<()> {
        let mut archive = tar::Archive::new(reader);
        archive.unpack(self.dir.path()).map_err(|err| BuildError::io(err, self.dir.path()))
    }

    /// Tears the area down after a mid-setup failure.
    pub fn abort(self) -> Result<()> {
        trace!("aborting staging area {}", self.dir.path().display());
        self.teardown()
    }

    /// Tears the area down on normal completion.
    pub fn remove(self) -> Result<()> {
        self.teardown()
    }

    fn teardown(self) -> Result<()> {
        let path = self.dir.path().to_path_buf();
        self.dir.close().map_err(|err| BuildError::io(err, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BuildSettings;
    use pretty_assertions::assert_eq;

    fn build_env() -> BuildEnvironment {
        let settings = BuildSettings::builder().cachedir("/c").tempdir("/t").build().unwrap();
        BuildEnvironment::new(&settings, "x86_64")
    }

    fn tar_with(name: &str, contents: &[u8]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, contents).unwrap();
        builder.into_inner().unwrap()
    }

    #[test]
    fn lives_under_tempdir_staging() {
        let tmp = tempfile::tempdir().unwrap();
        let area =
            StagingArea::create(tmp.path(), &build_env(), true, BTreeMap::new(), Vec::new())
                .unwrap();
        assert!(area.dirname().starts_with(tmp.path().join("staging")));
        assert!(area.use_chroot());
        let path = area.dirname().to_path_buf();
        area.remove().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn abort_releases_the_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let area =
            StagingArea::create(tmp.path(), &build_env(), false, BTreeMap::new(), Vec::new())
                .unwrap();
        let path = area.dirname().to_path_buf();
        area.abort().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn merges_extra_env_and_path() {
        let tmp = tempfile::tempdir().unwrap();
        let mut extra_env = BTreeMap::new();
        extra_env.insert("PREFIX".to_string(), "/usr".to_string());
        let area = StagingArea::create(
            tmp.path(),
            &build_env(),
            true,
            extra_env,
            vec![PathBuf::from("/usr/bin"), PathBuf::from("/tools/bin")],
        )
        .unwrap();
        assert_eq!(area.env().get("PREFIX").unwrap(), "/usr");
        let path = area.env().get("PATH").unwrap();
        assert!(path.starts_with("/usr/bin:/tools/bin:"));
        assert_eq!(area.env().get("TARGET").unwrap(), "x86_64");
    }

    #[test]
    fn installs_chunk_tarballs() {
        let tmp = tempfile::tempdir().unwrap();
        let area =
            StagingArea::create(tmp.path(), &build_env(), true, BTreeMap::new(), Vec::new())
                .unwrap();
        let blob = tar_with("usr/bin/busybox", b"#!binary");
        area.install_artifact(blob.as_slice()).unwrap();
        assert_eq!(fs::read(area.dirname().join("usr/bin/busybox")).unwrap(), b"#!binary");
    }
}
