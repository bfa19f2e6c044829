//! OCI bundle assembly and teardown.
//!
//! A container bundle stacks three mounts below `<base>/bundle`: the image's
//! squashfs partition loop-mounted at `lower/`, a writable overlay at
//! `rootfs/` backed by `overlay/{upper,work}`, and the self-bind of the
//! overlay parent which re-allows suid. Pod bundles only hold an empty
//! `rootfs/` for the infra process.

pub mod loopdev;
pub mod sif;
pub mod translate;
pub mod user;

use crate::oci_spec::Spec;
use anyhow::{Context, Result};
use getset::Getters;
use log::{debug, warn};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use std::{
    fs,
    fs::File,
    path::{Path, PathBuf},
};

/// How cleanup reacts to failing steps.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Teardown {
    /// Abort on the first failing step and return its error.
    Strict,
    /// Attempt every step; failures are logged and swallowed. Used from
    /// failure handlers and re-entrant cleanup.
    BestEffort,
}

impl Teardown {
    /// Run one cleanup step under this mode's failure policy.
    pub(crate) fn step<F>(self, what: &str, f: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        match f() {
            Ok(()) => Ok(()),
            Err(e) => match self {
                Teardown::BestEffort => {
                    warn!("Cleanup step '{}' failed: {:#}", what, e);
                    Ok(())
                }
                Teardown::Strict => Err(e).with_context(|| format!("cleanup step '{}'", what)),
            },
        }
    }
}

#[derive(Debug, Getters)]
/// An on-disk OCI bundle below a pod or container base directory.
pub struct Bundle {
    /// The bundle directory holding `config.json` and `rootfs/`.
    #[get = "pub"]
    path: PathBuf,
}

impl Bundle {
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Self {
        Self {
            path: base_dir.as_ref().join("bundle"),
        }
    }

    pub fn rootfs(&self) -> PathBuf {
        self.path.join("rootfs")
    }

    pub fn lower(&self) -> PathBuf {
        self.path.join("lower")
    }

    pub fn overlay(&self) -> PathBuf {
        self.path.join("overlay")
    }

    pub fn config_file(&self) -> PathBuf {
        self.path.join("config.json")
    }

    /// Lay out a pod bundle: nothing but an empty rootfs.
    pub fn prepare_pod(&self) -> Result<()> {
        fs::create_dir_all(self.rootfs())
            .with_context(|| format!("create pod rootfs {}", self.rootfs().display()))?;
        Ok(())
    }

    /// Lay out a container bundle from the image at `image_path`.
    ///
    /// The image's primary partition is attached to a free loop device and
    /// mounted read-only; container writes land in the overlay upper dir.
    pub fn prepare_container(&self, image_path: &Path) -> Result<()> {
        let partition = sif::primary_partition(image_path)?;
        partition.ensure_squashfs()?;

        let lower = self.lower();
        let overlay = self.overlay();
        let upper = overlay.join("upper");
        let work = overlay.join("work");
        let rootfs = self.rootfs();
        for dir in [&lower, &upper, &work, &rootfs].iter() {
            fs::create_dir_all(dir)
                .with_context(|| format!("create bundle dir {}", dir.display()))?;
        }

        let image = File::open(image_path)
            .with_context(|| format!("open image {}", image_path.display()))?;
        let device = loopdev::attach(
            &image,
            partition.offset() as u64,
            partition.size() as u64,
        )?;

        mount(
            Some(device.path()),
            &lower,
            Some("squashfs"),
            MsFlags::MS_RDONLY,
            Some("errors=remount-ro"),
        )
        .with_context(|| format!("mount image at {}", lower.display()))?;

        // Self-bind the overlay parent and remount without nosuid so that
        // suid binaries inside the container keep working.
        mount(
            Some(&overlay),
            &overlay,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .with_context(|| format!("bind {}", overlay.display()))?;
        mount(
            None::<&str>,
            &overlay,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT,
            None::<&str>,
        )
        .with_context(|| format!("remount {}", overlay.display()))?;

        let options = format!(
            "lowerdir={},workdir={},upperdir={}",
            lower.display(),
            work.display(),
            upper.display()
        );
        mount(
            Some("overlay"),
            &rootfs,
            Some("overlay"),
            MsFlags::empty(),
            Some(options.as_str()),
        )
        .with_context(|| format!("mount overlay at {}", rootfs.display()))?;

        debug!("Prepared bundle {}", self.path.display());
        Ok(())
    }

    /// Serialize `spec` into the bundle's `config.json`.
    pub fn write_spec(&self, spec: &Spec) -> Result<()> {
        fs::create_dir_all(&self.path)
            .with_context(|| format!("create bundle dir {}", self.path.display()))?;
        spec.save(&self.config_file())
    }

    /// Unwind the bundle: unmount rootfs, image and overlay parent, then
    /// remove the directory tree.
    ///
    /// The loop device detaches itself once the image unmounts (auto-clear).
    pub fn teardown(&self, mode: Teardown) -> Result<()> {
        mode.step("unmount rootfs", || unmount(&self.rootfs()))?;
        mode.step("unmount image", || unmount(&self.lower()))?;
        mode.step("unmount overlay", || unmount(&self.overlay()))?;
        mode.step("remove bundle dir", || match fs::remove_dir_all(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(e).with_context(|| format!("remove {}", self.path.display()))
            }
        })?;
        Ok(())
    }
}

/// Detach a mount point; missing mounts and paths count as success.
pub(crate) fn unmount(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    match umount2(path, MntFlags::MNT_DETACH) {
        Ok(()) => Ok(()),
        Err(nix::Error::Sys(errno))
            if errno == nix::errno::Errno::EINVAL || errno == nix::errno::Errno::ENOENT =>
        {
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("unmount {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci_spec::SpecBuilder;
    use tempfile::TempDir;

    #[test]
    fn bundle_layout() {
        let bundle = Bundle::new("/base");
        assert_eq!(bundle.path(), &PathBuf::from("/base/bundle"));
        assert_eq!(bundle.rootfs(), PathBuf::from("/base/bundle/rootfs"));
        assert_eq!(bundle.lower(), PathBuf::from("/base/bundle/lower"));
        assert_eq!(bundle.config_file(), PathBuf::from("/base/bundle/config.json"));
    }

    #[test]
    fn pod_bundle_prepare_and_teardown() -> Result<()> {
        let dir = TempDir::new()?;
        let bundle = Bundle::new(dir.path());
        bundle.prepare_pod()?;
        assert!(bundle.rootfs().is_dir());

        let spec = SpecBuilder::default().version("1.0.0").build()?;
        bundle.write_spec(&spec)?;
        assert!(bundle.config_file().is_file());

        bundle.teardown(Teardown::Strict)?;
        assert!(!bundle.path().exists());
        Ok(())
    }

    #[test]
    fn teardown_is_reentrant() -> Result<()> {
        let dir = TempDir::new()?;
        let bundle = Bundle::new(dir.path());
        bundle.teardown(Teardown::Strict)?;
        bundle.teardown(Teardown::BestEffort)?;
        Ok(())
    }

    #[test]
    fn best_effort_swallows_failures() {
        let res = Teardown::BestEffort.step("failing", || anyhow::bail!("nope"));
        assert!(res.is_ok());
        let res = Teardown::Strict.step("failing", || anyhow::bail!("nope"));
        assert!(res.is_err());
    }
}
