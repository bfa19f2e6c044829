//! Linux namespace pinning.
//!
//! Namespaces requested for a pod are unshared by a short-lived helper
//! process and kept alive by bind-mounting their `/proc/<pid>/ns/<file>`
//! entries onto stable marker files under the pod directory.

use anyhow::{bail, Context, Result};
use derive_builder::Builder;
use getset::Getters;
use log::{debug, warn};
use nix::{
    mount::{mount, umount2, MntFlags, MsFlags},
    sched::CloneFlags,
};
use std::{
    fs,
    io,
    path::{Path, PathBuf},
    process::Stdio,
};
use strum::{AsRefStr, Display, EnumIter, EnumString};
use tokio::process::Command;

#[derive(
    AsRefStr, Clone, Copy, Debug, Display, EnumIter, EnumString, Eq, Hash, PartialEq,
)]
#[strum(serialize_all = "lowercase")]
/// The kinds of kernel namespaces the engine manages.
pub enum NamespaceType {
    Mount,
    Uts,
    Ipc,
    User,
    Net,
    Pid,
    Cgroup,
}

impl NamespaceType {
    /// The clone flag used to unshare this namespace.
    pub fn clone_flag(self) -> CloneFlags {
        match self {
            NamespaceType::Mount => CloneFlags::CLONE_NEWNS,
            NamespaceType::Uts => CloneFlags::CLONE_NEWUTS,
            NamespaceType::Ipc => CloneFlags::CLONE_NEWIPC,
            NamespaceType::User => CloneFlags::CLONE_NEWUSER,
            NamespaceType::Net => CloneFlags::CLONE_NEWNET,
            NamespaceType::Pid => CloneFlags::CLONE_NEWPID,
            NamespaceType::Cgroup => CloneFlags::CLONE_NEWCGROUP,
        }
    }

    /// File name of this namespace below `/proc/<pid>/ns`.
    pub fn proc_file(self) -> &'static str {
        match self {
            NamespaceType::Mount => "mnt",
            NamespaceType::Uts => "uts",
            NamespaceType::Ipc => "ipc",
            NamespaceType::User => "user",
            NamespaceType::Net => "net",
            NamespaceType::Pid => "pid",
            NamespaceType::Cgroup => "cgroup",
        }
    }
}

#[derive(Builder, Clone, Debug, Getters)]
#[builder(pattern = "owned", setter(into, strip_option))]
/// A namespace held by a pod, together with its bind-mounted host path.
pub struct Namespace {
    #[get = "pub"]
    typ: NamespaceType,

    /// Where the namespace is pinned; `None` until bound (the PID namespace
    /// is bound only once the instance process exists).
    #[get = "pub"]
    #[builder(default)]
    path: Option<PathBuf>,
}

impl Namespace {
    pub fn new(typ: NamespaceType, path: Option<PathBuf>) -> Self {
        Self { typ, path }
    }

    pub(crate) fn set_path(&mut self, path: PathBuf) {
        self.path = Some(path);
    }
}

/// Unshare every namespace of `namespaces` except PID and pin each to its
/// marker path.
///
/// A single helper process is spawned with all clone flags combined; it idles
/// on its stdin while the `/proc/<helper>/ns` entries are bound, then exits
/// when stdin closes.
pub async fn unshare_all(namespaces: &[Namespace]) -> Result<()> {
    let mut flags = CloneFlags::empty();
    let mut to_bind = Vec::new();
    for ns in namespaces {
        if ns.typ == NamespaceType::Pid {
            continue;
        }
        let path = match &ns.path {
            Some(path) => path,
            None => bail!("namespace {} has no pin path", ns.typ),
        };
        flags |= ns.typ.clone_flag();
        to_bind.push((ns.typ, path.clone()));
    }
    if to_bind.is_empty() {
        return Ok(());
    }

    let mut cmd = Command::new("cat");
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    unsafe {
        cmd.pre_exec(move || {
            nix::sched::unshare(flags).map_err(|e| {
                io::Error::new(io::ErrorKind::Other, format!("unshare: {}", e))
            })
        });
    }
    let mut helper = cmd.spawn().context("spawn namespace helper")?;
    let pid = helper.id().context("helper has no pid")? as i32;

    let res = bind_all(pid, &to_bind);

    // Closing stdin lets the helper exit; the binds keep the namespaces.
    drop(helper.stdin.take());
    helper.wait().await.context("reap namespace helper")?;

    res
}

fn bind_all(pid: i32, namespaces: &[(NamespaceType, PathBuf)]) -> Result<()> {
    for (typ, path) in namespaces {
        bind_at(pid, *typ, path)?;
    }
    Ok(())
}

/// Pin namespace `ns` of process `pid` by bind-mounting it onto `ns.path`.
pub fn bind(pid: i32, ns: &Namespace) -> Result<()> {
    let path = ns
        .path
        .as_ref()
        .with_context(|| format!("namespace {} has no pin path", ns.typ))?;
    bind_at(pid, ns.typ, path)
}

fn bind_at(pid: i32, typ: NamespaceType, path: &Path) -> Result<()> {
    let source = PathBuf::from(format!("/proc/{}/ns/{}", pid, typ.proc_file()));
    fs::File::create(path)
        .with_context(|| format!("create namespace marker {}", path.display()))?;
    mount(
        Some(&source),
        path,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .with_context(|| {
        format!("bind {} onto {}", source.display(), path.display())
    })?;
    debug!("Pinned {} namespace of {} at {}", typ, pid, path.display());
    Ok(())
}

/// Unpin a namespace: detach the bind mount and unlink the marker file.
///
/// Idempotent; a missing mount or file counts as success.
pub fn remove(ns: &Namespace) -> Result<()> {
    let path = match &ns.path {
        Some(path) => path,
        None => return Ok(()),
    };
    if !path.exists() {
        return Ok(());
    }
    match umount2(path, MntFlags::MNT_DETACH) {
        Ok(()) => {}
        Err(nix::Error::Sys(errno))
            if errno == nix::errno::Errno::EINVAL || errno == nix::errno::Errno::ENOENT =>
        {
            // Not mounted (anymore); proceed to unlink.
        }
        Err(e) => {
            return Err(e).with_context(|| format!("unmount namespace {}", path.display()))
        }
    }
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            Err(e).with_context(|| format!("remove namespace marker {}", path.display()))
        }
    }
}

/// Unpin all of `namespaces`, logging failures instead of propagating them.
pub fn remove_all_best_effort(namespaces: &[Namespace]) {
    for ns in namespaces {
        if let Err(e) = remove(ns) {
            warn!("Failed to unpin {} namespace: {:#}", ns.typ(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn namespace_type_tables() {
        assert_eq!(NamespaceType::Mount.proc_file(), "mnt");
        assert_eq!(NamespaceType::Net.proc_file(), "net");
        assert_eq!(NamespaceType::Uts.to_string(), "uts");
        assert_eq!(
            NamespaceType::Pid.clone_flag(),
            CloneFlags::CLONE_NEWPID
        );
    }

    #[test]
    fn remove_missing_marker_is_noop() -> Result<()> {
        let dir = TempDir::new()?;
        let ns = Namespace::new(
            NamespaceType::Uts,
            Some(dir.path().join("uts")),
        );
        remove(&ns)?;
        remove(&ns)?;
        Ok(())
    }

    #[test]
    fn remove_unbound_namespace_is_noop() -> Result<()> {
        let ns = Namespace::new(NamespaceType::Pid, None);
        remove(&ns)?;
        Ok(())
    }

    #[test]
    fn builder_defaults_to_unbound() -> Result<()> {
        let ns = NamespaceBuilder::default()
            .typ(NamespaceType::Ipc)
            .build()?;
        assert_eq!(*ns.typ(), NamespaceType::Ipc);
        assert!(ns.path().is_none());
        Ok(())
    }
}
