//! Host filesystem helpers: mount point discovery and disk usage.

use anyhow::{Context, Result};
use getset::CopyGetters;
use log::trace;
use std::{
    fs::File,
    io::{BufRead, BufReader, Read},
    path::{Component, Path, PathBuf},
};

const MOUNTINFO: &str = "/proc/self/mountinfo";

/// Find the mount point containing `path`.
///
/// The path is resolved through symlinks first; the longest mount point from
/// `/proc/self/mountinfo` which is a prefix of the resolved path wins.
pub fn mount_point<P: AsRef<Path>>(path: P) -> Result<PathBuf> {
    let file = File::open(MOUNTINFO).with_context(|| format!("open {}", MOUNTINFO))?;
    mount_point_from(path, file)
}

/// Like [`mount_point`], with the mountinfo content supplied by the caller.
pub fn mount_point_from<P: AsRef<Path>, R: Read>(path: P, mountinfo: R) -> Result<PathBuf> {
    let path = path.as_ref();
    let resolved = path
        .canonicalize()
        .with_context(|| format!("could not resolve path {}", path.display()))?;

    let mut best: Option<PathBuf> = None;
    for line in BufReader::new(mountinfo).lines() {
        let line = line.context("read mountinfo")?;
        let point = match parse_mount_point(&line) {
            Some(point) => point,
            None => {
                trace!("Skipping unparseable mountinfo line {:?}", line);
                continue;
            }
        };
        if !resolved.starts_with(&point) {
            continue;
        }
        if best
            .as_ref()
            .map(|b| point.components().count() > b.components().count())
            .unwrap_or(true)
        {
            best = Some(point);
        }
    }
    best.with_context(|| format!("no mount point found for {}", resolved.display()))
}

/// Extract the mount point (field five) from one mountinfo line.
///
/// Field order per proc(5):
/// `ID parentID major:minor root mountpoint options ...`
fn parse_mount_point(line: &str) -> Option<PathBuf> {
    let field = line.split(' ').nth(4)?;
    if !field.starts_with('/') {
        return None;
    }
    // Spaces inside the mount point are octal escaped.
    Some(PathBuf::from(field.replace("\\040", " ")))
}

#[derive(Clone, Copy, CopyGetters, Debug, Default, Eq, PartialEq)]
/// Disk usage of a directory tree.
pub struct Usage {
    /// Bytes occupied by files and directory entries.
    #[get_copy = "pub"]
    bytes: u64,

    /// Number of inodes (files plus directories).
    #[get_copy = "pub"]
    inodes: u64,
}

/// Compute the disk usage of the tree rooted at `path`.
///
/// Symlinks are counted by their own size, never followed.
pub fn usage<P: AsRef<Path>>(path: P) -> Result<Usage> {
    let path = path.as_ref();
    let meta = path
        .symlink_metadata()
        .with_context(|| format!("stat {}", path.display()))?;

    let mut total = Usage {
        bytes: meta.len(),
        inodes: 1,
    };
    if !meta.is_dir() {
        return Ok(total);
    }

    for entry in path
        .read_dir()
        .with_context(|| format!("read dir {}", path.display()))?
    {
        let entry = entry.with_context(|| format!("read dir entry in {}", path.display()))?;
        let sub = usage(entry.path())?;
        total.bytes += sub.bytes;
        total.inodes += sub.inodes;
    }
    Ok(total)
}

/// Remove a file, treating a missing one as success.
pub(crate) fn remove_file_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
    }
}

/// Remove a directory tree, treating a missing one as success.
pub(crate) fn remove_tree_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
    }
}

/// True if `path` is lexically under `base` (both assumed resolved).
pub fn is_under<P: AsRef<Path>, B: AsRef<Path>>(path: P, base: B) -> bool {
    let mut path = path.as_ref().components().peekable();
    for base_comp in base.as_ref().components() {
        if base_comp == Component::CurDir {
            continue;
        }
        match path.next() {
            Some(comp) if comp == base_comp => {}
            _ => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const FIXTURE: &str = "\
22 26 0:21 / / rw,relatime shared:7 - ext4 /dev/sda2 rw
23 22 0:4 / /proc rw,nosuid,nodev,noexec,relatime shared:13 - proc proc rw
24 22 0:6 / /dev rw,nosuid shared:2 - devtmpfs devtmpfs rw,size=8117840k
25 22 0:23 / /run rw,nosuid,nodev shared:5 - tmpfs tmpfs rw,mode=755
garbage line without enough fields
26 22 0:24
";

    #[test]
    fn mount_point_unresolvable_path() {
        let err = mount_point_from("/proc_definitely_missing", FIXTURE.as_bytes()).unwrap_err();
        assert!(format!("{:#}", err).contains("could not resolve path /proc_definitely_missing"));
    }

    #[test]
    fn mount_point_exact_match() -> Result<()> {
        assert_eq!(
            mount_point_from("/proc", FIXTURE.as_bytes())?,
            PathBuf::from("/proc")
        );
        Ok(())
    }

    #[test]
    fn mount_point_nested_paths() -> Result<()> {
        assert_eq!(
            mount_point_from("/proc/self", FIXTURE.as_bytes())?,
            PathBuf::from("/proc")
        );
        assert_eq!(
            mount_point_from("/dev/null", FIXTURE.as_bytes())?,
            PathBuf::from("/dev")
        );
        Ok(())
    }

    #[test]
    fn mount_point_falls_back_to_root() -> Result<()> {
        // The fixture has no /tmp mount, so anything below it lands on /.
        let dir = TempDir::new()?;
        let resolved = dir.path().canonicalize()?;
        let fixture_without_sub = "22 26 0:21 / / rw - ext4 /dev/sda2 rw\n";
        assert_eq!(
            mount_point_from(&resolved, fixture_without_sub.as_bytes())?,
            PathBuf::from("/")
        );
        Ok(())
    }

    #[test]
    fn parse_skips_bad_lines() {
        assert_eq!(parse_mount_point("not enough"), None);
        assert_eq!(parse_mount_point("1 2 0:1 / relative - x y z"), None);
        assert_eq!(
            parse_mount_point("25 22 0:23 / /run rw - tmpfs tmpfs rw"),
            Some(PathBuf::from("/run"))
        );
        assert_eq!(
            parse_mount_point("25 22 0:23 / /mnt/with\\040space rw - tmpfs tmpfs rw"),
            Some(PathBuf::from("/mnt/with space"))
        );
    }

    #[test]
    fn usage_counts_files_and_dirs() -> Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join("a"), vec![0u8; 15])?;
        fs::write(dir.path().join("b"), vec![0u8; 38])?;
        let sub = dir.path().join("sub");
        fs::create_dir(&sub)?;
        fs::write(sub.join("c"), vec![0u8; 15])?;

        let dir_size = dir.path().symlink_metadata()?.len();
        let sub_size = sub.symlink_metadata()?.len();

        let usage = usage(dir.path())?;
        assert_eq!(usage.inodes(), 5);
        assert_eq!(usage.bytes(), 15 + 38 + 15 + dir_size + sub_size);
        Ok(())
    }

    #[test]
    fn is_under_checks_components() {
        assert!(is_under("/a/b/c", "/a/b"));
        assert!(is_under("/a/b", "/a/b"));
        assert!(!is_under("/a/bc", "/a/b"));
        assert!(!is_under("/x", "/a"));
    }
}
