//! Resolution of container users against the rootfs passwd and group files.

use anyhow::{Context, Result};
use log::debug;
use std::{
    fs,
    path::Path,
};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
/// The resolved identity a container process runs as.
pub struct ResolvedUser {
    pub uid: u32,
    pub gid: u32,
}

/// Resolve `user` of the form `username[:uid][:gid]`, a plain uid, or an
/// empty string against the rootfs.
///
/// Missing passwd/group files inside the image are tolerated; unresolvable
/// names fall back to the numeric parts or root.
pub fn resolve<P: AsRef<Path>>(rootfs: P, user: &str) -> Result<ResolvedUser> {
    let rootfs = rootfs.as_ref();
    let mut parts = user.split(':');
    let name = parts.next().unwrap_or_default();

    let mut resolved = ResolvedUser::default();
    if let Ok(uid) = name.parse::<u32>() {
        resolved.uid = uid;
        resolved.gid = lookup_passwd_gid_by_uid(rootfs, uid)?.unwrap_or(0);
    } else if !name.is_empty() {
        match lookup_passwd(rootfs, name)? {
            Some((uid, gid)) => {
                resolved.uid = uid;
                resolved.gid = gid;
            }
            None => debug!("User {:?} not found in image passwd, using root", name),
        }
    }

    if let Some(uid) = parts.next().and_then(|p| p.parse().ok()) {
        resolved.uid = uid;
    }
    if let Some(gid) = parts.next().and_then(|p| p.parse().ok()) {
        resolved.gid = gid;
    }
    Ok(resolved)
}

/// Supplementary groups the user belongs to per the rootfs group file.
pub fn supplementary_gids<P: AsRef<Path>>(rootfs: P, user: &str) -> Result<Vec<u32>> {
    let path = rootfs.as_ref().join("etc/group");
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content =
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;

    let mut gids = Vec::new();
    for line in content.lines() {
        // group:passwd:gid:member,member
        let mut fields = line.splitn(4, ':');
        let _group = fields.next();
        let _passwd = fields.next();
        let gid = match fields.next().and_then(|g| g.parse::<u32>().ok()) {
            Some(gid) => gid,
            None => continue,
        };
        let members = fields.next().unwrap_or_default();
        if members.split(',').any(|m| m.trim() == user) {
            gids.push(gid);
        }
    }
    Ok(gids)
}

fn lookup_passwd(rootfs: &Path, name: &str) -> Result<Option<(u32, u32)>> {
    Ok(parse_passwd(rootfs)?
        .into_iter()
        .find(|(entry, _, _)| entry == name)
        .map(|(_, uid, gid)| (uid, gid)))
}

fn lookup_passwd_gid_by_uid(rootfs: &Path, uid: u32) -> Result<Option<u32>> {
    Ok(parse_passwd(rootfs)?
        .into_iter()
        .find(|(_, entry_uid, _)| *entry_uid == uid)
        .map(|(_, _, gid)| gid))
}

fn parse_passwd(rootfs: &Path) -> Result<Vec<(String, u32, u32)>> {
    let path = rootfs.join("etc/passwd");
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content =
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;

    let mut entries = Vec::new();
    for line in content.lines() {
        // name:passwd:uid:gid:gecos:dir:shell
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 4 {
            continue;
        }
        if let (Ok(uid), Ok(gid)) = (fields[2].parse(), fields[3].parse()) {
            entries.push((fields[0].to_string(), uid, gid));
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn rootfs() -> Result<TempDir> {
        let dir = TempDir::new()?;
        fs::create_dir(dir.path().join("etc"))?;
        fs::write(
            dir.path().join("etc/passwd"),
            "root:x:0:0:root:/root:/bin/sh\nmongo:x:999:998::/home/mongo:/bin/sh\n",
        )?;
        fs::write(
            dir.path().join("etc/group"),
            "root:x:0:\nmongo:x:998:mongo\nbackup:x:34:mongo,other\nbad:x:notanumber:mongo\n",
        )?;
        Ok(dir)
    }

    #[test]
    fn resolves_by_name() -> Result<()> {
        let rootfs = rootfs()?;
        assert_eq!(
            resolve(rootfs.path(), "mongo")?,
            ResolvedUser { uid: 999, gid: 998 }
        );
        Ok(())
    }

    #[test]
    fn resolves_numeric_and_overrides() -> Result<()> {
        let rootfs = rootfs()?;
        assert_eq!(
            resolve(rootfs.path(), "999")?,
            ResolvedUser { uid: 999, gid: 998 }
        );
        assert_eq!(
            resolve(rootfs.path(), "mongo:1000:1001")?,
            ResolvedUser {
                uid: 1000,
                gid: 1001
            }
        );
        Ok(())
    }

    #[test]
    fn unknown_user_falls_back_to_root() -> Result<()> {
        let rootfs = rootfs()?;
        assert_eq!(resolve(rootfs.path(), "ghost")?, ResolvedUser::default());
        assert_eq!(resolve(rootfs.path(), "")?, ResolvedUser::default());
        Ok(())
    }

    #[test]
    fn missing_files_are_tolerated() -> Result<()> {
        let dir = TempDir::new()?;
        assert_eq!(resolve(dir.path(), "mongo")?, ResolvedUser::default());
        assert!(supplementary_gids(dir.path(), "mongo")?.is_empty());
        Ok(())
    }

    #[test]
    fn supplementary_groups_by_membership() -> Result<()> {
        let rootfs = rootfs()?;
        assert_eq!(supplementary_gids(rootfs.path(), "mongo")?, vec![998, 34]);
        assert!(supplementary_gids(rootfs.path(), "root")?.is_empty());
        Ok(())
    }
}
