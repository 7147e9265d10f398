//! Container user selection (`--user`).

use super::SpecInput;
use crate::error::{Error, Result};
use oci_spec::runtime::{Spec, UserBuilder};
use std::path::Path;

/// A resolved uid/gid pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedUser {
    pub uid: u32,
    pub gid: u32,
}

/// Parse `<name|uid>[:<group|gid>]` against the container rootfs. Numeric
/// values are taken literally and never consult the image's passwd/group
/// files, so a numeric user works even when the image has none.
pub fn resolve(spec: &str, rootfs: &Path) -> Result<ResolvedUser> {
    let (user_part, group_part) = match spec.split_once(':') {
        Some((u, g)) => (u, Some(g)),
        None => (spec, None),
    };
    if user_part.is_empty() {
        return Err(Error::invalid(format!("invalid user {:?}", spec)));
    }

    let (uid, passwd_gid) = match user_part.parse::<u32>() {
        Ok(uid) => (uid, None),
        Err(_) => {
            let entry = lookup_passwd(rootfs, user_part)?.ok_or_else(|| {
                Error::invalid(format!("user {:?} not found in the image", user_part))
            })?;
            (entry.0, Some(entry.1))
        }
    };

    let gid = match group_part {
        Some(g) if g.is_empty() => {
            return Err(Error::invalid(format!("invalid user {:?}", spec)))
        }
        Some(g) => match g.parse::<u32>() {
            Ok(gid) => gid,
            Err(_) => lookup_group(rootfs, g)?.ok_or_else(|| {
                Error::invalid(format!("group {:?} not found in the image", g))
            })?,
        },
        // No group given: the user's passwd gid, or the uid for numeric users.
        None => passwd_gid.unwrap_or(uid),
    };

    Ok(ResolvedUser { uid, gid })
}

/// Find `(uid, gid)` for a user name in the rootfs's /etc/passwd.
fn lookup_passwd(rootfs: &Path, name: &str) -> Result<Option<(u32, u32)>> {
    let path = rootfs.join("etc/passwd");
    let data = match std::fs::read_to_string(&path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    for line in data.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() >= 4 && fields[0] == name {
            let uid = fields[2]
                .parse()
                .map_err(|_| Error::invalid(format!("malformed passwd entry for {:?}", name)))?;
            let gid = fields[3]
                .parse()
                .map_err(|_| Error::invalid(format!("malformed passwd entry for {:?}", name)))?;
            return Ok(Some((uid, gid)));
        }
    }
    Ok(None)
}

/// Find the gid for a group name in the rootfs's /etc/group.
fn lookup_group(rootfs: &Path, name: &str) -> Result<Option<u32>> {
    let path = rootfs.join("etc/group");
    let data = match std::fs::read_to_string(&path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    for line in data.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() >= 3 && fields[0] == name {
            let gid = fields[2]
                .parse()
                .map_err(|_| Error::invalid(format!("malformed group entry for {:?}", name)))?;
            return Ok(Some(gid));
        }
    }
    Ok(None)
}

/// Apply `--user`. Without the flag the image/runtime default (root) stands.
pub fn apply(spec: &mut Spec, input: &SpecInput) -> Result<()> {
    let Some(user_spec) = &input.user else {
        return Ok(());
    };

    // Name lookups need a materialized rootfs; with the snapshotter the
    // mounts are not active yet, so only numeric specs work there.
    let rootfs = input
        .rootfs
        .clone()
        .unwrap_or_else(|| std::path::PathBuf::from("/nonexistent"));
    let resolved = resolve(user_spec, &rootfs)?;

    let user = UserBuilder::default()
        .uid(resolved.uid)
        .gid(resolved.gid)
        .build()
        .map_err(|e| Error::spec(e.to_string()))?;

    let mut process = spec.process().clone().unwrap_or_default();
    process.set_user(user);
    spec.set_process(Some(process));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocispec::{assemble, SpecInput};
    use std::io::Write;

    fn fake_rootfs() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("etc")).unwrap();
        let mut passwd = std::fs::File::create(dir.path().join("etc/passwd")).unwrap();
        writeln!(passwd, "root:x:0:0:root:/root:/bin/sh").unwrap();
        writeln!(passwd, "app:x:1000:1000:app:/home/app:/bin/sh").unwrap();
        let mut group = std::fs::File::create(dir.path().join("etc/group")).unwrap();
        writeln!(group, "root:x:0:").unwrap();
        writeln!(group, "staff:x:50:app").unwrap();
        dir
    }

    #[test]
    fn test_numeric_user_skips_passwd() {
        // No rootfs at all; numeric specs must still resolve.
        let u = resolve("1000", Path::new("/nonexistent")).unwrap();
        assert_eq!(u, ResolvedUser { uid: 1000, gid: 1000 });

        let u = resolve("1000:2000", Path::new("/nonexistent")).unwrap();
        assert_eq!(u, ResolvedUser { uid: 1000, gid: 2000 });
    }

    #[test]
    fn test_named_user_from_passwd() {
        let rootfs = fake_rootfs();
        let u = resolve("app", rootfs.path()).unwrap();
        assert_eq!(u, ResolvedUser { uid: 1000, gid: 1000 });
    }

    #[test]
    fn test_named_group_from_group_file() {
        let rootfs = fake_rootfs();
        let u = resolve("app:staff", rootfs.path()).unwrap();
        assert_eq!(u, ResolvedUser { uid: 1000, gid: 50 });
    }

    #[test]
    fn test_unknown_name_rejected() {
        let rootfs = fake_rootfs();
        assert!(resolve("ghost", rootfs.path()).is_err());
        assert!(resolve("app:ghosts", rootfs.path()).is_err());
    }

    #[test]
    fn test_empty_parts_rejected() {
        assert!(resolve("", Path::new("/")).is_err());
        assert!(resolve("app:", Path::new("/")).is_err());
    }

    #[test]
    fn test_apply_sets_process_user() {
        let mut input = SpecInput::new("a".repeat(64));
        input.user = Some("1000:2000".to_string());
        let spec = assemble(&input).unwrap();
        let user = spec.process().as_ref().unwrap().user().clone();
        assert_eq!(user.uid(), 1000);
        assert_eq!(user.gid(), 2000);
    }
}
