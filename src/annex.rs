/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Annex View: the policy for how annexed entries are presented:
//! writable regular files, size masked to zero when the body is
//! absent (spec §4.2).

use std::{fs, os::unix::fs::MetadataExt, path::Path};

use crate::repo::RepositoryDriver;

/// Backing-agnostic attribute snapshot. Mirrors the fields a FUSE
/// `getattr` reply needs; kept independent of `fuser::FileAttr` so the
/// dispatcher can be unit-tested without constructing transport types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Attr {
    pub mode: u32,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u64,
    pub atime: (i64, i64),
    pub mtime: (i64, i64),
    pub ctime: (i64, i64),
}

impl Attr {
    fn from_metadata(meta: &fs::Metadata) -> Self {
        Attr {
            mode: meta.mode(),
            size: meta.size(),
            uid: meta.uid(),
            gid: meta.gid(),
            nlink: meta.nlink(),
            atime: (meta.atime(), meta.atime_nsec()),
            mtime: (meta.mtime(), meta.mtime_nsec()),
            ctime: (meta.ctime(), meta.ctime_nsec()),
        }
    }
}

/// True iff the annex body for `fp` exists on local disk, i.e.
/// `stat(fp)` (which follows the placeholder symlink) succeeds.
pub fn is_materialised(fp: &Path) -> bool {
    fs::metadata(fp).is_ok()
}

/// `getattr`: `lstat`, then, if annexed, overwrite with `stat` when
/// materialised, or fake a zero-size regular file when not; either way
/// OR in owner-write (spec §4.2, §4.3's `getattr` row).
pub fn getattr(fp: &Path, driver: &dyn RepositoryDriver) -> Result<Attr, i32> {
    let lstat = fs::symlink_metadata(fp).map_err(|e| crate::errno::errno_of(&e))?;
    let mut attr = Attr::from_metadata(&lstat);

    if driver.is_annexed(fp) {
        if is_materialised(fp) {
            if let Ok(stat) = fs::metadata(fp) {
                attr = Attr::from_metadata(&stat);
            }
        } else {
            attr.mode = (attr.mode & !libc::S_IFMT) | libc::S_IFREG;
            attr.size = 0;
        }
        attr.mode |= libc::S_IWUSR;
    }

    Ok(attr)
}

/// `access`: annexed-and-absent is always `EACCES`; annexed-and-present
/// masks the write bit from the request; ordinary paths pass the mask
/// straight through (spec §4.3's `access` row).
pub fn access(fp: &Path, mask: i32, driver: &dyn RepositoryDriver) -> Result<(), i32> {
    if driver.is_annexed(fp) {
        if is_materialised(fp) {
            check_access(fp, mask & !libc::W_OK)
        } else {
            Err(libc::EACCES)
        }
    } else {
        check_access(fp, mask)
    }
}

fn check_access(fp: &Path, mask: i32) -> Result<(), i32> {
    use nix::unistd::{access, AccessFlags};

    let mut flags = AccessFlags::empty();
    if mask & libc::R_OK != 0 {
        flags |= AccessFlags::R_OK;
    }
    if mask & libc::W_OK != 0 {
        flags |= AccessFlags::W_OK;
    }
    if mask & libc::X_OK != 0 {
        flags |= AccessFlags::X_OK;
    }
    if flags.is_empty() {
        flags = AccessFlags::F_OK;
    }
    access(fp, flags).map_err(|e| e as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    struct FakeDriver {
        annexed: std::collections::HashSet<std::path::PathBuf>,
    }
    impl RepositoryDriver for FakeDriver {
        fn is_annexed(&self, fp: &Path) -> bool {
            self.annexed.contains(fp)
        }
        fn is_ignored(&self, _fp: &Path) -> bool {
            false
        }
        fn annex_unlock(&self, _fp: &Path) -> crate::repo::driver::Result<()> {
            Ok(())
        }
        fn annex_add(&self, _fp: &Path) -> crate::repo::driver::Result<()> {
            Ok(())
        }
        fn annex_get(&self, _fp: &Path) -> crate::repo::driver::Result<()> {
            Ok(())
        }
        fn add(&self, _fp: &Path) -> crate::repo::driver::Result<()> {
            Ok(())
        }
        fn rm(&self, _fp: &Path) -> crate::repo::driver::Result<()> {
            Ok(())
        }
        fn mv(&self, _from: &Path, _to: &Path) -> crate::repo::driver::Result<()> {
            Ok(())
        }
        fn commit(&self, _message: &str) -> crate::repo::driver::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn getattr_on_annexed_unmaterialised_masks_size_and_type() {
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("placeholder");
        std::os::unix::fs::symlink("/nonexistent/target", &link).unwrap();
        let mut annexed = std::collections::HashSet::new();
        annexed.insert(link.clone());
        let driver = FakeDriver { annexed };

        let attr = getattr(&link, &driver).unwrap();
        assert_eq!(attr.size, 0);
        assert_eq!(attr.mode & libc::S_IFMT, libc::S_IFREG as u32);
        assert_ne!(attr.mode & libc::S_IWUSR as u32, 0);
    }

    #[test]
    fn getattr_on_annexed_materialised_uses_target_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        std::fs::write(&target, b"hello").unwrap();
        std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o444)).unwrap();
        let link = dir.path().join("placeholder");
        std::os::unix::fs::symlink(&target, &link).unwrap();
        let mut annexed = std::collections::HashSet::new();
        annexed.insert(link.clone());
        let driver = FakeDriver { annexed };

        let attr = getattr(&link, &driver).unwrap();
        assert_eq!(attr.size, 5);
        assert_ne!(attr.mode & libc::S_IWUSR as u32, 0);
    }

    #[test]
    fn getattr_on_ordinary_path_is_unmodified_lstat() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"x").unwrap();
        let driver = FakeDriver {
            annexed: std::collections::HashSet::new(),
        };
        let attr = getattr(&file, &driver).unwrap();
        assert_eq!(attr.size, 1);
    }

    #[test]
    fn getattr_on_missing_path_returns_enoent() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let driver = FakeDriver {
            annexed: std::collections::HashSet::new(),
        };
        assert_eq!(getattr(&missing, &driver), Err(libc::ENOENT));
    }

    #[test]
    fn access_on_annexed_unmaterialised_is_eacces() {
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("placeholder");
        std::os::unix::fs::symlink("/nonexistent/target", &link).unwrap();
        let mut annexed = std::collections::HashSet::new();
        annexed.insert(link.clone());
        let driver = FakeDriver { annexed };
        assert_eq!(access(&link, libc::R_OK, &driver), Err(libc::EACCES));
    }

    #[test]
    fn access_on_annexed_materialised_masks_write() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        std::fs::write(&target, b"hello").unwrap();
        let link = dir.path().join("placeholder");
        std::os::unix::fs::symlink(&target, &link).unwrap();
        let mut annexed = std::collections::HashSet::new();
        annexed.insert(link.clone());
        let driver = FakeDriver { annexed };
        assert!(access(&link, libc::R_OK, &driver).is_ok());
    }
}
