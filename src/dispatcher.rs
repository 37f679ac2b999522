/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The Operation Dispatcher (spec §4.3): one method per filesystem
//! callback, each composing a path translation, a POSIX operation,
//! and repository bookkeeping. Kept free of any FUSE/transport type
//! so it can be exercised directly in tests; `src/fs.rs` is the thin
//! `fuser::Filesystem` adapter on top of this.

use std::{
    fs,
    os::unix::fs::{FileExt, OpenOptionsExt, PermissionsExt},
    path::{Path, PathBuf},
    sync::Mutex,
};

use nix::{
    fcntl::OFlag,
    sys::stat::{mknod as nix_mknod, utimensat, Mode, SFlag, UtimensatFlags},
    sys::time::TimeSpec,
};

use crate::{
    annex,
    config::Config,
    errno::errno_of,
    path::PathMapper,
    repo::{driver::log_failure, RepositoryDriver},
};

pub use crate::annex::Attr;

/// A directory entry as handed back by `readdir`.
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Coarse filesystem statistics, independent of `fuser`'s reply type.
#[derive(Debug, Clone, Copy)]
pub struct StatvfsInfo {
    pub bsize: u64,
    pub frsize: u64,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub favail: u64,
    pub namemax: u64,
}

/// Process-wide, immutable-after-init mount context (spec §3).
pub struct MountContext {
    pub mapper: PathMapper,
    pub driver: Box<dyn RepositoryDriver>,
    pub config: Config,
}

/// The single mutual-exclusion primitive serialising all mutating
/// operations and `read`/`write` (spec §5). Read-only handlers never
/// take it.
pub struct Dispatcher {
    ctx: MountContext,
    writer_lock: Mutex<()>,
}

type DispatchResult<T> = Result<T, i32>;

impl Dispatcher {
    pub fn new(ctx: MountContext) -> Self {
        Dispatcher {
            ctx,
            writer_lock: Mutex::new(()),
        }
    }

    fn backing(&self, p: &str) -> PathBuf {
        self.ctx.mapper.to_backing(p)
    }

    fn driver(&self) -> &dyn RepositoryDriver {
        self.ctx.driver.as_ref()
    }

    // ---------------------------------------------------------------
    // Read-side handlers, lock-free (spec §4.3, §5).
    // ---------------------------------------------------------------

    pub fn getattr(&self, p: &str) -> DispatchResult<Attr> {
        annex::getattr(&self.backing(p), self.driver())
    }

    pub fn access(&self, p: &str, mask: i32) -> DispatchResult<()> {
        annex::access(&self.backing(p), mask, self.driver())
    }

    pub fn readlink(&self, p: &str) -> DispatchResult<PathBuf> {
        fs::read_link(self.backing(p)).map_err(|e| errno_of(&e))
    }

    pub fn readdir(&self, p: &str) -> DispatchResult<Vec<DirEntry>> {
        let fp = self.backing(p);
        let entries = fs::read_dir(&fp).map_err(|e| errno_of(&e))?;
        let mut result = vec![
            DirEntry {
                name: ".".to_owned(),
                is_dir: true,
            },
            DirEntry {
                name: "..".to_owned(),
                is_dir: true,
            },
        ];
        for entry in entries {
            let entry = entry.map_err(|e| errno_of(&e))?;
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            result.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir,
            });
        }
        Ok(result)
    }

    pub fn statfs(&self, p: &str) -> DispatchResult<StatvfsInfo> {
        let fp = self.backing(p);
        let vfs = nix::sys::statvfs::statvfs(&fp).map_err(|e| e as i32)?;
        Ok(StatvfsInfo {
            bsize: vfs.block_size(),
            frsize: vfs.fragment_size(),
            blocks: vfs.blocks(),
            bfree: vfs.blocks_free(),
            bavail: vfs.blocks_available(),
            files: vfs.files(),
            ffree: vfs.files_free(),
            favail: vfs.files_available(),
            namemax: vfs.name_max(),
        })
    }

    pub fn open(&self, p: &str, flags: i32) -> DispatchResult<()> {
        let fp = self.backing(p);
        let annexed = self.driver().is_annexed(&fp);

        if annexed && !annex::is_materialised(&fp) {
            log_failure("annex_get", &fp, self.driver().annex_get(&fp));
            if !annex::is_materialised(&fp) {
                return Err(libc::EACCES);
            }
        }

        let effective_flags = if annexed { mask_write_intent(flags) } else { flags };
        let oflag = OFlag::from_bits_truncate(effective_flags);
        let fd = nix::fcntl::open(&fp, oflag, Mode::empty()).map_err(|e| e as i32)?;
        let _ = nix::unistd::close(fd);
        Ok(())
    }

    /// Reopen read-only, `pread`, close. Takes the writer lock so
    /// `read` stays ordered against concurrent `write`s on the same
    /// file (spec §8 property 6); a path-keyed reader/writer
    /// discipline would allow more concurrency but is left as future
    /// work (spec §9).
    pub fn read(&self, p: &str, offset: i64, size: u32) -> DispatchResult<Vec<u8>> {
        let _guard = self.writer_lock.lock().unwrap();
        let fp = self.backing(p);
        let file = fs::File::open(&fp).map_err(|e| errno_of(&e))?;
        let mut buf = vec![0u8; size as usize];
        let read = file
            .read_at(&mut buf, offset as u64)
            .map_err(|e| errno_of(&e))?;
        buf.truncate(read);
        Ok(buf)
    }

    // ---------------------------------------------------------------
    // Mutating handlers, writer lock held for the whole sequence.
    // ---------------------------------------------------------------

    pub fn mknod(&self, p: &str, mode: u32, rdev: u64) -> DispatchResult<()> {
        let _guard = self.writer_lock.lock().unwrap();
        let fp = self.backing(p);
        let file_type = mode & libc::S_IFMT as u32;
        let perm = mode & !(libc::S_IFMT as u32);

        if file_type == libc::S_IFREG as u32 {
            std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(perm)
                .open(&fp)
                .map(|_| ())
                .map_err(|e| errno_of(&e))
        } else if file_type == libc::S_IFIFO as u32 {
            nix::unistd::mkfifo(&fp, Mode::from_bits_truncate(perm)).map_err(|e| e as i32)
        } else {
            nix_mknod(
                &fp,
                SFlag::from_bits_truncate(file_type),
                Mode::from_bits_truncate(perm),
                rdev,
            )
            .map_err(|e| e as i32)
        }
        // No commit: the entry is empty and will be tracked on release.
    }

    pub fn mkdir(&self, p: &str, mode: u32) -> DispatchResult<()> {
        let _guard = self.writer_lock.lock().unwrap();
        let fp = self.backing(p);
        std::fs::DirBuilder::new()
            .mode(mode)
            .create(&fp)
            .map_err(|e| errno_of(&e))
    }

    pub fn unlink(&self, p: &str) -> DispatchResult<()> {
        let _guard = self.writer_lock.lock().unwrap();
        let fp = self.backing(p);

        // Classify before removing: querying ignore status against an
        // already-absent path would be undefined (spec §4.3).
        let ignored = self.driver().is_ignored(&fp);
        fs::remove_file(&fp).map_err(|e| errno_of(&e))?;

        if !ignored {
            log_failure("rm", &fp, self.driver().rm(&fp));
            self.commit(&render(&self.ctx.config.commit_messages.removed, &[("path", stripped(p))]));
        }
        Ok(())
    }

    pub fn rmdir(&self, p: &str) -> DispatchResult<()> {
        let _guard = self.writer_lock.lock().unwrap();
        let fp = self.backing(p);
        fs::remove_dir(&fp).map_err(|e| errno_of(&e))
        // No commit: directories aren't tracked as repository content.
    }

    pub fn symlink(&self, target: &str, link: &str) -> DispatchResult<()> {
        let _guard = self.writer_lock.lock().unwrap();
        let flink = self.backing(link);
        std::os::unix::fs::symlink(target, &flink).map_err(|e| errno_of(&e))?;

        if !self.driver().is_ignored(&flink) {
            log_failure("add", &flink, self.driver().add(&flink));
            self.commit(&render(
                &self.ctx.config.commit_messages.symlink_created,
                &[("link", stripped(link)), ("target", target)],
            ));
        }
        Ok(())
    }

    pub fn rename(&self, from: &str, to: &str) -> DispatchResult<()> {
        let _guard = self.writer_lock.lock().unwrap();
        let ffrom = self.backing(from);
        let fto = self.backing(to);

        // `from` is classified before the rename, `to` after, so
        // `to`'s classification reflects its new location (spec §4.3).
        let from_ignored = self.driver().is_ignored(&ffrom);
        fs::rename(&ffrom, &fto).map_err(|e| errno_of(&e))?;
        let to_ignored = self.driver().is_ignored(&fto);

        match (from_ignored, to_ignored) {
            (true, true) => {}
            (true, false) => {
                log_failure("annex_add", &fto, self.driver().annex_add(&fto));
                log_failure("add", &fto, self.driver().add(&fto));
            }
            (false, true) => {
                log_failure("rm", &ffrom, self.driver().rm(&ffrom));
            }
            (false, false) => {
                log_failure("mv", &ffrom, self.driver().mv(&ffrom, &fto));
            }
        }

        self.commit(&render(
            &self.ctx.config.commit_messages.moved,
            &[("from", stripped(from)), ("to", stripped(to))],
        ));
        Ok(())
    }

    pub fn chmod(&self, p: &str, mode: u32) -> DispatchResult<()> {
        let _guard = self.writer_lock.lock().unwrap();
        let fp = self.backing(p);
        log_failure("annex_unlock", &fp, self.driver().annex_unlock(&fp));

        fs::set_permissions(&fp, std::fs::Permissions::from_mode(mode)).map_err(|e| errno_of(&e))?;

        log_failure("annex_add", &fp, self.driver().annex_add(&fp));
        self.commit(&render(
            &self.ctx.config.commit_messages.chmod,
            &[("path", stripped(p)), ("mode:o", &format!("{mode:o}"))],
        ));
        Ok(())
    }

    pub fn chown(&self, p: &str, uid: Option<u32>, gid: Option<u32>) -> DispatchResult<()> {
        let _guard = self.writer_lock.lock().unwrap();
        let fp = self.backing(p);
        log_failure("annex_unlock", &fp, self.driver().annex_unlock(&fp));

        // `lchown`, not `chown`: must not follow the placeholder
        // symlink before `annex_unlock` has materialised it.
        std::os::unix::fs::lchown(&fp, uid, gid).map_err(|e| errno_of(&e))?;

        log_failure("annex_add", &fp, self.driver().annex_add(&fp));
        self.commit(&render(&self.ctx.config.commit_messages.chown, &[("path", stripped(p))]));
        Ok(())
    }

    pub fn truncate(&self, p: &str, size: i64) -> DispatchResult<()> {
        let _guard = self.writer_lock.lock().unwrap();
        let fp = self.backing(p);
        log_failure("annex_unlock", &fp, self.driver().annex_unlock(&fp));

        nix::unistd::truncate(&fp, size).map_err(|e| e as i32)?;

        log_failure("annex_add", &fp, self.driver().annex_add(&fp));
        self.commit(&render(&self.ctx.config.commit_messages.truncate, &[("path", stripped(p))]));
        Ok(())
    }

    pub fn utimens(&self, p: &str, atime: (i64, i64), mtime: (i64, i64)) -> DispatchResult<()> {
        let _guard = self.writer_lock.lock().unwrap();
        let fp = self.backing(p);
        log_failure("annex_unlock", &fp, self.driver().annex_unlock(&fp));

        let atime = TimeSpec::new(atime.0, atime.1);
        let mtime = TimeSpec::new(mtime.0, mtime.1);
        utimensat(None, &fp, &atime, &mtime, UtimensatFlags::FollowSymlink).map_err(|e| e as i32)?;

        log_failure("annex_add", &fp, self.driver().annex_add(&fp));
        self.commit(&render(&self.ctx.config.commit_messages.utimens, &[("path", stripped(p))]));
        Ok(())
    }

    pub fn write(&self, p: &str, offset: i64, data: &[u8]) -> DispatchResult<u32> {
        let _guard = self.writer_lock.lock().unwrap();
        let fp = self.backing(p);

        if self.driver().is_annexed(&fp) {
            log_failure("annex_unlock", &fp, self.driver().annex_unlock(&fp));
        }

        let file = fs::OpenOptions::new()
            .write(true)
            .open(&fp)
            .map_err(|e| errno_of(&e))?;
        let written = file
            .write_at(data, offset as u64)
            .map_err(|e| errno_of(&e))?;
        // No commit here: `release` is the sole commit point for
        // content edits (spec §4.3's `write`/`release` rows).
        Ok(written as u32)
    }

    pub fn release(&self, p: &str) -> DispatchResult<()> {
        let _guard = self.writer_lock.lock().unwrap();
        let fp = self.backing(p);

        if !self.driver().is_ignored(&fp) {
            log_failure("annex_add", &fp, self.driver().annex_add(&fp));
            self.commit(&render(&self.ctx.config.commit_messages.released, &[("path", stripped(p))]));
        }
        Ok(())
    }

    fn commit(&self, message: &str) {
        log_failure("commit", Path::new(""), self.driver().commit(message));
    }
}

/// Strip the leading `/` from a virtual path for use in commit
/// messages.
fn stripped(p: &str) -> &str {
    p.strip_prefix('/').unwrap_or(p)
}

/// Clear write intent from `open(2)` flags for annexed paths: force
/// read-only access whenever the path is annexed, regardless of the
/// requested access mode (spec §9's redesign flag).
fn mask_write_intent(flags: i32) -> i32 {
    match flags & libc::O_ACCMODE {
        libc::O_WRONLY | libc::O_RDWR => (flags & !libc::O_ACCMODE) | libc::O_RDONLY,
        _ => flags,
    }
}

fn render(template: &str, subs: &[(&str, &str)]) -> String {
    let mut rendered = template.to_owned();
    for (key, value) in subs {
        rendered = rendered.replace(&format!("{{{key}}}"), value);
    }
    rendered
}
