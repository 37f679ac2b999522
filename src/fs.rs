/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! `fuser::Filesystem` adapter: resolves inode numbers to virtual
//! paths, calls into the `Dispatcher`, and translates results into
//! `fuser` reply types. Holds no filesystem logic of its own.

use std::{
    ffi::OsStr,
    path::Path,
    sync::Mutex,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
};
use log::warn;

use crate::dispatcher::{Attr, Dispatcher};
use crate::inode::{Inodes, ROOT_INO};

/// How long the kernel may cache attributes and entries before
/// re-querying. Kept short: repository state (annex materialisation,
/// ignore status) can change underneath the mount between calls.
const ATTR_TTL: Duration = Duration::from_secs(1);

pub struct AnnexFilesystem {
    dispatcher: Dispatcher,
    inodes: Mutex<Inodes>,
}

impl AnnexFilesystem {
    pub fn new(dispatcher: Dispatcher) -> Self {
        AnnexFilesystem {
            dispatcher,
            inodes: Mutex::new(Inodes::new()),
        }
    }

    fn path_of(&self, ino: u64) -> Option<std::path::PathBuf> {
        self.inodes.lock().unwrap().path_of(ino).map(Path::to_path_buf)
    }

    fn child_path(&self, parent: &Path, name: &OsStr) -> std::path::PathBuf {
        parent.join(name)
    }

    fn virtual_str(p: &Path) -> Option<&str> {
        p.to_str()
    }

    fn to_file_attr(ino: u64, attr: &Attr) -> FileAttr {
        FileAttr {
            ino,
            size: attr.size,
            blocks: attr.size.div_ceil(512),
            atime: system_time(attr.atime),
            mtime: system_time(attr.mtime),
            ctime: system_time(attr.ctime),
            crtime: system_time(attr.ctime),
            kind: file_type(attr.mode),
            perm: (attr.mode & 0o7777) as u16,
            nlink: attr.nlink as u32,
            uid: attr.uid,
            gid: attr.gid,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }
}

fn system_time((secs, nanos): (i64, i64)) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nanos as u32)
    } else {
        UNIX_EPOCH - Duration::new((-secs) as u64, 0)
    }
}

fn file_type(mode: u32) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFSOCK => FileType::Socket,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFCHR => FileType::CharDevice,
        _ => FileType::RegularFile,
    }
}

impl Filesystem for AnnexFilesystem {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(parent_path) = self.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let child = self.child_path(&parent_path, name);
        let Some(vp) = Self::virtual_str(&child) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.dispatcher.getattr(vp) {
            Ok(attr) => {
                let ino = self.inodes.lock().unwrap().get_or_allocate(&child);
                reply.entry(&ATTR_TTL, &Self::to_file_attr(ino, &attr), 0);
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(vp) = Self::virtual_str(&path) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.dispatcher.getattr(vp) {
            Ok(attr) => reply.attr(&ATTR_TTL, &Self::to_file_attr(ino, &attr)),
            Err(errno) => reply.error(errno),
        }
    }

    fn access(&mut self, _req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(vp) = Self::virtual_str(&path) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.dispatcher.access(vp, mask) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(vp) = Self::virtual_str(&path) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.dispatcher.readlink(vp) {
            Ok(target) => reply.data(target.as_os_str().as_encoded_bytes()),
            Err(errno) => reply.error(errno),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(vp) = Self::virtual_str(&path) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.dispatcher.readdir(vp) {
            Ok(entries) => {
                for (idx, entry) in entries.into_iter().enumerate().skip(offset as usize) {
                    let child_ino = if entry.name == "." {
                        ino
                    } else if entry.name == ".." {
                        ROOT_INO
                    } else {
                        let child = path.join(&entry.name);
                        self.inodes.lock().unwrap().get_or_allocate(&child)
                    };
                    let kind = if entry.is_dir {
                        FileType::Directory
                    } else {
                        FileType::RegularFile
                    };
                    if reply.add(child_ino, (idx + 1) as i64, kind, &entry.name) {
                        break;
                    }
                }
                reply.ok();
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn statfs(&mut self, _req: &Request, ino: u64, reply: ReplyStatfs) {
        let path = self.path_of(ino).unwrap_or_else(|| Path::new("/").to_path_buf());
        let vp = Self::virtual_str(&path).unwrap_or("/");
        match self.dispatcher.statfs(vp) {
            Ok(info) => reply.statfs(
                info.blocks,
                info.bfree,
                info.bavail,
                info.files,
                info.ffree,
                info.bsize as u32,
                info.namemax as u32,
                info.frsize as u32,
            ),
            Err(errno) => reply.error(errno),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(vp) = Self::virtual_str(&path) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.dispatcher.open(vp, flags) {
            Ok(()) => reply.opened(0, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(vp) = Self::virtual_str(&path) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.dispatcher.read(vp, offset, size) {
            Ok(data) => reply.data(&data),
            Err(errno) => reply.error(errno),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(vp) = Self::virtual_str(&path) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.dispatcher.write(vp, offset, data) {
            Ok(written) => reply.written(written),
            Err(errno) => reply.error(errno),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(vp) = Self::virtual_str(&path) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.dispatcher.release(vp) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let Some(parent_path) = self.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let child = self.child_path(&parent_path, name);
        let Some(vp) = Self::virtual_str(&child) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.dispatcher.mknod(vp, mode, rdev as u64) {
            Ok(()) => match self.dispatcher.getattr(vp) {
                Ok(attr) => {
                    let ino = self.inodes.lock().unwrap().get_or_allocate(&child);
                    reply.entry(&ATTR_TTL, &Self::to_file_attr(ino, &attr), 0);
                }
                Err(errno) => reply.error(errno),
            },
            Err(errno) => reply.error(errno),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(parent_path) = self.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let child = self.child_path(&parent_path, name);
        let Some(vp) = Self::virtual_str(&child) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.dispatcher.mkdir(vp, mode) {
            Ok(()) => match self.dispatcher.getattr(vp) {
                Ok(attr) => {
                    let ino = self.inodes.lock().unwrap().get_or_allocate(&child);
                    reply.entry(&ATTR_TTL, &Self::to_file_attr(ino, &attr), 0);
                }
                Err(errno) => reply.error(errno),
            },
            Err(errno) => reply.error(errno),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(parent_path) = self.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let child = self.child_path(&parent_path, name);
        let Some(vp) = Self::virtual_str(&child) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.dispatcher.unlink(vp) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(parent_path) = self.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let child = self.child_path(&parent_path, name);
        let Some(vp) = Self::virtual_str(&child) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.dispatcher.rmdir(vp) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let Some(parent_path) = self.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let child = self.child_path(&parent_path, link_name);
        let (Some(vp), Some(vt)) = (Self::virtual_str(&child), target.to_str()) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.dispatcher.symlink(vt, vp) {
            Ok(()) => match self.dispatcher.getattr(vp) {
                Ok(attr) => {
                    let ino = self.inodes.lock().unwrap().get_or_allocate(&child);
                    reply.entry(&ATTR_TTL, &Self::to_file_attr(ino, &attr), 0);
                }
                Err(errno) => reply.error(errno),
            },
            Err(errno) => reply.error(errno),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(from_parent), Some(to_parent)) = (self.path_of(parent), self.path_of(newparent))
        else {
            reply.error(libc::ENOENT);
            return;
        };
        let from = self.child_path(&from_parent, name);
        let to = self.child_path(&to_parent, newname);
        let (Some(vfrom), Some(vto)) = (Self::virtual_str(&from), Self::virtual_str(&to)) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.dispatcher.rename(vfrom, vto) {
            Ok(()) => {
                self.inodes.lock().unwrap().on_rename(&from, &to);
                reply.ok();
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<fuser::TimeOrNow>,
        mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(vp) = Self::virtual_str(&path) else {
            reply.error(libc::EINVAL);
            return;
        };

        if let Some(mode) = mode {
            if let Err(errno) = self.dispatcher.chmod(vp, mode) {
                reply.error(errno);
                return;
            }
        }
        if uid.is_some() || gid.is_some() {
            if let Err(errno) = self.dispatcher.chown(vp, uid, gid) {
                reply.error(errno);
                return;
            }
        }
        if let Some(size) = size {
            if let Err(errno) = self.dispatcher.truncate(vp, size as i64) {
                reply.error(errno);
                return;
            }
        }
        if atime.is_some() || mtime.is_some() {
            let now = SystemTime::now();
            let resolve = |t: Option<fuser::TimeOrNow>| -> (i64, i64) {
                let t = match t {
                    Some(fuser::TimeOrNow::SpecificTime(t)) => t,
                    Some(fuser::TimeOrNow::Now) | None => now,
                };
                match t.duration_since(UNIX_EPOCH) {
                    Ok(d) => (d.as_secs() as i64, d.subsec_nanos() as i64),
                    Err(_) => (0, 0),
                }
            };
            if let Err(errno) = self.dispatcher.utimens(vp, resolve(atime), resolve(mtime)) {
                reply.error(errno);
                return;
            }
        }

        match self.dispatcher.getattr(vp) {
            Ok(attr) => reply.attr(&ATTR_TTL, &Self::to_file_attr(ino, &attr)),
            Err(errno) => reply.error(errno),
        }
    }

    fn forget(&mut self, _req: &Request, ino: u64, _nlookup: u64) {
        self.inodes.lock().unwrap().forget(ino);
    }

    fn flush(&mut self, _req: &Request, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn releasedir(&mut self, _req: &Request, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn init(
        &mut self,
        _req: &Request,
        _config: &mut fuser::KernelConfig,
    ) -> Result<(), libc::c_int> {
        Ok(())
    }

    fn destroy(&mut self) {
        warn!("unmounting");
    }
}
