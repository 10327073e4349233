//! FUSE adapter
//!
//! [`HttpFuse`] implements rfuse3's raw `Filesystem` on top of [`HttpFs`].
//! The kernel speaks in inode numbers while the backend speaks in paths, so
//! an [`inode::InodeTable`] translates between the two; each callback then
//! maps onto one or two dispatcher verbs.
//!
//! Submodules:
//! - `inode`: inode <-> path bookkeeping
//! - `mount`: mounting, unmounting and the [`mount::Mount`] handle
pub mod inode;
pub mod mount;

use std::ffi::{OsStr, OsString};
use std::num::NonZeroU32;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::stream::{self, Stream};
use rfuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, FileAttr, ReplyAttr, ReplyCreated, ReplyData,
    ReplyDirectory, ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs, ReplyWrite,
};
use rfuse3::raw::{Filesystem, Request};
use rfuse3::{FileType, Result as FuseResult, SetAttr, Timestamp};
use tracing::debug;

use crate::cache::block::UNCACHED;
use crate::error::{Errno, FsResult};
use crate::vfs::HttpFs;
use crate::wire::{Stat, Timespec};
use inode::{InodeTable, ROOT_INODE};

/// Largest write the kernel may send in one request.
const MAX_WRITE: NonZeroU32 = match NonZeroU32::new(1024 * 1024) {
    Some(v) => v,
    None => panic!("zero max write"),
};

fn name_str(name: &OsStr) -> FsResult<&str> {
    name.to_str().ok_or(Errno(libc::EINVAL))
}

fn join(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}

fn parent_of(path: &str) -> &str {
    match path.trim_end_matches('/').rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

fn file_type(mode: u32) -> FileType {
    match mode & libc::S_IFMT as u32 {
        m if m == libc::S_IFDIR as u32 => FileType::Directory,
        m if m == libc::S_IFLNK as u32 => FileType::Symlink,
        m if m == libc::S_IFCHR as u32 => FileType::CharDevice,
        m if m == libc::S_IFBLK as u32 => FileType::BlockDevice,
        m if m == libc::S_IFIFO as u32 => FileType::NamedPipe,
        m if m == libc::S_IFSOCK as u32 => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn timestamp(t: Timespec) -> Timestamp {
    Timestamp::new(t.sec, t.nsec)
}

fn timespec(t: Timestamp) -> Timespec {
    Timespec::new(t.sec, t.nsec)
}

pub fn stat_to_attr(ino: u64, stat: &Stat) -> FileAttr {
    FileAttr {
        ino,
        size: stat.size,
        blocks: if stat.blocks > 0 {
            stat.blocks
        } else {
            stat.size.div_ceil(512)
        },
        atime: timestamp(stat.atime),
        mtime: timestamp(stat.mtime),
        ctime: timestamp(stat.ctime),
        #[cfg(target_os = "macos")]
        crtime: timestamp(stat.ctime),
        kind: file_type(stat.mode),
        perm: (stat.mode & 0o7777) as u16,
        nlink: stat.nlink.max(1),
        uid: stat.uid,
        gid: stat.gid,
        rdev: stat.rdev,
        #[cfg(target_os = "macos")]
        flags: 0,
        blksize: if stat.blksize > 0 { stat.blksize } else { 4096 },
    }
}

/// The kernel-facing filesystem: dispatcher plus inode bookkeeping.
pub struct HttpFuse {
    fs: HttpFs,
    inodes: InodeTable,
}

impl HttpFuse {
    pub fn new(fs: HttpFs) -> Self {
        Self {
            fs,
            inodes: InodeTable::new(),
        }
    }

    pub fn fs(&self) -> &HttpFs {
        &self.fs
    }

    pub fn inodes(&self) -> &InodeTable {
        &self.inodes
    }

    fn path(&self, ino: u64) -> FsResult<String> {
        self.inodes.path(ino).ok_or(Errno::ENOENT)
    }

    fn child(&self, parent: u64, name: &OsStr) -> FsResult<String> {
        Ok(join(&self.path(parent)?, name_str(name)?))
    }

    /// Path for a data transfer. Cached descriptors carry their own path;
    /// direct I/O needs a live one, which an unlinked inode no longer has.
    fn io_path(&self, ino: u64, fh: u64) -> FsResult<String> {
        match self.inodes.path(ino) {
            Some(path) => Ok(path),
            None if fh != UNCACHED => Ok(String::new()),
            None => Err(Errno::ENOENT),
        }
    }

    pub async fn read_data(&self, ino: u64, fh: u64, offset: u64, size: u32) -> FsResult<Bytes> {
        let path = self.io_path(ino, fh)?;
        self.fs.read(&path, fh, offset, size as usize).await
    }

    pub async fn write_data(&self, ino: u64, fh: u64, offset: u64, data: &[u8]) -> FsResult<u32> {
        let path = self.io_path(ino, fh)?;
        self.fs
            .write(&path, fh, offset, Bytes::copy_from_slice(data))
            .await
    }

    /// getattr on `path`, then hands its inode to the kernel.
    async fn entry(&self, path: &str) -> FuseResult<ReplyEntry> {
        let stat = self.fs.getattr(path).await?;
        let ino = self.inodes.lookup(path);
        Ok(ReplyEntry {
            ttl: self.fs.config().attr_ttl,
            attr: stat_to_attr(ino, &stat),
            generation: 0,
        })
    }

    async fn attr(&self, ino: u64, path: &str) -> FuseResult<ReplyAttr> {
        let stat = self.fs.getattr(path).await?;
        Ok(ReplyAttr {
            ttl: self.fs.config().attr_ttl,
            attr: stat_to_attr(ino, &stat),
        })
    }

    async fn entry_kind(&self, path: &str) -> FileType {
        match self.fs.getattr(path).await {
            Ok(stat) => file_type(stat.mode),
            Err(_) => FileType::RegularFile,
        }
    }
}

impl Filesystem for HttpFuse {
    type DirEntryStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntry>> + Send + 'a>>
    where
        Self: 'a;

    type DirEntryPlusStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntryPlus>> + Send + 'a>>
    where
        Self: 'a;

    async fn init(&self, _req: Request) -> FuseResult<ReplyInit> {
        Ok(ReplyInit {
            max_write: MAX_WRITE,
        })
    }

    async fn destroy(&self, _req: Request) {
        debug!(inodes = self.inodes.len(), "fuse session destroyed");
    }

    async fn lookup(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<ReplyEntry> {
        let path = self.child(parent, name)?;
        self.entry(&path).await
    }

    async fn forget(&self, _req: Request, inode: u64, nlookup: u64) {
        self.inodes.forget(inode, nlookup);
    }

    async fn batch_forget(&self, _req: Request, inodes: &[(u64, u64)]) {
        for &(inode, nlookup) in inodes {
            self.inodes.forget(inode, nlookup);
        }
    }

    async fn getattr(
        &self,
        _req: Request,
        inode: u64,
        _fh: Option<u64>,
        _flags: u32,
    ) -> FuseResult<ReplyAttr> {
        let path = self.path(inode)?;
        self.attr(inode, &path).await
    }

    async fn setattr(
        &self,
        _req: Request,
        inode: u64,
        _fh: Option<u64>,
        set_attr: SetAttr,
    ) -> FuseResult<ReplyAttr> {
        let path = self.path(inode)?;
        let fs = &self.fs;

        if let Some(size) = set_attr.size {
            fs.truncate(&path, size).await?;
        }
        if let Some(mode) = set_attr.mode {
            fs.chmod(&path, mode & 0o7777).await?;
        }
        if set_attr.uid.is_some() || set_attr.gid.is_some() {
            let (uid, gid) = match (set_attr.uid, set_attr.gid) {
                (Some(uid), Some(gid)) => (uid, gid),
                (uid, gid) => {
                    let current = fs.getattr(&path).await?;
                    (uid.unwrap_or(current.uid), gid.unwrap_or(current.gid))
                }
            };
            fs.chown(&path, uid, gid).await?;
        }
        if set_attr.atime.is_some() || set_attr.mtime.is_some() {
            let (atime, mtime) = match (set_attr.atime, set_attr.mtime) {
                (Some(a), Some(m)) => (timespec(a), timespec(m)),
                (a, m) => {
                    let current = fs.getattr(&path).await?;
                    (
                        a.map(timespec).unwrap_or(current.atime),
                        m.map(timespec).unwrap_or(current.mtime),
                    )
                }
            };
            fs.utimens(&path, atime, mtime).await?;
        }

        self.attr(inode, &path).await
    }

    async fn readlink(&self, _req: Request, inode: u64) -> FuseResult<ReplyData> {
        let target = self.fs.readlink(&self.path(inode)?).await?;
        Ok(ReplyData {
            data: Bytes::from(target.into_bytes()),
        })
    }

    async fn symlink(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        link: &OsStr,
    ) -> FuseResult<ReplyEntry> {
        let path = self.child(parent, name)?;
        self.fs.symlink(name_str(link)?, &path).await?;
        self.entry(&path).await
    }

    async fn mkdir(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
    ) -> FuseResult<ReplyEntry> {
        let path = self.child(parent, name)?;
        self.fs.mkdir(&path, mode & !umask).await?;
        self.entry(&path).await
    }

    async fn unlink(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let path = self.child(parent, name)?;
        self.fs.unlink(&path).await?;
        self.inodes.detach(&path);
        Ok(())
    }

    async fn rmdir(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let path = self.child(parent, name)?;
        self.fs.rmdir(&path).await?;
        self.inodes.detach(&path);
        Ok(())
    }

    async fn rename(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
    ) -> FuseResult<()> {
        let from = self.child(parent, name)?;
        let to = self.child(new_parent, new_name)?;
        self.fs.rename(&from, &to).await?;
        self.inodes.rename(&from, &to);
        Ok(())
    }

    async fn link(
        &self,
        _req: Request,
        inode: u64,
        new_parent: u64,
        new_name: &OsStr,
    ) -> FuseResult<ReplyEntry> {
        let target = self.path(inode)?;
        let path = self.child(new_parent, new_name)?;
        self.fs.link(&target, &path).await?;
        self.entry(&path).await
    }

    async fn open(&self, _req: Request, inode: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        let fh = self.fs.open(&self.path(inode)?).await?;
        Ok(ReplyOpen { fh, flags: 0 })
    }

    async fn read(
        &self,
        _req: Request,
        inode: u64,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> FuseResult<ReplyData> {
        let data = self.read_data(inode, fh, offset, size).await?;
        Ok(ReplyData { data })
    }

    #[allow(clippy::too_many_arguments)]
    async fn write(
        &self,
        _req: Request,
        inode: u64,
        fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> FuseResult<ReplyWrite> {
        let written = self.write_data(inode, fh, offset, data).await?;
        Ok(ReplyWrite { written })
    }

    async fn statfs(&self, _req: Request, _inode: u64) -> FuseResult<ReplyStatFs> {
        // the backend has no statfs verb; report a large, mostly free volume
        Ok(ReplyStatFs {
            blocks: 1 << 30,
            bfree: 1 << 30,
            bavail: 1 << 30,
            files: 1 << 20,
            ffree: 1 << 20,
            bsize: 4096,
            namelen: 255,
            frsize: 4096,
        })
    }

    async fn release(
        &self,
        _req: Request,
        _inode: u64,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> FuseResult<()> {
        self.fs.release(fh).await?;
        Ok(())
    }

    async fn fsync(&self, _req: Request, _inode: u64, fh: u64, _datasync: bool) -> FuseResult<()> {
        self.fs.flush(fh).await?;
        Ok(())
    }

    async fn flush(
        &self,
        _req: Request,
        _inode: u64,
        fh: u64,
        _lock_owner: u64,
    ) -> FuseResult<()> {
        self.fs.flush(fh).await?;
        Ok(())
    }

    async fn opendir(&self, _req: Request, _inode: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        parent: u64,
        _fh: u64,
        offset: i64,
    ) -> FuseResult<ReplyDirectory<Self::DirEntryStream<'a>>> {
        let dir = self.path(parent)?;
        let names: Vec<String> = self
            .fs
            .readdir(&dir)
            .await?
            .into_iter()
            .filter(|n| n != "." && n != "..")
            .collect();

        let children: Vec<String> = names.iter().map(|name| join(&dir, name)).collect();
        let kinds =
            futures::future::join_all(children.iter().map(|child| self.entry_kind(child))).await;

        let dot_dot = if parent == ROOT_INODE {
            ROOT_INODE
        } else {
            self.inodes.peek(parent_of(&dir))
        };
        let entries: Vec<FuseResult<DirectoryEntry>> = [
            (parent, FileType::Directory, OsString::from(".")),
            (dot_dot, FileType::Directory, OsString::from("..")),
        ]
        .into_iter()
        .chain(
            children
                .iter()
                .zip(kinds)
                .zip(names)
                .map(|((child, kind), name)| (self.inodes.peek(child), kind, OsString::from(name))),
        )
        .enumerate()
        .map(|(i, (inode, kind, name))| {
            Ok(DirectoryEntry {
                inode,
                kind,
                name,
                offset: i as i64 + 1,
            })
        })
        .skip(offset.max(0) as usize)
        .collect();

        Ok(ReplyDirectory {
            entries: Box::pin(stream::iter(entries)),
        })
    }

    async fn releasedir(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _flags: u32,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn access(&self, _req: Request, _inode: u64, _mask: u32) -> FuseResult<()> {
        Ok(())
    }

    async fn create(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _flags: u32,
    ) -> FuseResult<ReplyCreated> {
        let path = self.child(parent, name)?;
        let fh = self.fs.create(&path, mode).await?;
        let stat = match self.fs.getattr(&path).await {
            Ok(stat) => stat,
            Err(e) => {
                // the kernel never learns about fh, so free it here
                let _ = self.fs.release(fh).await;
                return Err(e.into());
            }
        };
        let ino = self.inodes.lookup(&path);
        Ok(ReplyCreated {
            ttl: self.fs.config().attr_ttl,
            attr: stat_to_attr(ino, &stat),
            generation: 0,
            fh,
            flags: 0,
        })
    }
}
