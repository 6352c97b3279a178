use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow,
};

use crate::config::BLOCK_SIZE;
use crate::drive::Drive;
use crate::errors::GdfsError;
use crate::logging;
use crate::posix::{FileKind, FileStat};
use crate::tree::now;

/// Kernel-side attribute/entry cache lifetime.
const TTL: Duration = Duration::from_secs(1);

/// FUSE binding: translates kernel callbacks into calls on the path-based
/// adapter, bridging sync callbacks onto the async core with `block_on`.
/// Inode numbers are minted here and mapped to paths.
pub struct GdfsFuse {
    drive: Arc<Drive>,
    handle: tokio::runtime::Handle,
    inode_to_path: HashMap<u64, String>,
    path_to_inode: HashMap<String, u64>,
    next_inode: u64,
}

impl GdfsFuse {
    pub fn new(drive: Arc<Drive>, handle: tokio::runtime::Handle) -> Self {
        let mut fs = GdfsFuse {
            drive,
            handle,
            inode_to_path: HashMap::new(),
            path_to_inode: HashMap::new(),
            next_inode: 2,
        };
        fs.inode_to_path.insert(1, "/".to_string());
        fs.path_to_inode.insert("/".to_string(), 1);
        fs
    }

    fn path_of(&self, ino: u64) -> Option<String> {
        self.inode_to_path.get(&ino).cloned()
    }

    fn ino_for(&mut self, path: &str) -> u64 {
        if let Some(&ino) = self.path_to_inode.get(path) {
            return ino;
        }
        let ino = self.next_inode;
        self.next_inode += 1;
        self.inode_to_path.insert(ino, path.to_string());
        self.path_to_inode.insert(path.to_string(), ino);
        ino
    }

    fn forget_path(&mut self, path: &str) {
        if let Some(ino) = self.path_to_inode.remove(path) {
            self.inode_to_path.remove(&ino);
        }
        // A removed directory takes its whole subtree of mappings with it.
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let stale: Vec<String> = self
            .path_to_inode
            .keys()
            .filter(|p| p.starts_with(&prefix))
            .cloned()
            .collect();
        for p in stale {
            if let Some(ino) = self.path_to_inode.remove(&p) {
                self.inode_to_path.remove(&ino);
            }
        }
    }

    fn move_path(&mut self, old: &str, new: &str) {
        self.forget_path(new);
        let mappings: Vec<(String, u64)> = self
            .path_to_inode
            .iter()
            .filter(|(p, _)| {
                p.as_str() == old || p.starts_with(&format!("{}/", old.trim_end_matches('/')))
            })
            .map(|(p, i)| (p.clone(), *i))
            .collect();
        for (p, ino) in mappings {
            let renamed = format!("{new}{}", &p[old.len()..]);
            self.path_to_inode.remove(&p);
            self.path_to_inode.insert(renamed.clone(), ino);
            self.inode_to_path.insert(ino, renamed);
        }
    }

    fn attr_for(&self, ino: u64, stat: &FileStat) -> FileAttr {
        FileAttr {
            ino,
            size: stat.size,
            blocks: stat.size.div_ceil(BLOCK_SIZE),
            atime: epoch(stat.atime),
            mtime: epoch(stat.mtime),
            ctime: epoch(stat.ctime),
            crtime: epoch(stat.ctime),
            kind: file_type(stat.kind),
            perm: stat.mode as u16,
            nlink: stat.nlink,
            uid: stat.uid,
            gid: stat.gid,
            rdev: stat.rdev as u32,
            blksize: BLOCK_SIZE as u32,
            flags: 0,
        }
    }
}

fn epoch(secs: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs.max(0) as u64)
}

fn file_type(kind: FileKind) -> FileType {
    match kind {
        FileKind::Regular => FileType::RegularFile,
        FileKind::Directory => FileType::Directory,
        FileKind::Symlink => FileType::Symlink,
        FileKind::Char => FileType::CharDevice,
        FileKind::Block => FileType::BlockDevice,
        FileKind::Fifo => FileType::NamedPipe,
        FileKind::Socket => FileType::Socket,
    }
}

fn errno(err: &GdfsError) -> i32 {
    err.errno()
}

fn join(parent: &str, name: &OsStr) -> Option<String> {
    let name = name.to_str()?;
    if parent == "/" {
        Some(format!("/{name}"))
    } else {
        Some(format!("{parent}/{name}"))
    }
}

impl Filesystem for GdfsFuse {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), libc::c_int> {
        logging::info("mounting gdfs filesystem");
        Ok(())
    }

    fn destroy(&mut self) {
        logging::info("unmounting gdfs filesystem");
    }

    fn lookup(&mut self, req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(parent_path) = self.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(path) = join(&parent_path, name) else {
            reply.error(libc::EINVAL);
            return;
        };
        let res = self
            .handle
            .block_on(self.drive.op_getattr(&path, req.uid(), req.gid()));
        match res {
            Ok(stat) => {
                let ino = self.ino_for(&path);
                reply.entry(&TTL, &self.attr_for(ino, &stat), 0);
            }
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn getattr(&mut self, req: &Request, ino: u64, reply: ReplyAttr) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let res = self
            .handle
            .block_on(self.drive.op_getattr(&path, req.uid(), req.gid()));
        match res {
            Ok(stat) => reply.attr(&TTL, &self.attr_for(ino, &stat)),
            Err(err) => reply.error(errno(&err)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
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
        let caller_uid = req.uid();
        let caller_gid = req.gid();
        let drive = self.drive.clone();
        let res = self.handle.block_on(async {
            if let Some(mode) = mode {
                drive.op_chmod(&path, mode, caller_uid, caller_gid).await?;
            }
            if uid.is_some() || gid.is_some() {
                let stat = drive.op_getattr(&path, caller_uid, caller_gid).await?;
                drive
                    .op_chown(
                        &path,
                        uid.unwrap_or(stat.uid),
                        gid.unwrap_or(stat.gid),
                        caller_uid,
                        caller_gid,
                    )
                    .await?;
            }
            if let Some(size) = size {
                drive.op_truncate(&path, size, caller_uid, caller_gid).await?;
            }
            if atime.is_some() || mtime.is_some() {
                let stat = drive.op_getattr(&path, caller_uid, caller_gid).await?;
                let resolve = |t: Option<TimeOrNow>, current: i64| match t {
                    Some(TimeOrNow::SpecificTime(st)) => st
                        .duration_since(UNIX_EPOCH)
                        .map(|d| d.as_secs() as i64)
                        .unwrap_or(current),
                    Some(TimeOrNow::Now) => now(),
                    None => current,
                };
                let new_atime = resolve(atime, stat.atime);
                let new_mtime = resolve(mtime, stat.mtime);
                drive
                    .op_utime(&path, new_atime, new_mtime, caller_uid, caller_gid)
                    .await?;
            }
            drive.op_getattr(&path, caller_uid, caller_gid).await
        });
        match res {
            Ok(stat) => reply.attr(&TTL, &self.attr_for(ino, &stat)),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn readlink(&mut self, req: &Request, ino: u64, reply: ReplyData) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let res = self
            .handle
            .block_on(self.drive.op_readlink(&path, req.uid(), req.gid()));
        match res {
            Ok(target) => reply.data(target.as_bytes()),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn mknod(
        &mut self,
        req: &Request,
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
        let Some(path) = join(&parent_path, name) else {
            reply.error(libc::EINVAL);
            return;
        };
        let uid = req.uid();
        let gid = req.gid();
        let drive = self.drive.clone();
        let res = self.handle.block_on(async {
            drive.op_mknod(&path, mode, rdev as u64, uid, gid).await?;
            drive.op_getattr(&path, uid, gid).await
        });
        match res {
            Ok(stat) => {
                let ino = self.ino_for(&path);
                reply.entry(&TTL, &self.attr_for(ino, &stat), 0);
            }
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request,
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
        let Some(path) = join(&parent_path, name) else {
            reply.error(libc::EINVAL);
            return;
        };
        let uid = req.uid();
        let gid = req.gid();
        let drive = self.drive.clone();
        let res = self.handle.block_on(async {
            drive.op_mkdir(&path, mode, uid, gid).await?;
            drive.op_getattr(&path, uid, gid).await
        });
        match res {
            Ok(stat) => {
                let ino = self.ino_for(&path);
                reply.entry(&TTL, &self.attr_for(ino, &stat), 0);
            }
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn unlink(&mut self, req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(parent_path) = self.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(path) = join(&parent_path, name) else {
            reply.error(libc::EINVAL);
            return;
        };
        let res = self
            .handle
            .block_on(self.drive.op_unlink(&path, req.uid(), req.gid()));
        match res {
            Ok(()) => {
                self.forget_path(&path);
                reply.ok();
            }
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn rmdir(&mut self, req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(parent_path) = self.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(path) = join(&parent_path, name) else {
            reply.error(libc::EINVAL);
            return;
        };
        let res = self
            .handle
            .block_on(self.drive.op_rmdir(&path, req.uid(), req.gid()));
        match res {
            Ok(()) => {
                self.forget_path(&path);
                reply.ok();
            }
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn symlink(
        &mut self,
        req: &Request,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let Some(parent_path) = self.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(path) = join(&parent_path, link_name) else {
            reply.error(libc::EINVAL);
            return;
        };
        let target = target.to_string_lossy().to_string();
        let uid = req.uid();
        let gid = req.gid();
        let drive = self.drive.clone();
        let res = self.handle.block_on(async {
            drive.op_symlink(&target, &path, uid, gid).await?;
            drive.op_getattr(&path, uid, gid).await
        });
        match res {
            Ok(stat) => {
                let ino = self.ino_for(&path);
                reply.entry(&TTL, &self.attr_for(ino, &stat), 0);
            }
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn rename(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(parent_path), Some(newparent_path)) =
            (self.path_of(parent), self.path_of(newparent))
        else {
            reply.error(libc::ENOENT);
            return;
        };
        let (Some(path), Some(newpath)) = (
            join(&parent_path, name),
            join(&newparent_path, newname),
        ) else {
            reply.error(libc::EINVAL);
            return;
        };
        let res = self
            .handle
            .block_on(self.drive.op_rename(&path, &newpath, req.uid(), req.gid()));
        match res {
            Ok(()) => {
                self.move_path(&path, &newpath);
                reply.ok();
            }
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn link(
        &mut self,
        req: &Request,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let (Some(path), Some(parent_path)) = (self.path_of(ino), self.path_of(newparent)) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(newpath) = join(&parent_path, newname) else {
            reply.error(libc::EINVAL);
            return;
        };
        let uid = req.uid();
        let gid = req.gid();
        let drive = self.drive.clone();
        let res = self.handle.block_on(async {
            drive.op_link(&path, &newpath, uid, gid).await?;
            drive.op_getattr(&newpath, uid, gid).await
        });
        match res {
            Ok(stat) => {
                let new_ino = self.ino_for(&newpath);
                reply.entry(&TTL, &self.attr_for(new_ino, &stat), 0);
            }
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn open(&mut self, req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let res = self
            .handle
            .block_on(self.drive.op_open(&path, req.uid(), req.gid()));
        match res {
            // The inode doubles as the file handle.
            Ok(()) => reply.opened(ino, 0),
            Err(err) => reply.error(errno(&err)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &mut self,
        req: &Request,
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
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let res = self.handle.block_on(self.drive.op_read(
            &path,
            offset as u64,
            size as u64,
            req.uid(),
            req.gid(),
        ));
        match res {
            Ok(data) => reply.data(&data),
            Err(err) => reply.error(errno(&err)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        req: &Request,
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
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let res = self.handle.block_on(self.drive.op_write(
            &path,
            offset as u64,
            data,
            req.uid(),
            req.gid(),
        ));
        match res {
            Ok(written) => reply.written(written),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn flush(&mut self, _req: &Request, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        reply.ok();
    }

    fn release(
        &mut self,
        req: &Request,
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
        let res = self
            .handle
            .block_on(self.drive.op_release(&path, req.uid(), req.gid()));
        match res {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn statfs(&mut self, req: &Request, ino: u64, reply: ReplyStatfs) {
        let path = self.path_of(ino).unwrap_or_else(|| "/".to_string());
        let res = self
            .handle
            .block_on(self.drive.op_statfs(&path, req.uid(), req.gid()));
        match res {
            Ok(st) => reply.statfs(
                st.blocks,
                st.bfree,
                st.bavail,
                st.files,
                0,
                st.bsize as u32,
                st.namelen,
                st.frsize as u32,
            ),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn readdir(
        &mut self,
        req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let res = self
            .handle
            .block_on(self.drive.op_readdir(&path, req.uid(), req.gid()));
        let children = match res {
            Ok(children) => children,
            Err(err) => {
                reply.error(errno(&err));
                return;
            }
        };

        let mut entries = vec![
            (ino, FileType::Directory, ".".to_string()),
            (1, FileType::Directory, "..".to_string()),
        ];
        for (name, kind) in children {
            let child_ino = match join(&path, OsStr::new(&name)) {
                Some(child_path) => self.ino_for(&child_path),
                None => continue,
            };
            entries.push((child_ino, file_type(kind), name));
        }
        for (i, (entry_ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(entry_ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn access(&mut self, req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let res = self.handle.block_on(self.drive.op_access(
            &path,
            mask as u32,
            req.uid(),
            req.gid(),
        ));
        match res {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn create(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(parent_path) = self.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(path) = join(&parent_path, name) else {
            reply.error(libc::EINVAL);
            return;
        };
        let uid = req.uid();
        let gid = req.gid();
        let drive = self.drive.clone();
        let res = self.handle.block_on(async {
            drive.op_create(&path, mode, uid, gid).await?;
            drive.op_open(&path, uid, gid).await?;
            drive.op_getattr(&path, uid, gid).await
        });
        match res {
            Ok(stat) => {
                let ino = self.ino_for(&path);
                reply.created(&TTL, &self.attr_for(ino, &stat), 0, ino, 0);
            }
            Err(err) => reply.error(errno(&err)),
        }
    }
}

/// Mounts the filesystem and blocks until unmount.
pub fn mount(
    drive: Arc<Drive>,
    handle: tokio::runtime::Handle,
    mountpoint: &Path,
    extra_options: &[String],
) -> std::io::Result<()> {
    let mut options = vec![
        MountOption::FSName("gdfs".to_string()),
        MountOption::AutoUnmount,
    ];
    for opt in extra_options {
        options.push(MountOption::CUSTOM(opt.clone()));
    }
    fuser::mount2(GdfsFuse::new(drive, handle), mountpoint, &options)
}
