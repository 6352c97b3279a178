use crate::cache::EntryView;
use crate::config::{BLOCK_SIZE, DEF_FILE_MODE, FRAGMENT_SIZE};
use crate::drive::Drive;
use crate::errors::{GdfsError, Result};
use crate::logging;
use crate::tree::{new_local_id, now, Entry, LinkKind, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    Char,
    Block,
    Fifo,
    Socket,
}

/// stat(2) payload handed to the FUSE binding.
#[derive(Debug, Clone, Copy)]
pub struct FileStat {
    pub kind: FileKind,
    pub mode: u32,
    pub nlink: u32,
    pub size: u64,
    pub ctime: i64,
    pub mtime: i64,
    pub atime: i64,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
}

/// statvfs(2) payload from the quota captured at mount.
#[derive(Debug, Clone, Copy)]
pub struct FsStat {
    pub bsize: u64,
    pub frsize: u64,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub namelen: u32,
}

/// Owner/group/other rwx with the root special cases: uid 0 always reads and
/// writes, and executes only if some execute bit is set.
pub fn file_access(
    uid: u32,
    gid: u32,
    mask: u32,
    owner_uid: u32,
    owner_gid: u32,
    mode: u32,
) -> Result<()> {
    let denied = || Err(GdfsError::Permission("access denied".into()));

    if mask & libc::R_OK as u32 != 0 {
        let ok = ((uid == owner_uid || uid == 0) && mode & 0o400 != 0)
            || ((gid == owner_gid || gid == 0) && mode & 0o040 != 0)
            || mode & 0o004 != 0;
        if !ok {
            return denied();
        }
    }
    if mask & libc::W_OK as u32 != 0 {
        let ok = ((uid == owner_uid || uid == 0) && mode & 0o200 != 0)
            || ((gid == owner_gid || gid == 0) && mode & 0o020 != 0)
            || mode & 0o002 != 0;
        if !ok {
            return denied();
        }
    }
    if mask & libc::X_OK as u32 != 0 {
        if uid == 0 {
            if mode & 0o111 == 0 {
                return denied();
            }
            return Ok(());
        }
        let ok = (uid == owner_uid && mode & 0o100 != 0)
            || (gid == owner_gid && mode & 0o010 != 0)
            || mode & 0o001 != 0;
        if !ok {
            return denied();
        }
    }
    Ok(())
}

/// Directory part of a path, always with a leading slash.
pub fn dir_name(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

/// Final component of a path.
pub fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

impl Drive {
    fn validate_path(&self, path: &str) -> Result<()> {
        if path.is_empty() {
            return Err(GdfsError::Argument("empty path".into()));
        }
        if path.len() > self.cfg.path_max {
            return Err(GdfsError::NameTooLong(format!(
                "path exceeds {} bytes",
                self.cfg.path_max
            )));
        }
        Ok(())
    }

    fn reject_root(&self, path: &str, op: &str) -> Result<()> {
        if path == "/" {
            return Err(GdfsError::NotPermitted(format!(
                "{op} on the root directory"
            )));
        }
        Ok(())
    }

    fn check_name(&self, name: &str) -> Result<()> {
        if name.len() > self.cfg.name_max {
            return Err(GdfsError::NameTooLong(name.to_string()));
        }
        Ok(())
    }

    fn check_access(&self, node: NodeId, uid: u32, gid: u32, mask: u32) -> Result<()> {
        let (e_uid, e_gid, mode) = self.with_tree(|t| {
            let e = t.entry(node);
            (e.uid, e.gid, e.file_mode)
        });
        file_access(uid, gid, mask, e_uid, e_gid, mode)
    }

    fn entry_view(&self, node: NodeId) -> EntryView {
        self.with_tree(|t| {
            let e = t.entry(node);
            EntryView {
                mtime: e.mtime,
                file_size: e.file_size,
                g_doc: e.g_doc,
            }
        })
    }

    pub async fn op_getattr(&self, path: &str, uid: u32, gid: u32) -> Result<FileStat> {
        self.validate_path(path)?;
        let name = base_name(path);
        // Desktop helpers probe these on every mount; they never exist here.
        if name == ".Trash" || name == ".Trash-1000" || name == ".hidden" {
            return Err(GdfsError::NotFound(name.to_string()));
        }
        let node = self.get_node(path, uid, gid, true).await?;
        self.with_tree(|t| {
            let e = t.entry(node);
            let kind = kind_of(e, t.node(node).link);
            Ok(FileStat {
                kind,
                mode: e.file_mode,
                nlink: e.ref_count,
                size: e.file_size,
                ctime: e.ctime,
                mtime: e.mtime,
                atime: e.atime,
                uid: e.uid,
                gid: e.gid,
                rdev: e.dev,
            })
        })
    }

    pub async fn op_mkdir(&self, path: &str, mode: u32, uid: u32, gid: u32) -> Result<()> {
        self.validate_path(path)?;
        self.reject_root(path, "mkdir")?;
        let parent = dir_name(path);
        let name = base_name(path);
        self.check_name(name)?;

        let parent_node = self.get_node(&parent, uid, gid, false).await?;
        self.check_access(parent_node, uid, gid, (libc::W_OK | libc::X_OK) as u32)?;
        if let Some(existing) = self.with_tree(|t| t.find(parent_node, name)) {
            if !self.with_tree(|t| t.entry(existing).dirty) {
                return Err(GdfsError::Exists(path.to_string()));
            }
        }
        self.make_dir(parent_node, name, mode & 0o7777, uid, gid)
            .await?;
        Ok(())
    }

    pub async fn op_create(&self, path: &str, mode: u32, uid: u32, gid: u32) -> Result<()> {
        self.validate_path(path)?;
        self.reject_root(path, "create")?;
        let parent = dir_name(path);
        let name = base_name(path);
        self.check_name(name)?;

        let parent_node = self.get_node(&parent, uid, gid, false).await?;
        self.check_access(parent_node, uid, gid, (libc::W_OK | libc::X_OK) as u32)?;
        if let Some(existing) = self.with_tree(|t| t.find(parent_node, name)) {
            if !self.with_tree(|t| t.entry(existing).dirty) {
                return Err(GdfsError::Exists(path.to_string()));
            }
        }
        self.make_file(parent_node, name, mode & 0o7777, uid, gid)
            .await?;
        Ok(())
    }

    pub async fn op_mknod(&self, path: &str, mode: u32, dev: u64, uid: u32, gid: u32) -> Result<()> {
        self.validate_path(path)?;
        self.reject_root(path, "mknod")?;
        let parent = dir_name(path);
        let name = base_name(path);
        self.check_name(name)?;

        let parent_node = self.get_node(&parent, uid, gid, false).await?;
        self.check_access(parent_node, uid, gid, (libc::W_OK | libc::X_OK) as u32)?;
        if let Some(existing) = self.with_tree(|t| t.find(parent_node, name)) {
            if !self.with_tree(|t| t.entry(existing).dirty) {
                return Err(GdfsError::Exists(path.to_string()));
            }
        }

        let kind = mode & libc::S_IFMT;
        if kind == libc::S_IFREG || kind == 0 {
            self.make_file(parent_node, name, DEF_FILE_MODE | (mode & 0o7777), uid, gid)
                .await?;
            return Ok(());
        }
        let link = match kind {
            libc::S_IFCHR => LinkKind::Char,
            libc::S_IFBLK => LinkKind::Block,
            libc::S_IFIFO => LinkKind::Fifo,
            libc::S_IFSOCK => LinkKind::Socket,
            _ => return Err(GdfsError::InvalidOperation("unsupported node type".into())),
        };
        // Device nodes exist only in the local tree.
        let mtime = now();
        self.with_tree(|t| {
            let entry = Entry::new(
                new_local_id(),
                0,
                false,
                mtime,
                mtime,
                uid,
                gid,
                DEF_FILE_MODE | (mode & 0o7777),
            )
            .with_dev(dev);
            t.insert_child(parent_node, name, entry, link, None);
        });
        Ok(())
    }

    pub async fn op_symlink(&self, target: &str, link_path: &str, uid: u32, gid: u32) -> Result<()> {
        self.validate_path(link_path)?;
        if target.is_empty() {
            return Err(GdfsError::Argument("empty symlink target".into()));
        }
        self.reject_root(link_path, "symlink")?;
        let parent = dir_name(link_path);
        let name = base_name(link_path);
        self.check_name(name)?;

        let parent_node = self.get_node(&parent, uid, gid, false).await?;
        self.check_access(parent_node, uid, gid, (libc::W_OK | libc::X_OK) as u32)?;
        if let Some(existing) = self.with_tree(|t| t.find(parent_node, name)) {
            if !self.with_tree(|t| t.entry(existing).dirty) {
                return Err(GdfsError::Exists(link_path.to_string()));
            }
        }
        let mtime = now();
        self.with_tree(|t| {
            let entry = Entry::new(
                new_local_id(),
                target.len() as u64 + 1,
                false,
                mtime,
                mtime,
                uid,
                gid,
                DEF_FILE_MODE,
            );
            t.insert_child(
                parent_node,
                name,
                entry,
                LinkKind::Symlink,
                Some(target.to_string()),
            );
        });
        Ok(())
    }

    pub async fn op_readlink(&self, path: &str, uid: u32, gid: u32) -> Result<String> {
        self.validate_path(path)?;
        self.reject_root(path, "readlink")?;
        let node = self.get_node(path, uid, gid, false).await?;
        self.check_access(node, uid, gid, libc::R_OK as u32)?;
        self.with_tree(|t| {
            let n = t.node(node);
            if n.link != LinkKind::Symlink {
                return Err(GdfsError::InvalidOperation(format!(
                    "{path} is not a symlink"
                )));
            }
            Ok(n.symlink_target.clone().unwrap_or_default())
        })
    }

    pub async fn op_link(&self, path: &str, newpath: &str, uid: u32, gid: u32) -> Result<()> {
        self.validate_path(path)?;
        self.validate_path(newpath)?;
        self.reject_root(path, "link")?;
        let new_parent = dir_name(newpath);
        let new_name = base_name(newpath);
        self.check_name(new_name)?;

        let source = self.get_node(path, uid, gid, false).await?;
        if self.with_tree(|t| t.entry(source).is_dir) {
            return Err(GdfsError::NotPermitted(
                "hard link to a directory".to_string(),
            ));
        }
        let parent_node = self.get_node(&new_parent, uid, gid, false).await?;
        self.check_access(source, uid, gid, (libc::R_OK | libc::W_OK) as u32)?;
        self.check_access(parent_node, uid, gid, (libc::W_OK | libc::X_OK) as u32)?;
        if let Some(existing) = self.with_tree(|t| t.find(parent_node, new_name)) {
            if !self.with_tree(|t| t.entry(existing).dirty) {
                return Err(GdfsError::Exists(newpath.to_string()));
            }
        }
        self.with_tree(|t| t.link_child(parent_node, new_name, source));
        Ok(())
    }

    pub async fn op_unlink(&self, path: &str, uid: u32, gid: u32) -> Result<()> {
        self.validate_path(path)?;
        self.reject_root(path, "unlink")?;
        let node = self.get_node(path, uid, gid, false).await?;
        let parent = self.with_tree(|t| t.node(node).parent);
        if let Some(parent) = parent {
            self.check_access(parent, uid, gid, libc::W_OK as u32)?;
        }
        self.delete_file(node, true).await
    }

    pub async fn op_rmdir(&self, path: &str, uid: u32, gid: u32) -> Result<()> {
        self.validate_path(path)?;
        self.reject_root(path, "rmdir")?;
        let node = self.get_node(path, uid, gid, false).await?;
        let (is_dir, empty, sticky, owner, parent) = self.with_tree(|t| {
            let e = t.entry(node);
            (
                e.is_dir,
                t.is_empty_dir(node),
                e.file_mode & libc::S_ISVTX != 0,
                e.uid,
                t.node(node).parent,
            )
        });
        if !is_dir {
            return Err(GdfsError::NotDirectory(path.to_string()));
        }
        if !empty {
            return Err(GdfsError::NotEmpty(path.to_string()));
        }
        if let Some(parent) = parent {
            self.check_access(parent, uid, gid, libc::W_OK as u32)?;
        }
        if sticky && uid != 0 && uid != owner {
            return Err(GdfsError::Permission(format!(
                "sticky bit: only root or the owner may delete {path}"
            )));
        }
        self.delete_file(node, true).await
    }

    pub async fn op_rename(&self, path: &str, newpath: &str, uid: u32, gid: u32) -> Result<()> {
        self.validate_path(path)?;
        self.validate_path(newpath)?;
        self.reject_root(path, "rename")?;
        let new_name = base_name(newpath).to_string();
        self.check_name(&new_name)?;

        let node = self.get_node(path, uid, gid, false).await?;
        let (sticky, owner, old_name, old_parent) = self.with_tree(|t| {
            let e = t.entry(node);
            (
                e.file_mode & libc::S_ISVTX != 0,
                e.uid,
                t.node(node).file_name.clone(),
                t.node(node).parent,
            )
        });
        if sticky && uid != 0 && uid != owner {
            return Err(GdfsError::Permission(format!(
                "sticky bit: only root or the owner may rename {path}"
            )));
        }

        let new_parent = self.get_node(&dir_name(newpath), uid, gid, false).await?;
        let cross_dir = old_parent != Some(new_parent);

        let mut force_write = false;
        let target = self.with_tree(|t| t.find(new_parent, &new_name));
        if let Some(target) = target {
            if target != node && !self.with_tree(|t| t.entry(target).dirty) {
                let (t_is_dir, t_empty) = self.with_tree(|t| {
                    (t.entry(target).is_dir, t.is_empty_dir(target))
                });
                if t_is_dir && !t_empty {
                    return Err(GdfsError::Exists(newpath.to_string()));
                }
                logging::warning(format!("rename: replacing existing {newpath}"));
                if old_name.starts_with('.') && !new_name.starts_with('.') {
                    // Promote a hidden (local-only) file over the visible
                    // target: adopt the target's remote identity and upload
                    // our bytes over it.
                    let old_id = self.with_tree(|t| t.entry(node).file_id.clone());
                    let target_id = self.with_tree(|t| t.entry(target).file_id.clone());
                    self.delete_file(target, false).await?;
                    self.cache.change(&old_id, &target_id).await;
                    self.with_tree(|t| t.rekey_entry(node, target_id));
                    force_write = true;
                } else {
                    self.delete_file(target, true).await?;
                }
            }
        }

        self.with_tree(|t| t.reattach(node, new_parent, &new_name));
        let new_parent_id = if cross_dir {
            Some(self.with_tree(|t| t.entry(new_parent).file_id.clone()))
        } else {
            None
        };
        self.enqueue_rename(node, &old_name, new_parent_id);

        if force_write {
            self.with_tree(|t| t.entry_mut(node).write = true);
            self.write_file(node).await?;
            self.with_tree(|t| t.entry_mut(node).write = false);
        }
        Ok(())
    }

    pub async fn op_chmod(&self, path: &str, mode: u32, uid: u32, _gid: u32) -> Result<()> {
        self.validate_path(path)?;
        self.reject_root(path, "chmod")?;
        let node = self.get_node(path, uid, _gid, false).await?;
        let owner = self.with_tree(|t| t.entry(node).uid);
        if uid != 0 && uid != owner {
            return Err(GdfsError::NotPermitted(
                "only the owner or root may change permissions".into(),
            ));
        }
        self.with_tree(|t| {
            let e = t.entry_mut(node);
            e.file_mode = mode & 0o7777;
            e.ctime = now();
        });
        Ok(())
    }

    pub async fn op_chown(
        &self,
        path: &str,
        new_uid: u32,
        new_gid: u32,
        uid: u32,
        gid: u32,
    ) -> Result<()> {
        self.validate_path(path)?;
        self.reject_root(path, "chown")?;
        let node = self.get_node(path, uid, gid, false).await?;
        let owner = self.with_tree(|t| t.entry(node).uid);
        if uid != 0 && uid != owner {
            return Err(GdfsError::NotPermitted(
                "only the owner or root may change ownership".into(),
            ));
        }
        self.with_tree(|t| {
            let e = t.entry_mut(node);
            e.uid = new_uid;
            e.gid = new_gid;
            e.ctime = now();
        });
        Ok(())
    }

    pub async fn op_truncate(&self, path: &str, new_size: u64, uid: u32, gid: u32) -> Result<()> {
        self.validate_path(path)?;
        let node = self.get_node(path, uid, gid, false).await?;
        self.check_access(node, uid, gid, libc::W_OK as u32)?;
        let (file_id, old_size) = self.with_tree(|t| {
            let e = t.entry(node);
            (e.file_id.clone(), e.file_size)
        });

        let mtime = now();
        if new_size == 0 {
            self.cache.put(&file_id, None, 0, mtime, true).await?;
        } else {
            self.with_tree(|t| t.entry_mut(node).write = true);
            if new_size > old_size {
                let zeros = vec![0u8; (new_size - old_size) as usize];
                self.cache
                    .put(&file_id, Some(&zeros), old_size, mtime, false)
                    .await?;
            } else if new_size < old_size {
                self.cache.resize(&file_id, new_size).await;
            }
        }
        self.cache.set_time(&file_id, mtime).await;
        self.with_tree(|t| {
            let e = t.entry_mut(node);
            e.mtime = mtime;
            e.ctime = mtime;
            e.file_size = new_size;
        });
        Ok(())
    }

    pub async fn op_utime(
        &self,
        path: &str,
        atime: i64,
        mtime: i64,
        uid: u32,
        gid: u32,
    ) -> Result<()> {
        self.validate_path(path)?;
        let node = self.get_node(path, uid, gid, false).await?;
        self.with_tree(|t| {
            let e = t.entry_mut(node);
            e.mtime = mtime;
            e.atime = atime;
        });
        if path != "/" {
            self.enqueue_utime(node);
        }
        Ok(())
    }

    pub async fn op_open(&self, path: &str, uid: u32, gid: u32) -> Result<()> {
        self.validate_path(path)?;
        let parent = dir_name(path);
        let name = base_name(path);
        let parent_node = self.get_node(&parent, uid, gid, false).await?;

        let node = match self.with_tree(|t| t.find(parent_node, name)) {
            Some(node) => {
                self.check_access(node, uid, gid, libc::R_OK as u32)?;
                node
            }
            None => {
                // open(O_CREAT) arrives here without a prior create.
                self.check_access(parent_node, uid, gid, (libc::W_OK | libc::X_OK) as u32)?;
                self.check_name(name)?;
                self.make_file(parent_node, name, DEF_FILE_MODE, uid, gid)
                    .await?
            }
        };
        self.with_tree(|t| t.entry_mut(node).file_open = true);
        Ok(())
    }

    pub async fn op_read(
        &self,
        path: &str,
        offset: u64,
        size: u64,
        uid: u32,
        gid: u32,
    ) -> Result<Vec<u8>> {
        self.validate_path(path)?;
        let node = self.get_node(path, uid, gid, false).await?;
        self.check_access(node, uid, gid, libc::R_OK as u32)?;
        let view = self.entry_view(node);
        if view.file_size == 0 || offset >= view.file_size {
            return Ok(Vec::new());
        }
        let (file_id, write) = self.with_tree(|t| {
            let e = t.entry(node);
            (e.file_id.clone(), e.write)
        });
        let size = size.min(view.file_size);
        let got = self
            .cache
            .get(&file_id, offset, size, &view, |s, e| {
                self.fetch_range(&file_id, view.g_doc, s, e)
            })
            .await
            .map_err(|err| match err {
                GdfsError::Transport(m) => GdfsError::Again(m),
                other => other,
            })?;

        self.with_tree(|t| {
            let e = t.entry_mut(node);
            if let Some(new_size) = got.file_size {
                if !e.write {
                    e.file_size = new_size;
                }
            }
            e.atime = now();
        });
        Ok(got.data)
    }

    pub async fn op_write(
        &self,
        path: &str,
        offset: u64,
        data: &[u8],
        uid: u32,
        gid: u32,
    ) -> Result<u32> {
        self.validate_path(path)?;
        let node = self.get_node(path, uid, gid, false).await?;
        self.check_access(node, uid, gid, libc::W_OK as u32)?;

        let mtime = now();
        let file_id = self.with_tree(|t| {
            let e = t.entry_mut(node);
            e.mtime = mtime;
            e.file_size = e.file_size.max(offset + data.len() as u64);
            e.write = true;
            e.file_id.clone()
        });
        self.cache
            .put(&file_id, Some(data), offset, mtime, false)
            .await?;
        Ok(data.len() as u32)
    }

    pub async fn op_release(&self, path: &str, uid: u32, gid: u32) -> Result<()> {
        self.validate_path(path)?;
        let node = self.get_node(path, uid, gid, false).await?;
        self.check_access(node, uid, gid, libc::R_OK as u32)?;
        let (write, file_size) = self.with_tree(|t| {
            let e = t.entry(node);
            (e.write, e.file_size)
        });
        let upload = if write && file_size > 0 {
            self.write_file(node).await
        } else {
            Ok(())
        };
        self.with_tree(|t| {
            let e = t.entry_mut(node);
            e.write = false;
            e.file_open = false;
        });
        upload.map_err(|err| GdfsError::Again(format!("upload on release failed: {err}")))
    }

    pub async fn op_readdir(
        &self,
        path: &str,
        uid: u32,
        gid: u32,
    ) -> Result<Vec<(String, FileKind)>> {
        self.validate_path(path)?;
        let node = self.get_node(path, uid, gid, false).await?;
        self.get_children(node).await?;
        self.check_access(node, uid, gid, libc::R_OK as u32)?;
        Ok(self.with_tree(|t| {
            t.children(node)
                .into_iter()
                .map(|c| {
                    let e = t.entry(c);
                    (t.node(c).file_name.clone(), kind_of(e, t.node(c).link))
                })
                .collect()
        }))
    }

    pub async fn op_access(&self, path: &str, mask: u32, uid: u32, gid: u32) -> Result<()> {
        self.validate_path(path)?;
        let node = self.get_node(path, uid, gid, false).await?;
        if mask == libc::F_OK as u32 {
            return Ok(());
        }
        self.check_access(node, uid, gid, mask)
    }

    pub async fn op_statfs(&self, path: &str, uid: u32, gid: u32) -> Result<FsStat> {
        self.validate_path(path)?;
        let _ = self.get_node(path, uid, gid, false).await?;
        let total = self
            .bytes_total
            .load(std::sync::atomic::Ordering::Relaxed);
        let free = self.bytes_free.load(std::sync::atomic::Ordering::Relaxed);
        let bfree = free / FRAGMENT_SIZE;
        Ok(FsStat {
            bsize: BLOCK_SIZE,
            frsize: FRAGMENT_SIZE,
            blocks: total / FRAGMENT_SIZE,
            bfree,
            bavail: bfree,
            files: self.file_count(),
            namelen: self.cfg.name_max as u32,
        })
    }
}

fn kind_of(entry: &Entry, link: LinkKind) -> FileKind {
    if entry.is_dir {
        return FileKind::Directory;
    }
    match link {
        LinkKind::Symlink => FileKind::Symlink,
        LinkKind::Char => FileKind::Char,
        LinkKind::Block => FileKind::Block,
        LinkKind::Fifo => FileKind::Fifo,
        LinkKind::Socket => FileKind::Socket,
        LinkKind::Regular | LinkKind::Hardlink => FileKind::Regular,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthRecord, TokenStore};
    use crate::config::Config;
    use crate::tree::is_local_id;
    use std::sync::Arc;

    /// Stub remote: a fixed change token and an empty root listing, enough
    /// for path resolution without touching the real API.
    async fn stub_remote() -> String {
        use axum::{routing::get, Json, Router};
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new()
            .route(
                "/changes/startPageToken",
                get(|| async { Json(serde_json::json!({"startPageToken": "token-1"})) }),
            )
            .route(
                "/files",
                get(|| async { Json(serde_json::json!({"files": []})) }),
            );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    /// Drive against the stub with the root listing already warmed, so
    /// resolving "/" later reuses the cached change token.
    async fn make_drive() -> Drive {
        let dir = std::env::temp_dir().join(format!(
            "gdfs-rs-posix-test-{}",
            uuid::Uuid::new_v4().as_simple()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let base = stub_remote().await;
        let mut cfg = Config::for_dir(&dir);
        cfg.api_base = base.clone();
        cfg.upload_base = base.clone();
        cfg.about_url = format!("{base}/about");
        cfg.change_token_url = format!("{base}/changes/startPageToken?fields=startPageToken");
        let tokens = TokenStore::with_record(
            dir.join("gdfs.auth"),
            cfg.oauth_token_url.clone(),
            cfg.token_refresh_threshold,
            AuthRecord {
                access_token: "test".into(),
                refresh_token: "test".into(),
                expiry: now() + 100_000,
            },
        );
        let drive = Drive::new(cfg, Arc::new(tokens)).unwrap();
        drive.get_node("/", 0, 0, false).await.unwrap();
        drive
    }

    fn seed_file(drive: &Drive, name: &str, id: &str, mode: u32, uid: u32) -> NodeId {
        drive.with_tree(|t| {
            let root = t.root;
            t.insert_child(
                root,
                name,
                Entry::new(id, 0, false, 1, 1, uid, uid, mode),
                LinkKind::Regular,
                None,
            )
        })
    }

    #[test]
    fn permission_bits_owner_group_other() {
        // Owner read allowed, other write denied.
        assert!(file_access(1000, 1000, libc::R_OK as u32, 1000, 1000, 0o640).is_ok());
        assert!(file_access(1001, 1001, libc::W_OK as u32, 1000, 1000, 0o644).is_err());
        // Group read.
        assert!(file_access(1001, 1000, libc::R_OK as u32, 1000, 1000, 0o640).is_ok());
        // Root always reads and writes.
        assert!(file_access(0, 0, (libc::R_OK | libc::W_OK) as u32, 1000, 1000, 0o000).is_ok());
        // Root executes only with some x bit.
        assert!(file_access(0, 0, libc::X_OK as u32, 1000, 1000, 0o644).is_err());
        assert!(file_access(0, 0, libc::X_OK as u32, 1000, 1000, 0o100).is_ok());
    }

    #[test]
    fn path_helpers_split_like_libgen() {
        assert_eq!(dir_name("/a/b/c.txt"), "/a/b");
        assert_eq!(dir_name("/c.txt"), "/");
        assert_eq!(base_name("/a/b/c.txt"), "c.txt");
        assert_eq!(base_name("/c.txt"), "c.txt");
    }

    #[tokio::test]
    async fn getattr_on_seeded_file_needs_no_remote() {
        let drive = make_drive().await;
        seed_file(&drive, "a.txt", "id-a", 0o644, 1000);
        // search=true would try a refresh; mtime TTL makes it a no-op since
        // cached_time is fresh.
        let stat = drive.op_getattr("/a.txt", 1000, 1000).await.unwrap();
        assert_eq!(stat.kind, FileKind::Regular);
        assert_eq!(stat.mode, 0o644);
        assert_eq!(stat.nlink, 1);
    }

    #[tokio::test]
    async fn mknod_fifo_creates_local_only_node() {
        let drive = make_drive().await;
        drive
            .op_mknod("/pipe", libc::S_IFIFO | 0o600, 0, 1000, 1000)
            .await
            .unwrap();
        let stat = drive.op_getattr("/pipe", 1000, 1000).await.unwrap();
        assert_eq!(stat.kind, FileKind::Fifo);
        assert!(drive.queue.is_empty(), "device nodes must not hit the remote");
        let id = drive.with_tree(|t| {
            let n = t.find(t.root, "pipe").unwrap();
            t.entry(n).file_id.clone()
        });
        assert!(is_local_id(&id));
    }

    #[tokio::test]
    async fn symlink_round_trips_and_stays_local() {
        let drive = make_drive().await;
        drive
            .op_symlink("/somewhere/else", "/ln", 1000, 1000)
            .await
            .unwrap();
        let target = drive.op_readlink("/ln", 1000, 1000).await.unwrap();
        assert_eq!(target, "/somewhere/else");
        assert!(drive.queue.is_empty());

        let stat = drive.op_getattr("/ln", 1000, 1000).await.unwrap();
        assert_eq!(stat.kind, FileKind::Symlink);
        assert_eq!(stat.size, "/somewhere/else".len() as u64 + 1);
    }

    #[tokio::test]
    async fn link_bumps_refcount_and_getattr_reports_it() {
        let drive = make_drive().await;
        seed_file(&drive, "a.txt", "id-a", 0o644, 1000);
        drive.op_link("/a.txt", "/b.txt", 1000, 1000).await.unwrap();
        let stat = drive.op_getattr("/b.txt", 1000, 1000).await.unwrap();
        assert_eq!(stat.nlink, 2);
        assert_eq!(
            drive.with_tree(|t| t.nodes_for_id("id-a").len()),
            2,
            "secondary index tracks both nodes"
        );
    }

    #[tokio::test]
    async fn chmod_chown_restricted_to_owner_or_root() {
        let drive = make_drive().await;
        seed_file(&drive, "a.txt", "id-a", 0o644, 1000);

        assert!(matches!(
            drive.op_chmod("/a.txt", 0o600, 1001, 1001).await,
            Err(GdfsError::NotPermitted(_))
        ));
        drive.op_chmod("/a.txt", 0o600, 1000, 1000).await.unwrap();
        let stat = drive.op_getattr("/a.txt", 1000, 1000).await.unwrap();
        assert_eq!(stat.mode, 0o600);

        drive.op_chown("/a.txt", 1001, 1001, 0, 0).await.unwrap();
        let stat = drive.op_getattr("/a.txt", 0, 0).await.unwrap();
        assert_eq!(stat.uid, 1001);
    }

    #[tokio::test]
    async fn mutating_the_root_is_refused() {
        let drive = make_drive().await;
        assert!(matches!(
            drive.op_chmod("/", 0o700, 0, 0).await,
            Err(GdfsError::NotPermitted(_))
        ));
        assert!(matches!(
            drive.op_unlink("/", 0, 0).await,
            Err(GdfsError::NotPermitted(_))
        ));
        assert!(matches!(
            drive.op_rmdir("/", 0, 0).await,
            Err(GdfsError::NotPermitted(_))
        ));
    }

    #[tokio::test]
    async fn oversized_names_and_paths_are_rejected() {
        let drive = make_drive().await;
        let name_255 = "a".repeat(255);
        let name_256 = "a".repeat(256);

        // 255 passes the name gate (fails later on permissions only if any).
        let err = drive
            .op_mknod(&format!("/{name_256}"), libc::S_IFIFO, 0, 1000, 1000)
            .await
            .unwrap_err();
        assert!(matches!(err, GdfsError::NameTooLong(_)));
        drive
            .op_mknod(&format!("/{name_255}"), libc::S_IFIFO | 0o600, 0, 1000, 1000)
            .await
            .unwrap();

        // Path boundary: 4096 bytes passes the length gate (and then fails
        // resolution), 4097 is rejected outright.
        let mut at_limit = String::new();
        while at_limit.len() + 200 <= 4096 {
            at_limit.push('/');
            at_limit.push_str(&"c".repeat(199));
        }
        at_limit.push('/');
        at_limit.push_str(&"c".repeat(4096 - at_limit.len()));
        assert_eq!(at_limit.len(), 4096);
        assert!(matches!(
            drive.op_getattr(&at_limit, 1000, 1000).await,
            Err(GdfsError::NotFound(_))
        ));

        let over_limit = format!("{at_limit}c");
        assert!(matches!(
            drive.op_getattr(&over_limit, 1000, 1000).await,
            Err(GdfsError::NameTooLong(_))
        ));
    }

    #[tokio::test]
    async fn write_then_read_round_trips_through_the_cache() {
        let drive = make_drive().await;
        seed_file(&drive, "a.txt", "id-a", 0o644, 1000);
        let wrote = drive
            .op_write("/a.txt", 0, b"hello", 1000, 1000)
            .await
            .unwrap();
        assert_eq!(wrote, 5);
        let data = drive.op_read("/a.txt", 0, 5, 1000, 1000).await.unwrap();
        assert_eq!(data, b"hello");
    }

    #[tokio::test]
    async fn truncate_grow_zero_fills_and_shrink_drops_pages() {
        let drive = make_drive().await;
        seed_file(&drive, "a.txt", "id-a", 0o644, 1000);
        drive
            .op_write("/a.txt", 0, b"abcdefgh", 1000, 1000)
            .await
            .unwrap();

        drive.op_truncate("/a.txt", 4, 1000, 1000).await.unwrap();
        let stat = drive.op_getattr("/a.txt", 1000, 1000).await.unwrap();
        assert_eq!(stat.size, 4);
        let data = drive.op_read("/a.txt", 0, 4, 1000, 1000).await.unwrap();
        assert_eq!(data, b"abcd");

        drive.op_truncate("/a.txt", 6, 1000, 1000).await.unwrap();
        let data = drive.op_read("/a.txt", 0, 6, 1000, 1000).await.unwrap();
        assert_eq!(data, b"abcd\0\0");

        drive.op_truncate("/a.txt", 0, 1000, 1000).await.unwrap();
        assert_eq!(drive.cache.resident_bytes("id-a").await, Some(0));
    }

    #[tokio::test]
    async fn unlink_detaches_and_enqueues_delete() {
        let drive = make_drive().await;
        seed_file(&drive, "a.txt", "id-a", 0o644, 1000);
        drive.op_unlink("/a.txt", 1000, 1000).await.unwrap();

        assert!(matches!(
            drive.op_getattr("/a.txt", 1000, 1000).await,
            Err(_)
        ));
        let snapshot = drive.queue.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].0, "id-a");
    }

    #[tokio::test]
    async fn unlink_of_a_pending_create_cancels_both_sides() {
        let drive = make_drive().await;
        let node = seed_file(&drive, "fresh.txt", "id-fresh", 0o644, 1000);
        drive.with_tree(|t| t.entry_mut(node).pending_create = true);
        drive.queue.build_request(
            crate::queue::ReqItem::new(
                "id-fresh",
                crate::queue::ReqType::Insert,
                "http://unused/files",
            )
            .with_body(r#"{"id":"id-fresh","name":"fresh.txt"}"#)
            .with_node(node, "fresh.txt"),
        );

        drive.op_unlink("/fresh.txt", 1000, 1000).await.unwrap();

        // INSERT and DELETE cancel; no entry may be left both
        // pending_create and dirty.
        assert!(drive.queue.is_empty());
        assert!(drive.with_tree(|t| t.nodes_for_id("id-fresh").is_empty()));
    }

    #[tokio::test]
    async fn rename_within_a_directory_updates_tree_and_queue() {
        let drive = make_drive().await;
        seed_file(&drive, "x", "id-x", 0o644, 1000);
        drive.op_rename("/x", "/y", 1000, 1000).await.unwrap();

        assert!(drive.op_getattr("/y", 1000, 1000).await.is_ok());
        let snapshot = drive.queue.snapshot();
        assert_eq!(snapshot, vec![("id-x".to_string(), crate::queue::ReqType::Update)]);
    }

    #[tokio::test]
    async fn rename_there_and_back_restores_the_tree() {
        let drive = make_drive().await;
        seed_file(&drive, "x", "id-x", 0o644, 1000);
        drive.op_rename("/x", "/y", 1000, 1000).await.unwrap();
        drive.op_rename("/y", "/x", 1000, 1000).await.unwrap();

        let stat = drive.op_getattr("/x", 1000, 1000).await.unwrap();
        assert_eq!(stat.kind, FileKind::Regular);
        assert!(drive.op_getattr("/y", 1000, 1000).await.is_err());
        // The two renames collapse to one pending UPDATE for the id.
        assert_eq!(drive.queue.len(), 1);
    }
}
