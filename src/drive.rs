use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::auth::TokenStore;
use crate::cache::{EntryView, PageCache};
use crate::config::{Config, DEF_DIR_MODE, DEF_FILE_MODE, DEF_GDOC_MODE, ROOT_MODE};
use crate::errors::{GdfsError, Result};
use crate::http::{remote_error, DriveClient};
use crate::logging;
use crate::posix::file_access;
use crate::queue::{ReqItem, ReqType, RequestQueue};
use crate::tree::{
    is_local_id, is_old_name_conflict, new_local_id, now, resolve_name_conflict, DirTree, Entry,
    LinkKind, NodeId,
};

pub const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

const GDOC_MIMES: [&str; 4] = [
    "application/vnd.google-apps.document",
    "application/vnd.google-apps.spreadsheet",
    "application/vnd.google-apps.drawing",
    "application/vnd.google-apps.presentation",
];

pub fn rfc3339_to_sec(raw: &str) -> i64 {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|t| t.timestamp())
        .unwrap_or(0)
}

pub fn to_rfc3339(secs: i64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp(secs, 0)
        .unwrap_or_else(chrono::Utc::now)
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// (is_dir, g_doc) for a remote MIME type. Native documents have no binary
/// bytes on the server and are exported as PDF on read.
pub fn classify_mime(mime: &str) -> (bool, bool) {
    if mime == FOLDER_MIME {
        (true, false)
    } else {
        (false, GDOC_MIMES.contains(&mime))
    }
}

#[derive(Debug, Deserialize)]
struct ChildItem {
    id: String,
    name: String,
    #[serde(rename = "mimeType", default)]
    mime_type: String,
    #[serde(rename = "modifiedTime", default)]
    modified_time: String,
    #[serde(default)]
    size: Option<String>,
    #[serde(rename = "viewedByMeTime", default)]
    viewed_by_me_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListPage {
    #[serde(default)]
    files: Vec<ChildItem>,
    #[serde(rename = "nextPageToken", default)]
    next_page_token: Option<String>,
}

pub(crate) enum Outcome {
    Done,
    Retry,
}

/// C7: the remote coordinator. Owns the tree, the page cache, the request
/// queue and the pre-fetched id pool, and mediates every remote exchange.
pub struct Drive {
    pub cfg: Config,
    pub client: DriveClient,
    pub tree: StdMutex<DirTree>,
    pub cache: PageCache,
    pub queue: RequestQueue,
    id_pool: StdMutex<VecDeque<String>>,
    change_token: StdMutex<String>,
    pub uid: u32,
    pub gid: u32,
    pub mounting_time: i64,
    pub bytes_used: AtomicU64,
    pub bytes_total: AtomicU64,
    pub bytes_free: AtomicU64,
}

impl Drive {
    pub fn new(cfg: Config, tokens: Arc<TokenStore>) -> Result<Self> {
        let client = DriveClient::new(tokens)?;
        let mounting_time = now();
        let uid = unsafe { libc::getuid() };
        let gid = unsafe { libc::getgid() };
        let root_entry = Entry::new(
            "root",
            0,
            true,
            mounting_time,
            mounting_time,
            uid,
            gid,
            ROOT_MODE,
        );
        Ok(Drive {
            cache: PageCache::new(cfg.cache_max),
            cfg,
            client,
            tree: StdMutex::new(DirTree::new(root_entry)),
            queue: RequestQueue::new(),
            id_pool: StdMutex::new(VecDeque::new()),
            change_token: StdMutex::new(String::new()),
            uid,
            gid,
            mounting_time,
            bytes_used: AtomicU64::new(0),
            bytes_total: AtomicU64::new(0),
            bytes_free: AtomicU64::new(0),
        })
    }

    pub fn with_tree<R>(&self, f: impl FnOnce(&mut DirTree) -> R) -> R {
        let mut tree = self.tree.lock().unwrap();
        f(&mut tree)
    }

    pub fn entry_snapshot(&self, node: NodeId) -> Option<Entry> {
        let tree = self.tree.lock().unwrap();
        if !tree.contains(node) {
            return None;
        }
        Some(tree.entry(node).clone())
    }

    /// Captures the account storage quota that statfs reports.
    pub async fn get_root(&self) -> Result<()> {
        let url = format!(
            "{}?fields=storageQuota(limit,usageInDrive)",
            self.cfg.about_url
        );
        let val = self.client.get_json(&url).await?;
        if let Some((code, message)) = remote_error(&val) {
            return Err(GdfsError::remote(code, message));
        }
        let used = val["storageQuota"]["usageInDrive"]
            .as_str()
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| GdfsError::Integrity("about response missing usageInDrive".into()))?;
        // Accounts without an enforced quota report no limit.
        let total = val["storageQuota"]["limit"]
            .as_str()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(used);
        self.bytes_used.store(used, Ordering::Relaxed);
        self.bytes_total.store(total, Ordering::Relaxed);
        self.bytes_free
            .store(total.saturating_sub(used), Ordering::Relaxed);
        logging::info(format!("drive quota: {used} of {total} bytes used"));
        Ok(())
    }

    /// C4 path resolution. Walks component by component, pulling a fresh
    /// listing for a parent whose child is missing before giving up.
    pub async fn get_node(&self, path: &str, uid: u32, gid: u32, search: bool) -> Result<NodeId> {
        if path.is_empty() {
            return Err(GdfsError::Argument("empty path".into()));
        }
        let root = self.with_tree(|t| t.root);
        if path == "/" {
            self.get_children(root).await?;
            return Ok(root);
        }

        let comps: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        let last = comps.len().saturating_sub(1);
        let mut node = root;
        for (i, comp) in comps.iter().enumerate() {
            if comp.len() > self.cfg.name_max {
                return Err(GdfsError::NameTooLong(comp.to_string()));
            }
            let child = self.with_tree(|t| t.find(node, comp));
            let child = match child {
                Some(c) => c,
                None => {
                    self.get_children(node).await?;
                    self.with_tree(|t| t.find(node, comp)).ok_or_else(|| {
                        GdfsError::NotFound(format!("path component {comp} does not exist"))
                    })?
                }
            };
            node = child;

            if i < last {
                let (is_dir, e_uid, e_gid, mode) = self.with_tree(|t| {
                    let e = t.entry(node);
                    (e.is_dir, e.uid, e.gid, e.file_mode)
                });
                file_access(uid, gid, libc::X_OK as u32, e_uid, e_gid, mode).map_err(|_| {
                    GdfsError::Permission(format!("no execute permission on {comp}"))
                })?;
                if !is_dir {
                    return Err(GdfsError::NotDirectory(comp.to_string()));
                }
            }
        }

        let (dirty, mtime, local, is_dir, link, write, pending_get) = self.with_tree(|t| {
            let e = t.entry(node);
            (
                e.dirty,
                e.mtime,
                is_local_id(&e.file_id),
                e.is_dir,
                t.node(node).link,
                e.write,
                e.pending_get,
            )
        });
        if dirty {
            return Err(GdfsError::NotFound("path component does not exist".into()));
        }
        if search && mtime > 0 && !local && (is_dir || link == LinkKind::Regular) && !write {
            self.update_node(node).await?;
        } else if is_dir && pending_get {
            self.get_children(node).await?;
        }
        Ok(node)
    }

    /// Best-effort metadata refresh, gated by the metadata TTL. Native
    /// documents are refreshed by re-export instead of a metadata GET.
    pub async fn update_node(&self, node: NodeId) -> Result<()> {
        let Some(entry) = self.entry_snapshot(node) else {
            return Ok(());
        };
        if is_local_id(&entry.file_id) {
            return Ok(());
        }
        if now() - entry.cached_time <= self.cfg.metadata_ttl {
            logging::debug(format!("metadata for {} still fresh", entry.file_id));
            return Ok(());
        }
        if entry.g_doc {
            self.download_file(node).await?;
            return Ok(());
        }
        let url = format!(
            "{}?fields=modifiedTime%2Cname%2Csize",
            self.cfg.file_url(&entry.file_id)
        );
        let name = self.with_tree(|t| t.node(node).file_name.clone());
        self.queue.build_request(
            ReqItem::new(entry.file_id, ReqType::Get, url).with_node(node, name),
        );
        Ok(())
    }

    fn children_url(&self, parent_id: &str, page_token: Option<&str>) -> String {
        let mut url = format!(
            "{}?pageSize=1000&q='{}'+in+parents+and+trashed+%3D+false&orderBy=name&spaces=drive",
            self.cfg.files_url(),
            parent_id
        );
        if let Some(token) = page_token {
            url.push_str("&pageToken=");
            url.push_str(token);
        }
        url.push_str(
            "&fields=files(id%2CmimeType%2CmodifiedTime%2Cname%2Csize%2CviewedByMeTime)%2CnextPageToken",
        );
        url
    }

    async fn fetch_change_token(&self) -> Result<String> {
        loop {
            let val = self.client.get_json(&self.cfg.change_token_url).await?;
            if let Some(token) = val["startPageToken"].as_str() {
                return Ok(token.to_string());
            }
            match remote_error(&val) {
                Some((code, _)) if code == "403" => {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Some((code, message)) => return Err(GdfsError::remote(code, message)),
                None => {
                    return Err(GdfsError::Integrity(
                        "change response missing startPageToken".into(),
                    ))
                }
            }
        }
    }

    /// Parent modifiedTime, waiting out the window where a just-created
    /// directory has not landed on the remote yet.
    async fn fetch_parent_mtime(&self, parent_id: &str) -> Result<i64> {
        let url = format!("{}?fields=modifiedTime", self.cfg.file_url(parent_id));
        let mut attempts = 0;
        loop {
            let val = self.client.get_json(&url).await?;
            if let Some(m) = val["modifiedTime"].as_str() {
                return Ok(rfc3339_to_sec(m));
            }
            match remote_error(&val) {
                Some((code, _)) if code == "403" => {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Some((code, _)) if code == "404" => {
                    attempts += 1;
                    if attempts >= 5 {
                        return Err(GdfsError::NotFound(
                            "directory not found when retrieving children".into(),
                        ));
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Some((code, message)) => return Err(GdfsError::remote(code, message)),
                None => {
                    return Err(GdfsError::Integrity(
                        "metadata response missing modifiedTime".into(),
                    ))
                }
            }
        }
    }

    /// C7 listing: change detection, paginated ingestion with conflict
    /// suffixing, and pruning of children the server no longer has.
    pub async fn get_children(&self, parent: NodeId) -> Result<()> {
        let snapshot = self.with_tree(|t| {
            if !t.contains(parent) {
                return None;
            }
            let pending_get = t.entry(parent).pending_get;
            if pending_get {
                t.entry_mut(parent).pending_get = false;
            }
            let e = t.entry(parent);
            Some((
                e.file_id.clone(),
                t.node(parent).parent.is_none(),
                e.mtime,
                pending_get,
                t.is_empty_dir(parent),
            ))
        });
        let Some((parent_id, is_root, parent_mtime, pending_get, no_children)) = snapshot else {
            return Ok(());
        };

        let mut dir_modified = pending_get;
        if !dir_modified {
            if is_root {
                let token = self.fetch_change_token().await?;
                let mut cached = self.change_token.lock().unwrap();
                if *cached != token {
                    *cached = token;
                    dir_modified = true;
                }
            } else {
                let mtime = self.fetch_parent_mtime(&parent_id).await?;
                if mtime > parent_mtime || no_children {
                    dir_modified = true;
                }
            }
        }
        if !dir_modified {
            logging::debug(format!("directory {parent_id} unchanged, serving cached listing"));
            return Ok(());
        }

        let mut observed: HashSet<String> = HashSet::new();
        let mut exports: Vec<NodeId> = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let url = self.children_url(&parent_id, page_token.as_deref());
            let val = self.client.get_json(&url).await?;
            if let Some((code, message)) = remote_error(&val) {
                if code == "403" {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
                return Err(GdfsError::remote(code, message));
            }
            let page: ListPage = serde_json::from_value(val)
                .map_err(|e| GdfsError::Integrity(format!("bad listing page: {e}")))?;

            self.with_tree(|tree| {
                for child in &page.files {
                    self.ingest_child(tree, parent, child, &mut observed, &mut exports);
                }
            });

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        for node in exports {
            if let Err(err) = self.download_file(node).await {
                logging::error(format!("export download failed: {err}"));
            }
        }

        // The server no longer lists these children; drop them in memory.
        let purged = self.with_tree(|tree| {
            let mut stale = Vec::new();
            for child in tree.children(parent) {
                let e = tree.entry(child);
                if !observed.contains(&e.file_id)
                    && !is_local_id(&e.file_id)
                    && !e.file_open
                    && !e.dirty
                    && !e.pending_create
                {
                    stale.push(child);
                }
            }
            let mut purged = Vec::new();
            for node in stale {
                purged.extend(tree.destroy_subtree(node));
            }
            purged
        });
        for file_id in purged {
            self.cache.remove(&file_id).await;
        }
        Ok(())
    }

    fn ingest_child(
        &self,
        tree: &mut DirTree,
        parent: NodeId,
        child: &ChildItem,
        observed: &mut HashSet<String>,
        exports: &mut Vec<NodeId>,
    ) {
        let mut file_name = child.name.replace('/', "_");
        let (is_dir, g_doc) = classify_mime(&child.mime_type);
        if g_doc {
            file_name.push_str(".pdf");
        }
        let mtime = rfc3339_to_sec(&child.modified_time);
        let atime = child
            .viewed_by_me_time
            .as_deref()
            .map(rfc3339_to_sec)
            .unwrap_or(mtime);
        let file_size: u64 = if is_dir || g_doc {
            0
        } else {
            child
                .size
                .as_deref()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0)
        };

        if let Some(node) = tree.nodes_for_id(&child.id).first().copied() {
            {
                let e = tree.entry(node);
                if e.dirty {
                    return;
                }
                if e.write {
                    observed.insert(child.id.clone());
                    return;
                }
                if e.g_doc && e.mtime < mtime {
                    exports.push(node);
                } else if e.is_dir && e.mtime < mtime {
                    tree.entry_mut(node).pending_get = true;
                }
            }

            let node_name = tree.node(node).file_name.clone();
            if file_name != node_name
                && !g_doc
                && !is_old_name_conflict(&file_name, &node_name)
                && tree.node(node).link != LinkKind::Hardlink
            {
                if let Some(par) = tree.node(node).parent {
                    let unique = resolve_name_conflict(tree, par, &file_name, is_dir);
                    tree.rename_child(par, &node_name, &unique);
                }
            }

            let e = tree.entry_mut(node);
            if !e.g_doc && !e.write {
                e.file_size = file_size;
            }
            e.atime = atime;
            e.mtime = mtime;
            observed.insert(child.id.clone());
        } else {
            let mode = if g_doc {
                DEF_GDOC_MODE
            } else if is_dir {
                DEF_DIR_MODE
            } else {
                DEF_FILE_MODE
            };
            let unique = resolve_name_conflict(tree, parent, &file_name, is_dir);
            let entry = Entry::new(
                child.id.clone(),
                file_size,
                is_dir,
                atime,
                mtime,
                self.uid,
                self.gid,
                mode,
            )
            .with_mime(child.mime_type.clone(), g_doc);
            let node = tree.insert_child(parent, unique, entry, LinkKind::Regular, None);
            if g_doc {
                exports.push(node);
            }
            observed.insert(child.id.clone());
        }
    }

    /// Refills the shared id pool once it runs low. The request itself is
    /// deduplicated by the queue.
    pub fn generate_file_id(&self) {
        let len = self.id_pool.lock().unwrap().len();
        if len <= 100 {
            let url = format!(
                "{}/generateIds?count=1000&space=drive&fields=ids",
                self.cfg.files_url()
            );
            self.queue
                .build_request(ReqItem::new("", ReqType::GenerateId, url));
        }
    }

    /// Pops a server-issued id, waiting for an in-flight replenishment when
    /// the pool is empty.
    pub async fn take_file_id(&self) -> Result<String> {
        self.generate_file_id();
        for _ in 0..100 {
            if let Some(id) = self.id_pool.lock().unwrap().pop_front() {
                return Ok(id);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.generate_file_id();
        }
        Err(GdfsError::Again("file id pool is empty".into()))
    }

    pub async fn make_dir(
        &self,
        parent: NodeId,
        file_name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<NodeId> {
        let file_id = self.take_file_id().await?;
        let parent_id = self.with_tree(|t| t.entry(parent).file_id.clone());
        let body = json!({
            "id": file_id,
            "name": file_name,
            "mimeType": FOLDER_MIME,
            "parents": [parent_id],
        })
        .to_string();
        let mtime = now();
        let node = self.with_tree(|t| {
            t.insert_child(
                parent,
                file_name,
                Entry::new(file_id.clone(), 0, true, mtime, mtime, uid, gid, mode),
                LinkKind::Regular,
                None,
            )
        });
        let url = format!("{}?fields=modifiedTime", self.cfg.files_url());
        self.queue.build_request(
            ReqItem::new(file_id, ReqType::Insert, url)
                .with_body(body)
                .with_node(node, file_name),
        );
        Ok(node)
    }

    pub async fn make_file(
        &self,
        parent: NodeId,
        file_name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<NodeId> {
        // Hidden files exist locally only and get a sentinel id.
        let local = file_name.starts_with('.');
        let file_id = if local {
            new_local_id()
        } else {
            self.take_file_id().await?
        };
        let parent_id = self.with_tree(|t| t.entry(parent).file_id.clone());
        let body = json!({
            "id": file_id,
            "name": file_name,
            "parents": [parent_id],
        })
        .to_string();
        let mtime = now();
        let node = self.with_tree(|t| {
            let node = t.insert_child(
                parent,
                file_name,
                Entry::new(file_id.clone(), 0, false, mtime, mtime, uid, gid, mode),
                LinkKind::Regular,
                None,
            );
            if !local {
                t.entry_mut(node).pending_create = true;
            }
            node
        });
        if !local {
            let url = format!("{}?fields=modifiedTime", self.cfg.files_url());
            self.queue.build_request(
                ReqItem::new(file_id, ReqType::Insert, url)
                    .with_body(body)
                    .with_node(node, file_name),
            );
        }
        Ok(node)
    }

    /// Removes a file or directory subtree from the tree. With `delete_req`,
    /// a remote DELETE is enqueued and the detached node lives on (marked
    /// dirty, invisible to resolution) until the worker confirms.
    pub async fn delete_file(&self, node: NodeId, delete_req: bool) -> Result<()> {
        let (purges, request) = self.with_tree(|tree| {
            let e = tree.entry(node).clone();
            tree.detach(node);

            let keep_for_worker = !is_local_id(&e.file_id)
                && delete_req
                && (e.ref_count == 1 || (e.is_dir && e.ref_count <= 2));

            let mut purges = Vec::new();
            let mut request = None;
            if keep_for_worker {
                {
                    let entry = tree.entry_mut(node);
                    entry.dirty = true;
                    // A delete supersedes any unacknowledged create.
                    entry.pending_create = false;
                }
                if !e.is_dir {
                    purges.push(e.file_id.clone());
                }
                for child in tree.children(node) {
                    purges.extend(tree.destroy_subtree(child));
                }
                let name = tree.node(node).file_name.clone();
                request = Some(
                    ReqItem::new(
                        e.file_id.clone(),
                        ReqType::Delete,
                        self.cfg.file_url(&e.file_id),
                    )
                    .with_node(node, name),
                );
            } else {
                purges.extend(tree.destroy_subtree(node));
            }
            (purges, request)
        });

        for file_id in purges {
            self.cache.remove(&file_id).await;
        }
        if let Some(req) = request {
            let id = req.id.clone();
            self.queue.build_request(req);
            // When the delete cancelled a still-queued INSERT, neither side
            // reaches the remote and no worker will ever confirm; the node
            // goes away here instead.
            let cancelled = !self.queue.snapshot().iter().any(|(qid, _)| *qid == id);
            if cancelled {
                self.with_tree(|tree| {
                    if tree.contains(node) {
                        tree.destroy_node(node);
                    }
                });
            }
        }
        Ok(())
    }

    /// Renames in place and mirrors the rename remotely. `new_parent_id` is
    /// set for cross-directory moves. Dot-involved names stay local.
    pub fn enqueue_rename(&self, node: NodeId, old_name: &str, new_parent_id: Option<String>) {
        let (file_id, new_name) = self.with_tree(|t| {
            (t.entry(node).file_id.clone(), t.node(node).file_name.clone())
        });
        if is_local_id(&file_id) || old_name.starts_with('.') {
            return;
        }
        let mut body = json!({ "name": new_name });
        if let Some(parent_id) = new_parent_id {
            body["parents"] = json!([parent_id]);
        }
        let url = format!("{}?fields=modifiedTime", self.cfg.file_url(&file_id));
        self.queue.build_request(
            ReqItem::new(file_id, ReqType::Update, url)
                .with_body(body.to_string())
                .with_node(node, new_name),
        );
    }

    /// Pushes a utime change remotely through the merge-friendly UPDATE.
    pub fn enqueue_utime(&self, node: NodeId) {
        let Some(entry) = self.entry_snapshot(node) else {
            return;
        };
        if is_local_id(&entry.file_id) {
            return;
        }
        let name = self.with_tree(|t| t.node(node).file_name.clone());
        let body = json!({
            "modifiedTime": to_rfc3339(entry.mtime),
            "viewedByMeTime": to_rfc3339(entry.atime),
        })
        .to_string();
        let url = format!("{}?fields=modifiedTime", self.cfg.file_url(&entry.file_id));
        self.queue.build_request(
            ReqItem::new(entry.file_id, ReqType::Update, url)
                .with_body(body)
                .with_node(node, name),
        );
    }

    async fn download_with_retry(&self, url: &str, range: Option<(u64, u64)>) -> Result<Vec<u8>> {
        loop {
            let res = match range {
                Some((start, stop)) => self.client.download_range(url, start, stop).await,
                None => self.client.download(url).await,
            };
            match res {
                Ok(bytes) => return Ok(bytes),
                Err(err) if err.remote_code() == Some("503") => {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Missing-range fetch the page cache calls into.
    pub async fn fetch_range(
        &self,
        file_id: &str,
        g_doc: bool,
        start: u64,
        stop: u64,
    ) -> Result<Vec<u8>> {
        if g_doc {
            let url = format!(
                "{}/export?mimeType=application%2Fpdf",
                self.cfg.file_url(file_id)
            );
            return self.download_with_retry(&url, None).await;
        }
        let url = format!("{}?alt=media", self.cfg.file_url(file_id));
        self.download_with_retry(&url, Some((start, stop))).await
    }

    /// Exports a native document as PDF and replaces the file's cache
    /// contents wholesale.
    pub async fn download_file(&self, node: NodeId) -> Result<()> {
        let Some(entry) = self.entry_snapshot(node) else {
            return Ok(());
        };
        let url = format!(
            "{}/export?mimeType=application%2Fpdf",
            self.cfg.file_url(&entry.file_id)
        );
        let bytes = self.download_with_retry(&url, None).await?;
        let mtime = now();
        self.with_tree(|t| {
            if t.contains(node) {
                let e = t.entry_mut(node);
                e.mtime = mtime;
                e.ctime = mtime;
                e.file_size = bytes.len() as u64;
            }
        });
        self.cache
            .put(&entry.file_id, Some(&bytes), 0, mtime, true)
            .await?;
        Ok(())
    }

    /// §4.4 resumable upload of a dirty file, synchronous with release.
    pub async fn write_file(&self, node: NodeId) -> Result<()> {
        let Some(entry) = self.entry_snapshot(node) else {
            return Ok(());
        };
        if is_local_id(&entry.file_id) || entry.file_size == 0 {
            return Ok(());
        }
        let file_id = entry.file_id.clone();
        let file_size = entry.file_size;
        let chunk = self.cfg.upload_chunk;

        let init_url = format!(
            "{}?uploadType=resumable&fields=modifiedTime",
            self.cfg.upload_url(&file_id)
        );
        let init_body = json!({ "modifiedTime": to_rfc3339(entry.mtime) }).to_string();
        let mime_hint = if entry.mime_type.is_empty() {
            None
        } else {
            Some(entry.mime_type.as_str())
        };
        let session = self
            .client
            .upload_session_init(&init_url, &init_body, mime_hint)
            .await?;

        let view = EntryView {
            mtime: entry.mtime,
            file_size,
            g_doc: entry.g_doc,
        };
        let mut start = 0u64;
        let mut stop = (file_size - 1).min(chunk - 1);
        loop {
            let got = self
                .cache
                .get(&file_id, start, stop - start + 1, &view, |s, e| {
                    self.fetch_range(&file_id, entry.g_doc, s, e)
                })
                .await?;

            let content_range = format!("bytes {start}-{stop}/{file_size}");
            let status = loop {
                let st = self
                    .client
                    .upload_chunk(&session, got.data.clone(), &content_range)
                    .await?;
                // The session endpoint 404s briefly right after init.
                if let Ok(val) = serde_json::from_str::<Value>(&st.body) {
                    if let Some((code, _)) = remote_error(&val) {
                        if code == "404" {
                            tokio::time::sleep(Duration::from_secs(1)).await;
                            continue;
                        }
                    }
                }
                break st;
            };
            if status.status == 200 || status.status == 201 {
                break;
            }

            let range_end = match status.range_end {
                Some(n) => n,
                None => {
                    // Probe until the server reveals how much it holds.
                    let mut recovered = None;
                    for _ in 0..10 {
                        let probe = self
                            .client
                            .upload_chunk(&session, Vec::new(), &format!("bytes */{file_size}"))
                            .await?;
                        if probe.status == 200 || probe.status == 201 {
                            recovered = Some(file_size);
                            break;
                        }
                        if let Some(n) = probe.range_end {
                            recovered = Some(n);
                            break;
                        }
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                    match recovered {
                        Some(n) if n >= file_size => break,
                        Some(n) => n,
                        None => {
                            return Err(GdfsError::Transport(
                                "unable to complete the upload session".into(),
                            ))
                        }
                    }
                }
            };
            start = range_end + 1;
            if start >= file_size {
                break;
            }
            stop = (file_size - 1).min(start + chunk - 1);
        }
        Ok(())
    }

    pub fn file_count(&self) -> u64 {
        self.with_tree(|t| t.node_count())
    }

    // Worker dispatch.

    pub(crate) async fn send_request(&self, item: &ReqItem) -> Outcome {
        match item.req_type {
            ReqType::Get => self.send_get_req(item).await,
            ReqType::Insert => self.send_insert_req(item).await,
            ReqType::Update => self.send_update_req(item).await,
            ReqType::Delete => self.send_delete_req(item).await,
            ReqType::Upload => self.send_upload_req(item).await,
            ReqType::GenerateId => self.send_generate_id_req(item).await,
        }
    }

    async fn send_get_req(&self, item: &ReqItem) -> Outcome {
        let Some(node) = item.node else {
            return Outcome::Done;
        };
        let val = match self.client.get_json(&item.url).await {
            Ok(v) => v,
            Err(err) => {
                logging::error(format!("metadata get failed: {err}"));
                return Outcome::Done;
            }
        };
        if let Some((code, message)) = remote_error(&val) {
            if code == "403" {
                return Outcome::Retry;
            }
            logging::error(format!("drive error {code}: {message}"));
            return Outcome::Done;
        }
        let Some(modified) = val["modifiedTime"].as_str() else {
            logging::error("metadata response missing modifiedTime".to_string());
            return Outcome::Done;
        };
        let remote_mtime = rfc3339_to_sec(modified);

        let needs_export = self.with_tree(|tree| {
            if !tree.contains(node) {
                return false;
            }
            if remote_mtime <= tree.entry(node).mtime {
                tree.entry_mut(node).cached_time = now();
                return false;
            }
            let needs_export = tree.entry(node).g_doc;
            {
                let e = tree.entry_mut(node);
                e.mtime = remote_mtime;
                e.ctime = remote_mtime;
            }

            if let Some(name) = val["name"].as_str() {
                let remote_name = name.replace('/', "_");
                let node_name = tree.node(node).file_name.clone();
                if remote_name != node_name && !is_old_name_conflict(&remote_name, &node_name) {
                    if let Some(par) = tree.node(node).parent {
                        let is_dir = tree.entry(node).is_dir;
                        let unique = resolve_name_conflict(tree, par, &remote_name, is_dir);
                        tree.rename_child(par, &node_name, &unique);
                    }
                }
            }
            {
                let e = tree.entry_mut(node);
                if !e.g_doc && !e.is_dir {
                    if let Some(size) = val["size"].as_str().and_then(|s| s.parse().ok()) {
                        e.file_size = size;
                    }
                }
                e.cached_time = now();
            }
            needs_export
        });
        if needs_export {
            if let Err(err) = self.download_file(node).await {
                logging::error(format!("export refresh failed: {err}"));
            }
        }
        Outcome::Done
    }

    async fn send_insert_req(&self, item: &ReqItem) -> Outcome {
        let mut attempts = 0;
        loop {
            let val = match self.client.post_json(&item.url, &item.body).await {
                Ok(v) => v,
                Err(err) => {
                    logging::error(format!("insert failed: {err}"));
                    return Outcome::Done;
                }
            };
            if let Some((code, message)) = remote_error(&val) {
                if code == "403" {
                    return Outcome::Retry;
                }
                // A create can 404 while the freshly generated id propagates.
                if code == "404" {
                    attempts += 1;
                    if attempts < 5 {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                }
                logging::error(format!("drive error {code}: {message}"));
                return Outcome::Done;
            }
            let mtime = val["modifiedTime"].as_str().map(rfc3339_to_sec);
            self.with_tree(|tree| {
                if let Some(node) = item.node {
                    if tree.contains(node) {
                        let e = tree.entry_mut(node);
                        e.pending_create = false;
                        if let Some(t) = mtime {
                            e.mtime = t;
                            e.ctime = t;
                        }
                    }
                }
            });
            return Outcome::Done;
        }
    }

    async fn send_update_req(&self, item: &ReqItem) -> Outcome {
        let val = match self.client.patch_json(&item.url, &item.body).await {
            Ok(v) => v,
            Err(err) => {
                logging::error(format!("update failed: {err}"));
                return Outcome::Done;
            }
        };
        if let Some((code, message)) = remote_error(&val) {
            if code == "403" {
                return Outcome::Retry;
            }
            logging::error(format!("drive error {code}: {message}"));
            return Outcome::Done;
        }
        // No error field means the PATCH landed, with or without a
        // modifiedTime echo.
        let mtime = val["modifiedTime"].as_str().map(rfc3339_to_sec);
        self.with_tree(|tree| {
            if let Some(node) = item.node {
                if tree.contains(node) {
                    if let Some(t) = mtime {
                        let e = tree.entry_mut(node);
                        e.mtime = t;
                        e.ctime = t;
                    }
                }
            }
        });
        Outcome::Done
    }

    async fn send_delete_req(&self, item: &ReqItem) -> Outcome {
        let resp = match self.client.delete(&item.url).await {
            Ok(r) => r,
            Err(err) => {
                logging::error(format!("delete failed: {err}"));
                return Outcome::Done;
            }
        };
        if let Some(val) = resp {
            if let Some((code, message)) = remote_error(&val) {
                if code == "403" || code == "404" {
                    return Outcome::Retry;
                }
                logging::error(format!("drive error {code}: {message}"));
                return Outcome::Done;
            }
        }
        // Terminal success: drop the detached node and its index slot.
        self.with_tree(|tree| {
            if let Some(node) = item.node {
                if tree.contains(node) {
                    tree.destroy_node(node);
                }
            }
        });
        Outcome::Done
    }

    async fn send_upload_req(&self, item: &ReqItem) -> Outcome {
        let content_range = item
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("Content-Range"))
            .map(|(_, v)| v.clone())
            .unwrap_or_default();
        let status = match self
            .client
            .upload_chunk(&item.url, item.body.clone().into_bytes(), &content_range)
            .await
        {
            Ok(s) => s,
            Err(err) => {
                logging::error(format!("upload chunk failed: {err}"));
                return Outcome::Done;
            }
        };
        if let Ok(val) = serde_json::from_str::<Value>(&status.body) {
            if let Some((code, message)) = remote_error(&val) {
                if code == "403" {
                    return Outcome::Retry;
                }
                logging::error(format!("drive error {code}: {message}"));
            }
        }
        Outcome::Done
    }

    async fn send_generate_id_req(&self, item: &ReqItem) -> Outcome {
        let val = match self.client.get_json(&item.url).await {
            Ok(v) => v,
            Err(err) => {
                logging::error(format!("id generation failed: {err}"));
                return Outcome::Done;
            }
        };
        if let Some((code, message)) = remote_error(&val) {
            if code == "403" {
                return Outcome::Retry;
            }
            logging::error(format!("drive error {code}: {message}"));
            return Outcome::Done;
        }
        if let Some(ids) = val["ids"].as_array() {
            let mut pool = self.id_pool.lock().unwrap();
            pool.extend(ids.iter().filter_map(|v| v.as_str().map(String::from)));
        }
        Outcome::Done
    }
}

/// Spawns the worker pool. Each worker drains the queue until shutdown;
/// retryable failures sleep a beat and go back to the front of the queue.
pub fn spawn_workers(drive: &Arc<Drive>) -> Vec<JoinHandle<()>> {
    (0..drive.cfg.worker_threads)
        .map(|_| {
            let drive = drive.clone();
            tokio::spawn(async move {
                while let Some(item) = drive.queue.next().await {
                    match drive.send_request(&item).await {
                        Outcome::Done => {}
                        Outcome::Retry => {
                            tokio::time::sleep(Duration::from_secs(1)).await;
                            drive.queue.requeue_front(item);
                        }
                    }
                }
            })
        })
        .collect()
}
