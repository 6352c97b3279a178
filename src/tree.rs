use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

/// Prefix of identifiers minted locally for objects that must never touch
/// the remote (dot files, devices, symlinks, sockets, FIFOs).
pub const LOCAL_ID_PREFIX: &str = "null";

pub fn is_local_id(file_id: &str) -> bool {
    file_id.starts_with(LOCAL_ID_PREFIX)
}

pub fn new_local_id() -> String {
    format!("{LOCAL_ID_PREFIX}{}", uuid::Uuid::new_v4().as_simple())
}

pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

pub type NodeId = u64;
pub type EntryId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Regular,
    Symlink,
    Hardlink,
    Char,
    Block,
    Fifo,
    Socket,
}

/// Authoritative local view of one remote object.
#[derive(Debug, Clone)]
pub struct Entry {
    pub file_id: String,
    pub file_size: u64,
    pub ctime: i64,
    pub mtime: i64,
    pub atime: i64,
    pub cached_time: i64,
    pub uid: u32,
    pub gid: u32,
    pub file_mode: u32,
    pub dev: u64,
    pub is_dir: bool,
    pub mime_type: String,
    pub g_doc: bool,
    pub ref_count: u32,
    pub dirty: bool,
    pub pending_create: bool,
    pub file_open: bool,
    pub write: bool,
    pub pending_get: bool,
}

impl Entry {
    pub fn new(
        file_id: impl Into<String>,
        file_size: u64,
        is_dir: bool,
        atime: i64,
        mtime: i64,
        uid: u32,
        gid: u32,
        file_mode: u32,
    ) -> Self {
        Entry {
            file_id: file_id.into(),
            file_size,
            ctime: mtime,
            mtime,
            atime,
            cached_time: now(),
            uid,
            gid,
            file_mode,
            dev: 0,
            is_dir,
            mime_type: String::new(),
            g_doc: false,
            // A directory is referenced by itself and its parent.
            ref_count: if is_dir { 2 } else { 1 },
            dirty: false,
            pending_create: false,
            file_open: false,
            write: false,
            pending_get: false,
        }
    }

    pub fn with_mime(mut self, mime_type: impl Into<String>, g_doc: bool) -> Self {
        self.mime_type = mime_type.into();
        self.g_doc = g_doc;
        self
    }

    pub fn with_dev(mut self, dev: u64) -> Self {
        self.dev = dev;
        self
    }
}

/// One name in a parent's child map.
#[derive(Debug)]
pub struct Node {
    pub file_name: String,
    pub entry: EntryId,
    pub parent: Option<NodeId>,
    pub link: LinkKind,
    pub symlink_target: Option<String>,
    pub children: HashMap<String, NodeId>,
}

/// C4: hierarchical namespace held in handle-keyed arenas, with a secondary
/// multimap from remote id to the nodes referencing it (hard links make it a
/// multimap).
pub struct DirTree {
    nodes: HashMap<NodeId, Node>,
    entries: HashMap<EntryId, Entry>,
    by_file_id: HashMap<String, Vec<NodeId>>,
    pub root: NodeId,
    next_node: NodeId,
    next_entry: EntryId,
}

impl DirTree {
    pub fn new(root_entry: Entry) -> Self {
        let mut tree = DirTree {
            nodes: HashMap::new(),
            entries: HashMap::new(),
            by_file_id: HashMap::new(),
            root: 0,
            next_node: 1,
            next_entry: 1,
        };
        let file_id = root_entry.file_id.clone();
        let entry_id = tree.alloc_entry(root_entry);
        let root = tree.alloc_node(Node {
            file_name: "/".to_string(),
            entry: entry_id,
            parent: None,
            link: LinkKind::Regular,
            symlink_target: None,
            children: HashMap::new(),
        });
        tree.root = root;
        tree.by_file_id.insert(file_id, vec![root]);
        tree
    }

    fn alloc_entry(&mut self, entry: Entry) -> EntryId {
        let id = self.next_entry;
        self.next_entry += 1;
        self.entries.insert(id, entry);
        id
    }

    fn alloc_node(&mut self, node: Node) -> NodeId {
        let id = self.next_node;
        self.next_node += 1;
        self.nodes.insert(id, node);
        id
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[&id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes.get_mut(&id).expect("node handle out of arena")
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn entry(&self, node: NodeId) -> &Entry {
        let eid = self.nodes[&node].entry;
        &self.entries[&eid]
    }

    pub fn entry_mut(&mut self, node: NodeId) -> &mut Entry {
        let eid = self.nodes[&node].entry;
        self.entries.get_mut(&eid).expect("entry handle out of arena")
    }

    pub fn find(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.nodes.get(&parent)?.children.get(name).copied()
    }

    pub fn children(&self, parent: NodeId) -> Vec<NodeId> {
        self.nodes[&parent].children.values().copied().collect()
    }

    pub fn is_empty_dir(&self, node: NodeId) -> bool {
        self.nodes[&node].children.is_empty()
    }

    /// Nodes currently referencing `file_id`.
    pub fn nodes_for_id(&self, file_id: &str) -> Vec<NodeId> {
        self.by_file_id.get(file_id).cloned().unwrap_or_default()
    }

    /// Creates an entry + node under `parent` and indexes the remote id.
    pub fn insert_child(
        &mut self,
        parent: NodeId,
        name: impl Into<String>,
        entry: Entry,
        link: LinkKind,
        symlink_target: Option<String>,
    ) -> NodeId {
        let name = name.into();
        let file_id = entry.file_id.clone();
        let entry_id = self.alloc_entry(entry);
        let node = self.alloc_node(Node {
            file_name: name.clone(),
            entry: entry_id,
            parent: Some(parent),
            link,
            symlink_target,
            children: HashMap::new(),
        });
        self.node_mut(parent).children.insert(name, node);
        self.by_file_id.entry(file_id).or_default().push(node);
        node
    }

    /// Second node over an existing entry (hard link): bumps the ref count.
    pub fn link_child(&mut self, parent: NodeId, name: impl Into<String>, source: NodeId) -> NodeId {
        let name = name.into();
        let entry_id = self.nodes[&source].entry;
        let file_id = self.entries[&entry_id].file_id.clone();
        self.entries.get_mut(&entry_id).unwrap().ref_count += 1;
        let node = self.alloc_node(Node {
            file_name: name.clone(),
            entry: entry_id,
            parent: Some(parent),
            link: LinkKind::Hardlink,
            symlink_target: None,
            children: HashMap::new(),
        });
        self.node_mut(parent).children.insert(name, node);
        self.by_file_id.entry(file_id).or_default().push(node);
        node
    }

    /// Detaches `node` from its parent's child map. The node stays in the
    /// arena; subtree teardown is the caller's job.
    pub fn detach(&mut self, node: NodeId) {
        let (parent, name) = {
            let n = &self.nodes[&node];
            (n.parent, n.file_name.clone())
        };
        if let Some(parent) = parent {
            self.node_mut(parent).children.remove(&name);
        }
        self.node_mut(node).parent = None;
    }

    pub fn rename_child(&mut self, parent: NodeId, old_name: &str, new_name: &str) {
        if let Some(child) = self.node_mut(parent).children.remove(old_name) {
            self.node_mut(child).file_name = new_name.to_string();
            self.node_mut(parent)
                .children
                .insert(new_name.to_string(), child);
        }
    }

    /// Moves a node under a (possibly different) parent with a new name.
    pub fn reattach(&mut self, node: NodeId, new_parent: NodeId, new_name: &str) {
        self.detach(node);
        self.node_mut(node).file_name = new_name.to_string();
        self.node_mut(node).parent = Some(new_parent);
        self.node_mut(new_parent)
            .children
            .insert(new_name.to_string(), node);
    }

    /// Drops exactly this node: unindexes it, releases its entry reference
    /// and destroys the entry when the last reference is gone. The node must
    /// already be detached or is detached here.
    pub fn destroy_node(&mut self, node: NodeId) {
        self.detach(node);
        let entry_id = self.nodes[&node].entry;
        let file_id = self.entries[&entry_id].file_id.clone();
        if let Some(ids) = self.by_file_id.get_mut(&file_id) {
            if let Some(pos) = ids.iter().position(|&n| n == node) {
                ids.remove(pos);
            }
            if ids.is_empty() {
                self.by_file_id.remove(&file_id);
            }
        }
        self.nodes.remove(&node);

        let entry = self.entries.get_mut(&entry_id).unwrap();
        entry.ref_count = entry.ref_count.saturating_sub(1);
        if entry.ref_count == 0 || (entry.is_dir && entry.ref_count <= 1) {
            self.entries.remove(&entry_id);
        }
    }

    /// Recursively destroys `node` and everything below it, returning the
    /// file ids of regular entries whose last reference went away (callers
    /// purge those from the page cache).
    pub fn destroy_subtree(&mut self, node: NodeId) -> Vec<String> {
        let mut purged = Vec::new();
        let mut queue = vec![node];
        while let Some(n) = queue.pop() {
            queue.extend(self.nodes[&n].children.values().copied());
            let entry = self.entry(n);
            if !entry.is_dir && entry.ref_count == 1 {
                purged.push(entry.file_id.clone());
            }
            self.destroy_node(n);
        }
        purged
    }

    /// Swaps the remote id of a node's entry, keeping the index consistent.
    pub fn rekey_entry(&mut self, node: NodeId, new_file_id: impl Into<String>) {
        let new_file_id = new_file_id.into();
        let entry_id = self.nodes[&node].entry;
        let old = std::mem::replace(
            &mut self.entries.get_mut(&entry_id).unwrap().file_id,
            new_file_id.clone(),
        );
        if let Some(ids) = self.by_file_id.get_mut(&old) {
            if let Some(pos) = ids.iter().position(|&n| n == node) {
                ids.remove(pos);
            }
            if ids.is_empty() {
                self.by_file_id.remove(&old);
            }
        }
        self.by_file_id.entry(new_file_id).or_default().push(node);
    }

    /// Total number of nodes below the root (statfs inode count).
    pub fn node_count(&self) -> u64 {
        let mut count = 0;
        let mut queue = vec![self.root];
        while let Some(n) = queue.pop() {
            let children = &self.nodes[&n].children;
            count += children.len() as u64;
            queue.extend(children.values().copied());
        }
        count
    }
}

/// Generates a child name unique under `parent` by suffixing `_k` onto the
/// stem. Directories are not split into stem and extension.
pub fn resolve_name_conflict(
    tree: &DirTree,
    parent: NodeId,
    file_name: &str,
    is_dir: bool,
) -> String {
    if tree.find(parent, file_name).is_none() {
        return file_name.to_string();
    }
    let (stem, ext) = if is_dir {
        (file_name, "")
    } else {
        match file_name.rfind('.') {
            Some(idx) => file_name.split_at(idx),
            None => (file_name, ""),
        }
    };
    for k in 1u32.. {
        let candidate = format!("{stem}_{k}{ext}");
        if tree.find(parent, &candidate).is_none() {
            return candidate;
        }
    }
    unreachable!()
}

/// True when `old_name` is a historical disambiguation of `new_name`
/// (`<new_name>_<digits>`), so a listing refresh does not undo an earlier
/// conflict rename.
pub fn is_old_name_conflict(new_name: &str, old_name: &str) -> bool {
    static SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(?s)(.*)_[0-9]+$").unwrap());
    match SUFFIX.captures(old_name) {
        Some(caps) => &caps[1] == new_name,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree_with_root() -> DirTree {
        DirTree::new(Entry::new("root", 0, true, 0, 0, 1000, 1000, 0o777))
    }

    fn file_entry(id: &str) -> Entry {
        Entry::new(id, 0, false, 0, 0, 1000, 1000, 0o644)
    }

    #[test]
    fn child_names_are_unique_within_a_directory() {
        let mut tree = tree_with_root();
        let root = tree.root;
        tree.insert_child(root, "a.txt", file_entry("id-a"), LinkKind::Regular, None);
        let name = resolve_name_conflict(&tree, root, "a.txt", false);
        assert_eq!(name, "a_1.txt");
        tree.insert_child(root, &name, file_entry("id-a2"), LinkKind::Regular, None);
        assert_eq!(resolve_name_conflict(&tree, root, "a.txt", false), "a_2.txt");

        let names: std::collections::HashSet<_> = tree
            .children(root)
            .into_iter()
            .map(|n| tree.node(n).file_name.clone())
            .collect();
        assert_eq!(names.len(), tree.children(root).len());
    }

    #[test]
    fn directories_are_not_split_on_dot() {
        let mut tree = tree_with_root();
        let root = tree.root;
        tree.insert_child(
            root,
            "photos.old",
            Entry::new("id-d", 0, true, 0, 0, 1000, 1000, 0o755),
            LinkKind::Regular,
            None,
        );
        assert_eq!(
            resolve_name_conflict(&tree, root, "photos.old", true),
            "photos.old_1"
        );
    }

    #[test]
    fn historical_suffix_is_recognized() {
        assert!(is_old_name_conflict("report.pdf", "report.pdf_1"));
        assert!(is_old_name_conflict("report", "report_12"));
        assert!(!is_old_name_conflict("report", "report_1a"));
        assert!(!is_old_name_conflict("report", "other_1"));
    }

    #[test]
    fn ref_count_tracks_nodes_and_entry_destroyed_at_zero() {
        let mut tree = tree_with_root();
        let root = tree.root;
        let a = tree.insert_child(root, "a", file_entry("id-a"), LinkKind::Regular, None);
        assert_eq!(tree.entry(a).ref_count, 1);

        let b = tree.link_child(root, "b", a);
        assert_eq!(tree.entry(a).ref_count, 2);
        assert_eq!(tree.nodes_for_id("id-a").len(), 2);

        tree.destroy_node(b);
        assert_eq!(tree.entry(a).ref_count, 1);
        assert_eq!(tree.nodes_for_id("id-a"), vec![a]);

        tree.destroy_node(a);
        assert!(tree.nodes_for_id("id-a").is_empty());
        assert!(tree.find(root, "a").is_none());
    }

    #[test]
    fn destroy_subtree_reports_cache_purges() {
        let mut tree = tree_with_root();
        let root = tree.root;
        let dir = tree.insert_child(
            root,
            "d",
            Entry::new("id-d", 0, true, 0, 0, 1000, 1000, 0o755),
            LinkKind::Regular,
            None,
        );
        tree.insert_child(dir, "f1", file_entry("id-f1"), LinkKind::Regular, None);
        tree.insert_child(dir, "f2", file_entry("id-f2"), LinkKind::Regular, None);

        let mut purged = tree.destroy_subtree(dir);
        purged.sort();
        assert_eq!(purged, vec!["id-f1".to_string(), "id-f2".to_string()]);
        assert!(tree.find(root, "d").is_none());
        assert!(tree.nodes_for_id("id-f1").is_empty());
    }

    #[test]
    fn rename_and_reattach_rekey_the_child_map() {
        let mut tree = tree_with_root();
        let root = tree.root;
        let a = tree.insert_child(root, "a", file_entry("id-a"), LinkKind::Regular, None);

        tree.rename_child(root, "a", "b");
        assert!(tree.find(root, "a").is_none());
        assert_eq!(tree.find(root, "b"), Some(a));
        assert_eq!(tree.node(a).file_name, "b");

        let dir = tree.insert_child(
            root,
            "d",
            Entry::new("id-d", 0, true, 0, 0, 1000, 1000, 0o755),
            LinkKind::Regular,
            None,
        );
        tree.reattach(a, dir, "c");
        assert!(tree.find(root, "b").is_none());
        assert_eq!(tree.find(dir, "c"), Some(a));
        assert_eq!(tree.node(a).parent, Some(dir));
    }

    #[test]
    fn rekey_entry_moves_the_secondary_index() {
        let mut tree = tree_with_root();
        let root = tree.root;
        let a = tree.insert_child(root, "a", file_entry("id-old"), LinkKind::Regular, None);

        tree.rekey_entry(a, "id-new");
        assert!(tree.nodes_for_id("id-old").is_empty());
        assert_eq!(tree.nodes_for_id("id-new"), vec![a]);
        assert_eq!(tree.entry(a).file_id, "id-new");
    }

    #[test]
    fn local_ids_never_collide_with_remote_ids() {
        let id = new_local_id();
        assert!(is_local_id(&id));
        assert!(!is_local_id("1aBcD"));
    }

    #[test]
    fn node_count_walks_the_whole_tree() {
        let mut tree = tree_with_root();
        let root = tree.root;
        let dir = tree.insert_child(
            root,
            "d",
            Entry::new("id-d", 0, true, 0, 0, 1000, 1000, 0o755),
            LinkKind::Regular,
            None,
        );
        tree.insert_child(dir, "f", file_entry("id-f"), LinkKind::Regular, None);
        assert_eq!(tree.node_count(), 2);
    }
}
