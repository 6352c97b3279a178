use std::collections::VecDeque;
use std::sync::Mutex as StdMutex;

use serde_json::Value;
use tokio::sync::Semaphore;

use crate::tree::{is_local_id, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqType {
    Get,
    Update,
    Insert,
    Delete,
    Upload,
    GenerateId,
}

/// One pending remote mutation. `file_name` rides along so the enqueue path
/// can apply the hidden-file drop without consulting the tree.
#[derive(Debug, Clone)]
pub struct ReqItem {
    pub id: String,
    pub req_type: ReqType,
    pub url: String,
    pub body: String,
    pub headers: Vec<(String, String)>,
    pub node: Option<NodeId>,
    pub file_name: Option<String>,
}

impl ReqItem {
    pub fn new(id: impl Into<String>, req_type: ReqType, url: impl Into<String>) -> Self {
        ReqItem {
            id: id.into(),
            req_type,
            url: url.into(),
            body: String::new(),
            headers: Vec::new(),
            node: None,
            file_name: None,
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_node(mut self, node: NodeId, file_name: impl Into<String>) -> Self {
        self.node = Some(node);
        self.file_name = Some(file_name.into());
        self
    }

    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers = headers;
        self
    }
}

/// C6: FIFO of pending remote mutations with a counting semaphore for worker
/// wakeups. `build_request` is the sole enqueue path and implements the
/// merge/cancel table; closing the semaphore is the kill signal.
pub struct RequestQueue {
    items: StdMutex<VecDeque<ReqItem>>,
    sem: Semaphore,
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestQueue {
    pub fn new() -> Self {
        RequestQueue {
            items: StdMutex::new(VecDeque::new()),
            sem: Semaphore::new(0),
        }
    }

    /// Resolves the new item against any pending item with the same id and
    /// enqueues the outcome. Hidden files (dot-prefixed names) and local-only
    /// sentinel ids never generate remote traffic and are dropped here,
    /// uniformly for every caller.
    pub fn build_request(&self, item: ReqItem) {
        if let Some(name) = &item.file_name {
            if name.starts_with('.') {
                return;
            }
        }
        if !item.id.is_empty() && is_local_id(&item.id) {
            return;
        }

        let mut items = self.items.lock().unwrap();
        let pos = items.iter().position(|pending| pending.id == item.id);
        let Some(pos) = pos else {
            items.push_back(item);
            self.sem.add_permits(1);
            return;
        };

        let pending_type = items[pos].req_type;
        use ReqType::*;
        match (item.req_type, pending_type) {
            // A pending request for the id already covers a repeat.
            (Get, _) | (GenerateId, GenerateId) => {}

            (Insert, Get) | (Insert, Insert) => {}
            (Insert, Update) => {
                let merged = merge_bodies(&item.body, &items[pos].body);
                items[pos].body = merged;
            }
            (Insert, Delete) => {
                // The delete never went out; the object lives on.
                items.remove(pos);
            }
            (Insert, Upload) => {
                items.push_back(item);
                self.sem.add_permits(1);
            }

            (Update, Get) => {}
            (Update, Insert) | (Update, Update) => {
                let merged = merge_bodies(&item.body, &items[pos].body);
                items[pos].body = merged;
            }
            (Update, Delete) => {}
            (Update, Upload) => {
                items.push_back(item);
                self.sem.add_permits(1);
            }

            (Delete, Get) | (Delete, Update) | (Delete, Upload) => {
                // The pending request is moot once the object is going away.
                items[pos] = item;
            }
            (Delete, Insert) => {
                // Never reached the remote; cancel both sides.
                items.remove(pos);
            }
            (Delete, Delete) => {}

            (Upload, Delete) => {}
            (Upload, _) => {
                items.push_back(item);
                self.sem.add_permits(1);
            }

            (GenerateId, _) | (_, GenerateId) => {
                // Distinct ids in practice; nothing to fold.
                items.push_back(item);
                self.sem.add_permits(1);
            }
        }
    }

    /// Blocks until an item is available; returns None once the queue is
    /// shut down (remaining items are discarded).
    pub async fn next(&self) -> Option<ReqItem> {
        loop {
            let permit = self.sem.acquire().await.ok()?;
            permit.forget();
            let popped = self.items.lock().unwrap().pop_front();
            if let Some(item) = popped {
                return Some(item);
            }
        }
    }

    /// Retryable failure: back to the front so ordering per id holds.
    pub fn requeue_front(&self, item: ReqItem) {
        self.items.lock().unwrap().push_front(item);
        self.sem.add_permits(1);
    }

    pub fn shutdown(&self) {
        self.sem.close();
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().unwrap().is_empty()
    }

    /// (id, type) pairs in queue order, for assertions.
    pub fn snapshot(&self) -> Vec<(String, ReqType)> {
        self.items
            .lock()
            .unwrap()
            .iter()
            .map(|i| (i.id.clone(), i.req_type))
            .collect()
    }
}

/// Field-wise merge of two JSON mutation bodies. The new body wins for
/// `name`, `mimeType`, `modifiedTime`, `viewedByMeTime` and `parents`; `id`
/// is taken from the existing body.
pub fn merge_bodies(new_body: &str, existing_body: &str) -> String {
    let new_val: Value = serde_json::from_str(new_body).unwrap_or(Value::Null);
    let old_val: Value = serde_json::from_str(existing_body).unwrap_or(Value::Null);

    let mut out = serde_json::Map::new();
    if let Some(id) = old_val.get("id").or_else(|| new_val.get("id")) {
        out.insert("id".to_string(), id.clone());
    }
    for key in ["name", "mimeType", "modifiedTime", "viewedByMeTime"] {
        if let Some(v) = new_val.get(key).or_else(|| old_val.get(key)) {
            out.insert(key.to_string(), v.clone());
        }
    }
    if let Some(parents) = new_val.get("parents").or_else(|| old_val.get("parents")) {
        // Drive mutations only ever carry a single parent.
        let first = parents.get(0).cloned();
        if let Some(first) = first {
            out.insert("parents".to_string(), Value::Array(vec![first]));
        }
    }
    Value::Object(out).to_string()
}
