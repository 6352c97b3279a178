use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};

use lru::LruCache;
use tokio::sync::Mutex;

use crate::errors::Result;
use crate::tree::now;

/// One contiguous byte range of a file, `[start, stop]` inclusive.
#[derive(Debug)]
pub struct Page {
    pub start: u64,
    pub stop: u64,
    pub buf: Vec<u8>,
}

impl Page {
    pub fn size(&self) -> u64 {
        self.stop - self.start + 1
    }
}

/// The slice of entry metadata the cache needs; the coordinator snapshots it
/// out of the tree so no tree lock is held across cache I/O.
#[derive(Debug, Clone, Copy)]
pub struct EntryView {
    pub mtime: i64,
    pub file_size: u64,
    pub g_doc: bool,
}

/// Result of a cache read: the assembled bytes plus, for non-native files,
/// the recomputed file size (sum of all resident page sizes).
#[derive(Debug)]
pub struct GetResult {
    pub data: Vec<u8>,
    pub file_size: Option<u64>,
}

/// Per-file ordered page set. Pages are disjoint and keyed by `start`;
/// `size` is the byte total over all pages.
#[derive(Debug, Default)]
pub struct FileBuf {
    pub mtime: i64,
    pub size: u64,
    pages: BTreeMap<u64, Page>,
}

impl FileBuf {
    pub fn clear_pages(&mut self) {
        self.pages.clear();
        self.size = 0;
        self.mtime = now();
    }

    fn insert_page(&mut self, start: u64, buf: Vec<u8>) {
        debug_assert!(!buf.is_empty());
        let stop = start + buf.len() as u64 - 1;
        self.size += buf.len() as u64;
        self.pages.insert(start, Page { start, stop, buf });
    }

    /// Writes `[start, start+buf.len()-1]`, overwriting overlapped bytes of
    /// existing pages in place and inserting new pages only for the ranges
    /// not already covered, so the set stays disjoint.
    pub fn put(&mut self, buf: &[u8], start: u64, mtime: i64) -> u64 {
        if buf.is_empty() {
            return 0;
        }
        let before = self.size;
        let stop = start + buf.len() as u64 - 1;
        let mut cur = start;

        let starts: Vec<u64> = self.pages.keys().copied().collect();
        for ps in starts {
            if cur > stop {
                break;
            }
            let (p_start, p_stop) = {
                let p = &self.pages[&ps];
                (p.start, p.stop)
            };
            if p_stop < cur {
                continue;
            }
            if p_start > stop {
                // The rest of the write fits in the gap before this page.
                self.insert_page(cur, buf[(cur - start) as usize..].to_vec());
                cur = stop + 1;
                break;
            }
            if cur < p_start {
                // Partial gap before an overlapping page.
                self.insert_page(cur, buf[(cur - start) as usize..(p_start - start) as usize].to_vec());
                cur = p_start;
            }
            // Overwrite the overlapped span of this page in place.
            let n = (p_stop.min(stop) - cur + 1) as usize;
            let p = self.pages.get_mut(&ps).unwrap();
            let off = (cur - p.start) as usize;
            p.buf[off..off + n].copy_from_slice(&buf[(cur - start) as usize..(cur - start) as usize + n]);
            if p_stop >= stop {
                cur = stop + 1;
                break;
            }
            cur = p_stop + 1;
        }
        if cur <= stop {
            self.insert_page(cur, buf[(cur - start) as usize..].to_vec());
        }

        self.mtime = mtime;
        self.size - before
    }

    /// Assembles `[start, stop]`, fetching missing subranges through
    /// `fetch`. Stale page sets (entry modified since caching) are dropped
    /// first; `stop` is clamped to the entry's file size.
    pub async fn get<F, Fut>(
        &mut self,
        start: u64,
        mut stop: u64,
        entry: &EntryView,
        fetch: F,
    ) -> Result<GetResult>
    where
        F: Fn(u64, u64) -> Fut,
        Fut: Future<Output = Result<Vec<u8>>>,
    {
        let mut file_size = entry.file_size;
        if entry.mtime > 0 {
            if self.mtime == 0 {
                self.mtime = entry.mtime;
            } else if entry.mtime > self.mtime {
                self.clear_pages();
                self.mtime = entry.mtime;
                file_size = 0;
            }
        }

        if file_size > 0 {
            stop = stop.min(file_size - 1);
        }
        if start > stop {
            return Ok(GetResult {
                data: Vec::new(),
                file_size: self.file_size_hint(entry),
            });
        }

        // A native document is a single exported page.
        if entry.g_doc {
            if self.pages.is_empty() {
                let bytes = fetch(0, if file_size > 0 { file_size - 1 } else { 0 }).await?;
                if !bytes.is_empty() {
                    self.insert_page(0, bytes);
                }
            }
            let data = match self.pages.get(&0) {
                Some(p) if start <= p.stop => {
                    let hi = (stop.min(p.stop) - p.start + 1) as usize;
                    p.buf[(start - p.start) as usize..hi].to_vec()
                }
                _ => Vec::new(),
            };
            return Ok(GetResult {
                data,
                file_size: None,
            });
        }

        let mut out = Vec::with_capacity((stop - start + 1) as usize);
        let mut cur = start;
        while cur <= stop {
            // Page containing cur, if any.
            let covering = self
                .pages
                .range(..=cur)
                .next_back()
                .filter(|(_, p)| p.stop >= cur)
                .map(|(s, _)| *s);
            if let Some(ps) = covering {
                let p = &self.pages[&ps];
                let hi = (p.stop.min(stop) - p.start + 1) as usize;
                out.extend_from_slice(&p.buf[(cur - p.start) as usize..hi]);
                cur = p.stop + 1;
                continue;
            }
            // Missing subrange up to the next resident page (or the stop).
            let gap_stop = self
                .pages
                .range(cur..)
                .next()
                .map(|(s, _)| (*s - 1).min(stop))
                .unwrap_or(stop);
            let want = gap_stop - cur + 1;
            let mut bytes = fetch(cur, gap_stop).await?;
            if bytes.is_empty() {
                break;
            }
            // An over-long response must not overlap the next page.
            if bytes.len() as u64 > want {
                bytes.truncate(want as usize);
            }
            let got = bytes.len() as u64;
            out.extend_from_slice(&bytes);
            self.insert_page(cur, bytes);
            if got < want {
                // Short read is end-of-object.
                break;
            }
            cur = gap_stop + 1;
        }

        Ok(GetResult {
            data: out,
            file_size: self.file_size_hint(entry),
        })
    }

    fn file_size_hint(&self, entry: &EntryView) -> Option<u64> {
        if entry.g_doc {
            None
        } else {
            Some(self.pages.values().map(Page::size).sum())
        }
    }

    /// Shrinks the page set to `new_size` bytes: pages past the boundary are
    /// dropped, a straddling page is truncated.
    pub fn resize(&mut self, new_size: u64) {
        if new_size == 0 {
            self.pages.clear();
            self.size = 0;
            return;
        }
        let boundary = new_size - 1;
        let starts: Vec<u64> = self.pages.keys().rev().copied().collect();
        for ps in starts {
            let (p_start, p_stop, p_size) = {
                let p = &self.pages[&ps];
                (p.start, p.stop, p.size())
            };
            if p_start > boundary {
                self.pages.remove(&ps);
                self.size -= p_size;
            } else if p_stop <= boundary {
                break;
            } else {
                // Straddles the boundary.
                let p = self.pages.get_mut(&ps).unwrap();
                p.stop = boundary;
                p.buf.truncate((boundary - p_start + 1) as usize);
                self.size -= p_size - p.size();
                break;
            }
        }
    }

    /// Ordered (start, stop) spans; property checks in tests.
    pub fn page_ranges(&self) -> Vec<(u64, u64)> {
        self.pages.values().map(|p| (p.start, p.stop)).collect()
    }
}

struct CacheInner {
    files: LruCache<String, Arc<Mutex<FileBuf>>>,
    size: u64,
}

/// C5: byte-budget LRU over per-file page sets. The list and map are only
/// touched under the inner lock, which is never held across file I/O; each
/// file's pages are guarded by that file's own async mutex.
pub struct PageCache {
    inner: StdMutex<CacheInner>,
    max: u64,
}

impl PageCache {
    pub fn new(max: u64) -> Self {
        PageCache {
            inner: StdMutex::new(CacheInner {
                files: LruCache::unbounded(),
                size: 0,
            }),
            max,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner.lock().unwrap().size
    }

    pub fn has_entry(&self, file_id: &str) -> bool {
        self.inner.lock().unwrap().files.contains(file_id)
    }

    /// Resident page bytes for one file; None when the file has no entry.
    pub async fn resident_bytes(&self, file_id: &str) -> Option<u64> {
        let f = {
            let inner = self.inner.lock().unwrap();
            inner.files.peek(file_id).cloned()
        }?;
        let size = f.lock().await.size;
        Some(size)
    }

    /// Splices the file to MRU, creating an empty entry on miss.
    fn file_mru(&self, file_id: &str) -> (Arc<Mutex<FileBuf>>, bool) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(f) = inner.files.get(file_id) {
            (f.clone(), true)
        } else {
            let f = Arc::new(Mutex::new(FileBuf::default()));
            inner.files.put(file_id.to_string(), f.clone());
            (f, false)
        }
    }

    pub async fn get<F, Fut>(
        &self,
        file_id: &str,
        offset: u64,
        len: u64,
        entry: &EntryView,
        fetch: F,
    ) -> Result<GetResult>
    where
        F: Fn(u64, u64) -> Fut,
        Fut: Future<Output = Result<Vec<u8>>>,
    {
        if len == 0 {
            return Ok(GetResult {
                data: Vec::new(),
                file_size: None,
            });
        }
        let (f, _) = self.file_mru(file_id);
        let (result, before, after) = {
            let mut fb = f.lock().await;
            let before = fb.size;
            let result = fb.get(offset, offset + len - 1, entry, fetch).await?;
            (result, before, fb.size)
        };

        // Invalidation shrinks, back-fills grow; keep the budget counter in
        // step with the page sets either way.
        if after < before {
            let mut inner = self.inner.lock().unwrap();
            inner.size = inner.size.saturating_sub(before - after);
        } else if after > before {
            let added = after - before;
            self.free_cache(added).await;
            self.inner.lock().unwrap().size += added;
        }
        Ok(result)
    }

    /// Writes a range. `to_delete` drops the file's resident pages first
    /// (full-object refresh, e.g. after a native-document export). A `None`
    /// buffer just performs the drop.
    pub async fn put(
        &self,
        file_id: &str,
        data: Option<&[u8]>,
        offset: u64,
        mtime: i64,
        to_delete: bool,
    ) -> Result<()> {
        let (f, existed) = self.file_mru(file_id);
        if to_delete && existed {
            let freed = {
                let mut fb = f.lock().await;
                let freed = fb.size;
                fb.clear_pages();
                freed
            };
            let mut inner = self.inner.lock().unwrap();
            inner.size = inner.size.saturating_sub(freed);
        }
        let Some(buf) = data else { return Ok(()) };
        if buf.is_empty() {
            return Ok(());
        }
        self.free_cache(buf.len() as u64).await;
        let added = {
            let mut fb = f.lock().await;
            fb.put(buf, offset, mtime)
        };
        self.inner.lock().unwrap().size += added;
        Ok(())
    }

    pub async fn remove(&self, file_id: &str) {
        let popped = {
            let mut inner = self.inner.lock().unwrap();
            inner.files.pop(file_id)
        };
        if let Some(f) = popped {
            let freed = f.lock().await.size;
            let mut inner = self.inner.lock().unwrap();
            inner.size = inner.size.saturating_sub(freed);
        }
    }

    /// Rekeys a file in place (rename-over-existing adopts the target's id).
    pub async fn change(&self, file_id: &str, new_file_id: &str) {
        let replaced = {
            let mut inner = self.inner.lock().unwrap();
            match inner.files.pop(file_id) {
                Some(f) => {
                    let replaced = inner.files.pop(new_file_id);
                    inner.files.put(new_file_id.to_string(), f);
                    replaced
                }
                None => None,
            }
        };
        if let Some(r) = replaced {
            let freed = r.lock().await.size;
            let mut inner = self.inner.lock().unwrap();
            inner.size = inner.size.saturating_sub(freed);
        }
    }

    pub async fn set_time(&self, file_id: &str, mtime: i64) {
        let f = {
            let mut inner = self.inner.lock().unwrap();
            inner.files.peek(file_id).cloned()
        };
        if let Some(f) = f {
            f.lock().await.mtime = mtime;
        }
    }

    pub async fn resize(&self, file_id: &str, new_size: u64) {
        let f = {
            let mut inner = self.inner.lock().unwrap();
            inner.files.peek(file_id).cloned()
        };
        if let Some(f) = f {
            let freed = {
                let mut fb = f.lock().await;
                let before = fb.size;
                fb.resize(new_size);
                before - fb.size
            };
            let mut inner = self.inner.lock().unwrap();
            inner.size = inner.size.saturating_sub(freed);
        }
    }

    /// Ensures room for `needed` more bytes by emptying files from the LRU
    /// tail. Entries stay in the list so later reads can repopulate them;
    /// requests larger than the whole budget skip eviction (soft budget).
    async fn free_cache(&self, needed: u64) {
        if needed > self.max {
            return;
        }
        let victims: Vec<Arc<Mutex<FileBuf>>> = {
            let inner = self.inner.lock().unwrap();
            if inner.size + needed < self.max {
                return;
            }
            inner.files.iter().rev().map(|(_, f)| f.clone()).collect()
        };
        for f in victims {
            {
                let inner = self.inner.lock().unwrap();
                if inner.size + needed < self.max {
                    return;
                }
            }
            let freed = {
                let mut fb = f.lock().await;
                let freed = fb.size;
                if freed == 0 {
                    continue;
                }
                fb.clear_pages();
                freed
            };
            let mut inner = self.inner.lock().unwrap();
            inner.size = inner.size.saturating_sub(freed);
        }
    }
}
