//! End-to-end scenarios against a stub of the Drive HTTP API: mutations are
//! recorded server-side so the tests can assert on the exact remote traffic.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path as AxPath, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, put};
use axum::{Json, Router};
use serde_json::{json, Value};

use gdfs_rs::auth::{AuthRecord, TokenStore};
use gdfs_rs::config::Config;
use gdfs_rs::drive::{spawn_workers, Drive};
use gdfs_rs::tree::now;

#[derive(Clone, Default)]
struct Stub {
    inner: Arc<StubInner>,
}

#[derive(Default)]
struct StubInner {
    change_token: Mutex<String>,
    /// Child objects of the root listing.
    listing: Mutex<Vec<Value>>,
    /// Raw media bytes served for `alt=media` downloads.
    bodies: Mutex<HashMap<String, Vec<u8>>>,
    inserts: Mutex<Vec<Value>>,
    updates: Mutex<Vec<(String, Value)>>,
    deletes: Mutex<Vec<String>>,
    /// (content-range, body length) for every PUT on a session URL.
    chunk_puts: Mutex<Vec<(String, usize)>>,
    /// Chunk start offsets whose first acknowledgement is swallowed.
    lost_acks: Mutex<HashSet<u64>>,
    /// Per-session highest acknowledged byte.
    acked: Mutex<HashMap<String, u64>>,
}

impl Stub {
    fn set_change_token(&self, token: &str) {
        *self.inner.change_token.lock().unwrap() = token.to_string();
    }

    fn set_listing(&self, children: Vec<Value>) {
        *self.inner.listing.lock().unwrap() = children;
    }

    fn set_body(&self, id: &str, bytes: Vec<u8>) {
        self.inner.bodies.lock().unwrap().insert(id.to_string(), bytes);
    }

    fn lose_ack_for(&self, chunk_start: u64) {
        self.inner.lost_acks.lock().unwrap().insert(chunk_start);
    }

    fn inserts(&self) -> Vec<Value> {
        self.inner.inserts.lock().unwrap().clone()
    }

    fn updates(&self) -> Vec<(String, Value)> {
        self.inner.updates.lock().unwrap().clone()
    }

    fn deletes(&self) -> Vec<String> {
        self.inner.deletes.lock().unwrap().clone()
    }

    fn chunk_puts(&self) -> Vec<(String, usize)> {
        self.inner.chunk_puts.lock().unwrap().clone()
    }
}

fn child(id: &str, name: &str, size: u64) -> Value {
    json!({
        "id": id,
        "name": name,
        "mimeType": "text/plain",
        "modifiedTime": "2024-01-01T00:00:00.000Z",
        "size": size.to_string(),
    })
}

async fn serve(stub: Stub) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let base = format!("http://{addr}");

    async fn change_token(State(stub): State<Stub>) -> Json<Value> {
        Json(json!({"startPageToken": *stub.inner.change_token.lock().unwrap()}))
    }

    async fn about(State(_): State<Stub>) -> Json<Value> {
        Json(json!({"storageQuota": {"usageInDrive": "1048576", "limit": "1073741824"}}))
    }

    async fn list_files(State(stub): State<Stub>) -> Json<Value> {
        Json(json!({"files": *stub.inner.listing.lock().unwrap()}))
    }

    async fn generate_ids(State(_): State<Stub>) -> Json<Value> {
        let ids: Vec<String> = (0..1000).map(|i| format!("srv-id-{i}")).collect();
        Json(json!({"ids": ids}))
    }

    async fn file_get(
        State(stub): State<Stub>,
        AxPath(id): AxPath<String>,
        Query(params): Query<HashMap<String, String>>,
        headers: HeaderMap,
    ) -> Response {
        if params.get("alt").map(String::as_str) == Some("media") {
            let bodies = stub.inner.bodies.lock().unwrap();
            let Some(body) = bodies.get(&id) else {
                return (
                    StatusCode::NOT_FOUND,
                    Json(json!({"error": {"code": 404, "message": "no media"}})),
                )
                    .into_response();
            };
            let range = headers
                .get("range")
                .and_then(|v| v.to_str().ok())
                .and_then(|raw| {
                    let rest = raw.strip_prefix("bytes=")?;
                    let (a, b) = rest.split_once('-')?;
                    Some((a.parse::<usize>().ok()?, b.parse::<usize>().ok()?))
                });
            let slice = match range {
                Some((a, b)) => {
                    let hi = (b + 1).min(body.len());
                    body[a.min(hi)..hi].to_vec()
                }
                None => body.clone(),
            };
            return ([("content-type", "application/octet-stream")], slice).into_response();
        }
        // Metadata: serve from the listing when known.
        let listing = stub.inner.listing.lock().unwrap();
        match listing.iter().find(|c| c["id"] == id.as_str()) {
            Some(meta) => Json(meta.clone()).into_response(),
            None => Json(json!({
                "id": id,
                "name": id,
                "modifiedTime": "2024-01-01T00:00:00.000Z",
                "size": "0",
            }))
            .into_response(),
        }
    }

    async fn insert(State(stub): State<Stub>, body: String) -> Json<Value> {
        let val: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
        stub.inner.inserts.lock().unwrap().push(val);
        Json(json!({"modifiedTime": "2024-01-01T00:10:00.000Z"}))
    }

    async fn update(
        State(stub): State<Stub>,
        AxPath(id): AxPath<String>,
        body: String,
    ) -> Json<Value> {
        let val: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
        stub.inner.updates.lock().unwrap().push((id, val));
        Json(json!({"modifiedTime": "2024-01-01T00:20:00.000Z"}))
    }

    async fn remove(State(stub): State<Stub>, AxPath(id): AxPath<String>) -> StatusCode {
        stub.inner.deletes.lock().unwrap().push(id);
        StatusCode::NO_CONTENT
    }

    async fn upload_init(AxPath(id): AxPath<String>, headers: HeaderMap) -> Response {
        let host = headers
            .get("host")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("127.0.0.1");
        (
            StatusCode::OK,
            [("location", format!("http://{host}/session/{id}"))],
            Json(json!({})),
        )
            .into_response()
    }

    async fn session_put(
        State(stub): State<Stub>,
        AxPath(id): AxPath<String>,
        headers: HeaderMap,
        body: axum::body::Bytes,
    ) -> Response {
        let content_range = headers
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        stub.inner
            .chunk_puts
            .lock()
            .unwrap()
            .push((content_range.clone(), body.len()));

        let rest = content_range.trim_start_matches("bytes ");
        let (range_part, total_part) = rest.split_once('/').unwrap_or(("*", "0"));
        let total: u64 = total_part.parse().unwrap_or(0);

        if range_part == "*" {
            // Status probe.
            let acked = stub.inner.acked.lock().unwrap();
            return match acked.get(&id) {
                Some(&end) if end + 1 >= total && total > 0 => {
                    (StatusCode::OK, Json(json!({}))).into_response()
                }
                Some(&end) => (
                    StatusCode::PERMANENT_REDIRECT,
                    [("range", format!("bytes=0-{end}"))],
                )
                    .into_response(),
                None => StatusCode::PERMANENT_REDIRECT.into_response(),
            };
        }

        let (a, b) = range_part
            .split_once('-')
            .map(|(a, b)| (a.parse::<u64>().unwrap_or(0), b.parse::<u64>().unwrap_or(0)))
            .unwrap_or((0, 0));

        // A configured lost acknowledgement swallows this chunk once.
        if stub.inner.lost_acks.lock().unwrap().remove(&a) {
            return StatusCode::PERMANENT_REDIRECT.into_response();
        }

        stub.inner.acked.lock().unwrap().insert(id, b);
        if b + 1 >= total {
            (StatusCode::OK, Json(json!({}))).into_response()
        } else {
            (
                StatusCode::PERMANENT_REDIRECT,
                [("range", format!("bytes=0-{b}"))],
            )
                .into_response()
        }
    }

    async fn export_pdf(State(stub): State<Stub>, AxPath(id): AxPath<String>) -> Response {
        let bodies = stub.inner.bodies.lock().unwrap();
        match bodies.get(&id) {
            Some(body) => {
                ([("content-type", "application/pdf")], body.clone()).into_response()
            }
            None => (
                StatusCode::NOT_FOUND,
                Json(json!({"error": {"code": 404, "message": "nothing to export"}})),
            )
                .into_response(),
        }
    }

    let app = Router::new()
        .route("/changes/startPageToken", get(change_token))
        .route("/about", get(about))
        .route("/files", get(list_files).post(insert))
        .route("/files/generateIds", get(generate_ids))
        .route("/files/:id", get(file_get).patch(update).delete(remove))
        .route("/files/:id/export", get(export_pdf))
        .route("/upload/files/:id", patch(upload_init))
        .route("/session/:id", put(session_put))
        .with_state(stub);

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    base
}

struct Harness {
    drive: Arc<Drive>,
    stub: Stub,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

async fn harness_with(cache_max: u64, upload_chunk: u64) -> Harness {
    harness_opts(cache_max, upload_chunk, true).await
}

async fn harness_opts(cache_max: u64, upload_chunk: u64, start_workers: bool) -> Harness {
    let stub = Stub::default();
    stub.set_change_token("t1");
    let base = serve(stub.clone()).await;

    let dir = std::env::temp_dir().join(format!(
        "gdfs-rs-e2e-{}",
        uuid::Uuid::new_v4().as_simple()
    ));
    std::fs::create_dir_all(&dir).unwrap();

    let mut cfg = Config::for_dir(&dir);
    cfg.api_base = base.clone();
    cfg.upload_base = format!("{base}/upload");
    cfg.about_url = format!("{base}/about");
    cfg.change_token_url = format!("{base}/changes/startPageToken?fields=startPageToken");
    cfg.cache_max = cache_max;
    cfg.upload_chunk = upload_chunk;

    let tokens = TokenStore::with_record(
        dir.join("gdfs.auth"),
        cfg.oauth_token_url.clone(),
        cfg.token_refresh_threshold,
        AuthRecord {
            access_token: "test-token".into(),
            refresh_token: "test-refresh".into(),
            expiry: now() + 100_000,
        },
    );
    let drive = Arc::new(Drive::new(cfg, Arc::new(tokens)).unwrap());
    drive.get_root().await.unwrap();
    let workers = if start_workers {
        spawn_workers(&drive)
    } else {
        Vec::new()
    };
    Harness {
        drive,
        stub,
        workers,
    }
}

async fn harness() -> Harness {
    harness_with(100 * 1024 * 1024, 10 * 1024 * 1024).await
}

impl Harness {
    async fn drain_queue(&self) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !self.drive.queue.is_empty() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "queue never drained: {:?}",
                self.drive.queue.snapshot()
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        // One more beat for the in-flight item a worker already popped.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    async fn shutdown(self) {
        self.drive.queue.shutdown();
        for w in self.workers {
            let _ = w.await;
        }
    }
}

#[tokio::test]
async fn create_write_release_reread_is_one_insert_and_one_upload() {
    let h = harness().await;

    h.drive.op_create("/a.txt", 0o644, 1000, 1000).await.unwrap();
    let wrote = h
        .drive
        .op_write("/a.txt", 0, b"hello", 1000, 1000)
        .await
        .unwrap();
    assert_eq!(wrote, 5);
    h.drive.op_release("/a.txt", 1000, 1000).await.unwrap();

    let data = h.drive.op_read("/a.txt", 0, 5, 1000, 1000).await.unwrap();
    assert_eq!(data, b"hello");

    h.drain_queue().await;
    let inserts = h.stub.inserts();
    assert_eq!(inserts.len(), 1, "exactly one INSERT expected");
    assert_eq!(inserts[0]["name"], "a.txt");

    let puts = h.stub.chunk_puts();
    assert_eq!(puts.len(), 1, "one five-byte chunk expected: {puts:?}");
    assert_eq!(puts[0], ("bytes 0-4/5".to_string(), 5));

    h.shutdown().await;
}

#[tokio::test]
async fn rename_with_replacement_deletes_target_and_updates_source() {
    let h = harness().await;
    h.stub.set_listing(vec![child("id-x", "x", 5), child("id-y", "y", 0)]);
    h.stub.set_body("id-x", b"12345".to_vec());

    // Ingest the two children.
    h.drive.op_readdir("/", 1000, 1000).await.unwrap();

    h.drive.op_rename("/x", "/y", 1000, 1000).await.unwrap();

    let stat = h.drive.op_getattr("/y", 1000, 1000).await.unwrap();
    assert_eq!(stat.size, 5);
    assert!(h.drive.op_getattr("/x", 1000, 1000).await.is_err());

    h.drain_queue().await;
    assert_eq!(h.stub.deletes(), vec!["id-y".to_string()]);
    let updates = h.stub.updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].0, "id-x");
    assert_eq!(updates[0].1["name"], "y");

    h.shutdown().await;
}

#[tokio::test]
async fn listing_refresh_follows_the_change_token() {
    let h = harness().await;
    h.stub.set_listing(vec![child("id-a", "a", 1), child("id-b", "b", 1)]);

    let names: Vec<String> = h
        .drive
        .op_readdir("/", 1000, 1000)
        .await
        .unwrap()
        .into_iter()
        .map(|(n, _)| n)
        .collect();
    assert_eq!(sorted(names), vec!["a", "b"]);

    // Remote mutates: b vanishes, c appears, the change token advances.
    h.stub.set_listing(vec![child("id-a", "a", 1), child("id-c", "c", 1)]);
    h.stub.set_change_token("t2");

    let names: Vec<String> = h
        .drive
        .op_readdir("/", 1000, 1000)
        .await
        .unwrap()
        .into_iter()
        .map(|(n, _)| n)
        .collect();
    assert_eq!(sorted(names), vec!["a", "c"]);
    assert!(
        h.drive.with_tree(|t| t.nodes_for_id("id-b").is_empty()),
        "node for the vanished child must be destroyed"
    );

    h.shutdown().await;
}

#[tokio::test]
async fn duplicate_remote_names_are_suffixed_locally() {
    let h = harness().await;
    h.stub.set_listing(vec![
        child("id-r1", "report.pdf", 10),
        child("id-r2", "report.pdf", 20),
    ]);

    let names: Vec<String> = h
        .drive
        .op_readdir("/", 1000, 1000)
        .await
        .unwrap()
        .into_iter()
        .map(|(n, _)| n)
        .collect();
    assert_eq!(sorted(names), vec!["report.pdf", "report_1.pdf"]);

    assert!(h.drive.op_getattr("/report.pdf", 1000, 1000).await.is_ok());
    assert!(h
        .drive
        .op_getattr("/report_1.pdf", 1000, 1000)
        .await
        .is_ok());

    h.shutdown().await;
}

#[tokio::test]
async fn native_documents_are_listed_and_read_as_pdf_exports() {
    let h = harness().await;
    let pdf = b"%PDF-1.4 exported notes".to_vec();
    h.stub.set_listing(vec![json!({
        "id": "id-doc",
        "name": "Notes",
        "mimeType": "application/vnd.google-apps.document",
        "modifiedTime": "2024-01-01T00:00:00.000Z",
    })]);
    h.stub.set_body("id-doc", pdf.clone());

    let names: Vec<String> = h
        .drive
        .op_readdir("/", 1000, 1000)
        .await
        .unwrap()
        .into_iter()
        .map(|(n, _)| n)
        .collect();
    assert_eq!(names, vec!["Notes.pdf"]);

    let stat = h.drive.op_getattr("/Notes.pdf", 1000, 1000).await.unwrap();
    assert_eq!(stat.size, pdf.len() as u64);
    assert_eq!(stat.mode, 0o444);

    let data = h
        .drive
        .op_read("/Notes.pdf", 0, pdf.len() as u64, 1000, 1000)
        .await
        .unwrap();
    assert_eq!(data, pdf);

    h.shutdown().await;
}

#[tokio::test]
async fn cache_eviction_respects_the_byte_budget() {
    let h = harness_with(1024 * 1024, 10 * 1024 * 1024).await;
    let size = 600 * 1024u64;
    h.stub.set_listing(vec![
        child("id-f1", "f1", size),
        child("id-f2", "f2", size),
    ]);
    h.stub.set_body("id-f1", vec![b'1'; size as usize]);
    h.stub.set_body("id-f2", vec![b'2'; size as usize]);
    h.drive.op_readdir("/", 1000, 1000).await.unwrap();

    let data = h.drive.op_read("/f1", 0, size, 1000, 1000).await.unwrap();
    assert_eq!(data.len(), size as usize);
    let data = h.drive.op_read("/f2", 0, size, 1000, 1000).await.unwrap();
    assert_eq!(data.len(), size as usize);

    assert!(h.drive.cache.total_bytes() <= 1024 * 1024);
    assert!(h.drive.cache.has_entry("id-f1"), "entry survives eviction");
    assert_eq!(h.drive.cache.resident_bytes("id-f1").await, Some(0));
    assert_eq!(h.drive.cache.resident_bytes("id-f2").await, Some(size));

    h.shutdown().await;
}

#[tokio::test]
async fn interrupted_upload_resumes_from_the_probed_range() {
    // 12-byte file in 4-byte chunks; the ack for the middle chunk is lost.
    let h = harness_with(100 * 1024 * 1024, 4).await;
    h.stub.lose_ack_for(4);

    h.drive.op_create("/big.bin", 0o644, 1000, 1000).await.unwrap();
    h.drive
        .op_write("/big.bin", 0, b"abcdefghijkl", 1000, 1000)
        .await
        .unwrap();
    h.drive.op_release("/big.bin", 1000, 1000).await.unwrap();

    let puts = h.stub.chunk_puts();
    let ranges: Vec<&str> = puts.iter().map(|(r, _)| r.as_str()).collect();
    assert_eq!(
        ranges,
        vec![
            "bytes 0-3/12",
            "bytes 4-7/12",  // ack swallowed
            "bytes */12",    // probe
            "bytes 4-7/12",  // retransmit
            "bytes 8-11/12",
        ]
    );

    h.drain_queue().await;
    h.shutdown().await;
}

#[tokio::test]
async fn merged_insert_and_update_reach_the_remote_as_one_insert() {
    // Workers start only after both requests are enqueued, so the merge is
    // decided entirely by the queue.
    let mut h = harness_opts(100 * 1024 * 1024, 10 * 1024 * 1024, false).await;
    use gdfs_rs::queue::{ReqItem, ReqType};

    h.drive.queue.build_request(
        ReqItem::new("id-m", ReqType::Insert, format!("{}?fields=modifiedTime", files_url(&h)))
            .with_body(r#"{"id":"id-m","name":"first.txt","parents":["root"]}"#),
    );
    h.drive.queue.build_request(
        ReqItem::new("id-m", ReqType::Update, format!("{}/id-m", files_url(&h)))
            .with_body(r#"{"name":"second.txt"}"#),
    );
    assert_eq!(h.drive.queue.len(), 1);

    h.workers = spawn_workers(&h.drive);
    h.drain_queue().await;
    let inserts = h.stub.inserts();
    assert_eq!(inserts.len(), 1);
    assert_eq!(inserts[0]["name"], "second.txt");
    assert_eq!(inserts[0]["id"], "id-m");
    assert!(h.stub.updates().is_empty());

    h.shutdown().await;
}

fn files_url(h: &Harness) -> String {
    format!("{}/files", h.drive.cfg.api_base)
}

fn sorted(mut v: Vec<String>) -> Vec<String> {
    v.sort();
    v
}
