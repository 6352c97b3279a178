use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, LOCATION, RANGE};
use reqwest::{Client as HttpClient, ClientBuilder, RequestBuilder, Response};
use serde_json::Value;

use crate::auth::TokenStore;
use crate::errors::{GdfsError, Result};

/// C2: thin typed surface over the Drive HTTP API. Every request goes
/// through the credential store first, so an expiring access token is
/// renewed before it is used.
pub struct DriveClient {
    http: HttpClient,
    tokens: Arc<TokenStore>,
}

/// Outcome of one resumable-upload chunk PUT. The session protocol is driven
/// off the status code and the `Range` response header.
#[derive(Debug)]
pub struct ChunkStatus {
    pub status: u16,
    pub range_end: Option<u64>,
    pub body: String,
}

impl DriveClient {
    pub fn new(tokens: Arc<TokenStore>) -> Result<Self> {
        let http = ClientBuilder::new()
            .timeout(Duration::from_secs(10 * 60))
            .connect_timeout(Duration::from_secs(60))
            .user_agent("gdfs-rs/0.1")
            .build()?;
        Ok(DriveClient { http, tokens })
    }

    async fn authed(&self, req: RequestBuilder) -> Result<Response> {
        let token = self.tokens.access_token(&self.http).await?;
        let resp = req.bearer_auth(token).send().await?;
        Ok(resp)
    }

    /// Metadata fetch, listing page, id generation. Error bodies come back
    /// as JSON too; callers inspect `remote_error`.
    pub async fn get_json(&self, url: &str) -> Result<Value> {
        let resp = self.authed(self.http.get(spread_quota(url))).await?;
        let raw = resp.text().await?;
        parse_json(&raw)
    }

    /// INSERT: POST with a JSON mutation body.
    pub async fn post_json(&self, url: &str, body: &str) -> Result<Value> {
        let resp = self
            .authed(
                self.http
                    .post(spread_quota(url))
                    .header(CONTENT_TYPE, "application/json; charset=UTF-8")
                    .body(body.to_string()),
            )
            .await?;
        let raw = resp.text().await?;
        parse_json(&raw)
    }

    /// UPDATE: PATCH with a JSON mutation body.
    pub async fn patch_json(&self, url: &str, body: &str) -> Result<Value> {
        let resp = self
            .authed(
                self.http
                    .patch(spread_quota(url))
                    .header(CONTENT_TYPE, "application/json; charset=UTF-8")
                    .body(body.to_string()),
            )
            .await?;
        let raw = resp.text().await?;
        parse_json(&raw)
    }

    /// DELETE returns an empty body on success, a JSON error body otherwise.
    pub async fn delete(&self, url: &str) -> Result<Option<Value>> {
        let resp = self.authed(self.http.delete(spread_quota(url))).await?;
        let raw = resp.text().await?;
        if raw.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(parse_json(&raw)?))
    }

    /// Ranged media download. A JSON body in the response means the remote
    /// refused the read and is reported as a remote error.
    pub async fn download_range(&self, url: &str, start: u64, stop: u64) -> Result<Vec<u8>> {
        let resp = self
            .authed(
                self.http
                    .get(spread_quota(url))
                    .header(RANGE, format!("bytes={start}-{stop}")),
            )
            .await?;
        media_bytes(resp).await
    }

    /// Whole-object media download (PDF export of native documents).
    pub async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let resp = self.authed(self.http.get(spread_quota(url))).await?;
        media_bytes(resp).await
    }

    /// Resumable-upload session init: PATCH that yields the per-upload
    /// session endpoint in the `Location` header.
    pub async fn upload_session_init(
        &self,
        url: &str,
        body: &str,
        content_type_hint: Option<&str>,
    ) -> Result<String> {
        let mut req = self
            .http
            .patch(spread_quota(url))
            .header(CONTENT_TYPE, "application/json; charset=UTF-8")
            .body(body.to_string());
        if let Some(mime) = content_type_hint {
            req = req.header("X-Upload-Content-Type", mime.to_string());
        }
        let resp = self.authed(req).await?;
        let location = resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        match location {
            Some(loc) if !loc.is_empty() => Ok(loc),
            _ => {
                let raw = resp.text().await.unwrap_or_default();
                if let Ok(val) = parse_json(&raw) {
                    if let Some((code, message)) = remote_error(&val) {
                        return Err(GdfsError::remote(code, message));
                    }
                }
                Err(GdfsError::Integrity(
                    "upload session response carries no Location header".to_string(),
                ))
            }
        }
    }

    /// One chunk PUT against the session endpoint. `content_range` is the
    /// full `bytes a-b/S` (or `bytes */S` probe) value.
    pub async fn upload_chunk(
        &self,
        session_url: &str,
        body: Vec<u8>,
        content_range: &str,
    ) -> Result<ChunkStatus> {
        let resp = self
            .authed(
                self.http
                    .put(session_url)
                    .header("Content-Range", content_range)
                    .body(body),
            )
            .await?;
        let status = resp.status().as_u16();
        let range_end = resp
            .headers()
            .get(RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_range_end);
        let body = resp.text().await.unwrap_or_default();
        Ok(ChunkStatus {
            status,
            range_end,
            body,
        })
    }
}

/// `{"error": {"code": ..., "message": ...}}` → (code, message).
pub fn remote_error(val: &Value) -> Option<(String, String)> {
    let err = val.get("error")?;
    let code = match err.get("code") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    };
    let message = err
        .get("message")
        .and_then(|m| m.as_str())
        .unwrap_or("")
        .to_string();
    Some((code, message))
}

fn parse_json(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).map_err(|e| GdfsError::Integrity(format!("bad json: {e}")))
}

async fn media_bytes(resp: Response) -> Result<Vec<u8>> {
    use futures_util::StreamExt;

    let status = resp.status();
    let is_json = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("application/json"))
        .unwrap_or(false);
    let expect = resp.content_length().unwrap_or(0) as usize;
    let mut out = Vec::with_capacity(expect);
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk?);
    }
    if is_json {
        if let Ok(val) = serde_json::from_slice::<Value>(&out) {
            if let Some((code, message)) = remote_error(&val) {
                return Err(GdfsError::remote(code, message));
            }
        }
    }
    if !status.is_success() {
        return Err(GdfsError::remote(
            status.as_u16().to_string(),
            String::from_utf8_lossy(&out[..out.len().min(256)]).to_string(),
        ));
    }
    Ok(out)
}

/// `Range: bytes=0-N` → N.
fn parse_range_end(raw: &str) -> Option<u64> {
    let rest = raw.trim().strip_prefix("bytes=")?;
    let (_, end) = rest.split_once('-')?;
    end.trim().parse().ok()
}

/// Spread request quota across synthetic users, as the Drive API meters per
/// quotaUser.
fn spread_quota(url: &str) -> String {
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{url}{sep}quotaUser={}", uuid::Uuid::new_v4().as_simple())
}
