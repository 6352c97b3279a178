use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tokio::sync::Mutex;

use crate::config::{Config, CLIENT_ID, CLIENT_SECRET, REDIRECT_URI};
use crate::errors::{GdfsError, Result};

pub const TOKEN_SLOT_LEN: usize = 100;
pub const AUTH_RECORD_LEN: usize = TOKEN_SLOT_LEN * 2 + 8;

/// One on-disk credential record: two fixed 100-byte NUL-padded token slots
/// followed by the expiry as little-endian seconds since the epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRecord {
    pub access_token: String,
    pub refresh_token: String,
    pub expiry: i64,
}

impl AuthRecord {
    pub fn encode(&self) -> Result<[u8; AUTH_RECORD_LEN]> {
        let mut out = [0u8; AUTH_RECORD_LEN];
        write_slot(&mut out[..TOKEN_SLOT_LEN], &self.access_token, "access token")?;
        write_slot(
            &mut out[TOKEN_SLOT_LEN..TOKEN_SLOT_LEN * 2],
            &self.refresh_token,
            "refresh token",
        )?;
        out[TOKEN_SLOT_LEN * 2..].copy_from_slice(&self.expiry.to_le_bytes());
        Ok(out)
    }

    pub fn decode(raw: &[u8]) -> Result<AuthRecord> {
        if raw.len() != AUTH_RECORD_LEN {
            return Err(GdfsError::Auth(format!(
                "auth record is {} bytes, expected {AUTH_RECORD_LEN}",
                raw.len()
            )));
        }
        let expiry = i64::from_le_bytes(raw[TOKEN_SLOT_LEN * 2..].try_into().unwrap());
        Ok(AuthRecord {
            access_token: read_slot(&raw[..TOKEN_SLOT_LEN])?,
            refresh_token: read_slot(&raw[TOKEN_SLOT_LEN..TOKEN_SLOT_LEN * 2])?,
            expiry,
        })
    }
}

fn write_slot(slot: &mut [u8], token: &str, what: &str) -> Result<()> {
    // The slot is fixed-size; longer tokens are rejected, never truncated.
    if token.len() > slot.len() {
        return Err(GdfsError::Auth(format!(
            "{what} is {} bytes, limit is {}",
            token.len(),
            slot.len()
        )));
    }
    slot[..token.len()].copy_from_slice(token.as_bytes());
    Ok(())
}

fn read_slot(slot: &[u8]) -> Result<String> {
    let end = slot.iter().position(|&b| b == 0).unwrap_or(slot.len());
    String::from_utf8(slot[..end].to_vec())
        .map_err(|_| GdfsError::Auth("auth record is not valid utf-8".to_string()))
}

/// Persist `record` at `path` with mode 0600, via a temp file and rename.
pub fn save_auth_file(path: &Path, record: &AuthRecord) -> Result<()> {
    let encoded = record.encode()?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, encoded)
        .map_err(|e| GdfsError::Auth(format!("write {}: {e}", tmp.display())))?;
    std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| GdfsError::Auth(format!("chmod {}: {e}", tmp.display())))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| GdfsError::Auth(format!("rename to {}: {e}", path.display())))?;
    Ok(())
}

pub fn load_auth_file(path: &Path) -> Result<AuthRecord> {
    let raw = std::fs::read(path).map_err(|e| {
        GdfsError::Auth(format!(
            "unable to read {} ({e}); run gauth first",
            path.display()
        ))
    })?;
    AuthRecord::decode(&raw)
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    error: Option<String>,
    error_description: Option<String>,
}

/// C1: in-memory credential store backed by the auth file. Renews the access
/// token before expiry and persists every renewal.
pub struct TokenStore {
    path: PathBuf,
    token_url: String,
    refresh_threshold: i64,
    record: Mutex<AuthRecord>,
}

impl TokenStore {
    pub fn load(cfg: &Config) -> Result<Self> {
        let path = cfg.auth_file();
        let record = load_auth_file(&path)?;
        Ok(TokenStore {
            path,
            token_url: cfg.oauth_token_url.clone(),
            refresh_threshold: cfg.token_refresh_threshold,
            record: Mutex::new(record),
        })
    }

    /// Store over an explicit record; used by tests and by gauth.
    pub fn with_record(path: PathBuf, token_url: String, threshold: i64, record: AuthRecord) -> Self {
        TokenStore {
            path,
            token_url,
            refresh_threshold: threshold,
            record: Mutex::new(record),
        }
    }

    /// Returns a usable access token, refreshing first when the current one
    /// has expired or expires within the refresh threshold.
    pub async fn access_token(&self, http: &reqwest::Client) -> Result<String> {
        let mut rec = self.record.lock().await;
        let now = chrono::Utc::now().timestamp();
        if now >= rec.expiry || rec.expiry - now <= self.refresh_threshold {
            self.renew(http, &mut rec).await?;
        }
        Ok(rec.access_token.clone())
    }

    async fn renew(&self, http: &reqwest::Client, rec: &mut AuthRecord) -> Result<()> {
        let form = [
            ("refresh_token", rec.refresh_token.as_str()),
            ("grant_type", "refresh_token"),
            ("client_id", CLIENT_ID),
            ("client_secret", CLIENT_SECRET),
        ];
        let resp = http
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| GdfsError::Auth(format!("token refresh: {e}")))?;
        let parsed: TokenResponse = resp
            .json()
            .await
            .map_err(|e| GdfsError::Auth(format!("token refresh body: {e}")))?;

        if let Some(err) = parsed.error {
            return Err(GdfsError::Auth(format!(
                "{err}: {}",
                parsed.error_description.unwrap_or_default()
            )));
        }
        let access = parsed
            .access_token
            .ok_or_else(|| GdfsError::Auth("refresh response missing access_token".into()))?;
        let expires_in = parsed.expires_in.unwrap_or(3600);

        rec.access_token = access;
        rec.expiry = chrono::Utc::now().timestamp() + expires_in;
        // Google rotates refresh tokens only on re-consent; keep ours unless
        // the endpoint handed back a new one.
        if let Some(refresh) = parsed.refresh_token {
            rec.refresh_token = refresh;
        }
        save_auth_file(&self.path, rec)?;
        crate::logging::info("access token renewed");
        Ok(())
    }
}

/// One-shot authorization-code exchange used by gauth.
pub async fn exchange_auth_code(
    http: &reqwest::Client,
    token_url: &str,
    auth_code: &str,
) -> Result<AuthRecord> {
    let form = [
        ("code", auth_code),
        ("grant_type", "authorization_code"),
        ("client_id", CLIENT_ID),
        ("client_secret", CLIENT_SECRET),
        ("redirect_uri", REDIRECT_URI),
    ];
    let resp = http
        .post(token_url)
        .form(&form)
        .send()
        .await
        .map_err(|e| GdfsError::Auth(format!("code exchange: {e}")))?;
    let parsed: TokenResponse = resp
        .json()
        .await
        .map_err(|e| GdfsError::Auth(format!("code exchange body: {e}")))?;

    if let Some(err) = parsed.error {
        return Err(GdfsError::Auth(format!(
            "{err}: {}",
            parsed.error_description.unwrap_or_default()
        )));
    }
    let access_token = parsed
        .access_token
        .ok_or_else(|| GdfsError::Auth("exchange response missing access_token".into()))?;
    let refresh_token = parsed
        .refresh_token
        .ok_or_else(|| GdfsError::Auth("exchange response missing refresh_token".into()))?;
    Ok(AuthRecord {
        access_token,
        refresh_token,
        expiry: chrono::Utc::now().timestamp() + parsed.expires_in.unwrap_or(3600),
    })
}
