use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Root access mode and defaults applied to objects discovered on the remote.
pub const ROOT_MODE: u32 = 0o777;
pub const DEF_FILE_MODE: u32 = 0o644;
pub const DEF_DIR_MODE: u32 = 0o755;
pub const DEF_GDOC_MODE: u32 = 0o444;

pub const PATH_MAX_LEN: usize = 4096;
pub const NAME_MAX_LEN: usize = 255;
pub const BLOCK_SIZE: u64 = 4096;
pub const FRAGMENT_SIZE: u64 = 4096;

pub const MAX_WORKER_THREADS: usize = 10;
pub const CACHE_MAX_SIZE: u64 = 100 * 1024 * 1024;
pub const CACHE_TIMEOUT_SECS: i64 = 60;
pub const UPLOAD_CHUNK_SIZE: u64 = 10 * 1024 * 1024;
pub const ACCESS_TOKEN_TIMEOUT_SECS: i64 = 300;

pub const CLIENT_ID: &str =
    "1226761120-i6c1c1l3aafea2je44ubq3d9g19k48ob.apps.googleusercontent.com";
pub const CLIENT_SECRET: &str = "60wF05CehSS2RmSToMyAzA-N";
pub const REDIRECT_URI: &str = "urn:ietf:wg:oauth:2.0:oob";

pub const AUTH_FILE: &str = "gdfs.auth";
pub const CONF_FILE: &str = "gdfs.conf";
pub const LOG_FILE: &str = "gdfs.log";

/// Resolved runtime configuration. Tunables default to the values above;
/// base URLs are fields so tests can point the client at a stub server.
#[derive(Debug, Clone)]
pub struct Config {
    pub conf_dir: PathBuf,
    pub mount_user: String,

    pub api_base: String,
    pub upload_base: String,
    pub change_token_url: String,
    pub about_url: String,
    pub oauth_token_url: String,

    pub cache_max: u64,
    pub upload_chunk: u64,
    pub metadata_ttl: i64,
    pub worker_threads: usize,
    pub token_refresh_threshold: i64,
    pub name_max: usize,
    pub path_max: usize,
}

impl Config {
    pub fn default_conf_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("GDFS_CONF_DIR") {
            return PathBuf::from(dir);
        }
        PathBuf::from("/opt/gdfs")
    }

    pub fn load(conf_dir: Option<&Path>) -> Result<Self> {
        let conf_dir = conf_dir
            .map(|p| p.to_path_buf())
            .unwrap_or_else(Self::default_conf_dir);
        let mount_user = read_mount_user(&conf_dir.join(CONF_FILE))?;
        Ok(Self::with_dir(conf_dir, mount_user))
    }

    fn with_dir(conf_dir: PathBuf, mount_user: String) -> Self {
        Config {
            conf_dir,
            mount_user,
            api_base: "https://www.googleapis.com/drive/v3".to_string(),
            upload_base: "https://www.googleapis.com/upload/drive/v3".to_string(),
            change_token_url:
                "https://www.googleapis.com/drive/v3/changes/startPageToken?fields=startPageToken"
                    .to_string(),
            about_url: "https://www.googleapis.com/drive/v3/about".to_string(),
            oauth_token_url: "https://www.googleapis.com/oauth2/v3/token".to_string(),
            cache_max: CACHE_MAX_SIZE,
            upload_chunk: UPLOAD_CHUNK_SIZE,
            metadata_ttl: CACHE_TIMEOUT_SECS,
            worker_threads: MAX_WORKER_THREADS,
            token_refresh_threshold: ACCESS_TOKEN_TIMEOUT_SECS,
            name_max: NAME_MAX_LEN,
            path_max: PATH_MAX_LEN,
        }
    }

    /// Configuration rooted at an arbitrary directory with default user;
    /// avoids touching /opt/gdfs in tests.
    pub fn for_dir(conf_dir: impl Into<PathBuf>) -> Self {
        Self::with_dir(conf_dir.into(), "root".to_string())
    }

    pub fn auth_file(&self) -> PathBuf {
        self.conf_dir.join(AUTH_FILE)
    }

    pub fn conf_file(&self) -> PathBuf {
        self.conf_dir.join(CONF_FILE)
    }

    pub fn log_file(&self, log_dir: Option<&Path>) -> PathBuf {
        log_dir
            .map(|d| d.join(LOG_FILE))
            .unwrap_or_else(|| self.conf_dir.join(LOG_FILE))
    }

    pub fn file_url(&self, file_id: &str) -> String {
        format!("{}/files/{}", self.api_base, file_id)
    }

    pub fn files_url(&self) -> String {
        format!("{}/files", self.api_base)
    }

    pub fn upload_url(&self, file_id: &str) -> String {
        format!("{}/files/{}", self.upload_base, file_id)
    }
}

/// `gdfs.conf` is a line-oriented `key=value` file. The only recognized key
/// is `gdfs.mount.user`, the owner of the auth and log files. A missing file
/// or key means the mount user is root.
pub fn read_mount_user(conf_file: &Path) -> Result<String> {
    const KEY: &str = "gdfs.mount.user=";

    if !conf_file.exists() {
        return Ok("root".to_string());
    }
    let raw = std::fs::read_to_string(conf_file)
        .with_context(|| format!("read {}", conf_file.display()))?;
    for line in raw.lines() {
        let line = line.trim();
        if let Some(user) = line.strip_prefix(KEY) {
            let user = user.trim();
            if !user.is_empty() {
                return Ok(user.to_string());
            }
        }
    }
    Ok("root".to_string())
}
