use thiserror::Error;

/// Error sum for the filesystem core. Every variant maps onto the POSIX
/// errno the kernel adapter reports for it.
#[derive(Debug, Error)]
pub enum GdfsError {
    #[error("invalid argument: {0}")]
    Argument(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("operation not permitted: {0}")]
    NotPermitted(String),

    #[error("no such file or directory: {0}")]
    NotFound(String),

    #[error("not a directory: {0}")]
    NotDirectory(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("file exists: {0}")]
    Exists(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("name too long: {0}")]
    NameTooLong(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("remote error {code}: {message}")]
    Remote { code: String, message: String },

    #[error("auth failure: {0}")]
    Auth(String),

    #[error("malformed remote response: {0}")]
    Integrity(String),

    #[error("temporarily unavailable: {0}")]
    Again(String),
}

impl GdfsError {
    pub fn remote(code: impl Into<String>, message: impl Into<String>) -> Self {
        GdfsError::Remote {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Negative errno handed back to the kernel for this error.
    pub fn errno(&self) -> i32 {
        match self {
            GdfsError::Argument(_) => libc::EINVAL,
            GdfsError::Permission(_) => libc::EACCES,
            GdfsError::NotPermitted(_) => libc::EPERM,
            GdfsError::NotFound(_) => libc::ENOENT,
            GdfsError::NotDirectory(_) => libc::ENOTDIR,
            GdfsError::NotEmpty(_) => libc::ENOTEMPTY,
            GdfsError::Exists(_) => libc::EEXIST,
            GdfsError::InvalidOperation(_) => libc::EINVAL,
            GdfsError::NameTooLong(_) => libc::ENAMETOOLONG,
            GdfsError::Transport(_) => libc::EIO,
            GdfsError::Remote { .. } => libc::EIO,
            GdfsError::Auth(_) => libc::EACCES,
            GdfsError::Integrity(_) => libc::EIO,
            GdfsError::Again(_) => libc::EAGAIN,
        }
    }

    /// Remote 403 is the rate-limit signal; 404 is retryable only inside the
    /// post-INSERT grace window, which the caller tracks.
    pub fn remote_code(&self) -> Option<&str> {
        match self {
            GdfsError::Remote { code, .. } => Some(code.as_str()),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for GdfsError {
    fn from(err: reqwest::Error) -> Self {
        GdfsError::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GdfsError>;
