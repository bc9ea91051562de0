use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

const STALE_REFERENCE_ERRORS: &[&str] = &[
    "FILE_REFERENCE_",
    "ACCESS_HASH_INVALID",
    "LOCATION_INVALID",
];

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("auth failed: {message}")]
    Auth { message: String },

    #[error("not found: {message}")]
    NotFound { message: String },

    #[error("ambiguous result: {message}")]
    Ambiguous { message: String },

    #[error("unexpected type: expected {expected}, got {got}")]
    UnexpectedType { expected: String, got: String },

    #[error("flood wait of {}s requested", wait.as_secs_f64())]
    FloodWait { wait: Duration },

    #[error(
        "flood wait too long: requested {}s, ceiling {}s",
        requested.as_secs_f64(),
        ceiling.as_secs_f64()
    )]
    FloodWaitTooLong {
        requested: Duration,
        ceiling: Duration,
    },

    #[error("remote request timed out")]
    Timeout,

    #[error("document has no thumbnail")]
    NoThumbnail,

    #[error("file chunk redirected to cdn dc {dc_id}")]
    CdnRedirect { dc_id: i32 },

    #[error("remote error: {message}")]
    Remote { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache miss: {key}")]
    CacheMiss { key: String },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("sqlite migrate error: {0}")]
    SqliteMigrate(#[from] sqlx::migrate::MigrateError),

    #[error("invalid state: {message}")]
    InvalidState { message: String },

    #[error("cancelled")]
    Cancelled,

    #[error("encode error: {message}")]
    Encode { message: String },
}

impl Error {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
        }
    }

    /// The remote rejected a cached file reference or access hash; a fresh
    /// descriptor fixes it.
    pub fn is_stale_reference(&self) -> bool {
        match self {
            Self::Remote { message } => STALE_REFERENCE_ERRORS
                .iter()
                .any(|name| message.contains(name)),
            _ => false,
        }
    }

    /// Transient conditions the downloader retries on its own.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::FloodWait { .. } | Self::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_reference_errors_are_recognised_through_context() {
        let wrapped = Error::remote(
            "upload.getFile message=5 offset=0 limit=4096: remote error: FILE_REFERENCE_EXPIRED",
        );
        assert!(wrapped.is_stale_reference());
        assert!(Error::remote("LOCATION_INVALID").is_stale_reference());
        assert!(!Error::remote("CHANNEL_INVALID").is_stale_reference());
        assert!(!Error::Timeout.is_stale_reference());
    }
}
