// Boundary error types. None of these ever reach the membership store: they
// are logged and counted where they occur.

use thiserror::Error;

/// Failures talking to the REST endpoints (snapshot, enumeration, publish).
#[derive(Debug, Error)]
pub enum RestError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("pagination exceeded {limit} pages")]
    TooManyPages { limit: usize },
}

impl RestError {
    /// Server-side and transport failures are worth retrying later.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(error) => error.is_timeout() || error.is_connect() || error.is_request(),
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Url(_) | Self::TooManyPages { .. } => false,
        }
    }
}

/// Failures reading from or acknowledging on the event source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("event source i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("queue broker failed: {0}")]
    Amqp(#[from] lapin::Error),
    #[error("invalid broker endpoint {endpoint}")]
    Endpoint { endpoint: String },
    #[error("unreadable frame: {reason}")]
    Frame { reason: String },
    #[error("unknown delivery tag {0}")]
    UnknownTag(u64),
}

impl SourceError {
    /// Frame-level problems affect a single item; the source stays usable.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Frame { .. } | Self::UnknownTag(_))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
    #[error("invalid namespace pattern: {0}")]
    Namespace(#[from] regex::Error),
}
