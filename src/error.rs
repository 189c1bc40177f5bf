//! Error types shared across the proxy and replay engines.

use thiserror::Error;

pub type ProxyResult<T> = Result<T, ProxyError>;

/// The non-fatal and infrastructure error kinds the proxy and replay
/// engines can raise. Variants map onto the HTTP status/body pairs listed
/// in the error handling design: `BadRequest` and `Absent` become 400s,
/// `UpstreamUnavailable` a 503, `Transport`/`Internal` a 503/500.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("request id should be positive number")]
    BadRequestId,

    #[error("no such request")]
    Absent,

    #[error("no upstream")]
    NoUpstream,

    #[error("upstream service unavaible")]
    UpstreamUnavailable,

    #[error("internal server error")]
    Internal(String),

    #[error("failed to bind {port}: {reason}")]
    BindFailed { port: u16, reason: String },

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("client tls error: {0}")]
    ClientTls(String),

    #[error("upstream tls error connecting to {target}: {reason}")]
    UpstreamTls { target: String, reason: String },

    #[error("upstream connection error to {target}: {reason}")]
    UpstreamConnection { target: String, reason: String },

    #[error("invalid config field {field}={value}: {reason}")]
    InvalidConfig {
        field: String,
        value: String,
        reason: String,
    },

    #[error("http error: {0}")]
    Http(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(String),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("failed to write config: {0}")]
    Write(String),
}

impl ProxyError {
    /// Whether this error is expected connection noise (client hung up,
    /// reset the connection, closed the tunnel early) versus something
    /// worth an `error!` log line. Mirrors the teacher's `proxy.rs`
    /// `e.is_recoverable()` check used to pick `debug!` over `error!`.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProxyError::Io(_) | ProxyError::ClientTls(_) | ProxyError::UpstreamTls { .. }
        )
    }

    /// HTTP status code this error should be surfaced to a replay/proxy
    /// client as.
    pub fn status_code(&self) -> u16 {
        match self {
            ProxyError::BadRequestId | ProxyError::Absent | ProxyError::NoUpstream => 400,
            ProxyError::UpstreamUnavailable => 503,
            ProxyError::Internal(_) | ProxyError::Database(_) | ProxyError::Http(_) => 500,
            _ => 500,
        }
    }

    /// Canonical message text surfaced to the client, per the error
    /// handling design's fixed strings.
    pub fn client_message(&self) -> &'static str {
        match self {
            ProxyError::BadRequestId => "request id should be positive number",
            ProxyError::Absent => "no such request",
            ProxyError::NoUpstream => "no upstream",
            ProxyError::UpstreamUnavailable => "upstream service unavaible",
            _ => "internal server error",
        }
    }
}
