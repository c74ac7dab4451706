use thiserror::Error;

/// Errors returned by an [`ActivityFeed`](super::ActivityFeed).
#[derive(Debug, Error)]
pub enum FeedError {
    /// 5xx from the remote.
    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// The remote asked us to slow down.
    #[error("Rate limited by remote")]
    RateLimited { retry_after_secs: Option<u64> },

    /// Connection, DNS, TLS or timeout failure.
    #[error("Network error: {message}")]
    Network { message: String },

    /// The remote definitively has no such resource.
    #[error("Not found: {resource}")]
    NotFound { resource: String },

    /// Credentials missing, expired or insufficient.
    #[error("Unauthorized")]
    Unauthorized,

    /// Response body did not match the expected shape.
    #[error("Decode error: {message}")]
    Decode { message: String },

    /// The call was abandoned while waiting for rate-limit capacity.
    #[error("Cancelled")]
    Cancelled,
}

impl FeedError {
    #[inline]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    #[inline]
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    #[inline]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Map a non-success HTTP status to an error.
    pub fn from_status(status: u16, resource: &str, retry_after_secs: Option<u64>) -> Self {
        match status {
            401 | 403 => Self::Unauthorized,
            404 => Self::not_found(resource),
            429 => Self::RateLimited { retry_after_secs },
            500..=599 => Self::Server {
                status,
                message: resource.to_string(),
            },
            other => Self::Decode {
                message: format!("unexpected status {other} for {resource}"),
            },
        }
    }

    /// Whether retrying with backoff may succeed.
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Server { .. } | Self::RateLimited { .. } | Self::Network { .. }
        )
    }

    /// Whether this is the definitive "no data" signal.
    #[inline]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// First line of an error message, for progress and log lines.
#[inline]
pub fn short_error_message(e: &impl std::error::Error) -> String {
    let full = e.to_string();
    full.lines().next().unwrap_or(&full).to_string()
}
