use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error taxonomy from the resilience layer design (§7).
///
/// This is a closed classification, not a type hierarchy: every
/// failure path in the engine is tagged with exactly one of these
/// kinds so that retry, breaker, and DLQ logic can all agree on what
/// "retryable" means without re-deriving it from an HTTP status code
/// in three different places.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(test, derive(Hash))]
pub enum ErrorClass {
    /// DNS, connect, TLS handshake, socket, read timeout.
    Transport,
    /// 5xx and configured retryable status codes.
    ServerTransient,
    /// 4xx except configured retryable codes (401/403/404 etc).
    ClientPermanent,
    /// 429, honors `Retry-After`.
    Throttled,
    /// Response body could not be decoded per a configured pointer.
    Parse,
    /// Missing required field, invalid enum, unresolvable template.
    Config,
    /// Synthetic: the breaker was open, no HTTP was issued.
    BreakerOpen,
}

impl ErrorClass {
    /// Whether this class is retried by the fetcher's own retry loop.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorClass::Transport | ErrorClass::ServerTransient | ErrorClass::Throttled
        )
    }

    /// Whether this class counts toward the circuit breaker's failure
    /// counter in `Closed` state. Throttled only counts once the
    /// fetcher's own retry budget has been exhausted (handled by the
    /// caller, not here).
    pub fn trips_breaker(self) -> bool {
        !matches!(self, ErrorClass::BreakerOpen | ErrorClass::Config)
    }

    /// Whether this class should open the breaker immediately,
    /// bypassing the failure-threshold counter.
    pub fn opens_breaker_immediately(self) -> bool {
        matches!(self, ErrorClass::ClientPermanent)
    }
}

/// A single endpoint-scoped failure, with enough context for
/// structured logging and DLQ routing.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("transport error for endpoint {endpoint_id}: {message}")]
    Transport {
        endpoint_id: String,
        message: String,
    },

    #[error("server returned {status} for endpoint {endpoint_id}")]
    ServerTransient { endpoint_id: String, status: u16 },

    #[error("client error {status} for endpoint {endpoint_id}")]
    ClientPermanent { endpoint_id: String, status: u16 },

    #[error("rate limited (429) for endpoint {endpoint_id}, retry_after={retry_after_secs:?}")]
    Throttled {
        endpoint_id: String,
        retry_after_secs: Option<u64>,
    },

    #[error("failed to parse response for endpoint {endpoint_id}: {message}")]
    Parse {
        endpoint_id: String,
        message: String,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("circuit breaker open for endpoint {endpoint_id}")]
    BreakerOpen { endpoint_id: String },

    #[error("retry budget exhausted for endpoint {endpoint_id} after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        endpoint_id: String,
        attempts: u32,
        last_error: String,
    },
}

impl ConnectError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ConnectError::Transport { .. } => ErrorClass::Transport,
            ConnectError::ServerTransient { .. } => ErrorClass::ServerTransient,
            ConnectError::ClientPermanent { .. } => ErrorClass::ClientPermanent,
            ConnectError::Throttled { .. } => ErrorClass::Throttled,
            ConnectError::Parse { .. } => ErrorClass::Parse,
            ConnectError::Config(_) => ErrorClass::Config,
            ConnectError::BreakerOpen { .. } => ErrorClass::BreakerOpen,
            ConnectError::RetriesExhausted { .. } => ErrorClass::ServerTransient,
        }
    }

    pub fn endpoint_id(&self) -> Option<&str> {
        match self {
            ConnectError::Transport { endpoint_id, .. }
            | ConnectError::ServerTransient { endpoint_id, .. }
            | ConnectError::ClientPermanent { endpoint_id, .. }
            | ConnectError::Throttled { endpoint_id, .. }
            | ConnectError::Parse { endpoint_id, .. }
            | ConnectError::BreakerOpen { endpoint_id }
            | ConnectError::RetriesExhausted { endpoint_id, .. } => Some(endpoint_id),
            ConnectError::Config(_) => None,
        }
    }
}
