use std::time::Duration;

/// Typed error hierarchy for the orchestration core.
/// Classifies errors as fatal (don't retry), recoverable, or operational.
#[derive(Clone, Debug, thiserror::Error)]
pub enum HavenError {
    // Fatal, don't retry
    #[error("no client configured for purpose: {0}")]
    ConfigurationMissing(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // Recoverable
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),

    // Degrades to an empty/failed step, never propagates
    #[error("protocol violation: {0}")]
    Protocol(String),

    // Operational
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("step budget exhausted after {0} steps")]
    Exhausted(u32),
    #[error("cancelled")]
    Cancelled,
}

impl HavenError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::ServerError { .. } | Self::StreamInterrupted(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ConfigurationMissing(_) | Self::InvalidRequest(_))
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::ConfigurationMissing(_) => "configuration_missing",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Transport(_) => "transport",
            Self::ServerError { .. } => "server_error",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::Protocol(_) => "protocol",
            Self::Timeout(_) => "timeout",
            Self::Exhausted(_) => "exhausted",
            Self::Cancelled => "cancelled",
        }
    }

    /// Classify an HTTP status code into the appropriate error variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            400 => Self::InvalidRequest(body),
            401 | 403 => Self::ConfigurationMissing(format!("rejected credentials: {body}")),
            429 => Self::ServerError { status, body },
            500..=599 => Self::ServerError { status, body },
            _ => Self::InvalidRequest(format!("unexpected status {status}: {body}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(HavenError::Transport("pipe closed".into()).is_retryable());
        assert!(HavenError::ServerError { status: 500, body: "err".into() }.is_retryable());
        assert!(HavenError::StreamInterrupted("eof".into()).is_retryable());
    }

    #[test]
    fn fatal_classification() {
        assert!(HavenError::ConfigurationMissing("vision".into()).is_fatal());
        assert!(HavenError::InvalidRequest("bad".into()).is_fatal());
    }

    #[test]
    fn not_retryable_and_not_fatal() {
        let timeout = HavenError::Timeout(Duration::from_secs(10));
        assert!(!timeout.is_retryable());
        assert!(!timeout.is_fatal());

        let protocol = HavenError::Protocol("missing choices".into());
        assert!(!protocol.is_retryable());
        assert!(!protocol.is_fatal());
    }

    #[test]
    fn from_status_mapping() {
        assert!(HavenError::from_status(400, "bad request".into()).is_fatal());
        assert!(HavenError::from_status(401, "unauthorized".into()).is_fatal());
        assert!(HavenError::from_status(429, "rate limited".into()).is_retryable());
        assert!(HavenError::from_status(503, "unavailable".into()).is_retryable());
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(HavenError::Cancelled.error_kind(), "cancelled");
        assert_eq!(HavenError::Exhausted(8).error_kind(), "exhausted");
        assert_eq!(
            HavenError::Protocol("no finish_reason".into()).error_kind(),
            "protocol"
        );
    }
}
