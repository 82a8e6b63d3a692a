use thiserror::Error;

/// A row whose template could not be turned into a request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("unresolved template token {{{0}}}")]
    UnresolvedToken(String),

    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),
}

/// Failure to speak HTTP with the target. Never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("failed to read response body: {0}")]
    Body(String),

    #[error("request cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout
        } else if e.is_connect() {
            TransportError::Connect(root_cause(&e))
        } else if e.is_body() || e.is_decode() {
            TransportError::Body(root_cause(&e))
        } else {
            TransportError::Request(root_cause(&e))
        }
    }
}

// reqwest wraps the interesting part (refused, dns, tls) a few sources deep.
fn root_cause(e: &(dyn std::error::Error + 'static)) -> String {
    let mut current = e;
    while let Some(next) = current.source() {
        current = next;
    }
    current.to_string()
}

/// Terminal error carried by an [`Outcome`](crate::Outcome).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobError {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("worker panicked: {0}")]
    Panic(String),
}

impl JobError {
    /// Short stable label used in log fields.
    pub fn category(&self) -> &'static str {
        match self {
            JobError::Build(_) => "build",
            JobError::Transport(TransportError::Timeout) => "timeout",
            JobError::Transport(TransportError::Connect(_)) => "connect",
            JobError::Transport(TransportError::Request(_)) => "request",
            JobError::Transport(TransportError::Body(_)) => "body",
            JobError::Transport(TransportError::Cancelled) => "cancelled",
            JobError::Panic(_) => "panic",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_error_display_is_transparent() {
        let err = JobError::from(BuildError::UnresolvedToken("id".into()));
        assert_eq!(err.to_string(), "unresolved template token {id}");
        assert_eq!(err.category(), "build");
    }

    #[test]
    fn test_transport_categories() {
        assert_eq!(JobError::from(TransportError::Timeout).category(), "timeout");
        assert_eq!(
            JobError::from(TransportError::Connect("refused".into())).category(),
            "connect"
        );
        assert_eq!(JobError::Panic("boom".into()).category(), "panic");
    }
}
