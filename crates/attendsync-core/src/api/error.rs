use thiserror::Error;

/// Failure talking to the hosted attendance database.
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("no remote store configured: {0}")]
    NotConfigured(String),

    #[error("remote store refused access: {0}")]
    AccessDenied(String),

    #[error("remote store rejected the anon key")]
    Unauthorized,

    #[error("no such table or row: {0}")]
    NotFound(String),

    #[error("remote store kept answering 429 after retries")]
    RateLimited,

    #[error("remote store failed: {0}")]
    ServerError(String),

    #[error("could not reach remote store: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("unexpected reply from remote store: {0}")]
    InvalidResponse(String),
}

/// Bytes of a failed response body kept in the error.
const BODY_SNIPPET_BYTES: usize = 500;

impl RemoteError {
    fn body_snippet(body: &str) -> String {
        if body.len() <= BODY_SNIPPET_BYTES {
            return body.to_string();
        }
        let mut end = BODY_SNIPPET_BYTES;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }

    /// Map a non-success PostgREST status to an error variant.
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let snippet = Self::body_snippet(body);
        match status.as_u16() {
            401 => RemoteError::Unauthorized,
            403 => RemoteError::AccessDenied(snippet),
            404 => RemoteError::NotFound(snippet),
            429 => RemoteError::RateLimited,
            500..=599 => RemoteError::ServerError(snippet),
            _ => RemoteError::InvalidResponse(format!("HTTP {}: {}", status, snippet)),
        }
    }

    /// True when the request never got an answer (connect failure, timeout),
    /// as opposed to the server turning it down.
    pub fn is_offline(&self) -> bool {
        match self {
            RemoteError::NetworkError(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            _ => false,
        }
    }
}
