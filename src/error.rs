use thiserror::Error;

/// Errors raised by the storage layer
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised while driving a crawl
#[derive(Debug, Error)]
pub enum CrawlError {
    /// The execution context was cancelled. Not a failure.
    #[error("crawl cancelled")]
    Cancelled,

    #[error("task {0} is already running")]
    AlreadyRunning(i64),

    #[error("task {0} not found")]
    TaskNotFound(i64),

    #[error("task {id}: {source}")]
    Transition {
        id: i64,
        #[source]
        source: crate::crawler::task::TransitionError,
    },

    #[error("failed to build request payload: {0}")]
    Payload(#[source] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("no active proxies available")]
    NoProxies,

    #[error("proxy error: {0}")]
    Proxy(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("browser service error: {0}")]
    Browser(String),

    #[error("engine is shutting down")]
    ShuttingDown,
}

impl CrawlError {
    /// Whether this error only signals cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CrawlError::Cancelled)
    }

    /// Transport-level failures that warrant swapping the proxy
    pub fn is_transport(&self) -> bool {
        match self {
            CrawlError::Http(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            CrawlError::Proxy(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_distinguishable() {
        assert!(CrawlError::Cancelled.is_cancelled());
        assert!(!CrawlError::NoProxies.is_cancelled());
        assert!(CrawlError::Proxy("refused".into()).is_transport());
        assert!(!CrawlError::MalformedResponse("eof".into()).is_transport());
    }
}
