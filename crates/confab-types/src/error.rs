use thiserror::Error;

/// Error taxonomy for the conversation engine.
///
/// Guard violations and validation failures are reported synchronously to the
/// caller. Blob-store and fan-out failures are absorbed at their call sites
/// (logged, never blocking the primary mutation) and so never appear here;
/// `Storage` covers unexpected row-store failures only.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Malformed input: empty message, bad MIME type, oversized media.
    #[error("{0}")]
    Validation(String),

    /// Caller is not allowed: non-participant, non-sender, wrong recipient.
    #[error("{0}")]
    Permission(String),

    /// Guard violation: window expired, wrong request status, already unsent.
    #[error("{0}")]
    InvalidState(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

pub type ChatResult<T> = Result<T, ChatError>;
