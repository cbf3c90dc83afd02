use thiserror::Error;

/// Failure of a single remote call.
///
/// `SizeExceeded` is a recoverable signal consumed by the batch fetcher; every
/// other variant is fatal for the fetch that produced it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("request exceeded the remote size limit")]
    SizeExceeded,

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("MediaWiki API error [{code}]: {info}")]
    Api { code: String, info: String },

    #[error("failed to decode {operation} response: {detail}")]
    Decode { operation: String, detail: String },

    #[error("operation cancelled")]
    Cancelled,
}

impl FetchError {
    pub fn api(code: impl Into<String>, info: impl Into<String>) -> Self {
        Self::Api {
            code: code.into(),
            info: info.into(),
        }
    }

    pub fn decode(operation: &str, detail: impl ToString) -> Self {
        Self::Decode {
            operation: operation.to_string(),
            detail: detail.to_string(),
        }
    }

    /// Transport-level failures are worth repeating the whole portion for.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

pub type FetchResult<T> = std::result::Result<T, FetchError>;
