use crate::tool::CodingToolError;
use engagement_ids::CodeSchemeId;
use engagement_protocol::RetryError;
use engagement_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodingError {
    #[error("Code scheme '{scheme_id}' bound to cleaners {first} and {second}")]
    CleanerConflict {
        scheme_id: CodeSchemeId,
        first: String,
        second: String,
    },

    #[error("Code scheme '{0}' is not in the registry")]
    UnknownScheme(CodeSchemeId),

    #[error("Coding tool authentication failed for {dataset}: {message}")]
    ToolAuth { dataset: String, message: String },

    #[error("Coding tool call for {dataset} gave up after {attempts} attempts: {last}")]
    ToolRetriesExhausted {
        dataset: String,
        attempts: u32,
        last: String,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Coding worker failed: {0}")]
    Worker(String),
}

impl CodingError {
    /// Convert a retry failure. `None` means the call was cancelled.
    pub(crate) fn from_retry(dataset: &str, err: RetryError<CodingToolError>) -> Option<Self> {
        match err {
            RetryError::Fatal(CodingToolError::Auth(message)) => Some(CodingError::ToolAuth {
                dataset: dataset.to_string(),
                message,
            }),
            RetryError::Fatal(other) => Some(CodingError::ToolRetriesExhausted {
                dataset: dataset.to_string(),
                attempts: 1,
                last: other.to_string(),
            }),
            RetryError::Exhausted { attempts, last } => Some(CodingError::ToolRetriesExhausted {
                dataset: dataset.to_string(),
                attempts,
                last: last.to_string(),
            }),
            RetryError::Cancelled => None,
        }
    }
}
