use crate::source::SourceError;
use engagement_ids::FlowName;
use engagement_protocol::RetryError;
use engagement_store::StoreError;
use thiserror::Error;

/// Stage-level sync failures. Messages written before the failure stay.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Authentication failed while syncing {flow}: {message}")]
    Auth { flow: FlowName, message: String },

    #[error("Gave up on {flow} after {attempts} attempts: {last}")]
    RetriesExhausted {
        flow: FlowName,
        attempts: u32,
        last: String,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Sync worker failed: {0}")]
    Worker(String),
}

impl SyncError {
    /// Convert a retry failure. `None` means the call was cancelled.
    pub(crate) fn from_retry(flow: &FlowName, err: RetryError<SourceError>) -> Option<Self> {
        match err {
            RetryError::Fatal(SourceError::Auth(message)) => Some(SyncError::Auth {
                flow: flow.clone(),
                message,
            }),
            RetryError::Fatal(other) => Some(SyncError::RetriesExhausted {
                flow: flow.clone(),
                attempts: 1,
                last: other.to_string(),
            }),
            RetryError::Exhausted { attempts, last } => Some(SyncError::RetriesExhausted {
                flow: flow.clone(),
                attempts,
                last: last.to_string(),
            }),
            RetryError::Cancelled => None,
        }
    }
}
