use engagement_protocol::MessageKey;
use std::path::PathBuf;
use thiserror::Error;

/// Error types for engagement store operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to prepare store directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt row{}: {reason}", .key.as_ref().map(|k| format!(" {}", k.short())).unwrap_or_default())]
    Corrupt {
        key: Option<MessageKey>,
        reason: String,
    },

    #[error("Message not found: {0}")]
    NotFound(MessageKey),

    #[error("Message {key} still conflicting after {attempts} compare-and-swap attempts")]
    CasExhausted { key: MessageKey, attempts: u32 },
}
