//! Coding tool collaborator.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use engagement_ids::{CodeId, CodeSchemeId};
use engagement_protocol::{MessageKey, Retryable};
use engagement_store::AppliedLabel;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A label a human coder applied in the coding tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualLabel {
    pub message_key: MessageKey,
    pub scheme_id: CodeSchemeId,
    pub code_id: CodeId,
    #[serde(default)]
    pub slot: usize,
    pub checked: bool,
    pub labelled_at: DateTime<Utc>,
    pub coder: String,
}

/// A message handed to the coding tool for manual review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodingMessage {
    pub message_key: MessageKey,
    pub raw_text: String,
    pub received_at: DateTime<Utc>,
    /// Current effective labels for the dataset's schemes
    pub labels: Vec<AppliedLabel>,
}

#[derive(Debug, Clone, Error)]
pub enum CodingToolError {
    #[error("transient coding tool failure: {0}")]
    Transient(String),

    #[error("coding tool authentication failed: {0}")]
    Auth(String),

    #[error("coding tool unavailable: {0}")]
    Unavailable(String),
}

impl Retryable for CodingToolError {
    fn is_transient(&self) -> bool {
        !matches!(self, CodingToolError::Auth(_))
    }
}

/// Human coding tool holding one dataset per coding configuration.
#[async_trait]
pub trait CodingTool: Send + Sync {
    async fn get_manual_labels(&self, coda_dataset_id: &str) -> Result<Vec<ManualLabel>, CodingToolError>;

    async fn push_messages(
        &self,
        coda_dataset_id: &str,
        messages: Vec<CodingMessage>,
    ) -> Result<(), CodingToolError>;
}
