//! Collaborators of the sync stage.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use engagement_ids::{FlowName, ParticipantUuid};
use engagement_protocol::Retryable;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One answer to one flow result field, as exported by the survey platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurveyResponse {
    pub result_field: String,
    pub value: String,
    pub timestamp: DateTime<Utc>,
    pub participant_external_id: String,
}

/// Failures reported by a survey source or identity resolver.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("transient source failure: {0}")]
    Transient(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("source unavailable: {0}")]
    Unavailable(String),
}

impl Retryable for SourceError {
    fn is_transient(&self) -> bool {
        !matches!(self, SourceError::Auth(_))
    }
}

/// Survey platform holding flow results.
#[async_trait]
pub trait SurveySource: Send + Sync {
    /// All responses recorded for `flow_name`.
    async fn fetch_responses(&self, flow_name: &FlowName) -> Result<Vec<SurveyResponse>, SourceError>;
}

/// Maps platform contact ids onto de-identified participant uuids.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, external_id: &str) -> Result<ParticipantUuid, SourceError>;
}
