use async_trait::async_trait;
use engagement_ids::ParticipantUuid;
use engagement_sync::{IdentityResolver, SourceError};
use uuid::Uuid;

const DEFAULT_PREFIX: &str = "avf-participant-uuid-";

/// Deterministic resolver: `<prefix><uuid v5 of the external id>`.
///
/// The same contact always maps to the same participant, so re-syncing a
/// flow never creates new participants.
#[derive(Debug, Clone)]
pub struct PrefixedUuidResolver {
    prefix: String,
    namespace: Uuid,
}

impl PrefixedUuidResolver {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            namespace: Uuid::NAMESPACE_URL,
        }
    }

    pub fn uuid_for(&self, external_id: &str) -> String {
        let id = Uuid::new_v5(&self.namespace, external_id.trim().as_bytes());
        format!("{}{}", self.prefix, id)
    }
}

impl Default for PrefixedUuidResolver {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

#[async_trait]
impl IdentityResolver for PrefixedUuidResolver {
    async fn resolve(&self, external_id: &str) -> Result<ParticipantUuid, SourceError> {
        ParticipantUuid::parse(&self.uuid_for(external_id))
            .map_err(|e| SourceError::Unavailable(e.to_string()))
    }
}
