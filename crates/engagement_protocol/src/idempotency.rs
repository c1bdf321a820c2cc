use blake3::Hasher;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use engagement_ids::{DatasetName, FieldName, FlowName, ParticipantUuid};
use serde::{Deserialize, Serialize};
use std::fmt;

const SEP: u8 = 0x1f;

fn hash_parts(parts: &[&str]) -> String {
    let mut hasher = Hasher::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(&[SEP]);
    }
    hasher.finalize().to_hex().to_string()
}

/// Stable identity of one engagement message.
///
/// Derived from the uniqueness tuple, so re-syncing the same external response
/// always lands on the same key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageKey(String);

impl MessageKey {
    /// Wrap a key previously produced by [`message_key`] (e.g. read back from storage).
    pub fn from_raw(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log output.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Truncate a timestamp to the precision the store keeps (microseconds).
pub fn normalize_received_at(received_at: DateTime<Utc>) -> DateTime<Utc> {
    received_at.trunc_subsecs(6)
}

/// Canonical text form of `received_at` used in keys and storage.
///
/// Fixed width, so lexical order in SQLite matches time order.
pub fn received_at_text(received_at: DateTime<Utc>) -> String {
    normalize_received_at(received_at).to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Stable key for an engagement message.
///
/// Components:
/// - participant_uuid
/// - origin_dataset (the dataset assigned at sync, never the current one)
/// - origin_flow
/// - received_at (microsecond precision, UTC)
pub fn message_key(
    participant_uuid: &ParticipantUuid,
    origin_dataset: &DatasetName,
    origin_flow: &FlowName,
    received_at: DateTime<Utc>,
) -> MessageKey {
    let received = received_at_text(received_at);
    MessageKey(hash_parts(&[
        participant_uuid.as_str(),
        origin_dataset.as_str(),
        origin_flow.as_str(),
        &received,
    ]))
}

/// Hash of the synced content of a message.
///
/// Two syncs of the same key with different content hashes are a consistency
/// conflict.
pub fn content_hash(origin_field: &FieldName, raw_text: &str) -> String {
    hash_parts(&[origin_field.as_str(), raw_text])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ids() -> (ParticipantUuid, DatasetName, FlowName) {
        (
            ParticipantUuid::parse("participant-uuid-1").unwrap(),
            DatasetName::parse("gender").unwrap(),
            FlowName::parse("demog").unwrap(),
        )
    }

    #[test]
    fn test_message_key_is_stable() {
        let (p, d, f) = ids();
        let at = Utc.with_ymd_and_hms(2023, 3, 1, 10, 0, 0).unwrap();
        assert_eq!(message_key(&p, &d, &f, at), message_key(&p, &d, &f, at));
    }

    #[test]
    fn test_message_key_ignores_sub_microsecond_noise() {
        let (p, d, f) = ids();
        let base = Utc.with_ymd_and_hms(2023, 3, 1, 10, 0, 0).unwrap();
        let a = base + chrono::Duration::nanoseconds(1_000_100);
        let b = base + chrono::Duration::nanoseconds(1_000_900);
        assert_eq!(message_key(&p, &d, &f, a), message_key(&p, &d, &f, b));
    }

    #[test]
    fn test_message_key_separates_flows() {
        let (p, d, f) = ids();
        let other = FlowName::parse("demog_repeat").unwrap();
        let at = Utc.with_ymd_and_hms(2023, 3, 1, 10, 0, 0).unwrap();
        assert_ne!(message_key(&p, &d, &f, at), message_key(&p, &d, &other, at));
    }

    #[test]
    fn test_received_at_text_is_fixed_width() {
        let a = Utc.with_ymd_and_hms(2023, 3, 1, 10, 0, 0).unwrap();
        let b = a + chrono::Duration::microseconds(5);
        assert_eq!(received_at_text(a).len(), received_at_text(b).len());
        assert!(received_at_text(a) < received_at_text(b));
    }
}
