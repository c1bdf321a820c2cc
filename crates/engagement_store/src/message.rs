//! Engagement messages and applied labels.

use chrono::{DateTime, Utc};
use engagement_ids::{CodeId, CodeSchemeId, DatasetName, FieldName, FlowName, ParticipantUuid};
use engagement_protocol::{content_hash, message_key, normalize_received_at, MessageKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelOrigin {
    Auto,
    Manual,
}

impl fmt::Display for LabelOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabelOrigin::Auto => f.write_str("auto"),
            LabelOrigin::Manual => f.write_str("manual"),
        }
    }
}

/// One entry in a message's label history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedLabel {
    pub scheme_id: CodeSchemeId,
    pub code_id: CodeId,
    /// Coding-tool slot (0-based); multi-select schemes use several slots
    pub slot: usize,
    pub origin: LabelOrigin,
    pub checked: bool,
    pub labelled_at: DateTime<Utc>,
    /// Cleaner name for auto labels, coder for manual ones
    pub origin_name: String,
}

impl AppliedLabel {
    /// Checked manual > unchecked manual > auto.
    fn precedence(&self) -> u8 {
        match (self.origin, self.checked) {
            (LabelOrigin::Manual, true) => 2,
            (LabelOrigin::Manual, false) => 1,
            (LabelOrigin::Auto, _) => 0,
        }
    }
}

/// Canonical stored form of one participant response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngagementMessage {
    pub message_key: MessageKey,
    pub participant_uuid: ParticipantUuid,
    /// Current dataset; changes only through workspace correction
    pub dataset: DatasetName,
    /// Dataset assigned at sync; part of the uniqueness key
    pub origin_dataset: DatasetName,
    pub origin_flow: FlowName,
    pub origin_field: FieldName,
    pub received_at: DateTime<Utc>,
    pub raw_text: String,
    /// Mobile network operator of the participant's contact, set at sync
    pub operator: Option<String>,
    pub labels: Vec<AppliedLabel>,
    pub previous_datasets: Vec<DatasetName>,
    /// Compare-and-swap token
    pub version: i64,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub needs_review: bool,
}

impl EngagementMessage {
    /// Effective label for `(scheme, slot)`.
    ///
    /// Ranked by origin/checked precedence, then `labelled_at`, then history
    /// position (later wins).
    pub fn effective_label(&self, scheme_id: &CodeSchemeId, slot: usize) -> Option<&AppliedLabel> {
        self.labels
            .iter()
            .enumerate()
            .filter(|(_, l)| &l.scheme_id == scheme_id && l.slot == slot)
            .max_by_key(|(pos, l)| (l.precedence(), l.labelled_at, *pos))
            .map(|(_, l)| l)
    }

    /// Effective labels for every slot of `scheme_id` that has one, by slot.
    pub fn effective_labels(&self, scheme_id: &CodeSchemeId) -> Vec<&AppliedLabel> {
        let mut best: BTreeMap<usize, (usize, &AppliedLabel)> = BTreeMap::new();
        for (pos, label) in self.labels.iter().enumerate() {
            if &label.scheme_id != scheme_id {
                continue;
            }
            let replace = match best.get(&label.slot) {
                Some((best_pos, current)) => {
                    (label.precedence(), label.labelled_at, pos)
                        > (current.precedence(), current.labelled_at, *best_pos)
                }
                None => true,
            };
            if replace {
                best.insert(label.slot, (pos, label));
            }
        }
        best.into_values().map(|(_, label)| label).collect()
    }

    /// Whether an effective manual label exists on any slot of `scheme_id`.
    pub fn has_manual_label(&self, scheme_id: &CodeSchemeId) -> bool {
        self.effective_labels(scheme_id)
            .iter()
            .any(|l| l.origin == LabelOrigin::Manual)
    }

    /// Whether any slot of `scheme_id` has a checked effective label.
    pub fn has_checked_label(&self, scheme_id: &CodeSchemeId) -> bool {
        self.effective_labels(scheme_id).iter().any(|l| l.checked)
    }

    /// Exact-duplicate check used when merging labels from the coding tool.
    pub fn contains_label(&self, label: &AppliedLabel) -> bool {
        self.labels.iter().any(|existing| existing == label)
    }
}

/// A response mapped to a dataset, ready to be written by the sync stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub participant_uuid: ParticipantUuid,
    pub dataset: DatasetName,
    pub origin_flow: FlowName,
    pub origin_field: FieldName,
    pub received_at: DateTime<Utc>,
    pub raw_text: String,
    pub operator: Option<String>,
}

impl NewMessage {
    pub fn new(
        participant_uuid: ParticipantUuid,
        dataset: DatasetName,
        origin_flow: FlowName,
        origin_field: FieldName,
        received_at: DateTime<Utc>,
        raw_text: impl Into<String>,
    ) -> Self {
        Self {
            participant_uuid,
            dataset,
            origin_flow,
            origin_field,
            received_at: normalize_received_at(received_at),
            raw_text: raw_text.into(),
            operator: None,
        }
    }

    pub fn with_operator(mut self, operator: Option<impl Into<String>>) -> Self {
        self.operator = operator.map(Into::into);
        self
    }

    pub fn key(&self) -> MessageKey {
        message_key(
            &self.participant_uuid,
            &self.dataset,
            &self.origin_flow,
            self.received_at,
        )
    }

    pub fn content_hash(&self) -> String {
        content_hash(&self.origin_field, &self.raw_text)
    }
}

/// Same key re-synced with different content. The stored copy is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsistencyError {
    pub message_key: MessageKey,
    pub stored_hash: String,
    pub incoming_hash: String,
}

impl fmt::Display for ConsistencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "message {} re-synced with different content (stored {}, incoming {})",
            self.message_key.short(),
            &self.stored_hash[..self.stored_hash.len().min(12)],
            &self.incoming_hash[..self.incoming_hash.len().min(12)]
        )
    }
}

impl std::error::Error for ConsistencyError {}

/// Result of writing one synced message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// Same key and content; only `last_seen_at` moved
    Unchanged,
    /// First writer wins; message flagged for review
    Conflict(ConsistencyError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 3, 1, 10, minute, 0).unwrap()
    }

    fn label(code: &str, slot: usize, origin: LabelOrigin, checked: bool, minute: u32) -> AppliedLabel {
        AppliedLabel {
            scheme_id: CodeSchemeId::parse("gender").unwrap(),
            code_id: CodeId::parse(code).unwrap(),
            slot,
            origin,
            checked,
            labelled_at: at(minute),
            origin_name: "test".to_string(),
        }
    }

    fn message(labels: Vec<AppliedLabel>) -> EngagementMessage {
        let new = NewMessage::new(
            ParticipantUuid::parse("p1").unwrap(),
            DatasetName::parse("gender").unwrap(),
            FlowName::parse("demog").unwrap(),
            FieldName::parse("gender").unwrap(),
            at(0),
            "male",
        );
        EngagementMessage {
            message_key: new.key(),
            participant_uuid: new.participant_uuid,
            dataset: new.dataset.clone(),
            origin_dataset: new.dataset,
            origin_flow: new.origin_flow,
            origin_field: new.origin_field,
            received_at: new.received_at,
            raw_text: new.raw_text,
            operator: new.operator,
            labels,
            previous_datasets: Vec::new(),
            version: 0,
            first_seen_at: at(0),
            last_seen_at: at(0),
            needs_review: false,
        }
    }

    #[test]
    fn test_manual_beats_later_auto() {
        let msg = message(vec![
            label("female", 0, LabelOrigin::Manual, true, 1),
            label("male", 0, LabelOrigin::Auto, true, 5),
        ]);
        let scheme = CodeSchemeId::parse("gender").unwrap();
        assert_eq!(msg.effective_label(&scheme, 0).unwrap().code_id.as_str(), "female");
    }

    #[test]
    fn test_checked_manual_beats_unchecked_manual() {
        let msg = message(vec![
            label("female", 0, LabelOrigin::Manual, true, 1),
            label("male", 0, LabelOrigin::Manual, false, 9),
        ]);
        let scheme = CodeSchemeId::parse("gender").unwrap();
        assert_eq!(msg.effective_label(&scheme, 0).unwrap().code_id.as_str(), "female");
    }

    #[test]
    fn test_latest_wins_within_rank_and_position_breaks_ties() {
        let scheme = CodeSchemeId::parse("gender").unwrap();
        let msg = message(vec![
            label("female", 0, LabelOrigin::Manual, true, 3),
            label("male", 0, LabelOrigin::Manual, true, 2),
        ]);
        assert_eq!(msg.effective_label(&scheme, 0).unwrap().code_id.as_str(), "female");

        let msg = message(vec![
            label("female", 0, LabelOrigin::Manual, true, 3),
            label("male", 0, LabelOrigin::Manual, true, 3),
        ]);
        assert_eq!(msg.effective_label(&scheme, 0).unwrap().code_id.as_str(), "male");
    }

    #[test]
    fn test_effective_labels_per_slot() {
        let scheme = CodeSchemeId::parse("gender").unwrap();
        let msg = message(vec![
            label("a", 1, LabelOrigin::Manual, true, 1),
            label("b", 0, LabelOrigin::Manual, true, 1),
            label("c", 1, LabelOrigin::Manual, true, 2),
        ]);
        let codes: Vec<&str> = msg
            .effective_labels(&scheme)
            .iter()
            .map(|l| l.code_id.as_str())
            .collect();
        assert_eq!(codes, vec!["b", "c"]);
        assert!(msg.has_checked_label(&scheme));
        assert!(msg.has_manual_label(&scheme));
    }

    #[test]
    fn test_new_message_key_uses_normalized_time() {
        let base = at(0);
        let a = NewMessage::new(
            ParticipantUuid::parse("p1").unwrap(),
            DatasetName::parse("age").unwrap(),
            FlowName::parse("demog").unwrap(),
            FieldName::parse("age").unwrap(),
            base + chrono::Duration::nanoseconds(1_500),
            "23",
        );
        assert_eq!(a.received_at, base + chrono::Duration::microseconds(1));
    }
}
