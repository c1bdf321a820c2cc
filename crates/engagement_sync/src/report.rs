use engagement_ids::{DatasetName, FlowName};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// `(flow, field)` has no dataset binding
    Unconfigured,
    /// Field name is not a valid identifier
    InvalidField(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Unconfigured => f.write_str("no dataset configured"),
            SkipReason::InvalidField(reason) => write!(f, "invalid field: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedResponse {
    pub flow: FlowName,
    pub field: String,
    pub participant_external_id: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DatasetSyncCounts {
    pub inserted: usize,
    pub unchanged: usize,
    pub conflicts: usize,
}

/// Summary of one sync stage run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub flows_fetched: usize,
    pub responses_seen: usize,
    pub inserted: usize,
    pub unchanged: usize,
    pub conflicts: usize,
    pub skipped: Vec<SkippedResponse>,
    pub per_dataset: BTreeMap<DatasetName, DatasetSyncCounts>,
    pub cancelled: bool,
}

impl SyncReport {
    pub fn merge(&mut self, other: SyncReport) {
        self.flows_fetched += other.flows_fetched;
        self.responses_seen += other.responses_seen;
        self.inserted += other.inserted;
        self.unchanged += other.unchanged;
        self.conflicts += other.conflicts;
        self.skipped.extend(other.skipped);
        for (dataset, counts) in other.per_dataset {
            let entry = self.per_dataset.entry(dataset).or_default();
            entry.inserted += counts.inserted;
            entry.unchanged += counts.unchanged;
            entry.conflicts += counts.conflicts;
        }
        self.cancelled |= other.cancelled;
    }

    pub fn written(&self) -> usize {
        self.inserted + self.unchanged + self.conflicts
    }
}
