use serde::Serialize;
use std::collections::BTreeMap;

/// Per analysis-dataset counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DatasetAnalysisCounts {
    pub messages_read: usize,
    pub test_participants_excluded: usize,
    pub uncoded_excluded: usize,
    pub records: usize,
    pub participants: usize,
    pub not_reviewed_cells: usize,
}

/// Summary of one analysis stage run, keyed by analysis dataset name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AnalysisReport {
    pub datasets: BTreeMap<String, DatasetAnalysisCounts>,
    pub exported: usize,
    pub cancelled: bool,
}

impl AnalysisReport {
    pub fn total_records(&self) -> usize {
        self.datasets.values().map(|d| d.records).sum()
    }
}
