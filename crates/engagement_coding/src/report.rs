use serde::Serialize;
use std::collections::BTreeMap;

/// Sampled auto-coding errors kept per dataset.
pub const MAX_ERROR_SAMPLES: usize = 5;

/// Per coding-dataset counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DatasetCodingReport {
    pub messages: usize,
    pub auto_coded: usize,
    pub not_coded: usize,
    pub manual_applied: usize,
    pub manual_rejected: usize,
    pub awaiting_manual: usize,
    pub auto_coding_errors: usize,
    pub error_samples: Vec<String>,
    pub ws_moved: usize,
    pub ws_unresolved: usize,
    pub cas_retries: u32,
    pub cancelled: bool,
}

impl DatasetCodingReport {
    pub(crate) fn sample_error(&mut self, sample: String) {
        self.auto_coding_errors += 1;
        if self.error_samples.len() < MAX_ERROR_SAMPLES {
            self.error_samples.push(sample);
        }
    }
}

/// Summary of one coding stage run, keyed by coding-tool dataset id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CodingReport {
    pub datasets: BTreeMap<String, DatasetCodingReport>,
    pub cancelled: bool,
}

impl CodingReport {
    pub fn total(&self) -> DatasetCodingReport {
        let mut total = DatasetCodingReport::default();
        for report in self.datasets.values() {
            total.messages += report.messages;
            total.auto_coded += report.auto_coded;
            total.not_coded += report.not_coded;
            total.manual_applied += report.manual_applied;
            total.manual_rejected += report.manual_rejected;
            total.awaiting_manual += report.awaiting_manual;
            total.auto_coding_errors += report.auto_coding_errors;
            total.ws_moved += report.ws_moved;
            total.ws_unresolved += report.ws_unresolved;
            total.cas_retries += report.cas_retries;
            total.cancelled |= report.cancelled;
        }
        total
    }
}
