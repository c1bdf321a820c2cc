//! Analysis datasets: exportable tables derived from coded messages.

use chrono::{DateTime, Utc};
use engagement_config::{AnalysisDatasetType, AnalysisLocation};
use engagement_ids::{CodeId, CodeSchemeId, ParticipantUuid};
use engagement_protocol::MessageKey;
use engagement_vocab::{Code, CodeScheme, ControlCode};
use serde::Serialize;
use std::collections::BTreeMap;

/// One resolved value in an analysis column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CellValue {
    /// `None` when the scheme has no code for a propagated control value
    pub code_id: Option<CodeId>,
    pub string_value: String,
    pub numeric_value: Option<i64>,
    pub control_code: Option<ControlCode>,
}

impl CellValue {
    pub fn from_code(code: &Code) -> Self {
        Self {
            code_id: Some(code.code_id.clone()),
            string_value: code.string_value.clone(),
            numeric_value: code.numeric_value,
            control_code: code.control_code,
        }
    }

    /// The scheme's code for `control`, or a bare control value if it has none.
    pub fn control(scheme: &CodeScheme, control: ControlCode) -> Self {
        match scheme.control_code(control) {
            Some(code) => Self::from_code(code),
            None => Self {
                code_id: None,
                string_value: control.as_str().to_string(),
                numeric_value: None,
                control_code: Some(control),
            },
        }
    }

    pub fn is_control(&self) -> bool {
        self.control_code.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnalysisColumn {
    pub name: String,
    pub scheme_id: CodeSchemeId,
    pub location: Option<AnalysisLocation>,
    /// Computed from another column rather than read from labels
    pub derived: bool,
}

/// One row: a coded response (RQA) or a participant (demographic).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnalysisRecord {
    pub participant_uuid: ParticipantUuid,
    pub message_keys: Vec<MessageKey>,
    pub received_at: DateTime<Utc>,
    pub raw_text: String,
    /// Aligned with [`AnalysisDataset::columns`]; one value per coded slot
    pub cells: Vec<Vec<CellValue>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnalysisDataset {
    pub name: String,
    pub dataset_type: AnalysisDatasetType,
    pub raw_dataset: String,
    pub columns: Vec<AnalysisColumn>,
    pub records: Vec<AnalysisRecord>,
}

impl AnalysisDataset {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Cells of `column` for every record, in record order.
    pub fn column_cells<'a>(&'a self, column: &str) -> impl Iterator<Item = &'a [CellValue]> + 'a {
        let idx = self.column_index(column);
        self.records
            .iter()
            .filter_map(move |record| idx.and_then(|i| record.cells.get(i)).map(Vec::as_slice))
    }

    /// Per-column counts of each string value.
    pub fn category_counts(&self) -> BTreeMap<String, BTreeMap<String, usize>> {
        let mut counts: BTreeMap<String, BTreeMap<String, usize>> = self
            .columns
            .iter()
            .map(|c| (c.name.clone(), BTreeMap::new()))
            .collect();

        for record in &self.records {
            for (column, cells) in self.columns.iter().zip(&record.cells) {
                let Some(column_counts) = counts.get_mut(&column.name) else {
                    continue;
                };
                for cell in cells {
                    *column_counts.entry(cell.string_value.clone()).or_default() += 1;
                }
            }
        }
        counts
    }

    /// Distinct participants with at least one record.
    pub fn participant_count(&self) -> usize {
        let mut participants: Vec<&ParticipantUuid> =
            self.records.iter().map(|r| &r.participant_uuid).collect();
        participants.sort();
        participants.dedup();
        participants.len()
    }
}
