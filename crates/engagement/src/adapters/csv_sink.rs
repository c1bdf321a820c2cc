use async_trait::async_trait;
use engagement_analysis::{AnalysisDataset, CellValue, ExportError, ExportSink};
use engagement_protocol::defaults::RAW_TEXT_JOINER;
use std::path::{Path, PathBuf};

/// Writes `<dir>/<name>.csv` (one row per record) and `<dir>/<name>_counts.csv`.
#[derive(Debug, Clone)]
pub struct CsvExportSink {
    dir: PathBuf,
}

impl CsvExportSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn records_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.csv", name))
    }

    pub fn counts_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}_counts.csv", name))
    }

    fn write_records(&self, path: &Path, dataset: &AnalysisDataset) -> Result<(), ExportError> {
        let mut writer = csv::Writer::from_path(path).map_err(|e| encode(path, e))?;

        let mut header = vec![
            "participant_uuid".to_string(),
            "received_at".to_string(),
            dataset.raw_dataset.clone(),
        ];
        header.extend(dataset.columns.iter().map(|c| c.name.clone()));
        writer.write_record(&header).map_err(|e| encode(path, e))?;

        for record in &dataset.records {
            let mut row = vec![
                record.participant_uuid.to_string(),
                record.received_at.to_rfc3339(),
                record.raw_text.clone(),
            ];
            row.extend(record.cells.iter().map(|cells| join_cells(cells)));
            writer.write_record(&row).map_err(|e| encode(path, e))?;
        }
        writer.flush().map_err(|source| ExportError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    fn write_counts(&self, path: &Path, dataset: &AnalysisDataset) -> Result<(), ExportError> {
        let mut writer = csv::Writer::from_path(path).map_err(|e| encode(path, e))?;
        writer
            .write_record(["column", "value", "count"])
            .map_err(|e| encode(path, e))?;
        for (column, counts) in dataset.category_counts() {
            for (value, count) in counts {
                writer
                    .write_record([column.as_str(), value.as_str(), &count.to_string()])
                    .map_err(|e| encode(path, e))?;
            }
        }
        writer.flush().map_err(|source| ExportError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn join_cells(cells: &[CellValue]) -> String {
    cells
        .iter()
        .map(|c| c.string_value.as_str())
        .collect::<Vec<_>>()
        .join(RAW_TEXT_JOINER)
}

fn encode(path: &Path, err: csv::Error) -> ExportError {
    ExportError::Encode(format!("{}: {}", path.display(), err))
}

#[async_trait]
impl ExportSink for CsvExportSink {
    async fn write(&self, name: &str, dataset: &AnalysisDataset) -> Result<(), ExportError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| ExportError::Io {
            path: self.dir.clone(),
            source,
        })?;
        self.write_records(&self.records_path(name), dataset)?;
        self.write_counts(&self.counts_path(name), dataset)
    }
}
