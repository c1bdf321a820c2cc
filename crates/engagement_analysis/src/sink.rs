//! Export collaborator.

use crate::dataset::AnalysisDataset;
use crate::error::ExportError;
use async_trait::async_trait;

/// Durable destination for analysis datasets. The format is the sink's concern.
#[async_trait]
pub trait ExportSink: Send + Sync {
    async fn write(&self, name: &str, dataset: &AnalysisDataset) -> Result<(), ExportError>;
}
