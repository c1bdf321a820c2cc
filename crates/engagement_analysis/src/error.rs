use engagement_ids::CodeSchemeId;
use engagement_store::StoreError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("Code scheme '{0}' is not in the registry")]
    UnknownScheme(CodeSchemeId),

    #[error("Age source column '{source_column}' not found before '{column}'")]
    MissingAgeSource { column: String, source_column: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Export of '{name}' failed: {source}")]
    Export {
        name: String,
        #[source]
        source: ExportError,
    },

    #[error("Analysis worker failed: {0}")]
    Worker(String),
}

/// Failure reported by an [`ExportSink`](crate::ExportSink).
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not encode {0}")]
    Encode(String),
}
