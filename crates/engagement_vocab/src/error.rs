use engagement_ids::CodeSchemeId;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or validating code schemes.
#[derive(Debug, Error)]
pub enum VocabError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse code scheme {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid code scheme '{scheme_id}': {reason}")]
    InvalidScheme { scheme_id: String, reason: String },

    #[error("Code scheme '{scheme_id}' defined twice ({first} and {second})")]
    DuplicateScheme {
        scheme_id: CodeSchemeId,
        first: String,
        second: String,
    },

    #[error("Code scheme directory not found: {0}")]
    MissingDirectory(PathBuf),
}

impl VocabError {
    pub(crate) fn invalid(scheme_id: &str, reason: impl Into<String>) -> Self {
        VocabError::InvalidScheme {
            scheme_id: scheme_id.to_string(),
            reason: reason.into(),
        }
    }
}
