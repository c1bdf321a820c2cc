//! Pipeline configuration.
//!
//! Loaded once from TOML, validated against the vocabulary registry, then
//! passed to every stage as an immutable [`ValidatedConfig`].

pub mod error;
pub mod model;
pub mod validate;

pub use error::{ConfigError, ConfigIssue};
pub use model::{
    AgeCategory, AgeCategoryConfiguration, AnalysisConfig, AnalysisDatasetConfiguration,
    AnalysisDatasetType, AnalysisLocation, CodaDatasetConfiguration, CodeSchemeConfiguration,
    CodingConfig, CodingConfiguration, FlowResultConfiguration, PipelineConfig, SyncConfig,
};
pub use validate::ValidatedConfig;
