//! Configuration model as written in the pipeline TOML file.

use crate::error::ConfigError;
use engagement_ids::{CodeSchemeId, DatasetName, FieldName, FlowName, ParticipantUuid};
use engagement_protocol::{defaults, RetryPolicy};
use engagement_vocab::Cleaner;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Used for log file naming and report headers
    pub pipeline_name: String,

    /// Participants excluded from analysis outputs
    #[serde(default)]
    pub test_participant_uuids: Vec<ParticipantUuid>,

    /// Directory holding code scheme JSON files (relative to the config file)
    #[serde(default = "default_code_schemes_dir")]
    pub code_schemes_dir: PathBuf,

    /// SQLite engagement store (relative to the config file)
    #[serde(default = "default_store_path")]
    pub engagement_store_path: PathBuf,

    /// Concurrent flows / datasets processed per stage
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Retry policy for survey-source and coding-tool calls
    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub coding: CodingConfig,

    #[serde(default)]
    pub analysis: AnalysisConfig,
}

fn default_code_schemes_dir() -> PathBuf {
    PathBuf::from("code_schemes")
}

fn default_store_path() -> PathBuf {
    PathBuf::from(defaults::DEFAULT_STORE_PATH)
}

fn default_workers() -> usize {
    defaults::DEFAULT_WORKERS
}

fn default_slot_count() -> usize {
    1
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub flow_result_configurations: Vec<FlowResultConfiguration>,
}

/// `(flow, field) -> engagement dataset`. Many-to-one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowResultConfiguration {
    pub flow_name: FlowName,
    pub flow_result_field: FieldName,
    pub engagement_db_dataset: DatasetName,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CodingConfig {
    /// Scheme whose checked manual labels move a message to another dataset
    #[serde(default)]
    pub ws_correct_dataset_code_scheme: Option<CodeSchemeId>,

    #[serde(default)]
    pub dataset_configurations: Vec<CodaDatasetConfiguration>,
}

/// One coding-tool dataset bound to one engagement dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodaDatasetConfiguration {
    /// Dataset id in the coding tool
    pub coda_dataset_id: String,
    pub engagement_db_dataset: DatasetName,
    pub code_scheme_configurations: Vec<CodeSchemeConfiguration>,
    /// String value of this dataset's code in the workspace-correction scheme
    #[serde(default)]
    pub ws_code_match_value: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeSchemeConfiguration {
    pub code_scheme: CodeSchemeId,
    #[serde(default)]
    pub auto_coder: Option<Cleaner>,
    /// Number of slots the coding tool exposes for this scheme
    #[serde(default = "default_slot_count")]
    pub coda_code_schemes_count: usize,
    /// Auto-code only while no earlier scheme in the cascade chain has a real code
    #[serde(default)]
    pub cascade: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default)]
    pub dataset_configurations: Vec<AnalysisDatasetConfiguration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisDatasetType {
    ResearchQuestionAnswer,
    Demographic,
    /// Mobile operator per participant, derived from contacts at sync
    Operator,
}

impl fmt::Display for AnalysisDatasetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisDatasetType::ResearchQuestionAnswer => f.write_str("research_question_answer"),
            AnalysisDatasetType::Demographic => f.write_str("demographic"),
            AnalysisDatasetType::Operator => f.write_str("operator"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisDatasetConfiguration {
    pub name: String,
    /// Source datasets; empty for operator datasets, which read every message
    #[serde(default)]
    pub engagement_db_datasets: Vec<DatasetName>,
    pub dataset_type: AnalysisDatasetType,
    /// Name of the raw-text column
    pub raw_dataset: String,
    pub coding_configs: Vec<CodingConfiguration>,
}

/// One analysis column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodingConfiguration {
    pub code_scheme: CodeSchemeId,
    /// Column name
    pub analysis_dataset: String,
    /// Present for derived age-category columns
    #[serde(default)]
    pub age_category_config: Option<AgeCategoryConfiguration>,
    #[serde(default)]
    pub analysis_location: Option<AnalysisLocation>,
}

impl CodingConfiguration {
    /// Derived columns are computed from other columns, never read from labels.
    pub fn is_derived(&self) -> bool {
        self.age_category_config.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgeCategoryConfiguration {
    /// Column holding the numeric age
    pub age_analysis_dataset: String,
    /// Checked in order; first match wins
    pub categories: Vec<AgeCategory>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgeCategory {
    pub low: i64,
    pub high: i64,
    /// String value of the category code
    pub label: String,
}

impl AgeCategory {
    pub fn contains(&self, age: i64) -> bool {
        self.low <= age && age <= self.high
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisLocation {
    MogadishuSubDistrict,
    SomaliaDistrict,
    SomaliaRegion,
    SomaliaState,
    SomaliaZone,
    SomaliaOperator,
}

impl fmt::Display for AnalysisLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AnalysisLocation::MogadishuSubDistrict => "mogadishu_sub_district",
            AnalysisLocation::SomaliaDistrict => "somalia_district",
            AnalysisLocation::SomaliaRegion => "somalia_region",
            AnalysisLocation::SomaliaState => "somalia_state",
            AnalysisLocation::SomaliaZone => "somalia_zone",
            AnalysisLocation::SomaliaOperator => "somalia_operator",
        };
        f.write_str(name)
    }
}

impl PipelineConfig {
    /// Load from a TOML file. Relative paths resolve against the file's directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: PipelineConfig =
            toml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        Ok(config)
    }

    /// Parse TOML text without touching the filesystem.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })
    }

    fn resolve_paths(&mut self, base: &Path) {
        if self.code_schemes_dir.is_relative() {
            self.code_schemes_dir = base.join(&self.code_schemes_dir);
        }
        if self.engagement_store_path.is_relative() {
            self.engagement_store_path = base.join(&self.engagement_store_path);
        }
    }
}
