//! Pre-flight validation.
//!
//! Every rule is checked and every failure collected, so one run reports all
//! problems in the file. Nothing here touches the store or collaborators.

use crate::error::{ConfigError, ConfigIssue};
use crate::model::{
    AnalysisDatasetConfiguration, AnalysisDatasetType, CodaDatasetConfiguration,
    FlowResultConfiguration, PipelineConfig,
};
use engagement_ids::{CodeSchemeId, DatasetName, FieldName, FlowName, ParticipantUuid};
use engagement_protocol::defaults::{HARD_MAX_WORKERS, MAX_CODING_SLOTS};
use engagement_vocab::{Cleaner, VocabularyRegistry};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::warn;

/// Configuration that passed validation against a registry.
///
/// Immutable; shared by every stage behind an `Arc`.
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    config: Arc<PipelineConfig>,
    bindings: BTreeMap<(FlowName, FieldName), DatasetName>,
    flow_names: Vec<FlowName>,
    test_participants: HashSet<ParticipantUuid>,
    workers: usize,
}

impl ValidatedConfig {
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn pipeline_name(&self) -> &str {
        &self.config.pipeline_name
    }

    /// Dataset bound to `(flow, field)`, if configured.
    pub fn dataset_for(&self, flow: &FlowName, field: &FieldName) -> Option<&DatasetName> {
        self.bindings.get(&(flow.clone(), field.clone()))
    }

    /// De-duplicated flow/field bindings.
    pub fn bindings(&self) -> impl Iterator<Item = (&FlowName, &FieldName, &DatasetName)> {
        self.bindings
            .iter()
            .map(|((flow, field), dataset)| (flow, field, dataset))
    }

    /// Distinct flow names, in configuration order.
    pub fn flow_names(&self) -> &[FlowName] {
        &self.flow_names
    }

    pub fn is_test_participant(&self, participant: &ParticipantUuid) -> bool {
        self.test_participants.contains(participant)
    }

    /// Worker cap, clamped to `1..=HARD_MAX_WORKERS`.
    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn coding_datasets(&self) -> &[CodaDatasetConfiguration] {
        &self.config.coding.dataset_configurations
    }

    pub fn analysis_datasets(&self) -> &[AnalysisDatasetConfiguration] {
        &self.config.analysis.dataset_configurations
    }

    pub fn ws_correct_dataset_code_scheme(&self) -> Option<&CodeSchemeId> {
        self.config.coding.ws_correct_dataset_code_scheme.as_ref()
    }

    /// Coding dataset whose `ws_code_match_value` is `value`.
    pub fn coding_dataset_for_ws_value(&self, value: &str) -> Option<&CodaDatasetConfiguration> {
        self.coding_datasets()
            .iter()
            .find(|d| d.ws_code_match_value.as_deref() == Some(value))
    }
}

impl PipelineConfig {
    /// Validate against `registry`, collecting every issue.
    pub fn validate(self, registry: &VocabularyRegistry) -> Result<ValidatedConfig, ConfigError> {
        let mut v = Validator {
            registry,
            issues: Vec::new(),
        };

        if self.pipeline_name.trim().is_empty() {
            v.issue("pipeline_name", "must not be empty");
        }
        if self.workers == 0 {
            v.issue("workers", "must be at least 1");
        } else if self.workers > HARD_MAX_WORKERS {
            warn!(
                workers = self.workers,
                cap = HARD_MAX_WORKERS,
                "workers above hard cap; clamping"
            );
        }
        if self.retry.max_attempts == 0 {
            v.issue("retry.max_attempts", "must be at least 1");
        }

        let (bindings, flow_names) = v.check_flow_bindings(&self.sync.flow_result_configurations);
        let synced: BTreeSet<&DatasetName> = bindings.values().copied().collect();

        v.check_coding(&self);
        v.check_analysis(&self, &synced);

        if !v.issues.is_empty() {
            return Err(ConfigError::Invalid(v.issues));
        }

        let bindings = bindings
            .into_iter()
            .map(|(key, dataset)| (key, dataset.clone()))
            .collect();
        let test_participants = self.test_participant_uuids.iter().cloned().collect();
        let workers = self.workers.clamp(1, HARD_MAX_WORKERS);

        Ok(ValidatedConfig {
            config: Arc::new(self),
            bindings,
            flow_names,
            test_participants,
            workers,
        })
    }
}

struct Validator<'a> {
    registry: &'a VocabularyRegistry,
    issues: Vec<ConfigIssue>,
}

impl<'a> Validator<'a> {
    fn issue(&mut self, location: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ConfigIssue::new(location, message));
    }

    fn require_scheme(&mut self, location: &str, scheme_id: &CodeSchemeId) -> bool {
        if self.registry.contains(scheme_id) {
            true
        } else {
            self.issue(location, format!("unknown code scheme '{}'", scheme_id));
            false
        }
    }

    fn check_flow_bindings<'c>(
        &mut self,
        entries: &'c [FlowResultConfiguration],
    ) -> (BTreeMap<(FlowName, FieldName), &'c DatasetName>, Vec<FlowName>) {
        let mut bindings: BTreeMap<(FlowName, FieldName), &DatasetName> = BTreeMap::new();
        let mut flow_names = Vec::new();
        let mut seen_flows = HashSet::new();

        for (idx, entry) in entries.iter().enumerate() {
            let key = (entry.flow_name.clone(), entry.flow_result_field.clone());
            match bindings.get(&key) {
                Some(existing) if *existing == &entry.engagement_db_dataset => {
                    warn!(
                        flow = %entry.flow_name,
                        field = %entry.flow_result_field,
                        "Duplicate flow result configuration ignored"
                    );
                }
                Some(existing) => {
                    let existing = (*existing).clone();
                    self.issue(
                        format!("sync.flow_result_configurations[{}]", idx),
                        format!(
                            "({}, {}) bound to both '{}' and '{}'",
                            entry.flow_name,
                            entry.flow_result_field,
                            existing,
                            entry.engagement_db_dataset
                        ),
                    );
                }
                None => {
                    bindings.insert(key, &entry.engagement_db_dataset);
                }
            }
            if seen_flows.insert(entry.flow_name.clone()) {
                flow_names.push(entry.flow_name.clone());
            }
        }

        (bindings, flow_names)
    }

    fn check_coding(&mut self, config: &PipelineConfig) {
        let coding = &config.coding;
        let ws_scheme = match &coding.ws_correct_dataset_code_scheme {
            Some(id) if self.require_scheme("coding.ws_correct_dataset_code_scheme", id) => {
                self.registry.get(id).cloned()
            }
            _ => None,
        };

        let mut coda_ids = HashSet::new();
        let mut engagement_datasets = HashSet::new();
        let mut ws_values: HashMap<&str, usize> = HashMap::new();
        let mut cleaners: HashMap<&CodeSchemeId, &Cleaner> = HashMap::new();

        for (d_idx, dataset) in coding.dataset_configurations.iter().enumerate() {
            let loc = format!("coding.dataset_configurations[{}]", d_idx);

            if dataset.coda_dataset_id.trim().is_empty() {
                self.issue(&loc, "coda_dataset_id must not be empty");
            } else if !coda_ids.insert(dataset.coda_dataset_id.as_str()) {
                self.issue(
                    &loc,
                    format!("duplicate coda_dataset_id '{}'", dataset.coda_dataset_id),
                );
            }
            if !engagement_datasets.insert(&dataset.engagement_db_dataset) {
                self.issue(
                    &loc,
                    format!(
                        "engagement dataset '{}' is coded by more than one coding dataset",
                        dataset.engagement_db_dataset
                    ),
                );
            }
            if dataset.code_scheme_configurations.is_empty() {
                self.issue(&loc, "no code_scheme_configurations");
            }

            match (&coding.ws_correct_dataset_code_scheme, &dataset.ws_code_match_value) {
                (Some(_), None) => {
                    self.issue(&loc, "ws_code_match_value is required when ws correction is configured")
                }
                (_, Some(value)) => {
                    if let Some(prev) = ws_values.insert(value.as_str(), d_idx) {
                        self.issue(
                            &loc,
                            format!(
                                "ws_code_match_value '{}' already used by dataset_configurations[{}]",
                                value, prev
                            ),
                        );
                    }
                    if let Some(scheme) = &ws_scheme {
                        if scheme.code_for_string_value(value).is_none() {
                            self.issue(
                                &loc,
                                format!(
                                    "ws_code_match_value '{}' is not a code in '{}'",
                                    value,
                                    scheme.scheme_id()
                                ),
                            );
                        }
                    }
                }
                (None, None) => {}
            }

            let mut schemes_here = HashSet::new();
            for (s_idx, cfg) in dataset.code_scheme_configurations.iter().enumerate() {
                let sloc = format!("{}.code_scheme_configurations[{}]", loc, s_idx);
                if !schemes_here.insert(&cfg.code_scheme) {
                    self.issue(&sloc, format!("scheme '{}' listed twice", cfg.code_scheme));
                }
                let known = self.require_scheme(&sloc, &cfg.code_scheme);

                let count = cfg.coda_code_schemes_count;
                if count == 0 || count > MAX_CODING_SLOTS {
                    self.issue(
                        &sloc,
                        format!(
                            "coda_code_schemes_count {} outside 1..={}",
                            count, MAX_CODING_SLOTS
                        ),
                    );
                }

                if let Some(cleaner) = &cfg.auto_coder {
                    if count != 1 {
                        self.issue(
                            &sloc,
                            format!(
                                "auto-coded scheme must have coda_code_schemes_count 1, got {}",
                                count
                            ),
                        );
                    }
                    if known {
                        let has_nc = self
                            .registry
                            .get(&cfg.code_scheme)
                            .map(|s| s.not_coded().is_some())
                            .unwrap_or(false);
                        if !has_nc {
                            self.issue(&sloc, "auto-coded scheme has no NOT_CODED code");
                        }
                    }
                    match cleaners.get(&cfg.code_scheme) {
                        Some(existing) if *existing != cleaner => self.issue(
                            &sloc,
                            format!(
                                "scheme '{}' bound to cleaners {} and {}",
                                cfg.code_scheme, existing, cleaner
                            ),
                        ),
                        Some(_) => {}
                        None => {
                            cleaners.insert(&cfg.code_scheme, cleaner);
                        }
                    }
                }

                if cfg.cascade {
                    if s_idx == 0 {
                        self.issue(&sloc, "the first scheme of a dataset cannot cascade");
                    }
                    if cfg.auto_coder.is_none() {
                        self.issue(&sloc, "cascading scheme needs an auto_coder");
                    }
                }
            }
        }
    }

    fn check_analysis(&mut self, config: &PipelineConfig, synced: &BTreeSet<&DatasetName>) {
        let mut names = HashSet::new();

        for (a_idx, analysis) in config.analysis.dataset_configurations.iter().enumerate() {
            let loc = format!("analysis.dataset_configurations[{}]", a_idx);

            if analysis.name.trim().is_empty() {
                self.issue(&loc, "name must not be empty");
            } else if !names.insert(analysis.name.as_str()) {
                self.issue(&loc, format!("duplicate analysis dataset '{}'", analysis.name));
            }
            let operator = analysis.dataset_type == AnalysisDatasetType::Operator;
            if operator {
                if !analysis.engagement_db_datasets.is_empty() {
                    self.issue(&loc, "operator datasets must not list engagement_db_datasets");
                }
            } else if analysis.engagement_db_datasets.is_empty() {
                self.issue(&loc, "engagement_db_datasets must not be empty");
            }
            for dataset in &analysis.engagement_db_datasets {
                if !synced.contains(dataset) {
                    self.issue(
                        &loc,
                        format!("engagement dataset '{}' has no sync binding", dataset),
                    );
                }
            }

            let mut columns: Vec<&str> = Vec::new();
            if !analysis.raw_dataset.trim().is_empty() {
                columns.push(analysis.raw_dataset.as_str());
            } else {
                self.issue(&loc, "raw_dataset must not be empty");
            }

            for (c_idx, column) in analysis.coding_configs.iter().enumerate() {
                let cloc = format!("{}.coding_configs[{}]", loc, c_idx);
                if columns.contains(&column.analysis_dataset.as_str()) {
                    self.issue(
                        &cloc,
                        format!("duplicate column '{}'", column.analysis_dataset),
                    );
                }
                let known = self.require_scheme(&cloc, &column.code_scheme);
                if operator {
                    if column.is_derived() {
                        self.issue(&cloc, "operator datasets cannot have derived columns");
                    }
                    let has_nc = self
                        .registry
                        .get(&column.code_scheme)
                        .map_or(true, |scheme| scheme.not_coded().is_some());
                    if !has_nc {
                        self.issue(&cloc, "operator scheme has no NOT_CODED code");
                    }
                }

                if let Some(age) = &column.age_category_config {
                    let source_idx = analysis.coding_configs[..c_idx]
                        .iter()
                        .position(|c| c.analysis_dataset == age.age_analysis_dataset);
                    match source_idx {
                        None => self.issue(
                            &cloc,
                            format!(
                                "age source column '{}' must appear earlier in the same dataset",
                                age.age_analysis_dataset
                            ),
                        ),
                        Some(idx) if analysis.coding_configs[idx].is_derived() => self.issue(
                            &cloc,
                            format!(
                                "age source column '{}' is itself derived",
                                age.age_analysis_dataset
                            ),
                        ),
                        Some(_) => {}
                    }
                    if age.categories.is_empty() {
                        self.issue(&cloc, "age_category_config has no categories");
                    }
                    for bucket in &age.categories {
                        if bucket.low > bucket.high {
                            self.issue(
                                &cloc,
                                format!(
                                    "bucket '{}' has low {} > high {}",
                                    bucket.label, bucket.low, bucket.high
                                ),
                            );
                        }
                    }
                    if known {
                        if let Some(scheme) = self.registry.get(&column.code_scheme).cloned() {
                            for bucket in &age.categories {
                                if scheme.code_for_string_value(&bucket.label).is_none() {
                                    self.issue(
                                        &cloc,
                                        format!(
                                            "bucket label '{}' is not a code in '{}'",
                                            bucket.label, column.code_scheme
                                        ),
                                    );
                                }
                            }
                            if scheme.not_coded().is_none() {
                                self.issue(&cloc, "age category scheme has no NOT_CODED code");
                            }
                        }
                    }
                }

                columns.push(column.analysis_dataset.as_str());
            }
        }
    }
}
