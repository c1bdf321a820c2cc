//! Per-dataset coding rules, resolved against the registry once per run.
//!
//! [`DatasetPlan::apply`] is the pure part of the coding stage: given a
//! message and the manual labels fetched for it, it appends labels and
//! possibly moves the message. It runs inside a compare-and-swap loop, so it
//! must be deterministic for a given input.

use crate::cleaners::CleanerRegistry;
use crate::error::CodingError;
use crate::tool::{CodingMessage, ManualLabel};
use chrono::{DateTime, Utc};
use engagement_config::{CodaDatasetConfiguration, ValidatedConfig};
use engagement_ids::{CodeId, DatasetName};
use engagement_store::{AppliedLabel, EngagementMessage, LabelOrigin};
use engagement_vocab::{Cleaner, CodeScheme, ControlCode, VocabularyRegistry};
use std::collections::HashMap;
use std::sync::Arc;

const CASCADE_ORIGIN: &str = "cascade";

#[derive(Debug)]
struct PlannedScheme {
    scheme: Arc<CodeScheme>,
    cleaner: Option<Cleaner>,
    slots: usize,
    cascade: bool,
}

#[derive(Debug)]
struct WsPlan {
    scheme: Arc<CodeScheme>,
    own_value: Option<String>,
    /// ws code string value -> engagement dataset
    targets: HashMap<String, DatasetName>,
}

/// What happened to one message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageOutcome {
    pub manual_applied: usize,
    pub auto_coded: usize,
    pub not_coded: usize,
    pub auto_coding_errors: Vec<String>,
    pub moved_to: Option<DatasetName>,
    pub ws_unresolved: bool,
    /// Message left this dataset before it could be coded
    pub skipped: bool,
}

#[derive(Debug)]
pub struct DatasetPlan {
    coda_dataset_id: String,
    dataset: DatasetName,
    schemes: Vec<PlannedScheme>,
    ws: Option<WsPlan>,
}

impl DatasetPlan {
    pub fn build(
        dataset: &CodaDatasetConfiguration,
        config: &ValidatedConfig,
        registry: &VocabularyRegistry,
        cleaners: &CleanerRegistry,
    ) -> Result<Self, CodingError> {
        let mut schemes = Vec::with_capacity(dataset.code_scheme_configurations.len());
        for cfg in &dataset.code_scheme_configurations {
            let scheme = registry
                .get(&cfg.code_scheme)
                .cloned()
                .ok_or_else(|| CodingError::UnknownScheme(cfg.code_scheme.clone()))?;
            schemes.push(PlannedScheme {
                scheme,
                cleaner: cleaners.get(&cfg.code_scheme).cloned(),
                slots: cfg.coda_code_schemes_count,
                cascade: cfg.cascade,
            });
        }

        let ws = match config.ws_correct_dataset_code_scheme() {
            Some(ws_id) => {
                let scheme = registry
                    .get(ws_id)
                    .cloned()
                    .ok_or_else(|| CodingError::UnknownScheme(ws_id.clone()))?;
                let targets = config
                    .coding_datasets()
                    .iter()
                    .filter_map(|d| {
                        d.ws_code_match_value
                            .as_ref()
                            .map(|value| (value.clone(), d.engagement_db_dataset.clone()))
                    })
                    .collect();
                Some(WsPlan {
                    scheme,
                    own_value: dataset.ws_code_match_value.clone(),
                    targets,
                })
            }
            None => None,
        };

        Ok(Self {
            coda_dataset_id: dataset.coda_dataset_id.clone(),
            dataset: dataset.engagement_db_dataset.clone(),
            schemes,
            ws,
        })
    }

    pub fn coda_dataset_id(&self) -> &str {
        &self.coda_dataset_id
    }

    pub fn dataset(&self) -> &DatasetName {
        &self.dataset
    }

    /// Validate a label from the coding tool against this dataset's schemes.
    pub fn check_manual(&self, label: &ManualLabel) -> Result<AppliedLabel, String> {
        let (scheme, slots) = match self
            .schemes
            .iter()
            .find(|s| s.scheme.scheme_id() == &label.scheme_id)
        {
            Some(planned) => (&planned.scheme, planned.slots),
            None => match &self.ws {
                Some(ws) if ws.scheme.scheme_id() == &label.scheme_id => (&ws.scheme, 1),
                _ => {
                    return Err(format!(
                        "scheme '{}' is not coded in {}",
                        label.scheme_id, self.coda_dataset_id
                    ))
                }
            },
        };

        if label.slot >= slots {
            return Err(format!(
                "slot {} out of range for '{}' ({} slots)",
                label.slot, label.scheme_id, slots
            ));
        }
        if scheme.code(&label.code_id).is_none() {
            return Err(format!(
                "code '{}' is not in scheme '{}'",
                label.code_id, label.scheme_id
            ));
        }

        Ok(AppliedLabel {
            scheme_id: label.scheme_id.clone(),
            code_id: label.code_id.clone(),
            slot: label.slot,
            origin: LabelOrigin::Manual,
            checked: label.checked,
            labelled_at: label.labelled_at,
            origin_name: label.coder.clone(),
        })
    }

    /// Merge manual labels, apply workspace correction, then auto-code.
    ///
    /// Returns `(changed, outcome)` for the compare-and-swap loop.
    pub fn apply(
        &self,
        message: &mut EngagementMessage,
        manual: &[AppliedLabel],
        now: DateTime<Utc>,
    ) -> (bool, MessageOutcome) {
        let mut outcome = MessageOutcome::default();
        if message.dataset != self.dataset {
            outcome.skipped = true;
            return (false, outcome);
        }

        let mut changed = false;
        for label in manual {
            if !message.contains_label(label) {
                message.labels.push(label.clone());
                outcome.manual_applied += 1;
                changed = true;
            }
        }

        if let Some(ws) = &self.ws {
            if let Some(value) = ws_correction(ws, message) {
                if Some(&value) != ws.own_value.as_ref() {
                    match ws.targets.get(&value) {
                        Some(target) if target != &message.dataset => {
                            let current = std::mem::replace(&mut message.dataset, target.clone());
                            message.previous_datasets.push(current);
                            outcome.moved_to = Some(target.clone());
                            return (true, outcome);
                        }
                        Some(_) => {}
                        None => outcome.ws_unresolved = true,
                    }
                }
            }
        }

        // Whether any scheme earlier in the current cascade chain resolved to
        // a real code. A non-cascading scheme starts a new chain.
        let mut chain_coded = false;
        for planned in &self.schemes {
            let scheme_id = planned.scheme.scheme_id();
            if !planned.cascade {
                chain_coded = false;
            }

            if let Some(cleaner) = &planned.cleaner {
                if !message.has_manual_label(scheme_id) {
                    if let Some(label) =
                        self.auto_label(planned, cleaner, message, chain_coded, now, &mut outcome)
                    {
                        let current = message.effective_label(scheme_id, 0);
                        let same = current.map_or(false, |c| {
                            c.origin == LabelOrigin::Auto
                                && c.code_id == label.code_id
                                && c.checked == label.checked
                        });
                        if !same {
                            if is_not_coded(&planned.scheme, &label.code_id) {
                                outcome.not_coded += 1;
                            } else {
                                outcome.auto_coded += 1;
                            }
                            message.labels.push(label);
                            changed = true;
                        }
                    }
                }
            }

            chain_coded |= message
                .effective_label(scheme_id, 0)
                .map_or(false, |label| !is_not_coded(&planned.scheme, &label.code_id));
        }

        (changed, outcome)
    }

    fn auto_label(
        &self,
        planned: &PlannedScheme,
        cleaner: &Cleaner,
        message: &EngagementMessage,
        chain_coded: bool,
        now: DateTime<Utc>,
        outcome: &mut MessageOutcome,
    ) -> Option<AppliedLabel> {
        let scheme = &planned.scheme;
        let label = |code_id: CodeId, checked: bool, origin_name: String| AppliedLabel {
            scheme_id: scheme.scheme_id().clone(),
            code_id,
            slot: 0,
            origin: LabelOrigin::Auto,
            checked,
            labelled_at: now,
            origin_name,
        };

        if planned.cascade && chain_coded {
            return match scheme.not_coded() {
                Some(nc) => Some(label(nc.code_id.clone(), true, CASCADE_ORIGIN.to_string())),
                None => {
                    outcome
                        .auto_coding_errors
                        .push(format!("{}: no NOT_CODED code", scheme.scheme_id()));
                    None
                }
            };
        }

        match cleaner.auto_code(&message.raw_text, scheme) {
            Ok(code) => {
                let checked = code.control_code != Some(ControlCode::NotCoded);
                Some(label(code.code_id.clone(), checked, cleaner.to_string()))
            }
            Err(err) => {
                outcome.auto_coding_errors.push(format!(
                    "{} [{}]: {}",
                    message.message_key.short(),
                    scheme.scheme_id(),
                    err
                ));
                scheme
                    .not_coded()
                    .map(|nc| label(nc.code_id.clone(), false, cleaner.to_string()))
            }
        }
    }

    /// True if any scheme of this dataset lacks a checked effective label.
    pub fn awaiting_manual(&self, message: &EngagementMessage) -> bool {
        self.schemes
            .iter()
            .any(|planned| !message.has_checked_label(planned.scheme.scheme_id()))
    }

    /// Message as pushed to the coding tool, with current effective labels.
    pub fn coding_message(&self, message: &EngagementMessage) -> CodingMessage {
        let mut labels: Vec<AppliedLabel> = self
            .schemes
            .iter()
            .flat_map(|planned| message.effective_labels(planned.scheme.scheme_id()))
            .cloned()
            .collect();
        if let Some(ws) = &self.ws {
            labels.extend(message.effective_labels(ws.scheme.scheme_id()).into_iter().cloned());
        }

        CodingMessage {
            message_key: message.message_key.clone(),
            raw_text: message.raw_text.clone(),
            received_at: message.received_at,
            labels,
        }
    }
}

fn is_not_coded(scheme: &CodeScheme, code_id: &CodeId) -> bool {
    scheme
        .code(code_id)
        .map_or(false, |code| code.control_code == Some(ControlCode::NotCoded))
}

/// String value named by a checked manual, non-control ws label, if any.
fn ws_correction(ws: &WsPlan, message: &EngagementMessage) -> Option<String> {
    message
        .effective_labels(ws.scheme.scheme_id())
        .into_iter()
        .filter(|l| l.origin == LabelOrigin::Manual && l.checked)
        .filter_map(|l| ws.scheme.code(&l.code_id))
        .find(|code| !code.is_control())
        .map(|code| code.string_value.clone())
}
