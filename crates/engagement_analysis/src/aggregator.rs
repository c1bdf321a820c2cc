//! Analysis aggregator: fold coded messages into analysis datasets.

use crate::columns::ColumnSet;
use crate::dataset::{AnalysisDataset, AnalysisRecord, CellValue};
use crate::error::AnalysisError;
use crate::report::{AnalysisReport, DatasetAnalysisCounts};
use crate::sink::ExportSink;
use engagement_config::{AnalysisDatasetConfiguration, AnalysisDatasetType, ValidatedConfig};
use engagement_ids::ParticipantUuid;
use engagement_protocol::defaults::RAW_TEXT_JOINER;
use engagement_protocol::CancellationToken;
use engagement_store::{EngagementMessage, EngagementStore};
use engagement_vocab::VocabularyRegistry;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Datasets produced by one analysis run.
#[derive(Debug, Clone, Default)]
pub struct AnalysisOutput {
    pub datasets: BTreeMap<String, AnalysisDataset>,
    pub report: AnalysisReport,
}

#[derive(Debug, Clone)]
pub struct AnalysisAggregator {
    config: Arc<ValidatedConfig>,
    registry: Arc<VocabularyRegistry>,
    store: EngagementStore,
}

impl AnalysisAggregator {
    pub fn new(
        config: Arc<ValidatedConfig>,
        registry: Arc<VocabularyRegistry>,
        store: EngagementStore,
    ) -> Self {
        Self {
            config,
            registry,
            store,
        }
    }

    /// Build every configured analysis dataset.
    ///
    /// Reads only; the store is never written by this stage.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<AnalysisOutput, AnalysisError> {
        let plans = self
            .config
            .analysis_datasets()
            .iter()
            .map(|cfg| {
                ColumnSet::resolve(cfg, &self.registry).map(|columns| (cfg.clone(), Arc::new(columns)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            pipeline = self.config.pipeline_name(),
            datasets = plans.len(),
            workers = self.config.workers(),
            "Analysis stage starting"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.workers()));
        let mut tasks = JoinSet::new();

        for (cfg, columns) in plans {
            let aggregator = self.clone();
            let cancel = cancel.clone();
            let semaphore = Arc::clone(&semaphore);

            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| AnalysisError::Worker(e.to_string()))?;
                if cancel.is_cancelled() {
                    return Ok(None);
                }
                let messages = match cfg.dataset_type {
                    AnalysisDatasetType::Operator => aggregator.store.all_messages().await?,
                    _ => {
                        aggregator
                            .store
                            .messages_for_datasets(&cfg.engagement_db_datasets)
                            .await?
                    }
                };
                let config = &aggregator.config;
                let built = aggregate(&cfg, &columns, messages, |p| config.is_test_participant(p));
                Ok::<_, AnalysisError>(Some(built))
            });
        }

        let mut output = AnalysisOutput::default();
        while let Some(joined) = tasks.join_next().await {
            let result = joined.map_err(|e| AnalysisError::Worker(e.to_string()))?;
            match result {
                Ok(Some((dataset, counts))) => {
                    info!(
                        dataset = %dataset.name,
                        dataset_type = %dataset.dataset_type,
                        records = counts.records,
                        participants = counts.participants,
                        excluded_test = counts.test_participants_excluded,
                        not_reviewed = counts.not_reviewed_cells,
                        "Built analysis dataset"
                    );
                    output.report.datasets.insert(dataset.name.clone(), counts);
                    output.datasets.insert(dataset.name.clone(), dataset);
                }
                Ok(None) => output.report.cancelled = true,
                Err(err) => {
                    warn!("Analysis stage failed: {}; aborting remaining datasets", err);
                    tasks.abort_all();
                    return Err(err);
                }
            }
        }

        output.report.cancelled |= cancel.is_cancelled();
        info!(
            datasets = output.datasets.len(),
            records = output.report.total_records(),
            cancelled = output.report.cancelled,
            "Analysis stage finished"
        );
        Ok(output)
    }

    /// Write every dataset to `sink`, in name order.
    pub async fn export(
        &self,
        output: &mut AnalysisOutput,
        sink: &dyn ExportSink,
        cancel: &CancellationToken,
    ) -> Result<(), AnalysisError> {
        for (name, dataset) in &output.datasets {
            if cancel.is_cancelled() {
                info!("Export cancelled");
                output.report.cancelled = true;
                break;
            }
            sink.write(name, dataset)
                .await
                .map_err(|source| AnalysisError::Export {
                    name: name.clone(),
                    source,
                })?;
            output.report.exported += 1;
            debug!(dataset = %name, records = dataset.records.len(), "Exported analysis dataset");
        }
        Ok(())
    }
}

/// Fold the messages of one analysis configuration into a dataset.
///
/// `messages` may come in any order; records are built in `received_at`
/// order (RQA) or participant order (demographic and operator). Operator
/// datasets keep uncoded messages, since the operator comes from sync.
pub fn aggregate(
    config: &AnalysisDatasetConfiguration,
    columns: &ColumnSet,
    mut messages: Vec<EngagementMessage>,
    is_test_participant: impl Fn(&ParticipantUuid) -> bool,
) -> (AnalysisDataset, DatasetAnalysisCounts) {
    let mut counts = DatasetAnalysisCounts {
        messages_read: messages.len(),
        ..Default::default()
    };

    messages.sort_by(|a, b| {
        (a.received_at, &a.message_key).cmp(&(b.received_at, &b.message_key))
    });
    let coded: Vec<EngagementMessage> = messages
        .into_iter()
        .filter(|message| {
            if is_test_participant(&message.participant_uuid) {
                counts.test_participants_excluded += 1;
                false
            } else if config.dataset_type != AnalysisDatasetType::Operator
                && !columns.is_coded(message)
            {
                counts.uncoded_excluded += 1;
                false
            } else {
                true
            }
        })
        .collect();

    let records = match config.dataset_type {
        AnalysisDatasetType::ResearchQuestionAnswer => {
            rqa_records(columns, coded, &mut counts.not_reviewed_cells)
        }
        AnalysisDatasetType::Demographic => {
            demographic_records(columns, coded, &mut counts.not_reviewed_cells)
        }
        AnalysisDatasetType::Operator => operator_records(columns, coded),
    };

    let dataset = AnalysisDataset {
        name: config.name.clone(),
        dataset_type: config.dataset_type,
        raw_dataset: config.raw_dataset.clone(),
        columns: columns.columns(),
        records,
    };
    counts.records = dataset.records.len();
    counts.participants = dataset.participant_count();
    (dataset, counts)
}

fn rqa_records(
    columns: &ColumnSet,
    messages: Vec<EngagementMessage>,
    not_reviewed: &mut usize,
) -> Vec<AnalysisRecord> {
    messages
        .into_iter()
        .map(|message| {
            let mut cells: Vec<Vec<CellValue>> = (0..columns.len())
                .map(|idx| columns.checked_cells(idx, &message))
                .collect();
            *not_reviewed += columns.complete(&mut cells);
            AnalysisRecord {
                participant_uuid: message.participant_uuid,
                message_keys: vec![message.message_key],
                received_at: message.received_at,
                raw_text: message.raw_text,
                cells,
            }
        })
        .collect()
}

fn by_participant(
    messages: Vec<EngagementMessage>,
) -> BTreeMap<ParticipantUuid, Vec<EngagementMessage>> {
    let mut grouped: BTreeMap<ParticipantUuid, Vec<EngagementMessage>> = BTreeMap::new();
    for message in messages {
        grouped
            .entry(message.participant_uuid.clone())
            .or_default()
            .push(message);
    }
    grouped
}

/// One record per participant; each column from their latest message coding it.
fn demographic_records(
    columns: &ColumnSet,
    messages: Vec<EngagementMessage>,
    not_reviewed: &mut usize,
) -> Vec<AnalysisRecord> {
    let by_participant = by_participant(messages);
    let mut records = Vec::with_capacity(by_participant.len());
    for (participant, messages) in by_participant {
        let Some(latest) = messages.last() else {
            continue;
        };

        let mut cells: Vec<Vec<CellValue>> = (0..columns.len())
            .map(|idx| {
                messages
                    .iter()
                    .rev()
                    .map(|message| columns.checked_cells(idx, message))
                    .find(|cells| !cells.is_empty())
                    .unwrap_or_default()
            })
            .collect();
        *not_reviewed += columns.complete(&mut cells);

        records.push(AnalysisRecord {
            participant_uuid: participant,
            message_keys: messages.iter().map(|m| m.message_key.clone()).collect(),
            received_at: latest.received_at,
            raw_text: messages
                .iter()
                .map(|m| m.raw_text.as_str())
                .collect::<Vec<_>>()
                .join(RAW_TEXT_JOINER),
            cells,
        });
    }
    records
}

/// One record per participant, coded from the operator on their latest
/// message that carries one.
fn operator_records(columns: &ColumnSet, messages: Vec<EngagementMessage>) -> Vec<AnalysisRecord> {
    let by_participant = by_participant(messages);
    let mut records = Vec::with_capacity(by_participant.len());
    for (participant, messages) in by_participant {
        let Some(latest) = messages.last() else {
            continue;
        };
        let operator = messages.iter().rev().find_map(|m| m.operator.as_deref());

        records.push(AnalysisRecord {
            participant_uuid: participant,
            message_keys: messages.iter().map(|m| m.message_key.clone()).collect(),
            received_at: latest.received_at,
            raw_text: operator.unwrap_or_default().to_string(),
            cells: columns.operator_cells(operator),
        });
    }
    records
}
