//! Coding resolver: reconcile manual labels, auto-code and feed the coding tool.

use crate::cleaners::CleanerRegistry;
use crate::error::CodingError;
use crate::plan::DatasetPlan;
use crate::report::{CodingReport, DatasetCodingReport};
use crate::tool::{CodingTool, ManualLabel};
use chrono::Utc;
use engagement_config::ValidatedConfig;
use engagement_protocol::{retry_with_backoff, CancellationToken, MessageKey};
use engagement_store::{AppliedLabel, EngagementStore};
use engagement_vocab::VocabularyRegistry;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct CodingResolver {
    config: Arc<ValidatedConfig>,
    registry: Arc<VocabularyRegistry>,
    cleaners: Arc<CleanerRegistry>,
    store: EngagementStore,
}

impl CodingResolver {
    pub fn new(
        config: Arc<ValidatedConfig>,
        registry: Arc<VocabularyRegistry>,
        store: EngagementStore,
    ) -> Result<Self, CodingError> {
        let cleaners = Arc::new(CleanerRegistry::from_config(&config)?);
        Ok(Self {
            config,
            registry,
            cleaners,
            store,
        })
    }

    /// Code every configured dataset.
    ///
    /// Datasets are processed concurrently, at most `workers` at a time. A
    /// message moved by workspace correction is coded in its new dataset on
    /// this run if that dataset has not been read yet, otherwise on the next.
    pub async fn run(
        &self,
        tool: Arc<dyn CodingTool>,
        cancel: &CancellationToken,
    ) -> Result<CodingReport, CodingError> {
        let plans = self
            .config
            .coding_datasets()
            .iter()
            .map(|dataset| {
                DatasetPlan::build(dataset, &self.config, &self.registry, &self.cleaners).map(Arc::new)
            })
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            pipeline = self.config.pipeline_name(),
            datasets = plans.len(),
            cleaners = self.cleaners.len(),
            workers = self.config.workers(),
            "Coding stage starting"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.workers()));
        let mut tasks = JoinSet::new();

        for plan in plans {
            let resolver = self.clone();
            let tool = Arc::clone(&tool);
            let cancel = cancel.clone();
            let semaphore = Arc::clone(&semaphore);

            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| CodingError::Worker(e.to_string()))?;
                let report = resolver.code_dataset(&plan, tool.as_ref(), &cancel).await?;
                Ok::<_, CodingError>((plan.coda_dataset_id().to_string(), report))
            });
        }

        let mut report = CodingReport::default();
        while let Some(joined) = tasks.join_next().await {
            let result = joined.map_err(|e| CodingError::Worker(e.to_string()))?;
            match result {
                Ok((dataset, dataset_report)) => {
                    report.cancelled |= dataset_report.cancelled;
                    report.datasets.insert(dataset, dataset_report);
                }
                Err(err) => {
                    warn!("Coding stage failed: {}; aborting remaining datasets", err);
                    tasks.abort_all();
                    return Err(err);
                }
            }
        }

        report.cancelled |= cancel.is_cancelled();
        let total = report.total();
        info!(
            messages = total.messages,
            auto_coded = total.auto_coded,
            manual_applied = total.manual_applied,
            awaiting_manual = total.awaiting_manual,
            ws_moved = total.ws_moved,
            cancelled = report.cancelled,
            "Coding stage finished"
        );
        Ok(report)
    }

    async fn code_dataset(
        &self,
        plan: &DatasetPlan,
        tool: &dyn CodingTool,
        cancel: &CancellationToken,
    ) -> Result<DatasetCodingReport, CodingError> {
        let coda_id = plan.coda_dataset_id();
        let policy = &self.config.config().retry;
        let mut report = DatasetCodingReport::default();

        let fetched = retry_with_backoff(policy, cancel, coda_id, || tool.get_manual_labels(coda_id)).await;
        let labels = match fetched {
            Ok(labels) => labels,
            Err(err) => {
                return match CodingError::from_retry(coda_id, err) {
                    Some(err) => Err(err),
                    None => {
                        report.cancelled = true;
                        Ok(report)
                    }
                }
            }
        };
        let mut manual = group_manual_labels(plan, labels, &mut report);

        let messages = self.store.messages_for_dataset(plan.dataset()).await?;
        info!(
            dataset = %plan.dataset(),
            coda_dataset = coda_id,
            messages = messages.len(),
            "Coding dataset"
        );

        let mut to_push = Vec::new();
        for message in messages {
            if cancel.is_cancelled() {
                info!(coda_dataset = coda_id, "Coding cancelled between messages");
                report.cancelled = true;
                break;
            }

            let labels = manual.remove(&message.message_key).unwrap_or_default();
            let now = Utc::now();
            let update = self
                .store
                .update_message(&message.message_key, |m| plan.apply(m, &labels, now))
                .await?;
            report.cas_retries += update.retries;

            let outcome = update.value;
            if outcome.skipped {
                debug!(key = message.message_key.short(), "Message left dataset; skipped");
                continue;
            }
            report.messages += 1;
            report.manual_applied += outcome.manual_applied;
            report.auto_coded += outcome.auto_coded;
            report.not_coded += outcome.not_coded;
            for sample in outcome.auto_coding_errors {
                report.sample_error(sample);
            }
            if outcome.ws_unresolved {
                report.ws_unresolved += 1;
                warn!(
                    key = message.message_key.short(),
                    coda_dataset = coda_id,
                    "Workspace correction names a dataset with no coding configuration"
                );
            }
            if let Some(target) = outcome.moved_to {
                report.ws_moved += 1;
                info!(
                    key = message.message_key.short(),
                    from = %plan.dataset(),
                    to = %target,
                    "Moved message by workspace correction"
                );
                continue;
            }

            if plan.awaiting_manual(&update.message) {
                report.awaiting_manual += 1;
                to_push.push(plan.coding_message(&update.message));
            }
        }

        if !manual.is_empty() {
            debug!(
                coda_dataset = coda_id,
                messages = manual.len(),
                "Manual labels for messages no longer in this dataset"
            );
        }
        if report.auto_coding_errors > 0 {
            warn!(
                coda_dataset = coda_id,
                errors = report.auto_coding_errors,
                sample = report.error_samples.first().map(String::as_str).unwrap_or(""),
                "Auto-coding errors; messages left NOT_CODED for review"
            );
        }

        if !to_push.is_empty() && !report.cancelled {
            let pushed = retry_with_backoff(policy, cancel, coda_id, || {
                tool.push_messages(coda_id, to_push.clone())
            })
            .await;
            match pushed {
                Ok(()) => debug!(coda_dataset = coda_id, messages = to_push.len(), "Pushed messages"),
                Err(err) => match CodingError::from_retry(coda_id, err) {
                    Some(err) => return Err(err),
                    None => report.cancelled = true,
                },
            }
        }

        info!(
            coda_dataset = coda_id,
            messages = report.messages,
            auto_coded = report.auto_coded,
            not_coded = report.not_coded,
            manual_applied = report.manual_applied,
            manual_rejected = report.manual_rejected,
            awaiting_manual = report.awaiting_manual,
            ws_moved = report.ws_moved,
            "Coded dataset"
        );
        Ok(report)
    }
}

/// Validate labels from the coding tool and group them by message.
fn group_manual_labels(
    plan: &DatasetPlan,
    labels: Vec<ManualLabel>,
    report: &mut DatasetCodingReport,
) -> HashMap<MessageKey, Vec<AppliedLabel>> {
    let mut grouped: HashMap<MessageKey, Vec<AppliedLabel>> = HashMap::new();
    let mut first_rejection = None;

    for label in labels {
        match plan.check_manual(&label) {
            Ok(applied) => grouped.entry(label.message_key).or_default().push(applied),
            Err(reason) => {
                report.manual_rejected += 1;
                first_rejection.get_or_insert(reason);
            }
        }
    }

    if let Some(reason) = first_rejection {
        warn!(
            coda_dataset = plan.coda_dataset_id(),
            rejected = report.manual_rejected,
            "Rejected manual labels: {}",
            reason
        );
    }
    grouped
}
