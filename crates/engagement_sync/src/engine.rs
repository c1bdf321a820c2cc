//! Sync engine: fetch flow results and write them into the engagement store.

use crate::error::SyncError;
use crate::operator::operator_for_contact;
use crate::report::{SkipReason, SkippedResponse, SyncReport};
use crate::source::{IdentityResolver, SurveyResponse, SurveySource};
use engagement_config::ValidatedConfig;
use engagement_ids::{FieldName, FlowName, ParticipantUuid};
use engagement_protocol::{retry_with_backoff, CancellationToken};
use engagement_store::{EngagementStore, NewMessage, UpsertOutcome};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SyncEngine {
    config: Arc<ValidatedConfig>,
    store: EngagementStore,
}

impl SyncEngine {
    pub fn new(config: Arc<ValidatedConfig>, store: EngagementStore) -> Self {
        Self { config, store }
    }

    /// Sync every configured flow.
    ///
    /// Flows are fetched concurrently, at most `workers` at a time. The first
    /// fatal error aborts the remaining flows and fails the stage.
    pub async fn run(
        &self,
        source: Arc<dyn SurveySource>,
        resolver: Arc<dyn IdentityResolver>,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        let flows = self.config.flow_names().to_vec();
        info!(
            pipeline = self.config.pipeline_name(),
            flows = flows.len(),
            workers = self.config.workers(),
            "Sync stage starting"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.workers()));
        let mut tasks = JoinSet::new();

        for flow in flows {
            let engine = self.clone();
            let source = Arc::clone(&source);
            let resolver = Arc::clone(&resolver);
            let cancel = cancel.clone();
            let semaphore = Arc::clone(&semaphore);

            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| SyncError::Worker(e.to_string()))?;
                engine.sync_flow(&flow, source.as_ref(), resolver.as_ref(), &cancel).await
            });
        }

        let mut report = SyncReport::default();
        while let Some(joined) = tasks.join_next().await {
            let result = joined.map_err(|e| SyncError::Worker(e.to_string()))?;
            match result {
                Ok(flow_report) => report.merge(flow_report),
                Err(err) => {
                    warn!("Sync stage failed: {}; aborting remaining flows", err);
                    tasks.abort_all();
                    return Err(err);
                }
            }
        }

        report.cancelled |= cancel.is_cancelled();
        info!(
            flows = report.flows_fetched,
            responses = report.responses_seen,
            inserted = report.inserted,
            unchanged = report.unchanged,
            conflicts = report.conflicts,
            skipped = report.skipped.len(),
            cancelled = report.cancelled,
            "Sync stage finished"
        );
        Ok(report)
    }

    async fn sync_flow(
        &self,
        flow: &FlowName,
        source: &dyn SurveySource,
        resolver: &dyn IdentityResolver,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        let policy = &self.config.config().retry;
        let fetched = retry_with_backoff(policy, cancel, flow.as_str(), || {
            source.fetch_responses(flow)
        })
        .await;

        let responses = match fetched {
            Ok(responses) => responses,
            Err(err) => {
                return match SyncError::from_retry(flow, err) {
                    Some(err) => Err(err),
                    None => Ok(SyncReport {
                        cancelled: true,
                        ..Default::default()
                    }),
                }
            }
        };
        info!(flow = %flow, responses = responses.len(), "Fetched flow results");

        let mut report = self.sync_responses(flow, responses, resolver, cancel).await?;
        report.flows_fetched = 1;
        Ok(report)
    }

    /// Map responses of one flow onto datasets and write them.
    ///
    /// Responses whose `(flow, field)` is not configured are skipped and
    /// reported. Participants are resolved once per external id within the
    /// batch. Cancellation is checked before each message.
    pub async fn sync_responses(
        &self,
        flow: &FlowName,
        responses: Vec<SurveyResponse>,
        resolver: &dyn IdentityResolver,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::default();
        let mut warned: HashSet<String> = HashSet::new();
        let mut participants: HashMap<String, ParticipantUuid> = HashMap::new();

        for response in responses {
            if cancel.is_cancelled() {
                info!(flow = %flow, "Sync cancelled between messages");
                report.cancelled = true;
                break;
            }
            report.responses_seen += 1;

            let field = match FieldName::parse(&response.result_field) {
                Ok(field) => field,
                Err(e) => {
                    let reason = SkipReason::InvalidField(e.to_string());
                    report.skipped.push(skipped(flow, &response, reason));
                    continue;
                }
            };
            let Some(dataset) = self.config.dataset_for(flow, &field) else {
                if warned.insert(response.result_field.clone()) {
                    warn!(flow = %flow, field = %field, "Skipping responses for unconfigured field");
                }
                report.skipped.push(skipped(flow, &response, SkipReason::Unconfigured));
                continue;
            };

            let external_id = &response.participant_external_id;
            let participant = match participants.get(external_id) {
                Some(participant) => participant.clone(),
                None => match self
                    .resolve_participant(flow, resolver, external_id, cancel)
                    .await?
                {
                    Some(participant) => {
                        participants.insert(external_id.clone(), participant.clone());
                        participant
                    }
                    None => {
                        report.cancelled = true;
                        break;
                    }
                },
            };
            let operator = operator_for_contact(external_id);

            let message = NewMessage::new(
                participant,
                dataset.clone(),
                flow.clone(),
                field,
                response.timestamp,
                response.value,
            )
            .with_operator(operator);
            let (key, outcome) = self.store.insert_or_touch(&message).await?;

            let counts = report.per_dataset.entry(dataset.clone()).or_default();
            match outcome {
                UpsertOutcome::Inserted => {
                    report.inserted += 1;
                    counts.inserted += 1;
                }
                UpsertOutcome::Unchanged => {
                    report.unchanged += 1;
                    counts.unchanged += 1;
                }
                UpsertOutcome::Conflict(_) => {
                    report.conflicts += 1;
                    counts.conflicts += 1;
                }
            }
            debug!(key = key.short(), dataset = %dataset, "Synced response");
        }

        Ok(report)
    }

    /// `None` when cancelled while retrying.
    async fn resolve_participant(
        &self,
        flow: &FlowName,
        resolver: &dyn IdentityResolver,
        external_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<ParticipantUuid>, SyncError> {
        let policy = &self.config.config().retry;
        match retry_with_backoff(policy, cancel, "identity_resolver", || {
            resolver.resolve(external_id)
        })
        .await
        {
            Ok(participant) => Ok(Some(participant)),
            Err(err) => match SyncError::from_retry(flow, err) {
                Some(err) => Err(err),
                None => Ok(None),
            },
        }
    }
}

fn skipped(flow: &FlowName, response: &SurveyResponse, reason: SkipReason) -> SkippedResponse {
    SkippedResponse {
        flow: flow.clone(),
        field: response.result_field.clone(),
        participant_external_id: response.participant_external_id.clone(),
        reason,
    }
}
