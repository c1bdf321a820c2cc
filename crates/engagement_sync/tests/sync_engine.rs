//! Sync engine tests against a real in-memory SQLite store.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use engagement_config::{PipelineConfig, ValidatedConfig};
use engagement_ids::{DatasetName, FlowName, ParticipantUuid};
use engagement_protocol::CancellationToken;
use engagement_store::EngagementStore;
use engagement_sync::{
    IdentityResolver, SkipReason, SourceError, SurveyResponse, SurveySource, SyncEngine, SyncError,
};
use engagement_vocab::VocabularyRegistry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

// =============================================================================
// FIXTURES
// =============================================================================

const CONFIG: &str = r#"
    pipeline_name = "sync_test"

    [retry]
    max_attempts = 3
    base_delay_ms = 0
    max_delay_ms = 0
    timeout_secs = 5

    [[sync.flow_result_configurations]]
    flow_name = "s01e01"
    flow_result_field = "rqa_s01e01"
    engagement_db_dataset = "s01e01"

    [[sync.flow_result_configurations]]
    flow_name = "s01e01_activation"
    flow_result_field = "rqa_s01e01"
    engagement_db_dataset = "s01e01"

    [[sync.flow_result_configurations]]
    flow_name = "demog"
    flow_result_field = "age"
    engagement_db_dataset = "age"
"#;

fn config() -> Arc<ValidatedConfig> {
    let config = PipelineConfig::from_toml_str(CONFIG)
        .unwrap()
        .validate(&VocabularyRegistry::default())
        .unwrap();
    Arc::new(config)
}

fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2023, 3, 1, 10, minute, 0).unwrap()
}

fn response(field: &str, value: &str, minute: u32, contact: &str) -> SurveyResponse {
    SurveyResponse {
        result_field: field.to_string(),
        value: value.to_string(),
        timestamp: at(minute),
        participant_external_id: contact.to_string(),
    }
}

#[derive(Default)]
struct StaticSource {
    flows: HashMap<String, Vec<SurveyResponse>>,
}

impl StaticSource {
    fn with(mut self, flow: &str, responses: Vec<SurveyResponse>) -> Self {
        self.flows.insert(flow.to_string(), responses);
        self
    }
}

#[async_trait]
impl SurveySource for StaticSource {
    async fn fetch_responses(&self, flow_name: &FlowName) -> Result<Vec<SurveyResponse>, SourceError> {
        Ok(self.flows.get(flow_name.as_str()).cloned().unwrap_or_default())
    }
}

/// Fails `failures` times with a transient error before delegating.
struct FlakySource {
    inner: StaticSource,
    failures: u32,
    calls: AtomicU32,
}

#[async_trait]
impl SurveySource for FlakySource {
    async fn fetch_responses(&self, flow_name: &FlowName) -> Result<Vec<SurveyResponse>, SourceError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(SourceError::Transient("503".to_string()));
        }
        self.inner.fetch_responses(flow_name).await
    }
}

struct DeniedSource;

#[async_trait]
impl SurveySource for DeniedSource {
    async fn fetch_responses(&self, _flow_name: &FlowName) -> Result<Vec<SurveyResponse>, SourceError> {
        Err(SourceError::Auth("token revoked".to_string()))
    }
}

/// Always unavailable for one flow, healthy for the rest.
struct OutageSource {
    inner: StaticSource,
    down: &'static str,
}

#[async_trait]
impl SurveySource for OutageSource {
    async fn fetch_responses(&self, flow_name: &FlowName) -> Result<Vec<SurveyResponse>, SourceError> {
        if flow_name.as_str() == self.down {
            return Err(SourceError::Unavailable("flow export timed out".to_string()));
        }
        self.inner.fetch_responses(flow_name).await
    }
}

struct PrefixResolver;

/// Counts lookups so tests can see how often each contact is resolved.
#[derive(Default)]
struct CountingResolver {
    calls: AtomicU32,
}

#[async_trait]
impl IdentityResolver for CountingResolver {
    async fn resolve(&self, external_id: &str) -> Result<ParticipantUuid, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        PrefixResolver.resolve(external_id).await
    }
}

#[async_trait]
impl IdentityResolver for PrefixResolver {
    async fn resolve(&self, external_id: &str) -> Result<ParticipantUuid, SourceError> {
        ParticipantUuid::parse(&format!("avf-participant-{}", external_id))
            .map_err(|e| SourceError::Transient(e.to_string()))
    }
}

fn default_source() -> StaticSource {
    StaticSource::default()
        .with(
            "s01e01",
            vec![
                response("rqa_s01e01", "we need schools", 1, "c1"),
                response("rqa_s01e01", "roads", 2, "c2"),
            ],
        )
        .with(
            "s01e01_activation",
            vec![response("rqa_s01e01", "more schools", 9, "c1")],
        )
        .with(
            "demog",
            vec![
                response("age", "23", 3, "c1"),
                response("household_size", "5", 3, "c1"),
            ],
        )
}

// =============================================================================
// TESTS
// =============================================================================

#[tokio::test]
async fn test_sync_is_idempotent() {
    let store = EngagementStore::in_memory().await.unwrap();
    let engine = SyncEngine::new(config(), store.clone());
    let source: Arc<dyn SurveySource> = Arc::new(default_source());
    let resolver: Arc<dyn IdentityResolver> = Arc::new(PrefixResolver);
    let cancel = CancellationToken::new();

    let first = engine
        .run(Arc::clone(&source), Arc::clone(&resolver), &cancel)
        .await
        .unwrap();
    assert_eq!(first.flows_fetched, 3);
    assert_eq!(first.inserted, 4);
    assert_eq!(first.skipped.len(), 1);

    let second = engine.run(source, resolver, &cancel).await.unwrap();
    assert_eq!(second.inserted, 0);
    assert_eq!(second.unchanged, 4);
    assert_eq!(second.conflicts, 0);

    let counts = store.dataset_counts().await.unwrap();
    assert_eq!(counts.values().sum::<usize>(), 4);
}

#[tokio::test]
async fn test_two_flows_feed_one_dataset() {
    let store = EngagementStore::in_memory().await.unwrap();
    let engine = SyncEngine::new(config(), store.clone());
    engine
        .run(
            Arc::new(default_source()),
            Arc::new(PrefixResolver),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let messages = store
        .messages_for_dataset(&DatasetName::parse("s01e01").unwrap())
        .await
        .unwrap();
    let flows: Vec<&str> = messages.iter().map(|m| m.origin_flow.as_str()).collect();
    assert_eq!(flows, vec!["s01e01", "s01e01", "s01e01_activation"]);
    assert_eq!(messages[2].raw_text, "more schools");
}

#[tokio::test]
async fn test_unconfigured_field_is_skipped_not_raised() {
    let store = EngagementStore::in_memory().await.unwrap();
    let engine = SyncEngine::new(config(), store);
    let report = engine
        .sync_responses(
            &FlowName::parse("demog").unwrap(),
            vec![response("household_size", "5", 1, "c1"), response("age", "30", 1, "c1")],
            &PrefixResolver,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.responses_seen, 2);
    assert_eq!(report.inserted, 1);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].field, "household_size");
    assert_eq!(report.skipped[0].reason, SkipReason::Unconfigured);
}

#[tokio::test]
async fn test_changed_content_is_conflict() {
    let store = EngagementStore::in_memory().await.unwrap();
    let engine = SyncEngine::new(config(), store.clone());
    let flow = FlowName::parse("demog").unwrap();
    let cancel = CancellationToken::new();

    engine
        .sync_responses(&flow, vec![response("age", "23", 1, "c1")], &PrefixResolver, &cancel)
        .await
        .unwrap();
    let report = engine
        .sync_responses(&flow, vec![response("age", "24", 1, "c1")], &PrefixResolver, &cancel)
        .await
        .unwrap();

    assert_eq!(report.conflicts, 1);
    assert_eq!(store.needs_review_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let store = EngagementStore::in_memory().await.unwrap();
    let engine = SyncEngine::new(config(), store);
    let source = Arc::new(FlakySource {
        inner: default_source(),
        failures: 2,
        calls: AtomicU32::new(0),
    });

    let report = engine
        .run(source.clone(), Arc::new(PrefixResolver), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.flows_fetched, 3);
    assert_eq!(source.calls.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn test_auth_failure_is_fatal() {
    let store = EngagementStore::in_memory().await.unwrap();
    let engine = SyncEngine::new(config(), store);
    let err = engine
        .run(Arc::new(DeniedSource), Arc::new(PrefixResolver), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Auth { .. }));
}

#[tokio::test]
async fn test_exhausted_retries_fail_stage() {
    let store = EngagementStore::in_memory().await.unwrap();
    let engine = SyncEngine::new(config(), store);
    let source = Arc::new(FlakySource {
        inner: default_source(),
        failures: u32::MAX,
        calls: AtomicU32::new(0),
    });
    let err = engine
        .run(source, Arc::new(PrefixResolver), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::RetriesExhausted { attempts: 3, .. }));
}

#[tokio::test]
async fn test_cancelled_before_start_writes_nothing() {
    let store = EngagementStore::in_memory().await.unwrap();
    let engine = SyncEngine::new(config(), store.clone());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = engine
        .run(Arc::new(default_source()), Arc::new(PrefixResolver), &cancel)
        .await
        .unwrap();
    assert!(report.cancelled);
    assert_eq!(report.inserted, 0);
    assert!(store.dataset_counts().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_flow_keeps_completed_flows_and_rerun_is_idempotent() {
    // One worker runs flows in configured order, so both s01e01 flows
    // finish before demog is fetched.
    let config = PipelineConfig::from_toml_str(&format!("workers = 1\n{}", CONFIG))
        .unwrap()
        .validate(&VocabularyRegistry::default())
        .unwrap();
    let store = EngagementStore::in_memory().await.unwrap();
    let engine = SyncEngine::new(Arc::new(config), store.clone());
    let cancel = CancellationToken::new();

    let outage = OutageSource {
        inner: default_source(),
        down: "demog",
    };
    let err = engine
        .run(Arc::new(outage), Arc::new(PrefixResolver), &cancel)
        .await
        .unwrap_err();
    match err {
        SyncError::RetriesExhausted { flow, attempts, .. } => {
            assert_eq!(flow.as_str(), "demog");
            assert_eq!(attempts, 3);
        }
        other => panic!("unexpected error: {other}"),
    }

    let kept = store
        .messages_for_dataset(&DatasetName::parse("s01e01").unwrap())
        .await
        .unwrap();
    assert_eq!(kept.len(), 3);
    assert!(store
        .messages_for_dataset(&DatasetName::parse("age").unwrap())
        .await
        .unwrap()
        .is_empty());

    let rerun = engine
        .run(Arc::new(default_source()), Arc::new(PrefixResolver), &cancel)
        .await
        .unwrap();
    assert_eq!(rerun.inserted, 1);
    assert_eq!(rerun.unchanged, 3);
    assert_eq!(rerun.conflicts, 0);
    assert_eq!(store.dataset_counts().await.unwrap().values().sum::<usize>(), 4);
}

#[tokio::test]
async fn test_participants_resolved_once_per_batch() {
    let store = EngagementStore::in_memory().await.unwrap();
    let engine = SyncEngine::new(config(), store);
    let resolver = CountingResolver::default();

    let report = engine
        .sync_responses(
            &FlowName::parse("s01e01").unwrap(),
            vec![
                response("rqa_s01e01", "schools", 1, "c1"),
                response("rqa_s01e01", "roads", 2, "c2"),
                response("rqa_s01e01", "water", 3, "c1"),
            ],
            &resolver,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.inserted, 3);
    assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_operator_recorded_from_contact() {
    let store = EngagementStore::in_memory().await.unwrap();
    let engine = SyncEngine::new(config(), store.clone());
    engine
        .sync_responses(
            &FlowName::parse("demog").unwrap(),
            vec![
                response("age", "23", 1, "tel:+252612345678"),
                response("age", "31", 2, "tel:+254712345678"),
                response("age", "40", 3, "c3"),
            ],
            &PrefixResolver,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let messages = store
        .messages_for_dataset(&DatasetName::parse("age").unwrap())
        .await
        .unwrap();
    let operators: Vec<Option<&str>> = messages.iter().map(|m| m.operator.as_deref()).collect();
    assert_eq!(operators, vec![Some("hormud"), Some("other"), None]);
}
