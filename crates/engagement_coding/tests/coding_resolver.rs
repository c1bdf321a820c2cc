//! Coding resolver tests against a real in-memory SQLite store.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use engagement_coding::{
    CodingError, CodingMessage, CodingResolver, CodingTool, CodingToolError, ManualLabel,
};
use engagement_config::{PipelineConfig, ValidatedConfig};
use engagement_ids::{CodeId, CodeSchemeId, DatasetName, FieldName, FlowName, ParticipantUuid};
use engagement_protocol::{CancellationToken, MessageKey};
use engagement_store::{EngagementStore, LabelOrigin, NewMessage};
use engagement_vocab::{Code, CodeScheme, CodeType, ControlCode, VocabularyRegistry};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

// =============================================================================
// FIXTURES
// =============================================================================

const CONFIG: &str = r#"
    pipeline_name = "coding_test"

    [retry]
    max_attempts = 3
    base_delay_ms = 0
    max_delay_ms = 0
    timeout_secs = 5

    [coding]
    ws_correct_dataset_code_scheme = "ws_correct_dataset"

    [[coding.dataset_configurations]]
    coda_dataset_id = "TEST_s01e01"
    engagement_db_dataset = "s01e01"
    ws_code_match_value = "s01e01"
    [[coding.dataset_configurations.code_scheme_configurations]]
    code_scheme = "s01e01"
    coda_code_schemes_count = 2

    [[coding.dataset_configurations]]
    coda_dataset_id = "TEST_age"
    engagement_db_dataset = "age"
    ws_code_match_value = "age"
    [[coding.dataset_configurations.code_scheme_configurations]]
    code_scheme = "age"
    auto_coder = { type = "age", min = 10, max = 99 }
"#;

fn code(id: &str, value: &str, control: Option<ControlCode>) -> Code {
    Code {
        code_id: CodeId::parse(id).unwrap(),
        display_text: value.to_string(),
        string_value: value.to_string(),
        numeric_value: value.parse().ok(),
        code_type: if control.is_some() {
            CodeType::Control
        } else {
            CodeType::Normal
        },
        control_code: control,
        match_values: Vec::new(),
    }
}

fn scheme(id: &str, mut codes: Vec<Code>) -> CodeScheme {
    codes.push(code(&format!("{}-nc", id), "NC", Some(ControlCode::NotCoded)));
    CodeScheme::new(CodeSchemeId::parse(id).unwrap(), id, "1", codes).unwrap()
}

fn registry() -> Arc<VocabularyRegistry> {
    let ages = (10..=99)
        .map(|age| code(&format!("age-{}", age), &age.to_string(), None))
        .collect();
    let registry = VocabularyRegistry::from_schemes(vec![
        scheme("age", ages),
        scheme(
            "s01e01",
            vec![code("s01e01-yes", "yes", None), code("s01e01-no", "no", None)],
        ),
        scheme(
            "ws_correct_dataset",
            vec![code("ws-age", "age", None), code("ws-s01e01", "s01e01", None)],
        ),
    ])
    .unwrap();
    Arc::new(registry)
}

fn config(registry: &VocabularyRegistry) -> Arc<ValidatedConfig> {
    let config = PipelineConfig::from_toml_str(CONFIG)
        .unwrap()
        .validate(registry)
        .unwrap();
    Arc::new(config)
}

fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2023, 3, 1, 10, minute, 0).unwrap()
}

async fn seed(store: &EngagementStore, dataset: &str, participant: &str, text: &str, minute: u32) -> MessageKey {
    let message = NewMessage::new(
        ParticipantUuid::parse(participant).unwrap(),
        DatasetName::parse(dataset).unwrap(),
        FlowName::parse(&format!("{}_flow", dataset)).unwrap(),
        FieldName::parse(&format!("rqa_{}", dataset)).unwrap(),
        at(minute),
        text.to_string(),
    );
    let (key, _) = store.insert_or_touch(&message).await.unwrap();
    key
}

fn manual(key: &MessageKey, scheme: &str, code: &str, slot: usize) -> ManualLabel {
    ManualLabel {
        message_key: key.clone(),
        scheme_id: CodeSchemeId::parse(scheme).unwrap(),
        code_id: CodeId::parse(code).unwrap(),
        slot,
        checked: true,
        labelled_at: at(30),
        coder: "coder@example.org".to_string(),
    }
}

#[derive(Default)]
struct MemoryTool {
    labels: Mutex<HashMap<String, Vec<ManualLabel>>>,
    pushed: Mutex<HashMap<String, Vec<CodingMessage>>>,
}

impl MemoryTool {
    fn label(&self, dataset: &str, label: ManualLabel) {
        self.labels
            .lock()
            .unwrap()
            .entry(dataset.to_string())
            .or_default()
            .push(label);
    }

    fn pushed(&self, dataset: &str) -> Vec<CodingMessage> {
        self.pushed
            .lock()
            .unwrap()
            .get(dataset)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl CodingTool for MemoryTool {
    async fn get_manual_labels(&self, coda_dataset_id: &str) -> Result<Vec<ManualLabel>, CodingToolError> {
        Ok(self
            .labels
            .lock()
            .unwrap()
            .get(coda_dataset_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn push_messages(
        &self,
        coda_dataset_id: &str,
        messages: Vec<CodingMessage>,
    ) -> Result<(), CodingToolError> {
        self.pushed
            .lock()
            .unwrap()
            .insert(coda_dataset_id.to_string(), messages);
        Ok(())
    }
}

/// Fails the first `failures` label fetches, then behaves like an empty tool.
struct FlakyTool {
    failures: u32,
    calls: AtomicU32,
}

#[async_trait]
impl CodingTool for FlakyTool {
    async fn get_manual_labels(&self, _coda_dataset_id: &str) -> Result<Vec<ManualLabel>, CodingToolError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Err(CodingToolError::Transient("503".to_string()))
        } else {
            Ok(Vec::new())
        }
    }

    async fn push_messages(&self, _: &str, _: Vec<CodingMessage>) -> Result<(), CodingToolError> {
        Ok(())
    }
}

struct DeniedTool;

#[async_trait]
impl CodingTool for DeniedTool {
    async fn get_manual_labels(&self, _: &str) -> Result<Vec<ManualLabel>, CodingToolError> {
        Err(CodingToolError::Auth("token expired".to_string()))
    }

    async fn push_messages(&self, _: &str, _: Vec<CodingMessage>) -> Result<(), CodingToolError> {
        Ok(())
    }
}

async fn resolver() -> (CodingResolver, EngagementStore) {
    let registry = registry();
    let config = config(&registry);
    let store = EngagementStore::in_memory().await.unwrap();
    let resolver = CodingResolver::new(config, registry, store.clone()).unwrap();
    (resolver, store)
}

// =============================================================================
// AUTO-CODING AND MANUAL LABELS
// =============================================================================

#[tokio::test]
async fn test_auto_coding_is_idempotent_across_runs() {
    let (resolver, store) = resolver().await;
    let coded = seed(&store, "age", "p1", "I am 36", 0).await;
    let uncoded = seed(&store, "age", "p2", "old enough", 1).await;
    let tool = Arc::new(MemoryTool::default());
    let cancel = CancellationToken::new();

    let first = resolver.run(tool.clone(), &cancel).await.unwrap();
    let age = &first.datasets["TEST_age"];
    assert_eq!(age.messages, 2);
    assert_eq!(age.auto_coded, 1);
    assert_eq!(age.not_coded, 1);
    assert_eq!(age.awaiting_manual, 1);

    let pushed = tool.pushed("TEST_age");
    assert_eq!(pushed.len(), 1);
    assert_eq!(pushed[0].message_key, uncoded);

    let before = store.get(&coded).await.unwrap().unwrap();
    let second = resolver.run(tool.clone(), &cancel).await.unwrap();
    let after = store.get(&coded).await.unwrap().unwrap();
    assert_eq!(second.datasets["TEST_age"].auto_coded, 0);
    assert_eq!(second.datasets["TEST_age"].not_coded, 0);
    assert_eq!(before.version, after.version);
    assert_eq!(after.labels.len(), 1);
}

#[tokio::test]
async fn test_manual_labels_override_auto_and_clear_review_queue() {
    let (resolver, store) = resolver().await;
    let key = seed(&store, "age", "p1", "I am 36", 0).await;
    let tool = Arc::new(MemoryTool::default());
    let cancel = CancellationToken::new();

    resolver.run(tool.clone(), &cancel).await.unwrap();
    tool.label("TEST_age", manual(&key, "age", "age-15", 0));
    let report = resolver.run(tool.clone(), &cancel).await.unwrap();
    assert_eq!(report.datasets["TEST_age"].manual_applied, 1);

    let message = store.get(&key).await.unwrap().unwrap();
    let effective = message
        .effective_label(&CodeSchemeId::parse("age").unwrap(), 0)
        .unwrap();
    assert_eq!(effective.code_id.as_str(), "age-15");
    assert_eq!(effective.origin, LabelOrigin::Manual);
}

#[tokio::test]
async fn test_manual_only_dataset_pushes_until_labelled() {
    let (resolver, store) = resolver().await;
    let key = seed(&store, "s01e01", "p1", "yes and no", 0).await;
    let tool = Arc::new(MemoryTool::default());
    let cancel = CancellationToken::new();

    let report = resolver.run(tool.clone(), &cancel).await.unwrap();
    assert_eq!(report.datasets["TEST_s01e01"].awaiting_manual, 1);
    assert_eq!(tool.pushed("TEST_s01e01").len(), 1);

    tool.label("TEST_s01e01", manual(&key, "s01e01", "s01e01-yes", 0));
    tool.label("TEST_s01e01", manual(&key, "s01e01", "s01e01-no", 1));
    tool.label("TEST_s01e01", manual(&key, "s01e01", "s01e01-no", 5));
    let report = resolver.run(tool.clone(), &cancel).await.unwrap();
    let dataset = &report.datasets["TEST_s01e01"];
    assert_eq!(dataset.manual_applied, 2);
    assert_eq!(dataset.manual_rejected, 1);
    assert_eq!(dataset.awaiting_manual, 0);

    let message = store.get(&key).await.unwrap().unwrap();
    assert_eq!(
        message
            .effective_labels(&CodeSchemeId::parse("s01e01").unwrap())
            .len(),
        2
    );
}

// =============================================================================
// WORKSPACE CORRECTION
// =============================================================================

#[tokio::test]
async fn test_ws_correction_moves_message_then_codes_it() {
    let (resolver, store) = resolver().await;
    let key = seed(&store, "s01e01", "p1", "I am 15", 0).await;
    let tool = Arc::new(MemoryTool::default());
    let cancel = CancellationToken::new();
    tool.label("TEST_s01e01", manual(&key, "ws_correct_dataset", "ws-age", 0));

    let first = resolver.run(tool.clone(), &cancel).await.unwrap();
    assert_eq!(first.datasets["TEST_s01e01"].ws_moved, 1);

    let moved = store.get(&key).await.unwrap().unwrap();
    assert_eq!(moved.dataset.as_str(), "age");
    assert_eq!(moved.origin_dataset.as_str(), "s01e01");
    assert_eq!(moved.previous_datasets, vec![DatasetName::parse("s01e01").unwrap()]);

    // Coded in the new dataset on this run or the next, depending on order.
    resolver.run(tool.clone(), &cancel).await.unwrap();
    let coded = store.get(&key).await.unwrap().unwrap();
    let age = coded
        .effective_label(&CodeSchemeId::parse("age").unwrap(), 0)
        .unwrap();
    assert_eq!(age.code_id.as_str(), "age-15");
    assert_eq!(coded.previous_datasets.len(), 1);
}

// =============================================================================
// COLLABORATOR FAILURES
// =============================================================================

#[tokio::test]
async fn test_transient_tool_failures_are_retried() {
    let (resolver, store) = resolver().await;
    seed(&store, "age", "p1", "I am 36", 0).await;
    let tool = Arc::new(FlakyTool {
        failures: 2,
        calls: AtomicU32::new(0),
    });

    let report = resolver.run(tool.clone(), &CancellationToken::new()).await.unwrap();
    assert_eq!(report.datasets["TEST_age"].auto_coded, 1);
    assert!(tool.calls.load(Ordering::SeqCst) >= 3);
}

#[tokio::test]
async fn test_tool_auth_failure_is_fatal() {
    let (resolver, store) = resolver().await;
    seed(&store, "age", "p1", "I am 36", 0).await;

    let err = resolver
        .run(Arc::new(DeniedTool), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CodingError::ToolAuth { .. }));
}

#[tokio::test]
async fn test_cancelled_run_writes_nothing() {
    let (resolver, store) = resolver().await;
    let key = seed(&store, "age", "p1", "I am 36", 0).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = resolver
        .run(Arc::new(MemoryTool::default()), &cancel)
        .await
        .unwrap();
    assert!(report.cancelled);
    assert!(store.get(&key).await.unwrap().unwrap().labels.is_empty());
}
