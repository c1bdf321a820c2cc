//! SQLite-backed engagement store.
//!
//! One row per message. Label history and previous datasets are JSON columns.
//! Sync writes go through `insert_or_touch` (one transaction per message);
//! coding writes go through compare-and-swap on `version`.

use crate::error::StoreError;
use crate::message::{AppliedLabel, ConsistencyError, EngagementMessage, NewMessage, UpsertOutcome};
use chrono::{DateTime, Utc};
use engagement_ids::{DatasetName, FieldName, FlowName, ParticipantUuid};
use engagement_protocol::defaults::CAS_MAX_ATTEMPTS;
use engagement_protocol::{received_at_text, MessageKey};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, QueryBuilder, Row, Sqlite};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

const MESSAGE_COLUMNS: &str = "message_key, participant_uuid, dataset, origin_dataset, origin_flow, \
     origin_field, received_at, raw_text, operator, labels_json, previous_datasets_json, version, \
     first_seen_at, last_seen_at, needs_review";

/// Outcome of [`EngagementStore::update_message`].
#[derive(Debug)]
pub struct CasUpdate<T> {
    /// Value returned by the last (successful) application
    pub value: T,
    /// Message as written (or as read, when nothing changed)
    pub message: EngagementMessage,
    /// Version conflicts hit before the write landed
    pub retries: u32,
    pub written: bool,
}

/// Canonical per-participant message store.
#[derive(Debug, Clone)]
pub struct EngagementStore {
    pool: Pool<Sqlite>,
}

impl EngagementStore {
    /// Wrap an existing pool and ensure the schema exists.
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, StoreError> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Open (or create) a store file.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        let db_url = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;
        Self::new(pool).await
    }

    /// In-memory store (tests). A single connection keeps one database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::new(pool).await
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS engagement_messages (
                message_key TEXT PRIMARY KEY,
                participant_uuid TEXT NOT NULL,
                dataset TEXT NOT NULL,
                origin_dataset TEXT NOT NULL,
                origin_flow TEXT NOT NULL,
                origin_field TEXT NOT NULL,
                received_at TEXT NOT NULL,
                raw_text TEXT NOT NULL,
                operator TEXT,
                content_hash TEXT NOT NULL,
                labels_json TEXT NOT NULL DEFAULT '[]',
                previous_datasets_json TEXT NOT NULL DEFAULT '[]',
                version INTEGER NOT NULL DEFAULT 0,
                first_seen_at TEXT NOT NULL,
                last_seen_at TEXT NOT NULL,
                needs_review INTEGER NOT NULL DEFAULT 0,
                UNIQUE(participant_uuid, origin_dataset, origin_flow, received_at)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_dataset ON engagement_messages(dataset, received_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_participant ON engagement_messages(participant_uuid)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Write one synced message in its own transaction.
    ///
    /// New key: inserted. Known key with identical content: only
    /// `last_seen_at` moves. Known key with different content: the stored
    /// copy wins and is flagged `needs_review`.
    pub async fn insert_or_touch(
        &self,
        message: &NewMessage,
    ) -> Result<(MessageKey, UpsertOutcome), StoreError> {
        let key = message.key();
        let incoming_hash = message.content_hash();
        let now = received_at_text(Utc::now());

        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO engagement_messages
            (message_key, participant_uuid, dataset, origin_dataset, origin_flow, origin_field,
             received_at, raw_text, operator, content_hash, labels_json, previous_datasets_json,
             version, first_seen_at, last_seen_at, needs_review)
            VALUES (?1, ?2, ?3, ?3, ?4, ?5, ?6, ?7, ?10, ?8, '[]', '[]', 0, ?9, ?9, 0)
            ON CONFLICT(message_key) DO NOTHING
            "#,
        )
        .bind(key.as_str())
        .bind(message.participant_uuid.as_str())
        .bind(message.dataset.as_str())
        .bind(message.origin_flow.as_str())
        .bind(message.origin_field.as_str())
        .bind(received_at_text(message.received_at))
        .bind(&message.raw_text)
        .bind(&incoming_hash)
        .bind(&now)
        .bind(message.operator.as_deref())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 1 {
            tx.commit().await?;
            debug!(key = key.short(), dataset = %message.dataset, "Inserted message");
            return Ok((key, UpsertOutcome::Inserted));
        }

        let stored_hash: String =
            sqlx::query_scalar("SELECT content_hash FROM engagement_messages WHERE message_key = ?1")
                .bind(key.as_str())
                .fetch_one(&mut *tx)
                .await?;

        let outcome = if stored_hash == incoming_hash {
            sqlx::query("UPDATE engagement_messages SET last_seen_at = ?1 WHERE message_key = ?2")
                .bind(&now)
                .bind(key.as_str())
                .execute(&mut *tx)
                .await?;
            UpsertOutcome::Unchanged
        } else {
            sqlx::query(
                "UPDATE engagement_messages SET last_seen_at = ?1, needs_review = 1 WHERE message_key = ?2",
            )
            .bind(&now)
            .bind(key.as_str())
            .execute(&mut *tx)
            .await?;
            let conflict = ConsistencyError {
                message_key: key.clone(),
                stored_hash,
                incoming_hash,
            };
            warn!(dataset = %message.dataset, "Consistency conflict: {}", conflict);
            UpsertOutcome::Conflict(conflict)
        };

        tx.commit().await?;
        Ok((key, outcome))
    }

    pub async fn get(&self, key: &MessageKey) -> Result<Option<EngagementMessage>, StoreError> {
        let sql = format!(
            "SELECT {} FROM engagement_messages WHERE message_key = ?1",
            MESSAGE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_message).transpose()
    }

    /// Messages currently in `dataset`, ordered by `received_at` then key.
    pub async fn messages_for_dataset(
        &self,
        dataset: &DatasetName,
    ) -> Result<Vec<EngagementMessage>, StoreError> {
        self.messages_for_datasets(std::slice::from_ref(dataset)).await
    }

    /// Messages currently in any of `datasets`, ordered by `received_at` then key.
    pub async fn messages_for_datasets(
        &self,
        datasets: &[DatasetName],
    ) -> Result<Vec<EngagementMessage>, StoreError> {
        if datasets.is_empty() {
            return Ok(Vec::new());
        }

        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM engagement_messages WHERE dataset IN (",
            MESSAGE_COLUMNS
        ));
        let mut separated = query.separated(", ");
        for dataset in datasets {
            separated.push_bind(dataset.as_str());
        }
        separated.push_unseparated(") ORDER BY received_at, message_key");

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_message).collect()
    }

    /// Every message, ordered by `received_at` then key.
    pub async fn all_messages(&self) -> Result<Vec<EngagementMessage>, StoreError> {
        let sql = format!(
            "SELECT {} FROM engagement_messages ORDER BY received_at, message_key",
            MESSAGE_COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_message).collect()
    }

    /// Message counts per current dataset.
    pub async fn dataset_counts(&self) -> Result<BTreeMap<DatasetName, usize>, StoreError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT dataset, COUNT(*) FROM engagement_messages GROUP BY dataset ORDER BY dataset",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(dataset, count)| {
                let name = DatasetName::parse(&dataset).map_err(|e| StoreError::Corrupt {
                    key: None,
                    reason: e.to_string(),
                })?;
                Ok((name, count.max(0) as usize))
            })
            .collect()
    }

    /// Messages flagged by a consistency conflict.
    pub async fn needs_review_count(&self) -> Result<usize, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM engagement_messages WHERE needs_review = 1")
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as usize)
    }

    /// Write the mutable fields of `message` if its version is still current.
    ///
    /// Returns false on a version conflict. Only labels, dataset and previous
    /// datasets are written.
    pub async fn compare_and_swap(&self, message: &EngagementMessage) -> Result<bool, StoreError> {
        let labels_json = serde_json::to_string(&message.labels)?;
        let previous_json = serde_json::to_string(&message.previous_datasets)?;

        let result = sqlx::query(
            r#"
            UPDATE engagement_messages
            SET labels_json = ?1,
                dataset = ?2,
                previous_datasets_json = ?3,
                version = version + 1
            WHERE message_key = ?4 AND version = ?5
            "#,
        )
        .bind(&labels_json)
        .bind(message.dataset.as_str())
        .bind(&previous_json)
        .bind(message.message_key.as_str())
        .bind(message.version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Read-modify-write with compare-and-swap.
    ///
    /// `apply` returns `(changed, value)`. It is re-run on a fresh read after
    /// every version conflict, up to `CAS_MAX_ATTEMPTS` times.
    pub async fn update_message<T, F>(
        &self,
        key: &MessageKey,
        mut apply: F,
    ) -> Result<CasUpdate<T>, StoreError>
    where
        F: FnMut(&mut EngagementMessage) -> (bool, T),
    {
        let mut retries = 0;
        for _ in 0..CAS_MAX_ATTEMPTS {
            let mut message = self
                .get(key)
                .await?
                .ok_or_else(|| StoreError::NotFound(key.clone()))?;

            let (changed, value) = apply(&mut message);
            if !changed {
                return Ok(CasUpdate {
                    value,
                    message,
                    retries,
                    written: false,
                });
            }

            if self.compare_and_swap(&message).await? {
                message.version += 1;
                return Ok(CasUpdate {
                    value,
                    message,
                    retries,
                    written: true,
                });
            }

            retries += 1;
            debug!(key = key.short(), retries, "Version conflict; re-reading message");
        }

        Err(StoreError::CasExhausted {
            key: key.clone(),
            attempts: CAS_MAX_ATTEMPTS,
        })
    }

    /// Append labels (CAS).
    pub async fn append_labels(
        &self,
        key: &MessageKey,
        labels: &[AppliedLabel],
    ) -> Result<CasUpdate<()>, StoreError> {
        self.update_message(key, |message| {
            message.labels.extend(labels.iter().cloned());
            (!labels.is_empty(), ())
        })
        .await
    }

    /// Move a message to `target`, recording its current dataset (CAS).
    pub async fn move_to_dataset(
        &self,
        key: &MessageKey,
        target: &DatasetName,
    ) -> Result<CasUpdate<()>, StoreError> {
        self.update_message(key, |message| {
            if &message.dataset == target {
                return (false, ());
            }
            let current = std::mem::replace(&mut message.dataset, target.clone());
            message.previous_datasets.push(current);
            (true, ())
        })
        .await
    }
}

fn parse_timestamp(key: &str, field: &str, text: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            key: Some(MessageKey::from_raw(key)),
            reason: format!("bad {} '{}': {}", field, text, e),
        })
}

fn corrupt(key: &str, reason: impl ToString) -> StoreError {
    StoreError::Corrupt {
        key: Some(MessageKey::from_raw(key)),
        reason: reason.to_string(),
    }
}

fn row_to_message(row: &SqliteRow) -> Result<EngagementMessage, StoreError> {
    let key: String = row.try_get("message_key")?;
    let participant: String = row.try_get("participant_uuid")?;
    let dataset: String = row.try_get("dataset")?;
    let origin_dataset: String = row.try_get("origin_dataset")?;
    let origin_flow: String = row.try_get("origin_flow")?;
    let origin_field: String = row.try_get("origin_field")?;
    let received_at: String = row.try_get("received_at")?;
    let labels_json: String = row.try_get("labels_json")?;
    let previous_json: String = row.try_get("previous_datasets_json")?;
    let first_seen_at: String = row.try_get("first_seen_at")?;
    let last_seen_at: String = row.try_get("last_seen_at")?;

    Ok(EngagementMessage {
        participant_uuid: ParticipantUuid::parse(&participant).map_err(|e| corrupt(&key, e))?,
        dataset: DatasetName::parse(&dataset).map_err(|e| corrupt(&key, e))?,
        origin_dataset: DatasetName::parse(&origin_dataset).map_err(|e| corrupt(&key, e))?,
        origin_flow: FlowName::parse(&origin_flow).map_err(|e| corrupt(&key, e))?,
        origin_field: FieldName::parse(&origin_field).map_err(|e| corrupt(&key, e))?,
        received_at: parse_timestamp(&key, "received_at", &received_at)?,
        raw_text: row.try_get("raw_text")?,
        operator: row.try_get("operator")?,
        labels: serde_json::from_str(&labels_json)?,
        previous_datasets: serde_json::from_str(&previous_json)?,
        version: row.try_get("version")?,
        first_seen_at: parse_timestamp(&key, "first_seen_at", &first_seen_at)?,
        last_seen_at: parse_timestamp(&key, "last_seen_at", &last_seen_at)?,
        needs_review: row.try_get("needs_review")?,
        message_key: MessageKey::from_raw(key),
    })
}
