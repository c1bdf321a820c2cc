use async_trait::async_trait;
use engagement_coding::{CodingMessage, CodingTool, CodingToolError, ManualLabel};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

const LABELS_FILE: &str = "manual_labels.json";
const MESSAGES_FILE: &str = "messages.json";

/// Coding tool backed by a directory per coding dataset.
///
/// `<root>/<dataset>/manual_labels.json` holds labels exported from the tool;
/// pushed messages replace `<root>/<dataset>/messages.json`.
#[derive(Debug, Clone)]
pub struct FileCodingTool {
    root: PathBuf,
}

impl FileCodingTool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn labels_path(&self, coda_dataset_id: &str) -> PathBuf {
        self.root.join(coda_dataset_id).join(LABELS_FILE)
    }

    pub fn messages_path(&self, coda_dataset_id: &str) -> PathBuf {
        self.root.join(coda_dataset_id).join(MESSAGES_FILE)
    }
}

fn unavailable(path: &Path, err: impl std::fmt::Display) -> CodingToolError {
    CodingToolError::Unavailable(format!("{}: {}", path.display(), err))
}

#[async_trait]
impl CodingTool for FileCodingTool {
    async fn get_manual_labels(&self, coda_dataset_id: &str) -> Result<Vec<ManualLabel>, CodingToolError> {
        let path = self.labels_path(coda_dataset_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "No manual labels yet");
                return Ok(Vec::new());
            }
            Err(err) => return Err(unavailable(&path, err)),
        };
        serde_json::from_str(&content).map_err(|e| unavailable(&path, e))
    }

    async fn push_messages(
        &self,
        coda_dataset_id: &str,
        messages: Vec<CodingMessage>,
    ) -> Result<(), CodingToolError> {
        let path = self.messages_path(coda_dataset_id);
        let dir = self.root.join(coda_dataset_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| unavailable(&dir, e))?;

        let body = serde_json::to_vec_pretty(&messages).map_err(|e| unavailable(&path, e))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| unavailable(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| unavailable(&path, e))?;
        debug!(path = %path.display(), messages = messages.len(), "Wrote messages for review");
        Ok(())
    }
}
