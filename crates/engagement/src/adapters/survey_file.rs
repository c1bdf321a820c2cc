use anyhow::{Context, Result};
use async_trait::async_trait;
use engagement_ids::FlowName;
use engagement_sync::{SourceError, SurveyResponse, SurveySource};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// Survey platform export: `{ "<flow name>": [response, ...], ... }`.
#[derive(Debug, Clone, Default)]
pub struct JsonSurveySource {
    flows: HashMap<String, Vec<SurveyResponse>>,
}

impl JsonSurveySource {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read survey export: {}", path.display()))?;
        let flows: HashMap<String, Vec<SurveyResponse>> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse survey export: {}", path.display()))?;
        Ok(Self { flows })
    }

    pub fn from_flows(flows: HashMap<String, Vec<SurveyResponse>>) -> Self {
        Self { flows }
    }
}

#[async_trait]
impl SurveySource for JsonSurveySource {
    async fn fetch_responses(&self, flow_name: &FlowName) -> Result<Vec<SurveyResponse>, SourceError> {
        match self.flows.get(flow_name.as_str()) {
            Some(responses) => Ok(responses.clone()),
            None => {
                debug!(flow = %flow_name, "Flow absent from survey export");
                Ok(Vec::new())
            }
        }
    }
}
