//! Pipeline runner: load once, then run stages in order.

use anyhow::{Context, Result};
use engagement_analysis::{AnalysisAggregator, AnalysisOutput, ExportSink};
use engagement_coding::{CodingReport, CodingResolver, CodingTool};
use engagement_config::{PipelineConfig, ValidatedConfig};
use engagement_ids::RunId;
use engagement_protocol::CancellationToken;
use engagement_store::EngagementStore;
use engagement_sync::{IdentityResolver, SurveySource, SyncEngine, SyncReport};
use engagement_vocab::VocabularyRegistry;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Validated configuration together with the registry it was checked against.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: Arc<ValidatedConfig>,
    pub registry: Arc<VocabularyRegistry>,
}

impl LoadedConfig {
    /// Load the registry named by `config` and validate against it.
    pub fn validate(config: PipelineConfig) -> Result<Self> {
        let registry = VocabularyRegistry::load_dir(&config.code_schemes_dir).with_context(|| {
            format!(
                "Failed to load code schemes from {}",
                config.code_schemes_dir.display()
            )
        })?;
        let config = config.validate(&registry)?;
        info!(
            pipeline = config.pipeline_name(),
            schemes = registry.len(),
            flows = config.flow_names().len(),
            coding_datasets = config.coding_datasets().len(),
            analysis_datasets = config.analysis_datasets().len(),
            "Configuration validated"
        );
        Ok(Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::validate(PipelineConfig::load(path)?)
    }
}

/// Stage reports of a full run.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub run_id: RunId,
    pub sync: SyncReport,
    pub coding: CodingReport,
    pub analysis: AnalysisOutput,
}

/// Collaborators needed by a full run.
pub struct Collaborators<'a> {
    pub source: Arc<dyn SurveySource>,
    pub resolver: Arc<dyn IdentityResolver>,
    pub coding_tool: Arc<dyn CodingTool>,
    pub sink: Option<&'a dyn ExportSink>,
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    config: Arc<ValidatedConfig>,
    registry: Arc<VocabularyRegistry>,
    store: EngagementStore,
}

impl Pipeline {
    pub fn new(loaded: LoadedConfig, store: EngagementStore) -> Self {
        Self {
            config: loaded.config,
            registry: loaded.registry,
            store,
        }
    }

    /// Open the engagement store named by the configuration.
    pub async fn open(loaded: LoadedConfig) -> Result<Self> {
        let path = loaded.config.config().engagement_store_path.clone();
        let store = EngagementStore::open(&path)
            .await
            .with_context(|| format!("Failed to open engagement store: {}", path.display()))?;
        Ok(Self::new(loaded, store))
    }

    pub fn config(&self) -> &ValidatedConfig {
        &self.config
    }

    pub fn store(&self) -> &EngagementStore {
        &self.store
    }

    pub async fn sync(
        &self,
        source: Arc<dyn SurveySource>,
        resolver: Arc<dyn IdentityResolver>,
        cancel: &CancellationToken,
    ) -> Result<SyncReport> {
        let engine = SyncEngine::new(Arc::clone(&self.config), self.store.clone());
        engine
            .run(source, resolver, cancel)
            .await
            .context("Sync stage failed")
    }

    pub async fn code(&self, tool: Arc<dyn CodingTool>, cancel: &CancellationToken) -> Result<CodingReport> {
        let resolver = CodingResolver::new(
            Arc::clone(&self.config),
            Arc::clone(&self.registry),
            self.store.clone(),
        )?;
        resolver.run(tool, cancel).await.context("Coding stage failed")
    }

    /// Build analysis datasets and, when a sink is given, export them.
    pub async fn analyse(
        &self,
        sink: Option<&dyn ExportSink>,
        cancel: &CancellationToken,
    ) -> Result<AnalysisOutput> {
        let aggregator = AnalysisAggregator::new(
            Arc::clone(&self.config),
            Arc::clone(&self.registry),
            self.store.clone(),
        );
        let mut output = aggregator.run(cancel).await.context("Analysis stage failed")?;
        if let Some(sink) = sink {
            aggregator
                .export(&mut output, sink, cancel)
                .await
                .context("Export failed")?;
        }
        Ok(output)
    }

    /// sync, code, analyse. A cancelled stage stops the run after it.
    pub async fn run(
        &self,
        collaborators: Collaborators<'_>,
        cancel: &CancellationToken,
    ) -> Result<PipelineReport> {
        let run_id = RunId::new();
        info!(run_id = %run_id, pipeline = self.config.pipeline_name(), "Pipeline run starting");

        let sync = self
            .sync(collaborators.source, collaborators.resolver, cancel)
            .await?;
        let coding = if sync.cancelled {
            CodingReport {
                cancelled: true,
                ..Default::default()
            }
        } else {
            self.code(collaborators.coding_tool, cancel).await?
        };
        let analysis = if coding.cancelled {
            let mut output = AnalysisOutput::default();
            output.report.cancelled = true;
            output
        } else {
            self.analyse(collaborators.sink, cancel).await?
        };

        let needs_review = self.store.needs_review_count().await?;
        info!(
            run_id = %run_id,
            inserted = sync.inserted,
            auto_coded = coding.total().auto_coded,
            records = analysis.report.total_records(),
            needs_review,
            "Pipeline run finished"
        );
        Ok(PipelineReport {
            run_id,
            sync,
            coding,
            analysis,
        })
    }
}
