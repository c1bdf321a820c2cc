//! Analysis aggregator for the engagement pipeline.
//!
//! Folds coded engagement messages into research-question and demographic
//! analysis datasets, including derived age categories, and hands them to an
//! [`ExportSink`].

pub mod aggregator;
pub mod columns;
pub mod dataset;
pub mod error;
pub mod report;
pub mod sink;

pub use aggregator::{aggregate, AnalysisAggregator, AnalysisOutput};
pub use columns::{categorize_age, ColumnSet};
pub use dataset::{AnalysisColumn, AnalysisDataset, AnalysisRecord, CellValue};
pub use error::{AnalysisError, ExportError};
pub use report::{AnalysisReport, DatasetAnalysisCounts};
pub use sink::ExportSink;
