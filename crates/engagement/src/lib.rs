//! Engagement pipeline runner.
//!
//! Wires the sync, coding and analysis stages to file-backed collaborators
//! and renders stage reports.

pub mod adapters;
pub mod output;
pub mod pipeline;

pub use pipeline::{Collaborators, LoadedConfig, Pipeline, PipelineReport};
