//! Coding resolver for the engagement pipeline.
//!
//! Merges labels from the human coding tool into the engagement store,
//! auto-codes schemes that have a cleaner, applies workspace corrections
//! and pushes messages still needing review back to the tool.

pub mod cleaners;
pub mod error;
pub mod plan;
pub mod report;
pub mod resolver;
pub mod tool;

pub use cleaners::CleanerRegistry;
pub use error::CodingError;
pub use plan::{DatasetPlan, MessageOutcome};
pub use report::{CodingReport, DatasetCodingReport, MAX_ERROR_SAMPLES};
pub use resolver::CodingResolver;
pub use tool::{CodingMessage, CodingTool, CodingToolError, ManualLabel};
