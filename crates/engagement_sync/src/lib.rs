//! Sync engine for the engagement pipeline.
//!
//! Pulls flow results from a [`SurveySource`], resolves participants through
//! an [`IdentityResolver`] and writes one message per configured
//! `(flow, field)` response into the engagement store.

pub mod engine;
pub mod error;
pub mod operator;
pub mod report;
pub mod source;

pub use engine::SyncEngine;
pub use error::SyncError;
pub use operator::operator_for_contact;
pub use report::{DatasetSyncCounts, SkipReason, SkippedResponse, SyncReport};
pub use source::{IdentityResolver, SourceError, SurveyResponse, SurveySource};
