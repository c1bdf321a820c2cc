//! Vocabulary registry for the engagement pipeline.
//!
//! - [`scheme`]: validated code schemes and control codes
//! - [`registry`]: directory loader and shared read-only registry
//! - [`cleaners`]: auto-coders mapping raw text onto scheme codes

pub mod cleaners;
pub mod error;
pub mod registry;
pub mod scheme;

pub use cleaners::{code_for_clean_value, AutoCodingError, CleanValue, Cleaner, NOT_CODED_VALUE};
pub use error::VocabError;
pub use registry::VocabularyRegistry;
pub use scheme::{normalize_match_value, Code, CodeScheme, CodeType, ControlCode};
