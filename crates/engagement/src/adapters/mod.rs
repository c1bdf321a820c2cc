//! File-backed collaborators for running the pipeline locally.

pub mod coding_files;
pub mod csv_sink;
pub mod identity;
pub mod survey_file;

pub use coding_files::FileCodingTool;
pub use csv_sink::CsvExportSink;
pub use identity::PrefixedUuidResolver;
pub use survey_file::JsonSurveySource;
