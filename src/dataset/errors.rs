use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;

/// Setup-time failures of the preparation pipeline. All of them abort the run.
#[derive(Debug, Error)]
pub enum DatasetError {
    /// A required metadata file or registry is absent.
    #[error("Required source '{tag}' not found at {path}")]
    MissingSource { tag: String, path: PathBuf },
    /// Expected columns are missing from a source table.
    #[error("Source '{source_tag}' is missing expected columns: {}", missing.join(", "))]
    Schema {
        source_tag: String,
        missing: Vec<String>,
    },
    /// A row cannot be mapped to exactly one canonical class.
    #[error("Invalid row {row} in source '{source_tag}': {reason}")]
    InvalidRow {
        source_tag: String,
        /// One-based data row number (header excluded).
        row: usize,
        reason: String,
    },
    /// The same id appears twice within one source.
    #[error("Duplicate sample id '{id}' within source '{source_tag}'")]
    DuplicateId { source_tag: String, id: String },
    /// An id shared by two sources reached a step that needs merged input.
    #[error("Sample id '{id}' appears in sources '{first_source}' and '{second_source}'; merge before splitting")]
    UnmergedDuplicate {
        id: String,
        first_source: String,
        second_source: String,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("CSV error in {path}: {source}")]
    Csv { path: PathBuf, source: csv::Error },
    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}
