//! Typed run configuration loaded from TOML.
//!
//! Every key the pipeline consumes is a field here; nothing downstream looks
//! keys up dynamically or falls back to hidden defaults.

mod errors;
mod load;
mod types;

pub use errors::ConfigError;
pub use load::{load_config, parse_config};
pub use types::{
    DatasetConfig, LabConfig, PathsConfig, SafetyConfig, SourceConfig, SplitConfig,
    TrainingConfig,
};
