//! Sample registries, source harmonization, merging and stratified splitting.

mod classes;
mod errors;
mod harmonize;
mod merge;
pub mod metadata;
pub(crate) mod registry;
mod split;

pub use classes::ClassSet;
pub use errors::DatasetError;
pub use harmonize::{LabelHarmonizer, LabelSchema, SourceSpec, canonical_label};
pub use merge::{DatasetMerger, MergeStats};
pub use metadata::RawTable;
pub use registry::{Registry, Sample};
pub use split::{
    ClassShare, MIN_STRATIFIABLE_CLASS, Partition, Partitions, SplitAssignment, SplitRatios,
    StratificationQuality, StratificationReport, StratifiedSplitter, verify_stratification,
};
