//! Library exports for the preparation and training binaries, benchmarks and tests.
/// Typed TOML run configuration.
pub mod config;
/// Sample registries, harmonization, merging and stratified splitting.
pub mod dataset;
/// Tracing subscriber setup.
pub mod logging;
/// Training loop, metrics and the numeric pieces they use.
pub mod ml;
/// End-to-end prepare and train runs.
pub mod pipeline;
/// Run-scoped warnings and epoch reports.
pub mod report;
