//! Training orchestration and the numeric building blocks it consumes.
//!
//! The [`trainer`] drives one run; everything else here is a leaf component it
//! calls into: class weighting, the batch pipeline, the classifier interface,
//! loss, optimizer, loss scaling, scheduling, early stopping, checkpointing and
//! metrics.

pub mod checkpoint;
pub mod class_weights;
pub mod early_stopping;
pub mod loader;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod optim;
pub mod precision;
pub mod scheduler;
pub mod trainer;
