//! Multi-source registry merging with cross-source duplicate removal.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;
use tracing::info;

use super::Registry;

/// Counts produced by [`DatasetMerger::merge`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergeStats {
    pub total: usize,
    /// Samples kept per source tag after duplicate removal.
    pub per_source: BTreeMap<String, usize>,
    pub duplicates_removed: usize,
    pub per_class: BTreeMap<String, usize>,
}

impl MergeStats {
    /// Largest class count divided by the smallest, if any class is present.
    pub fn imbalance_ratio(&self) -> Option<f64> {
        let max = self.per_class.values().copied().max()?;
        let min = self.per_class.values().copied().filter(|c| *c > 0).min()?;
        Some(max as f64 / min as f64)
    }
}

/// Combines source registries; the earliest source is authoritative for an id.
#[derive(Debug, Default, Clone, Copy)]
pub struct DatasetMerger;

impl DatasetMerger {
    pub fn new() -> Self {
        Self
    }

    /// Append every source in order, dropping samples whose id was already seen.
    ///
    /// Labels are never touched; harmonization must happen before merging.
    pub fn merge(&self, sources: Vec<Registry>) -> (Registry, MergeStats) {
        let mut seen: HashSet<String> = HashSet::new();
        let mut merged = Registry::new();
        let mut stats = MergeStats::default();

        for source in sources {
            let before = merged.len();
            let mut removed = 0usize;
            for sample in source.samples() {
                if !seen.insert(sample.id.clone()) {
                    removed += 1;
                    continue;
                }
                // Ids are globally unique at this point, so the per-source check cannot fire.
                if merged.push(sample.clone()).is_err() {
                    removed += 1;
                }
            }
            info!(
                "Merged {} of {} samples ({} duplicates removed)",
                merged.len() - before,
                source.len(),
                removed
            );
            stats.duplicates_removed += removed;
        }

        stats.total = merged.len();
        stats.per_source = merged.source_counts();
        stats.per_class = merged.label_counts();
        log_distribution(&stats);
        (merged, stats)
    }
}

fn log_distribution(stats: &MergeStats) {
    info!(
        "Merge complete: {} samples, {} duplicates removed, sources {:?}",
        stats.total, stats.duplicates_removed, stats.per_source
    );
    let mut classes: Vec<_> = stats.per_class.iter().collect();
    classes.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    for (class, count) in classes {
        let pct = if stats.total == 0 {
            0.0
        } else {
            *count as f64 / stats.total as f64 * 100.0
        };
        info!("  {class:6}: {count:6} ({pct:5.2}%)");
    }
    if let Some(ratio) = stats.imbalance_ratio() {
        info!("Imbalance ratio: {ratio:.1}:1");
    }
}
