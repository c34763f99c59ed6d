//! Two-stage proportional stratified splitting and its verification.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::ConfigError;
use crate::report::{ReportSink, Warning};

use super::{DatasetError, Registry, Sample};

/// Classes smaller than this cannot be stratified and go to `train`.
pub const MIN_STRATIFIABLE_CLASS: usize = 2;
const RATIO_TOLERANCE: f64 = 1e-6;
const EXCELLENT_DEVIATION_PCT: f64 = 2.0;
const ACCEPTABLE_DEVIATION_PCT: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Partition {
    Train,
    Val,
    Test,
}

impl Partition {
    pub const ALL: [Partition; 3] = [Partition::Train, Partition::Val, Partition::Test];

    pub fn as_str(self) -> &'static str {
        match self {
            Partition::Train => "train",
            Partition::Val => "val",
            Partition::Test => "test",
        }
    }

    fn index(self) -> usize {
        match self {
            Partition::Train => 0,
            Partition::Val => 1,
            Partition::Test => 2,
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target train/val/test proportions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SplitRatios {
    pub train: f64,
    pub val: f64,
    pub test: f64,
}

impl SplitRatios {
    /// Ratios must be finite, non-negative and sum to 1 within 1e-6.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let all = [self.train, self.val, self.test];
        if all.iter().any(|r| !r.is_finite() || *r < 0.0) {
            return Err(ConfigError::invalid("split", "ratios must be non-negative"));
        }
        let sum: f64 = all.iter().sum();
        if (sum - 1.0).abs() > RATIO_TOLERANCE {
            return Err(ConfigError::invalid(
                "split",
                format!("ratios must sum to 1.0, got {sum}"),
            ));
        }
        Ok(())
    }

    fn holdout(&self) -> f64 {
        self.val + self.test
    }
}

/// Sample id to partition mapping covering every sample of the split registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitAssignment {
    map: BTreeMap<String, Partition>,
}

impl SplitAssignment {
    pub fn get(&self, id: &str) -> Option<Partition> {
        self.map.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Partition)> {
        self.map.iter().map(|(id, p)| (id.as_str(), *p))
    }

    pub fn ids_in(&self, partition: Partition) -> BTreeSet<&str> {
        self.iter()
            .filter(|(_, p)| *p == partition)
            .map(|(id, _)| id)
            .collect()
    }

    /// Sizes in `[train, val, test]` order.
    pub fn counts(&self) -> [usize; 3] {
        let mut counts = [0usize; 3];
        for partition in self.map.values() {
            counts[partition.index()] += 1;
        }
        counts
    }

    /// Materialize the partitions, preserving registry order within each.
    ///
    /// Fails with [`DatasetError::DuplicateId`] if `registry` repeats an id within a source.
    pub fn apply(&self, registry: &Registry) -> Result<Partitions, DatasetError> {
        let mut partitions = Partitions::default();
        for sample in registry {
            let target = match self.get(&sample.id) {
                Some(Partition::Train) | None => &mut partitions.train,
                Some(Partition::Val) => &mut partitions.val,
                Some(Partition::Test) => &mut partitions.test,
            };
            target.push(sample.clone())?;
        }
        Ok(partitions)
    }

    fn assign(&mut self, sample: &Sample, partition: Partition) {
        self.map.insert(sample.id.clone(), partition);
    }
}

/// The three disjoint registries produced from one split.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Partitions {
    pub train: Registry,
    pub val: Registry,
    pub test: Registry,
}

impl Partitions {
    pub fn get(&self, partition: Partition) -> &Registry {
        match partition {
            Partition::Train => &self.train,
            Partition::Val => &self.val,
            Partition::Test => &self.test,
        }
    }

    pub fn total(&self) -> usize {
        self.train.len() + self.val.len() + self.test.len()
    }
}

/// Deterministic per-class proportional splitter.
#[derive(Debug, Clone)]
pub struct StratifiedSplitter {
    ratios: SplitRatios,
    seed: u64,
}

impl StratifiedSplitter {
    pub fn new(ratios: SplitRatios, seed: u64) -> Result<Self, ConfigError> {
        ratios.validate()?;
        Ok(Self { ratios, seed })
    }

    pub fn ratios(&self) -> SplitRatios {
        self.ratios
    }

    /// Split `registry` into train/val/test.
    ///
    /// Stage one separates `train` from a holdout of `val + test` per class; stage
    /// two divides each class's holdout into `val` and `test`. Within a class the
    /// order is a seeded hash of the sample id, so the same seed always yields the
    /// same assignment regardless of registry order.
    ///
    /// Ids must be unique across the whole registry, so sources have to be merged
    /// first; a repeated id is a [`DatasetError::UnmergedDuplicate`].
    pub fn split(
        &self,
        registry: &Registry,
        sink: &mut dyn ReportSink,
    ) -> Result<SplitAssignment, DatasetError> {
        let mut first_source: HashMap<&str, &str> = HashMap::with_capacity(registry.len());
        for sample in registry {
            if let Some(first) = first_source.insert(sample.id.as_str(), sample.source.as_str()) {
                return Err(DatasetError::UnmergedDuplicate {
                    id: sample.id.clone(),
                    first_source: first.to_string(),
                    second_source: sample.source.clone(),
                });
            }
        }

        let mut by_class: BTreeMap<&str, Vec<&Sample>> = BTreeMap::new();
        for sample in registry {
            by_class.entry(sample.label.as_str()).or_default().push(sample);
        }

        let holdout_ratio = self.ratios.holdout();
        let val_share = if holdout_ratio > 0.0 {
            self.ratios.val / holdout_ratio
        } else {
            0.0
        };
        let mut assignment = SplitAssignment::default();

        for (class, mut members) in by_class {
            let n = members.len();
            if n < MIN_STRATIFIABLE_CLASS {
                sink.warn(Warning::DegenerateClass {
                    class: class.to_string(),
                    reason: format!("only {n} sample(s); cannot stratify, assigned to train"),
                });
                for sample in members {
                    assignment.assign(sample, Partition::Train);
                }
                continue;
            }

            self.sort_by_key(&mut members, "holdout");
            let mut holdout_n = ((n as f64) * holdout_ratio).round() as usize;
            if self.ratios.train > 0.0 {
                holdout_n = holdout_n.min(n - 1);
            }
            let (holdout, train) = members.split_at(holdout_n.min(n));
            for sample in train {
                assignment.assign(sample, Partition::Train);
            }

            let mut holdout = holdout.to_vec();
            self.sort_by_key(&mut holdout, "val_test");
            let val_n = ((holdout.len() as f64) * val_share).round() as usize;
            for (idx, sample) in holdout.into_iter().enumerate() {
                let partition = if idx < val_n {
                    Partition::Val
                } else {
                    Partition::Test
                };
                assignment.assign(sample, partition);
            }
        }

        let [train, val, test] = assignment.counts();
        let total = registry.len().max(1) as f64;
        info!(
            "Split {} samples: train {} ({:.1}%), val {} ({:.1}%), test {} ({:.1}%)",
            registry.len(),
            train,
            train as f64 / total * 100.0,
            val,
            val as f64 / total * 100.0,
            test,
            test as f64 / total * 100.0
        );
        Ok(assignment)
    }

    fn sort_by_key(&self, members: &mut [&Sample], stage: &str) {
        members.sort_by_cached_key(|sample| (order_key(self.seed, stage, &sample.id), sample.id.clone()));
    }
}

fn order_key(seed: u64, stage: &str, id: &str) -> u128 {
    let hash = blake3::hash(format!("{seed}|{stage}|{id}").as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash.as_bytes()[..16]);
    u128::from_le_bytes(bytes)
}

/// How well class proportions survived the split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StratificationQuality {
    /// Every class within 2 percentage points across partitions.
    Excellent,
    /// Within 5 percentage points.
    Acceptable,
    Poor,
}

/// Per-class share of each partition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassShare {
    pub class: String,
    /// Percentage of the whole registry.
    pub global_pct: f64,
    /// Counts in `[train, val, test]` order.
    pub counts: [usize; 3],
    /// Percentage of each partition, in `[train, val, test]` order.
    pub pct: [f64; 3],
    /// Max minus min percentage over the non-empty partitions.
    pub max_deviation: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StratificationReport {
    pub classes: Vec<ClassShare>,
    pub max_deviation: f64,
    pub quality: StratificationQuality,
}

/// Compare per-class percentages across partitions and grade the split.
///
/// A poor grade is reported through `sink`, never raised.
pub fn verify_stratification(
    registry: &Registry,
    assignment: &SplitAssignment,
    sink: &mut dyn ReportSink,
) -> StratificationReport {
    let sizes = assignment.counts();
    let mut per_class: BTreeMap<&str, [usize; 3]> = BTreeMap::new();
    for sample in registry {
        let partition = assignment.get(&sample.id).unwrap_or(Partition::Train);
        per_class.entry(sample.label.as_str()).or_default()[partition.index()] += 1;
    }

    let total = registry.len().max(1) as f64;
    let mut classes = Vec::with_capacity(per_class.len());
    for (class, counts) in per_class {
        let mut pct = [0.0f64; 3];
        for idx in 0..3 {
            if sizes[idx] > 0 {
                pct[idx] = counts[idx] as f64 / sizes[idx] as f64 * 100.0;
            }
        }
        let live: Vec<f64> = (0..3).filter(|idx| sizes[*idx] > 0).map(|idx| pct[idx]).collect();
        let max = live.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let min = live.iter().copied().fold(f64::INFINITY, f64::min);
        let max_deviation = if live.is_empty() { 0.0 } else { max - min };
        classes.push(ClassShare {
            class: class.to_string(),
            global_pct: counts.iter().sum::<usize>() as f64 / total * 100.0,
            counts,
            pct,
            max_deviation,
        });
    }

    let max_deviation = classes
        .iter()
        .map(|c| c.max_deviation)
        .fold(0.0f64, f64::max);
    let quality = if max_deviation < EXCELLENT_DEVIATION_PCT {
        info!("Stratification excellent (max deviation {max_deviation:.2}%)");
        StratificationQuality::Excellent
    } else if max_deviation < ACCEPTABLE_DEVIATION_PCT {
        info!("Stratification acceptable (max deviation {max_deviation:.2}%)");
        StratificationQuality::Acceptable
    } else {
        sink.warn(Warning::StratificationDeviation {
            max_deviation_pct: max_deviation,
        });
        StratificationQuality::Poor
    };
    for share in &classes {
        info!(
            "  {:6} train {:6.2}% ({}) | val {:6.2}% ({}) | test {:6.2}% ({}) | dev {:.2}",
            share.class,
            share.pct[0],
            share.counts[0],
            share.pct[1],
            share.counts[1],
            share.pct[2],
            share.counts[2],
            share.max_deviation
        );
    }

    StratificationReport {
        classes,
        max_deviation,
        quality,
    }
}
