//! Samples and the per-source registry that holds them.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use super::{ClassSet, DatasetError};

/// One labelled image reference. Never mutated after registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    #[serde(rename = "sample_id")]
    pub id: String,
    /// Tag of the source registry the sample came from.
    pub source: String,
    /// Canonical class name.
    pub label: String,
    /// Blob location relative to the source's image folder.
    pub blob: String,
}

/// Ordered sample collection with unique ids per source.
///
/// Cross-source duplicate ids are allowed here; [`super::DatasetMerger`] removes them.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    samples: Vec<Sample>,
    keys: HashSet<(String, String)>,
}

impl PartialEq for Registry {
    fn eq(&self, other: &Self) -> bool {
        self.samples == other.samples
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_samples(samples: impl IntoIterator<Item = Sample>) -> Result<Self, DatasetError> {
        let mut registry = Self::new();
        for sample in samples {
            registry.push(sample)?;
        }
        Ok(registry)
    }

    /// Append a sample, rejecting an id already registered for the same source.
    pub fn push(&mut self, sample: Sample) -> Result<(), DatasetError> {
        if !self.keys.insert((sample.source.clone(), sample.id.clone())) {
            return Err(DatasetError::DuplicateId {
                source_tag: sample.source,
                id: sample.id,
            });
        }
        self.samples.push(sample);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Sample> {
        self.samples.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.samples.iter().map(|s| s.id.as_str())
    }

    /// Per-class counts aligned with `classes`. Labels outside the set are ignored.
    pub fn class_counts(&self, classes: &ClassSet) -> Vec<usize> {
        let mut counts = vec![0usize; classes.len()];
        for sample in &self.samples {
            if let Some(idx) = classes.index_of(&sample.label) {
                counts[idx] += 1;
            }
        }
        counts
    }

    pub fn label_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for sample in &self.samples {
            *counts.entry(sample.label.clone()).or_default() += 1;
        }
        counts
    }

    pub fn source_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for sample in &self.samples {
            *counts.entry(sample.source.clone()).or_default() += 1;
        }
        counts
    }
}

impl<'a> IntoIterator for &'a Registry {
    type Item = &'a Sample;
    type IntoIter = std::slice::Iter<'a, Sample>;

    fn into_iter(self) -> Self::IntoIter {
        self.samples.iter()
    }
}

#[cfg(test)]
pub(crate) fn sample(id: &str, source: &str, label: &str) -> Sample {
    Sample {
        id: id.to_string(),
        source: source.to_string(),
        label: label.to_string(),
        blob: format!("{id}.jpg"),
    }
}
