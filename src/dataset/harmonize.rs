//! Label harmonization across heterogeneous source schemas.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::{ClassSet, DatasetError, RawTable, Registry, Sample};

/// How a source table encodes its label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LabelSchema {
    /// One column holds the class name (e.g. `dx`).
    SingleColumn {
        id_column: String,
        label_column: String,
    },
    /// One indicator column per class; exactly one is positive per row.
    Indicator {
        id_column: String,
        columns: Vec<String>,
    },
}

impl LabelSchema {
    pub fn id_column(&self) -> &str {
        match self {
            LabelSchema::SingleColumn { id_column, .. } => id_column,
            LabelSchema::Indicator { id_column, .. } => id_column,
        }
    }

    fn required_columns(&self) -> Vec<&str> {
        match self {
            LabelSchema::SingleColumn {
                id_column,
                label_column,
            } => vec![id_column, label_column],
            LabelSchema::Indicator { id_column, columns } => std::iter::once(id_column.as_str())
                .chain(columns.iter().map(String::as_str))
                .collect(),
        }
    }
}

/// Resolved description of one data source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSpec {
    pub tag: String,
    pub metadata_path: PathBuf,
    pub image_dir: PathBuf,
    pub image_extension: String,
    pub schema: LabelSchema,
    pub renames: BTreeMap<String, String>,
}

/// Maps raw source rows onto one canonical label per sample.
#[derive(Debug, Clone)]
pub struct LabelHarmonizer {
    classes: ClassSet,
}

impl LabelHarmonizer {
    pub fn new(classes: ClassSet) -> Self {
        Self { classes }
    }

    pub fn classes(&self) -> &ClassSet {
        &self.classes
    }

    /// Convert a raw table into a registry tagged with `spec.tag`.
    ///
    /// Fails with [`DatasetError::Schema`] when expected columns are absent and with
    /// [`DatasetError::InvalidRow`] when a row has no single recognised class.
    pub fn harmonize(&self, spec: &SourceSpec, table: &RawTable) -> Result<Registry, DatasetError> {
        let missing: Vec<String> = spec
            .schema
            .required_columns()
            .into_iter()
            .filter(|col| table.column_index(col).is_none())
            .map(str::to_string)
            .collect();
        if !missing.is_empty() {
            return Err(DatasetError::Schema {
                source_tag: spec.tag.clone(),
                missing,
            });
        }

        let id_idx = table.column_index(spec.schema.id_column()).unwrap_or_default();
        let mut registry = Registry::new();
        for (row_idx, row) in table.rows.iter().enumerate() {
            let invalid = |reason: String| DatasetError::InvalidRow {
                source_tag: spec.tag.clone(),
                row: row_idx + 1,
                reason,
            };
            let id = row.get(id_idx).map(|s| s.trim()).unwrap_or_default();
            if id.is_empty() {
                return Err(invalid("empty sample id".to_string()));
            }
            let raw_label = match &spec.schema {
                LabelSchema::SingleColumn { label_column, .. } => {
                    let idx = table.column_index(label_column).unwrap_or_default();
                    row.get(idx).cloned().unwrap_or_default()
                }
                LabelSchema::Indicator { columns, .. } => {
                    indicator_label(table, row, columns).map_err(invalid)?
                }
            };
            let label = canonical_label(&raw_label, &spec.renames);
            if !self.classes.contains(&label) {
                return Err(invalid(format!("unknown class '{raw_label}'")));
            }
            registry.push(Sample {
                id: id.to_string(),
                source: spec.tag.clone(),
                blob: format!("{id}.{}", spec.image_extension),
                label,
            })?;
        }

        info!(
            "Harmonized source '{}': {} samples, classes {:?}",
            spec.tag,
            registry.len(),
            registry.label_counts()
        );
        Ok(registry)
    }
}

/// Lower-case, trim and apply the source's renaming table.
pub fn canonical_label(raw: &str, renames: &BTreeMap<String, String>) -> String {
    let lowered = raw.trim().to_lowercase();
    renames.get(&lowered).cloned().unwrap_or(lowered)
}

fn indicator_label(table: &RawTable, row: &[String], columns: &[String]) -> Result<String, String> {
    let mut set = Vec::new();
    for column in columns {
        let idx = table.column_index(column).unwrap_or_default();
        let value = row.get(idx).map(|s| s.trim()).unwrap_or_default();
        let positive = value
            .parse::<f64>()
            .map(|v| v >= 0.5)
            .map_err(|_| format!("non-numeric indicator '{value}' in column {column}"))?;
        if positive {
            set.push(column.as_str());
        }
    }
    match set.as_slice() {
        [single] => Ok((*single).to_string()),
        [] => Err("no indicator column is set".to_string()),
        many => Err(format!("multiple indicator columns set: {}", many.join(", "))),
    }
}
