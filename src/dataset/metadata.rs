//! Tabular metadata files: raw per-source tables in, registry CSVs out.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use super::{DatasetError, Partitions, Registry, Sample};

/// Name of the merged registry written before splitting.
pub const MASTER_METADATA_FILE: &str = "master_metadata.csv";
pub const TRAIN_FILE: &str = "train.csv";
pub const VAL_FILE: &str = "val.csv";
pub const TEST_FILE: &str = "test.csv";

/// Untyped CSV table as read from a source's metadata file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RawTable {
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self { headers, rows }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }
}

/// Read a raw source table. A missing file is a [`DatasetError::MissingSource`].
pub fn read_table(path: &Path, tag: &str) -> Result<RawTable, DatasetError> {
    if !path.is_file() {
        return Err(DatasetError::MissingSource {
            tag: tag.to_string(),
            path: path.to_path_buf(),
        });
    }
    let csv_err = |source| DatasetError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(csv_err)?;
    let headers = reader
        .headers()
        .map_err(csv_err)?
        .iter()
        .map(str::to_string)
        .collect();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(csv_err)?;
        rows.push(record.iter().map(str::to_string).collect());
    }
    Ok(RawTable { headers, rows })
}

/// Write a registry as `sample_id,source,label,blob` rows.
pub fn write_registry(path: &Path, registry: &Registry) -> Result<(), DatasetError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| DatasetError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let csv_err = |source| DatasetError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut writer = csv::Writer::from_path(path).map_err(csv_err)?;
    for sample in registry {
        writer.serialize(sample).map_err(csv_err)?;
    }
    writer.flush().map_err(|source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

/// Read a registry previously written by [`write_registry`].
pub fn read_registry(path: &Path) -> Result<Registry, DatasetError> {
    if !path.is_file() {
        return Err(DatasetError::MissingSource {
            tag: registry_tag(path),
            path: path.to_path_buf(),
        });
    }
    let csv_err = |source| DatasetError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::Reader::from_path(path).map_err(csv_err)?;
    let mut registry = Registry::new();
    for row in reader.deserialize::<Sample>() {
        registry.push(row.map_err(csv_err)?)?;
    }
    Ok(registry)
}

/// Persist the three partitions as `train.csv`, `val.csv` and `test.csv` under `dir`.
pub fn write_partitions(dir: &Path, partitions: &Partitions) -> Result<(), DatasetError> {
    for (file, registry) in [
        (TRAIN_FILE, &partitions.train),
        (VAL_FILE, &partitions.val),
        (TEST_FILE, &partitions.test),
    ] {
        let path = dir.join(file);
        write_registry(&path, registry)?;
        info!("Saved {} ({} samples)", path.display(), registry.len());
    }
    Ok(())
}

pub fn read_partitions(dir: &Path) -> Result<Partitions, DatasetError> {
    Ok(Partitions {
        train: read_registry(&dir.join(TRAIN_FILE))?,
        val: read_registry(&dir.join(VAL_FILE))?,
        test: read_registry(&dir.join(TEST_FILE))?,
    })
}

fn registry_tag(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| PathBuf::from(path).display().to_string())
}
