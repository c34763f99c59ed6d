use std::path::{Path, PathBuf};

use tracing::info;

use super::{ConfigError, LabConfig};

/// Load, resolve and validate a TOML run configuration.
///
/// Relative entries under `[paths]` resolve against the directory containing the
/// config file, so a run behaves the same regardless of the working directory.
pub fn load_config(path: &Path) -> Result<LabConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    let config = parse_config(&text, path, base)?;
    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

/// Parse configuration text; `origin` is only used in error messages.
pub fn parse_config(text: &str, origin: &Path, base: &Path) -> Result<LabConfig, ConfigError> {
    let mut config: LabConfig = toml::from_str(text).map_err(|source| ConfigError::ParseToml {
        path: origin.to_path_buf(),
        source,
    })?;
    resolve_paths(&mut config, base);
    config.validate()?;
    Ok(config)
}

fn resolve_paths(config: &mut LabConfig, base: &Path) {
    let paths = &mut config.paths;
    for path in [
        &mut paths.raw_dir,
        &mut paths.processed_dir,
        &mut paths.checkpoint_dir,
        &mut paths.results_dir,
        &mut paths.log_dir,
    ] {
        *path = resolve(base, path);
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::LabelSchema;
    use crate::ml::class_weights::{ClassWeightMethod, ImbalanceStrategy};
    use crate::ml::model::ModelKind;
    use crate::ml::precision::Precision;

    const VALID: &str = r#"
[paths]
raw_dir = "data/raw"
processed_dir = "data/processed"
checkpoint_dir = "checkpoints"
results_dir = "results"
log_dir = "/var/log/lesionlab"

[dataset]
class_names = ["akiec", "bcc", "bkl", "df", "mel", "nv", "scc", "vasc"]
image_size = 32

[[dataset.sources]]
tag = "ham10000"
metadata = "HAM_10000/HAM10000_metadata.csv"
image_dir = "HAM_10000/images"
schema = { kind = "single_column", id_column = "image_id", label_column = "dx" }

[[dataset.sources]]
tag = "isic2019"
metadata = "ISIC_2019/ISIC_2019_Training_GroundTruth.csv"
image_dir = "ISIC_2019/images"
schema = { kind = "indicator", id_column = "image", columns = ["MEL", "NV", "BCC", "AK", "BKL", "DF", "VASC", "SCC"] }
renames = { ak = "akiec" }

[split]
train_ratio = 0.70
val_ratio = 0.15
test_ratio = 0.15
seed = 42

[training]
model = { kind = "mlp", hidden_size = 64 }
epochs = 30
batch_size = 32
learning_rate = 0.0001
weight_decay = 0.01
grad_clip_norm = 1.0
scheduler_factor = 0.5
scheduler_patience = 3
min_lr = 0.000001
early_stopping_patience = 7
early_stopping_min_delta = 0.001
class_weighting = "inverse_frequency"

[safety]
critical_class = "mel"
"#;

    fn parse(text: &str) -> Result<LabConfig, ConfigError> {
        parse_config(text, Path::new("test.toml"), Path::new("/runs/a"))
    }

    #[test]
    fn parses_full_config_with_defaults() {
        let config = parse(VALID).unwrap();
        assert_eq!(config.paths.raw_dir, PathBuf::from("/runs/a/data/raw"));
        assert_eq!(config.paths.log_dir, PathBuf::from("/var/log/lesionlab"));
        assert_eq!(config.training.model, ModelKind::Mlp { hidden_size: 64 });
        assert_eq!(config.training.class_weighting, ClassWeightMethod::InverseFrequency);
        assert_eq!(config.training.imbalance_strategy, ImbalanceStrategy::LossWeights);
        assert_eq!(config.training.precision, Precision::Full);
        assert_eq!(config.safety.sensitivity_threshold, 0.85);
        assert_eq!(config.dataset.sources[0].image_extension, "jpg");
        assert!(matches!(
            config.dataset.sources[1].schema,
            LabelSchema::Indicator { .. }
        ));
        assert_eq!(config.dataset.sources[1].renames["ak"], "akiec");
        let specs = config.source_specs();
        assert_eq!(
            specs[0].metadata_path,
            PathBuf::from("/runs/a/data/raw/HAM_10000/HAM10000_metadata.csv")
        );
    }

    #[test]
    fn missing_required_key_is_config_error() {
        let text = VALID.replace("seed = 42\n", "");
        let err = parse(&text).unwrap_err();
        assert!(matches!(err, ConfigError::ParseToml { .. }));
        assert!(err.to_string().contains("seed"));
    }

    #[test]
    fn ratios_must_sum_to_one() {
        let text = VALID.replace("test_ratio = 0.15", "test_ratio = 0.25");
        let err = parse(&text).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "split"));
    }

    #[test]
    fn critical_class_must_be_known() {
        let text = VALID.replace("critical_class = \"mel\"", "critical_class = \"melanoma\"");
        let err = parse(&text).unwrap_err();
        assert!(
            matches!(err, ConfigError::Invalid { ref field, .. } if field == "safety.critical_class")
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let text = VALID.replace("epochs = 30", "epochs = 30\nepochz = 3");
        assert!(matches!(parse(&text), Err(ConfigError::ParseToml { .. })));
    }

    #[test]
    fn load_reports_missing_file() {
        let err = load_config(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
