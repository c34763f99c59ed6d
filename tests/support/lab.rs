#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use lesionlab::config::{LabConfig, load_config};
use tempfile::TempDir;

/// A throwaway run directory with two small image sources and a config file.
pub struct LabFixture {
    temp: TempDir,
}

impl LabFixture {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("create tempdir");
        Self { temp }
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.root().join("data/raw")
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.root().join("data/processed")
    }

    pub fn results_dir(&self) -> PathBuf {
        self.root().join("results")
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.root().join("checkpoints")
    }

    /// HAM-style table: `image_id,lesion_id,dx`, one png per row.
    pub fn write_single_column_source(&self, rows: &[(String, &str)]) {
        let dir = self.raw_dir().join("ham");
        let mut text = String::from("image_id,lesion_id,dx\n");
        for (idx, (id, label)) in rows.iter().enumerate() {
            text.push_str(&format!("{id},HAM_{idx:04},{label}\n"));
            write_lesion_png(&dir.join("images").join(format!("{id}.png")), label, idx);
        }
        write_file(&dir.join("metadata.csv"), &text);
    }

    /// ISIC-style indicator table with upper-case class columns.
    pub fn write_indicator_source(&self, rows: &[(String, &str)]) {
        let dir = self.raw_dir().join("isic");
        let mut text = String::from("image,MEL,NV,BCC\n");
        for (idx, (id, label)) in rows.iter().enumerate() {
            let flag = |class: &str| if *label == class { "1.0" } else { "0.0" };
            text.push_str(&format!("{id},{},{},{}\n", flag("mel"), flag("nv"), flag("bcc")));
            write_lesion_png(&dir.join("images").join(format!("{id}.png")), label, idx);
        }
        write_file(&dir.join("groundtruth.csv"), &text);
    }

    /// Write `lesionlab.toml` with relative paths and load it back.
    pub fn config(&self, epochs: usize, training_extra: &str) -> LabConfig {
        let text = format!(
            r#"
[paths]
raw_dir = "data/raw"
processed_dir = "data/processed"
checkpoint_dir = "checkpoints"
results_dir = "results"
log_dir = "logs"

[dataset]
class_names = ["bcc", "mel", "nv"]
image_size = 4

[[dataset.sources]]
tag = "ham"
metadata = "ham/metadata.csv"
image_dir = "ham/images"
image_extension = "png"
schema = {{ kind = "single_column", id_column = "image_id", label_column = "dx" }}

[[dataset.sources]]
tag = "isic"
metadata = "isic/groundtruth.csv"
image_dir = "isic/images"
image_extension = "png"
schema = {{ kind = "indicator", id_column = "image", columns = ["MEL", "NV", "BCC"] }}

[split]
train_ratio = 0.6
val_ratio = 0.2
test_ratio = 0.2
seed = 11

[training]
run_name = "it"
model = {{ kind = "linear" }}
epochs = {epochs}
batch_size = 8
learning_rate = 0.05
weight_decay = 0.0
grad_clip_norm = 5.0
scheduler_factor = 0.5
scheduler_patience = 2
min_lr = 0.0001
early_stopping_patience = 20
early_stopping_min_delta = 0.0
class_weighting = "inverse_frequency"
num_workers = 2
{training_extra}

[safety]
critical_class = "mel"
"#
        );
        let path = self.root().join("lesionlab.toml");
        write_file(&path, &text);
        load_config(&path).expect("load fixture config")
    }

    /// The standard two-source layout: 60 HAM rows, 24 ISIC rows of which 4 repeat HAM ids.
    pub fn write_default_sources(&self) {
        let ham: Vec<(String, &str)> = (0..60)
            .map(|i| (format!("ISIC_{i:05}"), label_for(i, 60)))
            .collect();
        let isic: Vec<(String, &str)> = (0..4)
            .map(|i| (format!("ISIC_{i:05}"), "bcc"))
            .chain((100..120).map(|i| (format!("ISIC_{i:05}"), label_for(i - 100, 20))))
            .collect();
        self.write_single_column_source(&ham);
        self.write_indicator_source(&isic);
    }
}

/// Roughly 50% nv, 30% mel, 20% bcc.
pub fn label_for(idx: usize, total: usize) -> &'static str {
    let pos = idx * 10 / total;
    match pos {
        0..=4 => "nv",
        5..=7 => "mel",
        _ => "bcc",
    }
}

fn write_lesion_png(path: &Path, label: &str, idx: usize) {
    let jitter = (idx % 7) as u8 * 6;
    let color = match label {
        "mel" => [200 + jitter, 30, 30],
        "nv" => [30, 200 + jitter, 30],
        _ => [30, 30, 200 + jitter],
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create image dir");
    }
    image::RgbImage::from_pixel(4, 4, image::Rgb(color))
        .save(path)
        .expect("write png");
}

fn write_file(path: &Path, text: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent dirs");
    }
    fs::write(path, text).expect("write fixture file");
}
