//! Developer utility to harmonize, merge and split the configured sources.

use std::path::PathBuf;

use lesionlab::config::load_config;
use lesionlab::dataset::{Partition, StratificationQuality};
use lesionlab::logging;
use lesionlab::pipeline::prepare;
use lesionlab::report::RunLog;

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let options = parse_args(std::env::args().skip(1).collect())?;
    let config = load_config(&options.config_path).map_err(|err| err.to_string())?;
    if let Err(err) = logging::init(&config.paths.log_dir) {
        eprintln!("Logging disabled: {err}");
    }

    let mut log = RunLog::new();
    let prepared = prepare(&config, &mut log).map_err(|err| err.to_string())?;

    println!(
        "Merged {} samples ({} duplicates removed)",
        prepared.stats.total, prepared.stats.duplicates_removed
    );
    if let Some(ratio) = prepared.stats.imbalance_ratio() {
        println!("Imbalance ratio {ratio:.1}:1");
    }
    for partition in Partition::ALL {
        println!(
            "{:>5}: {:6} samples",
            partition.as_str(),
            prepared.partitions.get(partition).len()
        );
    }
    let quality = match prepared.report.quality {
        StratificationQuality::Excellent => "excellent",
        StratificationQuality::Acceptable => "acceptable",
        StratificationQuality::Poor => "poor",
    };
    println!(
        "Stratification {quality} (max deviation {:.2}%)",
        prepared.report.max_deviation
    );
    println!("Metadata written to {}", config.paths.processed_dir.display());
    if !log.warnings().is_empty() {
        println!("{} warning(s):", log.warnings().len());
        for warning in log.warnings() {
            println!("  {warning}");
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct CliOptions {
    config_path: PathBuf,
}

fn parse_args(args: Vec<String>) -> Result<CliOptions, String> {
    let mut config_path: Option<PathBuf> = None;
    let mut idx = 0usize;
    while idx < args.len() {
        match args[idx].as_str() {
            "-h" | "--help" => return Err(help_text()),
            "--config" => {
                idx += 1;
                let value = args.get(idx).ok_or_else(|| "--config requires a value".to_string())?;
                config_path = Some(PathBuf::from(value));
            }
            unknown => return Err(format!("Unknown argument: {unknown}\n\n{}", help_text())),
        }
        idx += 1;
    }
    let config_path = config_path.ok_or_else(|| format!("--config is required\n\n{}", help_text()))?;
    Ok(CliOptions { config_path })
}

fn help_text() -> String {
    [
        "lesionlab-prepare",
        "",
        "Harmonize source labels, merge sources, and write stratified",
        "train/val/test metadata into the configured processed directory.",
        "",
        "Usage:",
        "  lesionlab-prepare --config <lesionlab.toml>",
    ]
    .join("\n")
}
