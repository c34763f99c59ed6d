//! Developer utility to train a classifier on prepared partitions and evaluate it on the test split.

use std::path::PathBuf;

use lesionlab::config::load_config;
use lesionlab::logging;
use lesionlab::pipeline::{TrainRunOptions, train};
use lesionlab::report::RunLog;

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let options = parse_args(std::env::args().skip(1).collect())?;
    let mut config = load_config(&options.config_path).map_err(|err| err.to_string())?;
    if let Some(epochs) = options.epochs {
        config.training.epochs = epochs;
        config.validate().map_err(|err| err.to_string())?;
    }
    if let Err(err) = logging::init(&config.paths.log_dir) {
        eprintln!("Logging disabled: {err}");
    }

    let mut log = RunLog::new();
    let outcome = train(
        &config,
        TrainRunOptions {
            resume: options.resume,
            cancel: None,
        },
        &mut log,
    )
    .map_err(|err| err.to_string())?;

    let summary = &outcome.summary;
    println!(
        "Trained {} epoch(s){}; best balanced accuracy {:.4} at epoch {}",
        summary.epochs_completed,
        if summary.stopped_early { " (early stop)" } else { "" },
        summary.best_balanced_accuracy,
        summary.best_epoch.map(|e| e + 1).unwrap_or(0)
    );
    if let Some(test) = &outcome.test {
        let metrics = &test.metrics;
        println!("test loss:               {:.4}", test.loss);
        println!("test accuracy:           {:.4}", metrics.accuracy());
        println!("test balanced accuracy:  {:.4}", metrics.balanced_accuracy());
        println!("test f1 macro:           {:.4}", metrics.f1_macro());
        println!(
            "test {} sensitivity:    {:.4}",
            metrics.critical_class(),
            metrics.critical_sensitivity()
        );
        let cm = &metrics.confusion;
        println!("confusion matrix (rows=true, cols=pred):");
        for truth in 0..cm.n_classes {
            let mut row = String::new();
            for pred in 0..cm.n_classes {
                row.push_str(&format!("{:6}", cm.get(truth, pred)));
            }
            println!("{row}");
        }
    }
    let alerts = log.safety_alerts();
    if alerts > 0 {
        println!("{alerts} safety alert(s) raised; see the log for details");
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct CliOptions {
    config_path: PathBuf,
    resume: bool,
    epochs: Option<usize>,
}

fn parse_args(args: Vec<String>) -> Result<CliOptions, String> {
    let mut config_path: Option<PathBuf> = None;
    let mut resume = false;
    let mut epochs = None;
    let mut idx = 0usize;
    while idx < args.len() {
        match args[idx].as_str() {
            "-h" | "--help" => return Err(help_text()),
            "--config" => {
                idx += 1;
                let value = args.get(idx).ok_or_else(|| "--config requires a value".to_string())?;
                config_path = Some(PathBuf::from(value));
            }
            "--epochs" => {
                idx += 1;
                let value = args.get(idx).ok_or_else(|| "--epochs requires a value".to_string())?;
                epochs = Some(
                    value
                        .parse::<usize>()
                        .map_err(|_| format!("Invalid --epochs value: {value}"))?,
                );
            }
            "--resume" => resume = true,
            unknown => return Err(format!("Unknown argument: {unknown}\n\n{}", help_text())),
        }
        idx += 1;
    }
    let config_path = config_path.ok_or_else(|| format!("--config is required\n\n{}", help_text()))?;
    Ok(CliOptions {
        config_path,
        resume,
        epochs,
    })
}

fn help_text() -> String {
    [
        "lesionlab-train",
        "",
        "Train the configured classifier on prepared train/val metadata,",
        "then evaluate the best checkpoint on the test split.",
        "",
        "Usage:",
        "  lesionlab-train --config <lesionlab.toml> [--resume] [--epochs <n>]",
        "",
        "Options:",
        "  --resume        Continue from the run's latest checkpoint.",
        "  --epochs <n>    Override training.epochs.",
    ]
    .join("\n")
}
