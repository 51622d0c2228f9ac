// reprogram binary
//
// Commands:
//   reprogram train   [--config FILE] [--dry-run]   Learn a program for the task
//   reprogram extract --checkpoint FILE --output FILE   Render a saved program as PNG
//
// Without --config the built-in defaults (shuffled MNIST on a 224x224 canvas)
// are used. --dry-run swaps in synthetic data and a random classifier.

use clap::{Parser, Subcommand};
use reprogram::config::ReprogramConfig;
use reprogram::device::ComputeDevice;
use reprogram::pipeline::{dry_run_config, run_training};
use reprogram::visualize::extract_program;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "reprogram", version, about = "Adversarial reprogramming of a frozen image classifier")]
struct Cli {
    /// Log filter: a level (trace, debug, info, warn, error) or directives
    /// such as `reprogram=debug`.
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train an adversarial program.
    Train {
        /// JSON configuration file. Defaults are used when omitted.
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Override the compute device (cpu, cuda, cuda:N).
        #[arg(long)]
        device: Option<ComputeDevice>,

        /// Override the number of epochs.
        #[arg(long)]
        epochs: Option<usize>,

        /// Use synthetic data and a random classifier instead of real inputs.
        #[arg(long, default_value_t = false)]
        dry_run: bool,

        /// Number of synthetic training samples when `--dry-run` is active.
        #[arg(long, default_value_t = 64)]
        dry_run_samples: usize,
    },
    /// Render the program stored in a checkpoint.
    Extract {
        #[arg(long, value_name = "FILE")]
        checkpoint: PathBuf,

        #[arg(long, value_name = "FILE")]
        output: PathBuf,

        #[arg(long, default_value = "cpu")]
        device: ComputeDevice,
    },
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(log_filter(&cli.log_level))
        .with_target(false)
        .init();

    info!("reprogram v{}", reprogram::VERSION);

    let result = match cli.command {
        Command::Train { config, device, epochs, dry_run, dry_run_samples } => {
            cmd_train(config, device, epochs, dry_run, dry_run_samples)
        }
        Command::Extract { checkpoint, output, device } => device
            .resolve()
            .and_then(|dev| extract_program(&checkpoint, &output, &dev))
            .map(|ckpt| info!("extracted epoch {} program to {}", ckpt.epoch, output.display())),
    };

    if let Err(e) = result {
        error!("{e:#}");
        std::process::exit(1);
    }
}

/// Falls back to `info` when the directives do not parse.
fn log_filter(directives: &str) -> EnvFilter {
    EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new("info"))
}

fn cmd_train(
    config_path: Option<PathBuf>,
    device: Option<ComputeDevice>,
    epochs: Option<usize>,
    dry_run: bool,
    dry_run_samples: usize,
) -> anyhow::Result<()> {
    let mut config = match config_path.as_deref() {
        Some(path) => {
            info!("loading configuration from {}", path.display());
            ReprogramConfig::from_json(path)?
        }
        None => {
            info!("no configuration file given, using defaults");
            ReprogramConfig::default()
        }
    };
    if let Some(device) = device {
        config.device = device;
    }
    if let Some(epochs) = epochs {
        config.nb_epochs = epochs;
    }
    if dry_run {
        info!("DRY RUN: synthetic dataset ({dry_run_samples} samples), random classifier");
        config = dry_run_config(&config, dry_run_samples);
    }

    info!("  batch size : {}", config.batch_size);
    info!("  epochs     : {}", config.nb_epochs);
    info!("  lr         : {}", config.learning_rate);
    info!("  reg        : {:?} C={}", config.regularization, config.c);
    info!("  canvas     : {} (patch {})", config.input_size, config.patch_size);
    info!("  checkpoints: {} every {} epochs", config.save_path.display(), config.save_freq);

    let outcome = run_training(&config)?;
    match outcome.final_accuracy() {
        Some(acc) => info!("training complete, test accuracy {:.2}%", acc * 100.0),
        None => info!("training complete"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_filter_directives() {
        use tracing_subscriber::filter::LevelFilter;
        assert_eq!(log_filter("debug").max_level_hint(), Some(LevelFilter::DEBUG));
        assert_eq!(log_filter("reprogram=trace").max_level_hint(), Some(LevelFilter::TRACE));
        assert_eq!(log_filter("reprogram=notalevel").max_level_hint(), Some(LevelFilter::INFO));
    }

    #[test]
    fn test_cli_parses_train_overrides() {
        let cli = Cli::try_parse_from([
            "reprogram", "--log-level", "warn", "train", "--dry-run", "--device", "cuda:1", "--epochs", "3",
        ])
        .unwrap();
        assert_eq!(cli.log_level, "warn");
        match cli.command {
            Command::Train { device, epochs, dry_run, .. } => {
                assert_eq!(device, Some(ComputeDevice::Cuda(1)));
                assert_eq!(epochs, Some(3));
                assert!(dry_run);
            }
            Command::Extract { .. } => panic!("expected train"),
        }
    }
}
