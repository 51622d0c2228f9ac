// Training pipeline.
//
// fn run_training(config) -> TrainOutcome
// Steps: validate → device → data → frozen classifier → model → fit → render
//
// Everything a run needs comes from the ReprogramConfig passed in; nothing is
// read from globals or the environment.

use crate::classifier::{ConvClassifier, FrozenClassifier};
use crate::config::{DataSource, ReprogramConfig};
use crate::dataset::{Split, TaskDataset};
use crate::error::ReprogramError;
use crate::model::ReprogrammingModel;
use crate::training::{ProgramTrainer, TrainOutcome};
use crate::visualize::save_program_png;
use anyhow::Result;
use candle_core::Device;
use std::sync::Arc;

/// Train/test splits for a run.
pub struct TaskData {
    pub train: TaskDataset,
    pub test: Option<TaskDataset>,
}

/// Load the configured data source and check it matches the image geometry.
pub fn load_task_data(config: &ReprogramConfig) -> Result<TaskData> {
    let data = match &config.data {
        DataSource::Mnist { dir, train_limit, test_limit } => {
            let train = TaskDataset::mnist(dir, Split::Train, *train_limit)?;
            let test = if TaskDataset::split_exists(dir, Split::Test) {
                Some(TaskDataset::mnist(dir, Split::Test, *test_limit)?)
            } else {
                tracing::warn!("no MNIST test split in {}; skipping evaluation", dir.display());
                None
            };
            TaskData { train, test }
        }
        DataSource::Synthetic { train_samples, test_samples } => {
            let side = config.image_size;
            let k = config.num_task_classes;
            let train = TaskDataset::synthetic(*train_samples, side, k, config.data_seed)?;
            let test = if *test_samples > 0 {
                Some(TaskDataset::synthetic(*test_samples, side, k, config.data_seed.wrapping_add(1))?)
            } else {
                None
            };
            TaskData { train, test }
        }
    };

    for ds in std::iter::once(&data.train).chain(data.test.as_ref()) {
        if ds.height() != config.image_size || ds.width() != config.image_size {
            return Err(ReprogramError::shape(
                vec![config.image_size, config.image_size],
                vec![ds.height(), ds.width()],
            )
            .into());
        }
        if ds.num_classes() > config.num_task_classes {
            return Err(ReprogramError::config(format!(
                "dataset has {} classes, config declares {}",
                ds.num_classes(),
                config.num_task_classes
            ))
            .into());
        }
    }
    tracing::info!(
        "task data: {} train, {} test, {}x{}x{}",
        data.train.len(),
        data.test.as_ref().map_or(0, |t| t.len()),
        data.train.channels(),
        data.train.height(),
        data.train.width()
    );
    Ok(data)
}

/// Build the frozen classifier from pretrained weights, or from a random init
/// when none are configured.
pub fn load_classifier(config: &ReprogramConfig, device: &Device) -> Result<ConvClassifier> {
    let classifier = match &config.classifier_weights {
        Some(path) => ConvClassifier::load(config.classifier.clone(), path, device)?,
        None => {
            tracing::warn!("no classifier_weights configured; using a randomly initialized classifier");
            ConvClassifier::new(config.classifier.clone(), device)?
        }
    };
    tracing::info!(
        "frozen classifier: {} params, {} classes",
        classifier.num_params(),
        classifier.num_classes()
    );
    Ok(classifier)
}

/// Swap the data source for a small synthetic set and drop pretrained weights.
pub fn dry_run_config(config: &ReprogramConfig, samples: usize) -> ReprogramConfig {
    let mut cfg = config.clone();
    cfg.data = DataSource::Synthetic {
        train_samples: samples.max(1),
        test_samples: (samples / 4).max(1),
    };
    cfg.classifier_weights = None;
    cfg
}

pub fn run_training(config: &ReprogramConfig) -> Result<TrainOutcome> {
    config.validate()?;
    let device = config.device.resolve()?;
    tracing::info!("device: {}", config.device);

    let data = load_task_data(config)?;
    let classifier: Arc<dyn FrozenClassifier> = Arc::new(load_classifier(config, &device)?);
    let model = ReprogrammingModel::new(classifier, &config.model_config(), &device)?;
    let label_map = config.label_map()?;

    let mut trainer = ProgramTrainer::new(&model, label_map, config.training_config())?;
    let outcome = trainer.fit(&data.train, data.test.as_ref())?;
    if let Some(acc) = outcome.final_accuracy() {
        tracing::info!("final test accuracy: {:.2}%", acc * 100.0);
    }

    if let Some(path) = &config.program_image {
        save_program_png(model.program(), Some(model.mask()), path)?;
    }
    tracing::info!(
        "done: {} steps in {:.1}s, {} checkpoints",
        trainer.step_count(),
        trainer.elapsed_secs(),
        outcome.checkpoints.len()
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_data_matches_config() -> Result<()> {
        let cfg = ReprogramConfig::test();
        let data = load_task_data(&cfg)?;
        assert_eq!(data.train.len(), 16);
        assert_eq!(data.test.as_ref().map(|t| t.len()), Some(8));
        assert_eq!(data.train.height(), cfg.image_size);
        Ok(())
    }

    #[test]
    fn test_missing_mnist_dir_is_dataset_error() {
        let mut cfg = ReprogramConfig::test();
        cfg.data = DataSource::Mnist {
            dir: "/definitely/not/here".into(),
            train_limit: None,
            test_limit: None,
        };
        let err = load_task_data(&cfg).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<ReprogramError>(),
            Some(ReprogramError::Dataset { .. })
        ));
    }

    fn write_idx(dir: &std::path::Path, prefix: &str, n: u32, side: u32) -> Result<()> {
        let mut images = Vec::new();
        for v in [0x0803u32, n, side, side] {
            images.extend_from_slice(&v.to_be_bytes());
        }
        images.extend(std::iter::repeat(128u8).take((n * side * side) as usize));
        std::fs::write(dir.join(format!("{prefix}-images-idx3-ubyte")), images)?;

        let mut labels = Vec::new();
        for v in [0x0801u32, n] {
            labels.extend_from_slice(&v.to_be_bytes());
        }
        labels.extend((0..n).map(|i| (i % 4) as u8));
        std::fs::write(dir.join(format!("{prefix}-labels-idx1-ubyte")), labels)?;
        Ok(())
    }

    #[test]
    fn test_mnist_dir_without_test_split() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_idx(dir.path(), "train", 6, 8)?;
        let mut cfg = ReprogramConfig::test();
        cfg.data = DataSource::Mnist { dir: dir.path().into(), train_limit: Some(4), test_limit: None };
        let data = load_task_data(&cfg)?;
        assert_eq!(data.train.len(), 4);
        assert!(data.test.is_none());
        Ok(())
    }

    #[test]
    fn test_corrupt_test_split_is_dataset_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_idx(dir.path(), "train", 6, 8)?;
        std::fs::write(dir.path().join("t10k-images-idx3-ubyte"), b"garbage")?;
        std::fs::write(dir.path().join("t10k-labels-idx1-ubyte"), b"garbage")?;
        let mut cfg = ReprogramConfig::test();
        cfg.data = DataSource::Mnist { dir: dir.path().into(), train_limit: None, test_limit: None };
        let err = load_task_data(&cfg).err().ok_or_else(|| anyhow::anyhow!("corrupt split accepted"))?;
        assert!(matches!(
            err.downcast_ref::<ReprogramError>(),
            Some(ReprogramError::Dataset { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_image_size_mismatch_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_idx(dir.path(), "train", 4, 6)?;
        let mut cfg = ReprogramConfig::test();
        cfg.data = DataSource::Mnist { dir: dir.path().into(), train_limit: None, test_limit: None };
        let err = load_task_data(&cfg).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<ReprogramError>(),
            Some(ReprogramError::Shape { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_dry_run_config() {
        let mut cfg = ReprogramConfig::default();
        cfg.classifier_weights = Some("weights.safetensors".into());
        let dry = dry_run_config(&cfg, 32);
        assert_eq!(dry.data, DataSource::Synthetic { train_samples: 32, test_samples: 8 });
        assert!(dry.classifier_weights.is_none());
        assert_eq!(dry.batch_size, cfg.batch_size);
    }

    #[test]
    fn test_random_classifier_when_no_weights() -> Result<()> {
        let cfg = ReprogramConfig::test();
        let clf = load_classifier(&cfg, &Device::Cpu)?;
        assert_eq!(clf.num_classes(), cfg.classifier.num_classes);
        Ok(())
    }
}
