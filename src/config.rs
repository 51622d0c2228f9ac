//! Run configuration.
//!
//! [`ReprogramConfig`] carries every knob of a training run and is passed
//! explicitly into [`crate::pipeline::run_training`]. It deserializes from JSON;
//! missing fields take the values of [`ReprogramConfig::default`], which are
//! the constants of the reference shuffled-MNIST setup.
//!
//! ```json
//! {
//!   "batch_size": 16,
//!   "nb_epochs": 20,
//!   "regularization": "l2",
//!   "C": 0.05,
//!   "device": "cuda:0",
//!   "data": { "source": "mnist", "dir": "./data" }
//! }
//! ```

use crate::classifier::ConvClassifierConfig;
use crate::dataset::{MNIST_CLASSES, MNIST_SIDE};
use crate::device::ComputeDevice;
use crate::error::ReprogramError;
use crate::labels::LabelMap;
use crate::model::ModelConfig;
use crate::shuffle::DEFAULT_SHUFFLE_SEED;
use crate::training::{Regularization, TrainingConfig};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Where task images come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum DataSource {
    /// MNIST IDX files in `dir`.
    Mnist {
        dir: PathBuf,
        #[serde(default)]
        train_limit: Option<usize>,
        #[serde(default)]
        test_limit: Option<usize>,
    },
    /// Deterministic generated digits, for smoke runs without a download.
    Synthetic { train_samples: usize, test_samples: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReprogramConfig {
    // -----------------------------------------------------------------------
    // Optimisation
    // -----------------------------------------------------------------------
    pub batch_size: usize,
    pub nb_epochs: usize,
    pub learning_rate: f64,
    pub regularization: Regularization,
    /// Weight of the regularization penalty.
    #[serde(rename = "C")]
    pub c: f64,

    // -----------------------------------------------------------------------
    // Geometry
    // -----------------------------------------------------------------------
    /// Side of the centered region reserved for task data.
    pub patch_size: usize,
    /// Canvas side expected by the frozen classifier.
    pub input_size: usize,
    /// Side of the task images.
    pub image_size: usize,
    pub channels: usize,
    /// Sigma of the Gaussian blur applied to the initial program; 0 disables it.
    pub blur_sigma: f64,

    // -----------------------------------------------------------------------
    // Seeds
    // -----------------------------------------------------------------------
    pub shuffle_seed: u64,
    pub init_seed: u64,
    pub data_seed: u64,

    // -----------------------------------------------------------------------
    // Task
    // -----------------------------------------------------------------------
    pub num_task_classes: usize,
    /// Classifier output used for each task label; identity when absent.
    pub label_map: Option<Vec<usize>>,
    pub data: DataSource,

    // -----------------------------------------------------------------------
    // Frozen classifier
    // -----------------------------------------------------------------------
    pub classifier: ConvClassifierConfig,
    /// Pretrained weights. Without them the classifier keeps its random init.
    pub classifier_weights: Option<PathBuf>,

    // -----------------------------------------------------------------------
    // Infrastructure
    // -----------------------------------------------------------------------
    pub save_freq: usize,
    /// Checkpoint prefix: files are `{save_path}_epochNNNN.safetensors`.
    pub save_path: PathBuf,
    /// PNG of the final program, written after training.
    pub program_image: Option<PathBuf>,
    pub device: ComputeDevice,
}

impl Default for ReprogramConfig {
    fn default() -> Self {
        Self {
            batch_size: 16,
            nb_epochs: 20,
            learning_rate: 1e-3,
            regularization: Regularization::L2,
            c: 0.05,
            patch_size: 36,
            input_size: 224,
            image_size: MNIST_SIDE,
            channels: 3,
            blur_sigma: 0.5,
            shuffle_seed: DEFAULT_SHUFFLE_SEED,
            init_seed: 0,
            data_seed: 0,
            num_task_classes: MNIST_CLASSES,
            label_map: None,
            data: DataSource::Mnist {
                dir: PathBuf::from("./data"),
                train_limit: None,
                test_limit: None,
            },
            classifier: ConvClassifierConfig::imagenet(),
            classifier_weights: None,
            save_freq: 10,
            save_path: PathBuf::from("./models/conv_MNIST_shuffled"),
            program_image: Some(PathBuf::from("./models/program.png")),
            device: ComputeDevice::Cpu,
        }
    }
}

impl ReprogramConfig {
    /// Small CPU config for tests: synthetic data, 16x16 canvas.
    pub fn test() -> Self {
        let classifier = ConvClassifierConfig::tiny();
        Self {
            batch_size: 4,
            nb_epochs: 2,
            learning_rate: 1e-2,
            patch_size: 8,
            input_size: classifier.input_size,
            image_size: 8,
            channels: classifier.channels,
            blur_sigma: 0.0,
            num_task_classes: 4,
            data: DataSource::Synthetic { train_samples: 16, test_samples: 8 },
            classifier,
            save_freq: 1,
            save_path: PathBuf::from("./target/test_models/program"),
            program_image: None,
            ..Self::default()
        }
    }

    pub fn from_json(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        let cfg: Self = serde_json::from_str(&text)
            .with_context(|| format!("cannot parse config file {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(Into::into)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| -> Result<()> { Err(ReprogramError::config(msg).into()) };

        if self.batch_size == 0 {
            return fail("batch_size must be >= 1".into());
        }
        if self.nb_epochs == 0 {
            return fail("nb_epochs must be >= 1".into());
        }
        if self.save_freq == 0 {
            return fail("save_freq must be >= 1".into());
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return fail(format!("learning_rate must be positive, got {}", self.learning_rate));
        }
        if !(self.c.is_finite() && self.c >= 0.0) {
            return fail(format!("C must be non-negative, got {}", self.c));
        }
        if !(self.blur_sigma.is_finite() && self.blur_sigma >= 0.0) {
            return fail(format!("blur_sigma must be non-negative, got {}", self.blur_sigma));
        }
        if self.patch_size == 0 || self.patch_size > self.input_size {
            return fail(format!(
                "patch_size {} must be in 1..={} (input_size)",
                self.patch_size, self.input_size
            ));
        }
        if self.image_size == 0 || self.image_size > self.patch_size {
            return fail(format!(
                "image_size {} must be in 1..={} (patch_size)",
                self.image_size, self.patch_size
            ));
        }

        self.classifier.validate()?;
        if self.classifier.channels != self.channels || self.classifier.input_size != self.input_size {
            return fail(format!(
                "classifier takes {}x{}x{}, config has channels={} input_size={}",
                self.classifier.channels,
                self.classifier.input_size,
                self.classifier.input_size,
                self.channels,
                self.input_size
            ));
        }

        let map = self.label_map()?;
        if map.num_task_classes() != self.num_task_classes {
            return fail(format!(
                "label_map has {} entries, num_task_classes is {}",
                map.num_task_classes(),
                self.num_task_classes
            ));
        }
        map.check_fits(self.classifier.num_classes)?;

        if let DataSource::Synthetic { train_samples, .. } = self.data {
            if train_samples == 0 {
                return fail("synthetic train_samples must be >= 1".into());
            }
        }
        Ok(())
    }

    pub fn label_map(&self) -> Result<LabelMap> {
        match &self.label_map {
            Some(indices) => LabelMap::new(indices.clone()),
            None => Ok(LabelMap::identity(self.num_task_classes)),
        }
    }

    pub fn model_config(&self) -> ModelConfig {
        ModelConfig {
            input_size: self.input_size,
            patch_size: self.patch_size,
            image_size: self.image_size,
            channels: self.channels,
            blur_sigma: self.blur_sigma,
            shuffle_seed: self.shuffle_seed,
            init_seed: self.init_seed,
        }
    }

    pub fn training_config(&self) -> TrainingConfig {
        TrainingConfig {
            lr: self.learning_rate,
            nb_epochs: self.nb_epochs,
            batch_size: self.batch_size,
            regularization: self.regularization,
            c: self.c,
            save_freq: self.save_freq,
            save_path: Some(self.save_path.clone()),
            data_seed: self.data_seed,
        }
    }
}
