use crate::checkpoint::{checkpoint_path, ProgramCheckpoint};
use crate::dataset::TaskDataset;
use crate::error::ReprogramError;
use crate::labels::LabelMap;
use crate::model::ReprogrammingModel;
use anyhow::Result;
use candle_core::{DType, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Instant;

// ---------------------------------------------------------------------------
// Regularization
// ---------------------------------------------------------------------------

/// Penalty on the raw program tensor, weighted by `C` in the loss.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Regularization {
    /// sum |p|
    L1,
    /// sum p^2
    L2,
}

impl Regularization {
    pub fn penalty(&self, program: &Tensor) -> Result<Tensor> {
        let t = match self {
            Regularization::L1 => program.abs()?,
            Regularization::L2 => program.sqr()?,
        };
        t.sum_all().map_err(Into::into)
    }
}

// ---------------------------------------------------------------------------
// Loss
// ---------------------------------------------------------------------------

/// Cross-entropy over the task logits selected by `label_map`.
pub fn classification_loss(logits: &Tensor, labels: &Tensor, label_map: &LabelMap) -> Result<Tensor> {
    let task_logits = label_map.select(logits)?;
    let labels = labels.to_dtype(DType::U32)?;
    candle_nn::loss::cross_entropy(&task_logits, &labels).map_err(Into::into)
}

/// classification_loss + c * reg(program)
pub fn reprogram_loss(
    logits: &Tensor,
    labels: &Tensor,
    label_map: &LabelMap,
    program: &Tensor,
    regularization: Regularization,
    c: f64,
) -> Result<Tensor> {
    let ce = classification_loss(logits, labels, label_map)?;
    if c == 0.0 {
        return Ok(ce);
    }
    let reg = (regularization.penalty(program)? * c)?;
    (ce + reg).map_err(Into::into)
}

// ---------------------------------------------------------------------------
// Training Config
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct TrainingConfig {
    pub lr: f64,
    pub nb_epochs: usize,
    pub batch_size: usize,
    pub regularization: Regularization,
    pub c: f64,
    /// Checkpoint every `save_freq` epochs (and after the last one).
    pub save_freq: usize,
    /// Prefix for checkpoint files; None disables checkpointing.
    pub save_path: Option<PathBuf>,
    /// Seed for the per-epoch order of training samples.
    pub data_seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            nb_epochs: 20,
            batch_size: 16,
            regularization: Regularization::L2,
            c: 0.05,
            save_freq: 10,
            save_path: None,
            data_seed: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Trainer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct TrainOutcome {
    /// One entry per optimizer step.
    pub loss_history: Vec<f32>,
    /// Mean loss of each epoch.
    pub epoch_losses: Vec<f32>,
    /// (epoch, test accuracy) for every evaluation run.
    pub evaluations: Vec<(usize, f32)>,
    pub checkpoints: Vec<PathBuf>,
}

impl TrainOutcome {
    pub fn final_accuracy(&self) -> Option<f32> {
        self.evaluations.last().map(|&(_, acc)| acc)
    }
}

pub struct ProgramTrainer<'a> {
    model: &'a ReprogrammingModel,
    label_map: LabelMap,
    optimizer: AdamW,
    config: TrainingConfig,
    rng: StdRng,
    step_count: usize,
    loss_history: Vec<f32>,
    timer_start: Instant,
}

impl<'a> ProgramTrainer<'a> {
    pub fn new(model: &'a ReprogrammingModel, label_map: LabelMap, config: TrainingConfig) -> Result<Self> {
        label_map.check_fits(model.classifier().num_classes())?;
        if config.batch_size == 0 || config.save_freq == 0 {
            return Err(ReprogramError::config("batch_size and save_freq must be positive").into());
        }
        // Plain Adam: the regularizer is in the loss, not in weight decay.
        let params = ParamsAdamW {
            lr: config.lr,
            weight_decay: 0.0,
            ..Default::default()
        };
        let optimizer = AdamW::new(model.trainable_vars(), params)?;
        let rng = StdRng::seed_from_u64(config.data_seed);
        Ok(Self {
            model,
            label_map,
            optimizer,
            config,
            rng,
            step_count: 0,
            loss_history: Vec::new(),
            timer_start: Instant::now(),
        })
    }

    /// Forward, loss, backward and one optimizer step on the program.
    /// A non-finite loss is returned as an error before any update.
    pub fn train_step(&mut self, images: &Tensor, labels: &Tensor, epoch: usize, batch: usize) -> Result<f32> {
        let logits = self.model.forward(images)?;
        let loss = reprogram_loss(
            &logits,
            labels,
            &self.label_map,
            self.model.program(),
            self.config.regularization,
            self.config.c,
        )?;
        let value = loss.to_scalar::<f32>()?;
        if !value.is_finite() {
            return Err(ReprogramError::NonFinite { epoch, batch, value }.into());
        }
        self.optimizer.backward_step(&loss)?;
        self.step_count += 1;
        self.loss_history.push(value);
        Ok(value)
    }

    /// One pass over `train` in a freshly shuffled order. Returns the mean loss.
    pub fn train_epoch(&mut self, train: &TaskDataset, epoch: usize) -> Result<f32> {
        let device = self.model.device().clone();
        let batches = train.batches(self.config.batch_size, Some(&mut self.rng), &device);
        let n_batches = batches.num_batches();

        let mut sum = 0.0f64;
        let mut count = 0usize;
        for (i, batch) in batches.enumerate() {
            let (x, y) = batch?;
            let loss = self.train_step(&x, &y, epoch, i)?;
            sum += loss as f64;
            count += 1;
            if i % 100 == 0 {
                tracing::debug!("[epoch {epoch} batch {i:>5}/{n_batches}] loss={loss:.4}");
            }
        }
        Ok(if count > 0 { (sum / count as f64) as f32 } else { f32::NAN })
    }

    /// Snapshot the program at `epoch`. Returns the path written, if any.
    pub fn save_checkpoint(&self, epoch: usize) -> Result<Option<PathBuf>> {
        let Some(prefix) = &self.config.save_path else {
            return Ok(None);
        };
        let path = checkpoint_path(prefix, epoch);
        ProgramCheckpoint {
            program: self.model.program().copy()?,
            mask: self.model.mask().clone(),
            epoch,
            loss_history: self.loss_history.clone(),
        }
        .save(&path)?;
        Ok(Some(path))
    }

    /// Run the fixed number of epochs. Checkpoints every `save_freq` epochs
    /// and after the last one; evaluates on `test` at each of those points.
    pub fn fit(&mut self, train: &TaskDataset, test: Option<&TaskDataset>) -> Result<TrainOutcome> {
        anyhow::ensure!(!train.is_empty(), "training set is empty");
        let mut outcome = TrainOutcome::default();
        let epochs = self.config.nb_epochs;

        tracing::info!(
            "training program: {} samples, batch={}, {} epochs, lr={:.1e}, reg={:?} C={}",
            train.len(),
            self.config.batch_size,
            epochs,
            self.config.lr,
            self.config.regularization,
            self.config.c
        );

        for epoch in 1..=epochs {
            let mean = self.train_epoch(train, epoch)?;
            outcome.epoch_losses.push(mean);
            tracing::info!(
                "[epoch {epoch:>3}/{epochs}] loss={mean:.4} steps={} elapsed={:.1}s",
                self.step_count,
                self.elapsed_secs()
            );

            if epoch % self.config.save_freq == 0 || epoch == epochs {
                if let Some(path) = self.save_checkpoint(epoch)? {
                    outcome.checkpoints.push(path);
                }
                if let Some(test) = test {
                    let acc = evaluate(self.model, &self.label_map, test, self.config.batch_size)?;
                    tracing::info!("[epoch {epoch:>3}/{epochs}] test accuracy={:.2}%", acc * 100.0);
                    outcome.evaluations.push((epoch, acc));
                }
            }
        }

        outcome.loss_history = self.loss_history.clone();
        Ok(outcome)
    }

    pub fn step_count(&self) -> usize {
        self.step_count
    }

    pub fn loss_history(&self) -> &[f32] {
        &self.loss_history
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.timer_start.elapsed().as_secs_f64()
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Fraction of `dataset` whose mapped argmax equals the label. The program is
/// read, never updated.
pub fn evaluate(
    model: &ReprogrammingModel,
    label_map: &LabelMap,
    dataset: &TaskDataset,
    batch_size: usize,
) -> Result<f32> {
    if dataset.is_empty() {
        return Ok(0.0);
    }
    let device = model.device().clone();
    let mut correct = 0usize;
    for batch in dataset.batches(batch_size, None, &device) {
        let (x, y) = batch?;
        let logits = model.forward(&x)?.detach();
        let pred = label_map.predict(&logits)?;
        let hits = pred.eq(&y.to_dtype(DType::U32)?)?.to_dtype(DType::U32)?;
        correct += hits.sum_all()?.to_scalar::<u32>()? as usize;
    }
    Ok(correct as f32 / dataset.len() as f32)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
