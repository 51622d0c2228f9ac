// Task label -> classifier output index.
//
// The frozen classifier predicts over its own label space (e.g. 1000 ImageNet
// classes). A LabelMap picks one classifier output per task label; the
// selected columns, in task-label order, are the task logits used both for the
// loss and for accuracy.

use crate::error::ReprogramError;
use anyhow::Result;
use candle_core::Tensor;
use std::collections::HashSet;

#[derive(Clone, Debug)]
pub struct LabelMap {
    indices: Vec<u32>,
}

impl LabelMap {
    /// Task label k -> classifier output k.
    pub fn identity(num_task_classes: usize) -> Self {
        Self { indices: (0..num_task_classes as u32).collect() }
    }

    /// `indices[k]` is the classifier output used for task label k.
    /// The mapping must be injective.
    pub fn new(indices: Vec<usize>) -> Result<Self> {
        if indices.is_empty() {
            return Err(ReprogramError::config("label map is empty").into());
        }
        let mut seen = HashSet::new();
        for &i in &indices {
            if !seen.insert(i) {
                return Err(ReprogramError::config(format!(
                    "label map is not injective: output {i} used twice"
                ))
                .into());
            }
        }
        Ok(Self { indices: indices.into_iter().map(|i| i as u32).collect() })
    }

    pub fn num_task_classes(&self) -> usize {
        self.indices.len()
    }

    pub fn output_index(&self, task_label: usize) -> Option<usize> {
        self.indices.get(task_label).map(|&i| i as usize)
    }

    /// Every mapped output must exist in a classifier with `num_outputs` logits.
    pub fn check_fits(&self, num_outputs: usize) -> Result<()> {
        if let Some(&bad) = self.indices.iter().find(|&&i| i as usize >= num_outputs) {
            return Err(ReprogramError::config(format!(
                "label map uses output {bad}, classifier only has {num_outputs}"
            ))
            .into());
        }
        Ok(())
    }

    /// (B, num_outputs) classifier logits -> (B, num_task_classes) task logits.
    pub fn select(&self, logits: &Tensor) -> Result<Tensor> {
        let index = Tensor::from_slice(&self.indices, self.indices.len(), logits.device())?;
        logits.index_select(&index, 1).map_err(Into::into)
    }

    /// Predicted task label per row.
    pub fn predict(&self, logits: &Tensor) -> Result<Tensor> {
        self.select(logits)?.argmax(1).map_err(Into::into)
    }
}
