// Frozen classifier seam.
//
// The reprogramming model only sees `FrozenClassifier`: a function from a
// (B, C, S, S) canvas batch to (B, num_classes) logits. ConvClassifier is the
// network shipped with the crate: conv3x3 -> relu -> maxpool blocks, global
// average pooling, and a linear head. Its weights live in a VarMap that is
// never handed to an optimizer.

use crate::checkpoint::{load_varmap, save_varmap};
use crate::error::ReprogramError;
use anyhow::Result;
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{conv2d, linear, Conv2d, Conv2dConfig, Linear, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub trait FrozenClassifier {
    /// Logits over the classifier's native label space.
    fn forward(&self, input: &Tensor) -> Result<Tensor>;

    /// Side of the square input canvas.
    fn input_size(&self) -> usize;

    fn channels(&self) -> usize;

    fn num_classes(&self) -> usize;
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvClassifierConfig {
    pub channels: usize,
    pub input_size: usize,
    /// Output channels of each conv block. Every block halves the resolution.
    pub widths: Vec<usize>,
    pub num_classes: usize,
}

impl ConvClassifierConfig {
    /// ImageNet-shaped stand-in: 3x224x224 in, 1000 classes out.
    pub fn imagenet() -> Self {
        Self {
            channels: 3,
            input_size: 224,
            widths: vec![32, 64, 128, 256],
            num_classes: 1000,
        }
    }

    /// Small config for tests (fast).
    pub fn tiny() -> Self {
        Self {
            channels: 3,
            input_size: 16,
            widths: vec![4, 8],
            num_classes: 12,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| -> Result<()> { Err(ReprogramError::config(msg).into()) };
        if self.channels == 0 || self.num_classes == 0 || self.widths.is_empty() {
            return fail(format!("classifier needs channels, widths and classes: {self:?}"));
        }
        if self.widths.iter().any(|&w| w == 0) {
            return fail("classifier widths must be positive".into());
        }
        let min_input = 1usize << self.widths.len();
        if self.input_size < min_input {
            return fail(format!(
                "input_size {} too small for {} pooling blocks (need >= {min_input})",
                self.input_size,
                self.widths.len()
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ConvClassifier
// ---------------------------------------------------------------------------

pub struct ConvClassifier {
    blocks: Vec<Conv2d>,
    head: Linear,
    config: ConvClassifierConfig,
    varmap: VarMap,
}

impl ConvClassifier {
    /// Build with freshly initialized weights (candle_nn default init).
    pub fn new(config: ConvClassifierConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let conv_cfg = Conv2dConfig { padding: 1, ..Default::default() };

        let mut blocks = Vec::with_capacity(config.widths.len());
        let mut in_c = config.channels;
        for (i, &out_c) in config.widths.iter().enumerate() {
            blocks.push(conv2d(in_c, out_c, 3, conv_cfg, vb.pp(format!("features.{i}")))?);
            in_c = out_c;
        }
        let head = linear(in_c, config.num_classes, vb.pp("classifier"))?;
        Ok(Self { blocks, head, config, varmap })
    }

    /// Build and overwrite every weight from a safetensors file.
    pub fn load(config: ConvClassifierConfig, path: &Path, device: &Device) -> Result<Self> {
        let model = Self::new(config, device)?;
        load_varmap(&model.varmap, path, device)?;
        Ok(model)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        save_varmap(&self.varmap, path)
    }

    pub fn config(&self) -> &ConvClassifierConfig {
        &self.config
    }

    /// Copies of every weight, keyed by name.
    pub fn parameters(&self) -> Result<Vec<(String, Tensor)>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| anyhow::anyhow!("varmap lock poisoned"))?;
        let mut params: Vec<(String, Tensor)> = data
            .iter()
            .map(|(name, var)| Ok((name.clone(), var.as_tensor().copy()?)))
            .collect::<Result<_>>()?;
        params.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(params)
    }

    pub fn num_params(&self) -> usize {
        self.varmap.all_vars().iter().map(|v| v.as_tensor().elem_count()).sum()
    }
}

impl FrozenClassifier for ConvClassifier {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let (_b, c, h, w) = input.dims4()?;
        let s = self.config.input_size;
        if (c, h, w) != (self.config.channels, s, s) {
            return Err(ReprogramError::shape(
                vec![input.dim(0)?, self.config.channels, s, s],
                input.dims().to_vec(),
            )
            .into());
        }
        let mut x = input.clone();
        for block in &self.blocks {
            x = block.forward(&x)?.relu()?.max_pool2d(2)?;
        }
        let pooled = x.mean((2, 3))?;
        self.head.forward(&pooled).map_err(Into::into)
    }

    fn input_size(&self) -> usize {
        self.config.input_size
    }

    fn channels(&self) -> usize {
        self.config.channels
    }

    fn num_classes(&self) -> usize {
        self.config.num_classes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_shape() -> Result<()> {
        let device = Device::Cpu;
        let cfg = ConvClassifierConfig::tiny();
        let model = ConvClassifier::new(cfg.clone(), &device)?;
        let x = Tensor::randn(0f32, 1., (2, cfg.channels, cfg.input_size, cfg.input_size), &device)?;
        let logits = model.forward(&x)?;
        assert_eq!(logits.dims(), &[2, cfg.num_classes]);
        Ok(())
    }

    #[test]
    fn test_wrong_input_shape() -> Result<()> {
        let device = Device::Cpu;
        let model = ConvClassifier::new(ConvClassifierConfig::tiny(), &device)?;
        let x = Tensor::zeros((1, 3, 8, 8), DType::F32, &device)?;
        assert!(model.forward(&x).is_err());
        Ok(())
    }

    #[test]
    fn test_save_load_same_logits() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("clf.safetensors");
        let device = Device::Cpu;
        let cfg = ConvClassifierConfig::tiny();
        let a = ConvClassifier::new(cfg.clone(), &device)?;
        a.save(&path)?;
        let b = ConvClassifier::load(cfg.clone(), &path, &device)?;

        let x = Tensor::randn(0f32, 1., (3, 3, 16, 16), &device)?;
        let la = a.forward(&x)?.to_vec2::<f32>()?;
        let lb = b.forward(&x)?.to_vec2::<f32>()?;
        assert_eq!(la, lb);
        Ok(())
    }

    #[test]
    fn test_load_with_other_architecture_fails() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("clf.safetensors");
        let device = Device::Cpu;
        ConvClassifier::new(ConvClassifierConfig::tiny(), &device)?.save(&path)?;
        let mut other = ConvClassifierConfig::tiny();
        other.widths = vec![4, 16];
        assert!(ConvClassifier::load(other, &path, &device).is_err());
        Ok(())
    }

    #[test]
    fn test_config_validation() {
        assert!(ConvClassifierConfig::tiny().validate().is_ok());
        assert!(ConvClassifierConfig::imagenet().validate().is_ok());
        let mut cfg = ConvClassifierConfig::tiny();
        cfg.input_size = 2;
        assert!(cfg.validate().is_err());
        cfg = ConvClassifierConfig::tiny();
        cfg.widths.clear();
        assert!(cfg.validate().is_err());
    }
}
