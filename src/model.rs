// Reprogramming model
//
//   x (B, c, n, n) --shuffle--> embed into (B, C, S, S) canvas
//                               + tanh((1 - mask) * program)
//                               --> frozen classifier --> logits
//
// The program Var is the only trainable state. The classifier is shared
// read-only behind an Arc and never reaches the optimizer; gradients still
// flow through it back to the program.

use crate::blur::gaussian_blur;
use crate::classifier::FrozenClassifier;
use crate::error::ReprogramError;
use crate::mask::{build_mask, embed};
use crate::shuffle::ShufflePlan;
use anyhow::Result;
use candle_core::{Device, Tensor, Var};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct ModelConfig {
    /// Canvas side expected by the classifier.
    pub input_size: usize,
    /// Side of the centered region reserved for task data.
    pub patch_size: usize,
    /// Side of the task images (must fit in the patch).
    pub image_size: usize,
    pub channels: usize,
    /// 0 disables blurring of the initial program.
    pub blur_sigma: f64,
    pub shuffle_seed: u64,
    pub init_seed: u64,
}

pub struct ReprogrammingModel {
    classifier: Arc<dyn FrozenClassifier>,
    program: Var,
    mask: Tensor,
    // 1 - mask, where the program is allowed to write.
    program_region: Tensor,
    plan: ShufflePlan,
    config: ModelConfig,
}

impl ReprogrammingModel {
    pub fn new(
        classifier: Arc<dyn FrozenClassifier>,
        config: &ModelConfig,
        device: &Device,
    ) -> Result<Self> {
        let cfg = config.clone();
        if classifier.input_size() != cfg.input_size || classifier.channels() != cfg.channels {
            return Err(ReprogramError::config(format!(
                "classifier expects {}x{}x{}, model configured for {}x{}x{}",
                classifier.channels(),
                classifier.input_size(),
                classifier.input_size(),
                cfg.channels,
                cfg.input_size,
                cfg.input_size
            ))
            .into());
        }
        if cfg.image_size == 0 || cfg.image_size > cfg.patch_size {
            return Err(ReprogramError::config(format!(
                "task image side {} must be in 1..={} (patch_size)",
                cfg.image_size, cfg.patch_size
            ))
            .into());
        }
        if cfg.image_size < cfg.patch_size {
            tracing::warn!(
                "patch_size {} > image side {}: a border of the patch stays empty",
                cfg.patch_size,
                cfg.image_size
            );
        }

        let plan = ShufflePlan::new(cfg.shuffle_seed, cfg.image_size, cfg.image_size, device)?;
        // Permuting the all-ones patch leaves it unchanged, so the mask is not shuffled.
        let mask = build_mask(cfg.patch_size, cfg.input_size, cfg.channels, device)?;
        let program_region = mask.affine(-1.0, 1.0)?;

        let init = random_program(cfg.channels, cfg.input_size, cfg.init_seed, device)?;
        let init = if cfg.blur_sigma > 0.0 {
            gaussian_blur(&init, cfg.blur_sigma)?
        } else {
            init
        };
        let program = Var::from_tensor(&init)?;

        tracing::info!(
            "reprogramming model: canvas {}x{}x{}, patch {}, image {}, blur {:.2}, {} program params",
            cfg.channels,
            cfg.input_size,
            cfg.input_size,
            cfg.patch_size,
            cfg.image_size,
            cfg.blur_sigma,
            init.elem_count()
        );
        Ok(Self { classifier, program, mask, program_region, plan, config: cfg })
    }

    /// Logits of the frozen classifier on the adversarial input.
    pub fn forward(&self, batch: &Tensor) -> Result<Tensor> {
        let x_adv = self.adversarial_input(batch)?;
        self.classifier.forward(&x_adv)
    }

    /// embed(shuffle(batch)) + tanh((1 - mask) * program), shape (B, C, S, S).
    pub fn adversarial_input(&self, batch: &Tensor) -> Result<Tensor> {
        if !batch.device().same_device(self.mask.device()) {
            return Err(ReprogramError::Device(format!(
                "input on {:?}, model on {:?}",
                batch.device(),
                self.mask.device()
            ))
            .into());
        }
        let shuffled = self.plan.apply_batch(batch)?;
        let canvas = embed(&shuffled, self.config.input_size, self.config.channels)?;
        let p = self.activated_program()?;
        canvas.broadcast_add(&p).map_err(Into::into)
    }

    /// tanh((1 - mask) * program); exactly 0 wherever mask == 1.
    pub fn activated_program(&self) -> Result<Tensor> {
        self.program_region
            .mul(self.program.as_tensor())?
            .tanh()
            .map_err(Into::into)
    }

    pub fn program(&self) -> &Tensor {
        self.program.as_tensor()
    }

    pub fn mask(&self) -> &Tensor {
        &self.mask
    }

    pub fn plan(&self) -> &ShufflePlan {
        &self.plan
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn classifier(&self) -> &Arc<dyn FrozenClassifier> {
        &self.classifier
    }

    pub fn device(&self) -> &Device {
        self.mask.device()
    }

    /// Parameters for the optimizer: the program and nothing else.
    pub fn trainable_vars(&self) -> Vec<Var> {
        vec![self.program.clone()]
    }

    /// Overwrite the program (e.g. with values read from a checkpoint).
    pub fn set_program(&self, values: &Tensor) -> Result<()> {
        if values.dims() != self.program.dims() {
            return Err(ReprogramError::shape(
                self.program.dims().to_vec(),
                values.dims().to_vec(),
            )
            .into());
        }
        self.program.set(values)?;
        Ok(())
    }
}

fn random_program(channels: usize, size: usize, seed: u64, device: &Device) -> Result<Tensor> {
    let mut rng = StdRng::seed_from_u64(seed);
    let n = channels * size * size;
    let data: Vec<f32> = (0..n).map(|_| StandardNormal.sample(&mut rng)).collect();
    Tensor::from_vec(data, (channels, size, size), device).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    /// Classifier that ignores its input: logits are a fixed row, but the
    /// input still participates in the graph (with weight 0).
    struct ConstantClassifier {
        logits: Tensor,
        size: usize,
        channels: usize,
    }

    impl FrozenClassifier for ConstantClassifier {
        fn forward(&self, input: &Tensor) -> Result<Tensor> {
            let b = input.dim(0)?;
            let zero = (input.sum((1, 2, 3))? * 0.0)?.unsqueeze(1)?;
            let k = self.logits.dim(0)?;
            let rows = self.logits.unsqueeze(0)?.broadcast_as((b, k))?;
            rows.broadcast_add(&zero).map_err(Into::into)
        }
        fn input_size(&self) -> usize { self.size }
        fn channels(&self) -> usize { self.channels }
        fn num_classes(&self) -> usize { self.logits.dim(0).unwrap_or(0) }
    }

    fn cfg() -> ModelConfig {
        ModelConfig {
            input_size: 12,
            patch_size: 6,
            image_size: 6,
            channels: 3,
            blur_sigma: 0.0,
            shuffle_seed: 23,
            init_seed: 1,
        }
    }

    fn constant(size: usize, channels: usize) -> Result<Arc<dyn FrozenClassifier>> {
        let logits = Tensor::arange(0f32, 10., &Device::Cpu)?;
        Ok(Arc::new(ConstantClassifier { logits, size, channels }))
    }

    #[test]
    fn test_program_is_zero_inside_mask() -> Result<()> {
        let model = ReprogrammingModel::new(constant(12, 3)?, &cfg(), &Device::Cpu)?;
        // Push the raw program to large values to make sure masking, not tanh, zeroes it.
        model.set_program(&Tensor::full(50f32, (3, 12, 12), &Device::Cpu)?)?;
        let p = model.activated_program()?.to_vec3::<f32>()?;
        let m = model.mask().to_vec3::<f32>()?;
        for c in 0..3 {
            for i in 0..12 {
                for j in 0..12 {
                    if m[c][i][j] == 1.0 {
                        assert_eq!(p[c][i][j], 0.0);
                    } else {
                        assert!(p[c][i][j] > 0.99);
                    }
                }
            }
        }
        Ok(())
    }

    #[test]
    fn test_mask_covers_embedded_region() -> Result<()> {
        let device = Device::Cpu;
        let model = ReprogrammingModel::new(constant(12, 3)?, &cfg(), &device)?;
        let plain = build_mask(6, 12, 3, &device)?;
        assert_eq!(model.mask().to_vec3::<f32>()?, plain.to_vec3::<f32>()?);
        let region = embed(&Tensor::ones((1, 6, 6), DType::F32, &device)?, 12, 3)?;
        assert_eq!(model.mask().to_vec3::<f32>()?, region.to_vec3::<f32>()?);
        Ok(())
    }

    #[test]
    fn test_adversarial_input_keeps_shuffled_data() -> Result<()> {
        let device = Device::Cpu;
        let model = ReprogrammingModel::new(constant(12, 3)?, &cfg(), &device)?;
        let x = Tensor::randn(0f32, 1., (2, 1, 6, 6), &device)?;
        let adv = model.adversarial_input(&x)?;
        assert_eq!(adv.dims(), &[2, 3, 12, 12]);

        let expected = embed(&model.plan().apply_batch(&x)?, 12, 3)?;
        let got = adv.broadcast_mul(model.mask())?;
        let diff = (got - expected)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }

    #[test]
    fn test_forward_logits_shape() -> Result<()> {
        let device = Device::Cpu;
        let model = ReprogrammingModel::new(constant(12, 3)?, &cfg(), &device)?;
        let x = Tensor::zeros((4, 1, 6, 6), DType::F32, &device)?;
        assert_eq!(model.forward(&x)?.dims(), &[4, 10]);
        Ok(())
    }

    #[test]
    fn test_only_program_is_trainable() -> Result<()> {
        let model = ReprogrammingModel::new(constant(12, 3)?, &cfg(), &Device::Cpu)?;
        let vars = model.trainable_vars();
        assert_eq!(vars.len(), 1);
        assert_eq!(vars[0].dims(), &[3, 12, 12]);
        Ok(())
    }

    #[test]
    fn test_same_seed_same_init() -> Result<()> {
        let a = ReprogrammingModel::new(constant(12, 3)?, &cfg(), &Device::Cpu)?;
        let b = ReprogrammingModel::new(constant(12, 3)?, &cfg(), &Device::Cpu)?;
        assert_eq!(a.program().to_vec3::<f32>()?, b.program().to_vec3::<f32>()?);
        Ok(())
    }

    #[test]
    fn test_blur_smooths_initial_program() -> Result<()> {
        let sharp = ReprogrammingModel::new(constant(12, 3)?, &cfg(), &Device::Cpu)?;
        let mut blurred_cfg = cfg();
        blurred_cfg.blur_sigma = 1.0;
        let blurred = ReprogrammingModel::new(constant(12, 3)?, &blurred_cfg, &Device::Cpu)?;
        let var = |t: &Tensor| -> Result<f32> {
            let mean = t.mean_all()?;
            Ok(t.broadcast_sub(&mean)?.sqr()?.mean_all()?.to_scalar::<f32>()?)
        };
        assert!(var(blurred.program())? < var(sharp.program())?);
        Ok(())
    }

    #[test]
    fn test_construction_errors() -> Result<()> {
        let device = Device::Cpu;
        let mut c = cfg();
        c.patch_size = 13;
        c.image_size = 13;
        assert!(ReprogrammingModel::new(constant(12, 3)?, &c, &device).is_err());

        let mut c = cfg();
        c.image_size = 7;
        assert!(ReprogrammingModel::new(constant(12, 3)?, &c, &device).is_err());

        let err = ReprogrammingModel::new(constant(12, 1)?, &cfg(), &device)
            .err()
            .ok_or_else(|| anyhow::anyhow!("channel mismatch accepted"))?;
        assert!(matches!(
            err.downcast_ref::<ReprogramError>(),
            Some(ReprogramError::Config(_))
        ));
        Ok(())
    }

    #[test]
    fn test_set_program_rejects_wrong_shape() -> Result<()> {
        let model = ReprogrammingModel::new(constant(12, 3)?, &cfg(), &Device::Cpu)?;
        let bad = Tensor::zeros((1, 12, 12), DType::F32, &Device::Cpu)?;
        assert!(model.set_program(&bad).is_err());
        Ok(())
    }
}
