// Program rendering.
//
// tanh((1 - mask) * program) lives in [-1, 1]; it is rescaled to [0, 255]
// and written as RGB (C = 3) or grayscale (C = 1). The masked patch renders
// as mid-gray (0 -> 127).

use crate::checkpoint::{ensure_parent, ProgramCheckpoint};
use crate::error::ReprogramError;
use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use image::{DynamicImage, GrayImage, RgbImage};
use std::path::Path;

/// Activate and rescale a (C, H, W) program into an 8-bit image.
/// Without a mask the raw program is passed through tanh.
pub fn render_program(program: &Tensor, mask: Option<&Tensor>) -> Result<DynamicImage> {
    let (c, h, w) = program.dims3()?;
    let program = program.to_dtype(DType::F32)?;
    let activated = match mask {
        Some(mask) => {
            if mask.dims() != program.dims() {
                return Err(ReprogramError::shape(program.dims().to_vec(), mask.dims().to_vec()).into());
            }
            mask.to_dtype(DType::F32)?.affine(-1.0, 1.0)?.mul(&program)?.tanh()?
        }
        None => program.tanh()?,
    };

    // (C, H, W) -> (H, W, C) so pixels are interleaved.
    let hwc = activated.permute((1, 2, 0))?.flatten_all()?.to_vec1::<f32>()?;
    let bytes: Vec<u8> = hwc.iter().map(|&v| to_byte(v)).collect();

    let (w32, h32) = (w as u32, h as u32);
    let image = match c {
        3 => RgbImage::from_raw(w32, h32, bytes).map(DynamicImage::ImageRgb8),
        1 => GrayImage::from_raw(w32, h32, bytes).map(DynamicImage::ImageLuma8),
        _ => {
            return Err(ReprogramError::config(format!(
                "cannot render a program with {c} channels (need 1 or 3)"
            ))
            .into())
        }
    };
    image.ok_or_else(|| anyhow::anyhow!("pixel buffer does not match {w}x{h}x{c}"))
}

/// [-1, 1] -> [0, 255], clipped.
fn to_byte(v: f32) -> u8 {
    if !v.is_finite() {
        return 0;
    }
    ((v + 1.0) * 127.5).clamp(0.0, 255.0) as u8
}

pub fn save_program_png(program: &Tensor, mask: Option<&Tensor>, path: &Path) -> Result<()> {
    let image = render_program(program, mask)?;
    ensure_parent(path)?;
    image
        .save(path)
        .with_context(|| format!("cannot write program image {}", path.display()))?;
    tracing::info!("[visualize] program image -> {}", path.display());
    Ok(())
}

/// Load a program checkpoint and write its activated program as a PNG.
pub fn extract_program(checkpoint: &Path, output: &Path, device: &Device) -> Result<ProgramCheckpoint> {
    let ckpt = ProgramCheckpoint::load(checkpoint, device)?;
    tracing::info!(
        "[visualize] checkpoint {} (epoch {}, {} recorded losses)",
        checkpoint.display(),
        ckpt.epoch,
        ckpt.loss_history.len()
    );
    save_program_png(&ckpt.program, Some(&ckpt.mask), output)?;
    Ok(ckpt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GenericImageView;

    #[test]
    fn test_byte_scaling_clips() {
        assert_eq!(to_byte(-1.0), 0);
        assert_eq!(to_byte(1.0), 255);
        assert_eq!(to_byte(0.0), 127);
        assert_eq!(to_byte(5.0), 255);
        assert_eq!(to_byte(-5.0), 0);
        assert_eq!(to_byte(f32::NAN), 0);
    }

    #[test]
    fn test_masked_region_is_mid_gray() -> Result<()> {
        let device = Device::Cpu;
        let program = Tensor::full(10f32, (3, 4, 4), &device)?;
        let mut m = vec![0f32; 48];
        for ch in 0..3 {
            m[ch * 16 + 5] = 1.0;
        }
        let mask = Tensor::from_vec(m, (3, 4, 4), &device)?;
        let img = render_program(&program, Some(&mask))?;
        assert_eq!(img.dimensions(), (4, 4));
        let rgb = img.to_rgb8();
        assert_eq!(rgb.get_pixel(1, 1).0, [127, 127, 127]);
        // tanh(10) rounds to 1.0 -> 255.
        assert_eq!(rgb.get_pixel(0, 0).0, [255, 255, 255]);
        Ok(())
    }

    #[test]
    fn test_channel_layout_is_interleaved() -> Result<()> {
        let device = Device::Cpu;
        // Channel 0 saturates high, channel 2 low.
        let mut v = vec![0f32; 3 * 2 * 2];
        v[..4].fill(20.0);
        v[8..].fill(-20.0);
        let program = Tensor::from_vec(v, (3, 2, 2), &device)?;
        let rgb = render_program(&program, None)?.to_rgb8();
        assert_eq!(rgb.get_pixel(1, 0).0, [255, 127, 0]);
        Ok(())
    }

    #[test]
    fn test_grayscale_and_bad_channels() -> Result<()> {
        let device = Device::Cpu;
        let gray = render_program(&Tensor::zeros((1, 3, 5), DType::F32, &device)?, None)?;
        assert_eq!(gray.dimensions(), (5, 3));
        assert!(matches!(gray, DynamicImage::ImageLuma8(_)));
        assert!(render_program(&Tensor::zeros((2, 3, 3), DType::F32, &device)?, None).is_err());
        Ok(())
    }

    #[test]
    fn test_extract_writes_png() -> Result<()> {
        let device = Device::Cpu;
        let dir = tempfile::tempdir()?;
        let ckpt_path = dir.path().join("run_epoch0002.safetensors");
        ProgramCheckpoint {
            program: Tensor::randn(0f32, 1.0, (3, 6, 6), &device)?,
            mask: Tensor::zeros((3, 6, 6), DType::F32, &device)?,
            epoch: 2,
            loss_history: vec![1.0, 0.5],
        }
        .save(&ckpt_path)?;

        let out = dir.path().join("img/program.png");
        let ckpt = extract_program(&ckpt_path, &out, &device)?;
        assert_eq!(ckpt.epoch, 2);
        let img = image::open(&out)?;
        assert_eq!(img.dimensions(), (6, 6));
        Ok(())
    }

    #[test]
    fn test_extract_missing_checkpoint_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = extract_program(
            &dir.path().join("nope.safetensors"),
            &dir.path().join("out.png"),
            &Device::Cpu,
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ReprogramError>(),
            Some(ReprogramError::Checkpoint { .. })
        ));
        assert!(!dir.path().join("out.png").exists());
    }
}
