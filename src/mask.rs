// Mask and canvas embedding.
//
// Both build_mask and embed place their content with center_offset, so the
// 1-region of the mask is exactly where embed writes image data.

use crate::error::ReprogramError;
use anyhow::Result;
use candle_core::{DType, Device, Tensor};

/// Offset of a centered `inner` span inside an `outer` span: floor((outer - inner) / 2).
pub fn center_offset(inner: usize, outer: usize) -> usize {
    (outer - inner) / 2
}

/// (channels, canvas, canvas) tensor, 1 inside the centered patch, 0 elsewhere.
pub fn build_mask(
    patch_size: usize,
    canvas_size: usize,
    channels: usize,
    device: &Device,
) -> Result<Tensor> {
    if patch_size == 0 || channels == 0 {
        return Err(ReprogramError::config(format!(
            "mask needs a non-empty patch, got patch_size={patch_size} channels={channels}"
        ))
        .into());
    }
    if patch_size > canvas_size {
        return Err(ReprogramError::config(format!(
            "patch_size {patch_size} exceeds canvas size {canvas_size}"
        ))
        .into());
    }
    let patch = Tensor::ones((channels, patch_size, patch_size), DType::F32, device)?;
    pad_centered(&patch, canvas_size)
}

/// Place an image in the center of a zero canvas.
///
/// Accepts a single image `(c, h, w)` or a batch `(b, c, h, w)`. A one-channel
/// image is repeated across `channels`; any other mismatch is an error.
pub fn embed(image: &Tensor, canvas_size: usize, channels: usize) -> Result<Tensor> {
    let dims = image.dims().to_vec();
    let (c, h, w) = match dims.as_slice() {
        [c, h, w] | [_, c, h, w] => (*c, *h, *w),
        _ => {
            return Err(ReprogramError::shape(vec![channels, canvas_size, canvas_size], dims).into())
        }
    };
    if h > canvas_size || w > canvas_size {
        return Err(ReprogramError::config(format!(
            "image {h}x{w} does not fit a {canvas_size}x{canvas_size} canvas"
        ))
        .into());
    }
    let image = if c == channels {
        image.clone()
    } else if c == 1 {
        let mut target = dims.clone();
        let n = target.len();
        target[n - 3] = channels;
        image.broadcast_as(target)?.contiguous()?
    } else {
        let mut expected = dims.clone();
        let n = expected.len();
        expected[n - 3] = channels;
        return Err(ReprogramError::shape(expected, dims).into());
    };
    pad_centered(&image, canvas_size)
}

fn pad_centered(t: &Tensor, canvas_size: usize) -> Result<Tensor> {
    let rank = t.rank();
    let (h, w) = (t.dim(rank - 2)?, t.dim(rank - 1)?);
    let top = center_offset(h, canvas_size);
    let left = center_offset(w, canvas_size);
    let t = t.pad_with_zeros(rank - 2, top, canvas_size - h - top)?;
    t.pad_with_zeros(rank - 1, left, canvas_size - w - left).map_err(Into::into)
}
