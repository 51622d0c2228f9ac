// Gaussian smoothing of the initial program.
//
// Separable blur over the two spatial axes of a (C, H, W) tensor, each channel
// on its own, as two candle convolutions. Boundary handling is half-sample
// reflection (d c b a | a b c d) and the kernel is truncated at 4 sigma.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};

const TRUNCATE: f64 = 4.0;

/// Normalized 1D Gaussian kernel of radius round(4 * sigma), shape (2r + 1,).
pub fn gaussian_kernel(sigma: f64, device: &Device) -> Result<Tensor> {
    let radius = (TRUNCATE * sigma + 0.5) as i64;
    let x = Tensor::arange(-radius, radius + 1, device)?.to_dtype(DType::F32)?;
    let w = x.sqr()?.affine(-1.0 / (2.0 * sigma * sigma), 0.0)?.exp()?;
    w.broadcast_div(&w.sum_all()?).map_err(Into::into)
}

fn reflect(i: i64, n: usize) -> u32 {
    let n = n as i64;
    let period = 2 * n;
    let m = i.rem_euclid(period);
    (if m >= n { period - 1 - m } else { m }) as u32
}

/// Gather index that pads an axis of length `len` by `radius` on both sides.
fn reflect_index(len: usize, radius: usize, device: &Device) -> Result<Tensor> {
    let r = radius as i64;
    let idx: Vec<u32> = (-r..len as i64 + r).map(|i| reflect(i, len)).collect();
    let n = idx.len();
    Tensor::from_vec(idx, n, device).map_err(Into::into)
}

/// Blur every channel of a (C, H, W) tensor. `sigma <= 0` returns the input.
pub fn gaussian_blur(image: &Tensor, sigma: f64) -> Result<Tensor> {
    if sigma <= 0.0 {
        return Ok(image.clone());
    }
    let (_c, h, w) = image.dims3()?;
    let device = image.device();
    let kernel = gaussian_kernel(sigma, device)?;
    let k = kernel.dim(0)?;
    let radius = k / 2;

    // Channels become the batch axis: (C, 1, H, W).
    let x = image.to_dtype(DType::F32)?.unsqueeze(1)?;
    let x = x
        .index_select(&reflect_index(w, radius, device)?, 3)?
        .conv2d(&kernel.reshape((1, 1, 1, k))?, 0, 1, 1, 1)?;
    let x = x
        .index_select(&reflect_index(h, radius, device)?, 2)?
        .conv2d(&kernel.reshape((1, 1, k, 1))?, 0, 1, 1, 1)?;
    x.squeeze(1)?.to_dtype(image.dtype()).map_err(Into::into)
}
