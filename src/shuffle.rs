// Deterministic pixel shuffle.
//
// A ShufflePlan is a seeded permutation of the H*W grid, stored as a flat
// gather index: output pixel k (row-major) takes the channel vector of input
// pixel sources[k]. The same plan is applied to every image of the run, one
// index_select over the flattened spatial axis per call, whole batch at once.

use crate::error::ReprogramError;
use anyhow::Result;
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Seed of the reference shuffled-MNIST setup.
pub const DEFAULT_SHUFFLE_SEED: u64 = 23;

#[derive(Clone, Debug)]
pub struct ShufflePlan {
    seed: u64,
    height: usize,
    width: usize,
    sources: Vec<u32>,
    index: Tensor,
}

impl ShufflePlan {
    /// Enumerate the grid in row-major order and Fisher-Yates shuffle it with
    /// a StdRng keyed by `seed`. Same (seed, height, width) gives the same plan.
    pub fn new(seed: u64, height: usize, width: usize, device: &Device) -> Result<Self> {
        if height == 0 || width == 0 {
            return Err(ReprogramError::config(format!(
                "shuffle grid must be non-empty, got {height}x{width}"
            ))
            .into());
        }
        let n = height * width;
        anyhow::ensure!(n <= u32::MAX as usize, "shuffle grid {height}x{width} too large");

        let mut sources: Vec<u32> = (0..n as u32).collect();
        sources.shuffle(&mut StdRng::seed_from_u64(seed));
        let index = Tensor::from_slice(&sources, n, device)?;
        Ok(Self { seed, height, width, sources, index })
    }

    pub fn seed(&self) -> u64 { self.seed }
    pub fn height(&self) -> usize { self.height }
    pub fn width(&self) -> usize { self.width }

    /// Input coordinate whose pixel lands at output (row, col).
    pub fn source_of(&self, row: usize, col: usize) -> (usize, usize) {
        let s = self.sources[row * self.width + col] as usize;
        (s / self.width, s % self.width)
    }

    /// The plan that undoes this one: `inverse().apply(apply(x)) == x`.
    pub fn inverse(&self) -> Result<Self> {
        let mut inv = vec![0u32; self.sources.len()];
        for (dst, &src) in self.sources.iter().enumerate() {
            inv[src as usize] = dst as u32;
        }
        let index = Tensor::from_slice(&inv, inv.len(), self.index.device())?;
        Ok(Self {
            seed: self.seed,
            height: self.height,
            width: self.width,
            sources: inv,
            index,
        })
    }

    /// Shuffle a single (C, H, W) image.
    pub fn apply(&self, image: &Tensor) -> Result<Tensor> {
        let (c, h, w) = image.dims3()?;
        self.check_grid(h, w, image.dims())?;
        self.gather(image, c)
    }

    /// Shuffle every image of a (B, C, H, W) batch with one gather.
    pub fn apply_batch(&self, batch: &Tensor) -> Result<Tensor> {
        let (b, c, h, w) = batch.dims4()?;
        self.check_grid(h, w, batch.dims())?;
        self.gather(batch, b * c)
    }

    fn check_grid(&self, h: usize, w: usize, dims: &[usize]) -> Result<()> {
        if (h, w) != (self.height, self.width) {
            let mut expected = dims.to_vec();
            let n = expected.len();
            expected[n - 2] = self.height;
            expected[n - 1] = self.width;
            return Err(ReprogramError::shape(expected, dims.to_vec()).into());
        }
        Ok(())
    }

    fn gather(&self, t: &Tensor, rows: usize) -> Result<Tensor> {
        let index = if t.device().same_device(self.index.device()) {
            self.index.clone()
        } else {
            self.index.to_device(t.device())?
        };
        let flat = t.reshape((rows, self.height * self.width))?;
        let out = flat.index_select(&index, 1)?;
        out.reshape(t.dims()).map_err(Into::into)
    }
}
