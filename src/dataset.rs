// Task dataset: MNIST IDX files (normalized), or a synthetic stand-in.
//
// Images are kept flat in memory as f32 (N * C * H * W) and batched into
// (B, C, H, W) tensors with u32 labels. The training split is reshuffled
// every epoch by the caller's RNG.

use crate::error::ReprogramError;
use anyhow::Result;
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::path::Path;

pub const MNIST_MEAN: f32 = 0.1307;
pub const MNIST_STD: f32 = 0.3081;
pub const MNIST_SIDE: usize = 28;
pub const MNIST_CLASSES: usize = 10;

const IDX_IMAGES_MAGIC: u32 = 0x0000_0803;
const IDX_LABELS_MAGIC: u32 = 0x0000_0801;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

impl Split {
    fn prefix(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Test => "t10k",
        }
    }
}

#[derive(Clone, Debug)]
pub struct TaskDataset {
    images: Vec<f32>,
    labels: Vec<u32>,
    channels: usize,
    height: usize,
    width: usize,
}

impl TaskDataset {
    pub fn new(
        images: Vec<f32>,
        labels: Vec<u32>,
        channels: usize,
        height: usize,
        width: usize,
    ) -> Result<Self> {
        let per = channels * height * width;
        anyhow::ensure!(per > 0, "empty image shape {channels}x{height}x{width}");
        anyhow::ensure!(
            images.len() == labels.len() * per,
            "{} pixels for {} labels of {channels}x{height}x{width}",
            images.len(),
            labels.len()
        );
        Ok(Self { images, labels, channels, height, width })
    }

    /// Load one MNIST split from `dir`, normalized with the usual mean/std.
    /// Accepts both `train-images-idx3-ubyte` and `train-images.idx3-ubyte`.
    pub fn mnist(dir: &Path, split: Split, limit: Option<usize>) -> Result<Self> {
        let p = split.prefix();
        let images = find_idx(dir, &format!("{p}-images"), "idx3-ubyte")?;
        let labels = find_idx(dir, &format!("{p}-labels"), "idx1-ubyte")?;
        Self::from_idx(&images, &labels, limit)
    }

    /// Whether both IDX files of `split` are present in `dir`.
    pub fn split_exists(dir: &Path, split: Split) -> bool {
        let p = split.prefix();
        find_idx(dir, &format!("{p}-images"), "idx3-ubyte").is_ok()
            && find_idx(dir, &format!("{p}-labels"), "idx1-ubyte").is_ok()
    }

    pub fn from_idx(images_path: &Path, labels_path: &Path, limit: Option<usize>) -> Result<Self> {
        let (raw, rows, cols) = read_idx_images(images_path, limit)?;
        let labels = read_idx_labels(labels_path, limit)?;
        let n = labels.len().min(raw.len() / (rows * cols));
        if n == 0 {
            return Err(ReprogramError::dataset("no samples", images_path).into());
        }
        let images = raw[..n * rows * cols]
            .iter()
            .map(|&b| (b as f32 / 255.0 - MNIST_MEAN) / MNIST_STD)
            .collect();
        tracing::info!("loaded {n} samples ({rows}x{cols}) from {}", images_path.display());
        Self::new(images, labels[..n].to_vec(), 1, rows, cols)
    }

    /// Deterministic grayscale dataset where class k lights every pixel whose
    /// row-major index is congruent to k, plus uniform noise.
    pub fn synthetic(n: usize, side: usize, num_classes: usize, seed: u64) -> Result<Self> {
        anyhow::ensure!(num_classes > 0, "synthetic dataset needs at least one class");
        let mut rng = StdRng::seed_from_u64(seed);
        let per = side * side;
        let mut images = Vec::with_capacity(n * per);
        let mut labels = Vec::with_capacity(n);
        for i in 0..n {
            let label = (i % num_classes) as u32;
            for p in 0..per {
                let on = if p % num_classes == label as usize { 1.0 } else { 0.0 };
                images.push(on + rng.gen_range(-0.1f32..0.1));
            }
            labels.push(label);
        }
        Self::new(images, labels, 1, side, side)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn channels(&self) -> usize { self.channels }
    pub fn height(&self) -> usize { self.height }
    pub fn width(&self) -> usize { self.width }

    pub fn labels(&self) -> &[u32] {
        &self.labels
    }

    pub fn num_classes(&self) -> usize {
        self.labels.iter().max().map_or(0, |&m| m as usize + 1)
    }

    /// Single image as (C, H, W).
    pub fn image(&self, index: usize, device: &Device) -> Result<Tensor> {
        let per = self.channels * self.height * self.width;
        anyhow::ensure!(index < self.len(), "index {index} out of range ({})", self.len());
        let data = &self.images[index * per..(index + 1) * per];
        Tensor::from_slice(data, (self.channels, self.height, self.width), device)
            .map_err(Into::into)
    }

    /// Mini-batches in order, or in an order drawn from `rng`. The last
    /// batch may be short.
    pub fn batches<'a>(
        &'a self,
        batch_size: usize,
        rng: Option<&mut StdRng>,
        device: &'a Device,
    ) -> Batches<'a> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        if let Some(rng) = rng {
            order.shuffle(rng);
        }
        Batches { dataset: self, order, batch_size: batch_size.max(1), pos: 0, device }
    }
}

pub struct Batches<'a> {
    dataset: &'a TaskDataset,
    order: Vec<usize>,
    batch_size: usize,
    pos: usize,
    device: &'a Device,
}

impl Batches<'_> {
    pub fn num_batches(&self) -> usize {
        self.order.len().div_ceil(self.batch_size)
    }
}

impl Iterator for Batches<'_> {
    type Item = Result<(Tensor, Tensor)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.order.len() {
            return None;
        }
        let end = (self.pos + self.batch_size).min(self.order.len());
        let idx = &self.order[self.pos..end];
        self.pos = end;

        let ds = self.dataset;
        let per = ds.channels * ds.height * ds.width;
        let mut pixels = Vec::with_capacity(idx.len() * per);
        let mut labels = Vec::with_capacity(idx.len());
        for &i in idx {
            pixels.extend_from_slice(&ds.images[i * per..(i + 1) * per]);
            labels.push(ds.labels[i]);
        }
        let b = idx.len();
        let batch = Tensor::from_vec(pixels, (b, ds.channels, ds.height, ds.width), self.device)
            .and_then(|x| Ok((x, Tensor::from_vec(labels, b, self.device)?)));
        Some(batch.map_err(Into::into))
    }
}

// ---------------------------------------------------------------------------
// IDX parsing
// ---------------------------------------------------------------------------

fn find_idx(dir: &Path, stem: &str, ext: &str) -> Result<std::path::PathBuf> {
    for name in [format!("{stem}-{ext}"), format!("{stem}.{ext}")] {
        let p = dir.join(name);
        if p.exists() {
            return Ok(p);
        }
    }
    Err(ReprogramError::dataset(format!("no {stem} {ext} file"), dir).into())
}

fn read_be_u32(data: &[u8], offset: &mut usize, path: &Path) -> Result<u32> {
    let bytes = data
        .get(*offset..*offset + 4)
        .ok_or_else(|| ReprogramError::dataset("truncated IDX header", path))?;
    *offset += 4;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| ReprogramError::dataset(format!("cannot read: {e}"), path).into())
}

/// Raw pixels of the first `limit` images, plus (rows, cols).
fn read_idx_images(path: &Path, limit: Option<usize>) -> Result<(Vec<u8>, usize, usize)> {
    let data = read_file(path)?;
    let mut offset = 0usize;
    let magic = read_be_u32(&data, &mut offset, path)?;
    if magic != IDX_IMAGES_MAGIC {
        return Err(ReprogramError::dataset(format!("bad image magic {magic:#010x}"), path).into());
    }
    let total = read_be_u32(&data, &mut offset, path)? as usize;
    let rows = read_be_u32(&data, &mut offset, path)? as usize;
    let cols = read_be_u32(&data, &mut offset, path)? as usize;
    if rows == 0 || cols == 0 {
        return Err(ReprogramError::dataset("zero-sized images", path).into());
    }
    let count = limit.map_or(total, |l| l.min(total));
    let bytes = count * rows * cols;
    let pixels = data
        .get(offset..offset + bytes)
        .ok_or_else(|| ReprogramError::dataset("image file is truncated", path))?;
    Ok((pixels.to_vec(), rows, cols))
}

fn read_idx_labels(path: &Path, limit: Option<usize>) -> Result<Vec<u32>> {
    let data = read_file(path)?;
    let mut offset = 0usize;
    let magic = read_be_u32(&data, &mut offset, path)?;
    if magic != IDX_LABELS_MAGIC {
        return Err(ReprogramError::dataset(format!("bad label magic {magic:#010x}"), path).into());
    }
    let total = read_be_u32(&data, &mut offset, path)? as usize;
    let count = limit.map_or(total, |l| l.min(total));
    let labels = data
        .get(offset..offset + count)
        .ok_or_else(|| ReprogramError::dataset("label file is truncated", path))?;
    Ok(labels.iter().map(|&b| b as u32).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn write_idx(dir: &Path, n: usize, side: usize) -> Result<()> {
        let mut img = Vec::new();
        img.extend_from_slice(&IDX_IMAGES_MAGIC.to_be_bytes());
        img.extend_from_slice(&(n as u32).to_be_bytes());
        img.extend_from_slice(&(side as u32).to_be_bytes());
        img.extend_from_slice(&(side as u32).to_be_bytes());
        for i in 0..n {
            img.extend(std::iter::repeat((i * 50) as u8).take(side * side));
        }
        std::fs::write(dir.join("train-images-idx3-ubyte"), img)?;

        let mut lbl = Vec::new();
        lbl.extend_from_slice(&IDX_LABELS_MAGIC.to_be_bytes());
        lbl.extend_from_slice(&(n as u32).to_be_bytes());
        lbl.extend((0..n).map(|i| (i % 10) as u8));
        std::fs::write(dir.join("train-labels.idx1-ubyte"), lbl)?;
        Ok(())
    }

    #[test]
    fn test_mnist_idx_loading_and_normalization() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_idx(dir.path(), 4, 3)?;
        let ds = TaskDataset::mnist(dir.path(), Split::Train, None)?;
        assert_eq!(ds.len(), 4);
        assert_eq!((ds.channels(), ds.height(), ds.width()), (1, 3, 3));
        assert_eq!(ds.labels(), &[0, 1, 2, 3]);

        let img = ds.image(0, &Device::Cpu)?.flatten_all()?.to_vec1::<f32>()?;
        assert_relative_eq!(img[0], -MNIST_MEAN / MNIST_STD, epsilon = 1e-6);
        let img = ds.image(1, &Device::Cpu)?.flatten_all()?.to_vec1::<f32>()?;
        assert_relative_eq!(img[0], (50.0 / 255.0 - MNIST_MEAN) / MNIST_STD, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn test_limit_truncates() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_idx(dir.path(), 5, 2)?;
        let ds = TaskDataset::mnist(dir.path(), Split::Train, Some(2))?;
        assert_eq!(ds.len(), 2);
        Ok(())
    }

    #[test]
    fn test_missing_split_is_dataset_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(!TaskDataset::split_exists(dir.path(), Split::Test));
        let err = TaskDataset::mnist(dir.path(), Split::Test, None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ReprogramError>(),
            Some(ReprogramError::Dataset { .. })
        ));
        write_idx(dir.path(), 2, 2)?;
        assert!(TaskDataset::split_exists(dir.path(), Split::Train));
        Ok(())
    }

    #[test]
    fn test_bad_magic_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_idx(dir.path(), 2, 2)?;
        let labels = dir.path().join("train-labels.idx1-ubyte");
        let images = dir.path().join("train-images-idx3-ubyte");
        assert!(TaskDataset::from_idx(&labels, &images, None).is_err());
        Ok(())
    }

    #[test]
    fn test_batches_cover_dataset() -> Result<()> {
        let ds = TaskDataset::synthetic(10, 4, 3, 1)?;
        let device = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(0);
        let batches = ds.batches(4, Some(&mut rng), &device);
        assert_eq!(batches.num_batches(), 3);

        let mut sizes = Vec::new();
        let mut label_sum = 0u32;
        for batch in batches {
            let (x, y) = batch?;
            assert_eq!(x.dims()[1..], [1, 4, 4]);
            sizes.push(x.dim(0)?);
            label_sum += y.to_vec1::<u32>()?.iter().sum::<u32>();
        }
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(label_sum, ds.labels().iter().sum::<u32>());
        Ok(())
    }

    #[test]
    fn test_synthetic_is_deterministic() -> Result<()> {
        let a = TaskDataset::synthetic(6, 5, 3, 9)?;
        let b = TaskDataset::synthetic(6, 5, 3, 9)?;
        let device = Device::Cpu;
        assert_eq!(
            a.image(4, &device)?.to_vec3::<f32>()?,
            b.image(4, &device)?.to_vec3::<f32>()?
        );
        assert_eq!(a.num_classes(), 3);
        Ok(())
    }
}
