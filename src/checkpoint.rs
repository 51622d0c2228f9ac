// Checkpointing (safetensors)
//
// Two kinds of files: a VarMap dump for classifier weights, and a program
// snapshot (program + mask + epoch + loss history) written during training
// and read back by the extraction step.

use crate::error::ReprogramError;
use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const KEY_PROGRAM: &str = "program";
const KEY_MASK: &str = "mask";
const KEY_EPOCH: &str = "epoch";
const KEY_LOSSES: &str = "loss_history";

// ---------------------------------------------------------------------------
// VarMap checkpoints
// ---------------------------------------------------------------------------

pub fn save_varmap(varmap: &VarMap, path: &Path) -> Result<()> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| anyhow::anyhow!("varmap lock poisoned"))?;
    let named: HashMap<String, Tensor> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
        .collect();
    drop(data);
    ensure_parent(path)?;
    candle_core::safetensors::save(&named, path)?;
    tracing::info!("saved {} params to {}", named.len(), path.display());
    Ok(())
}

/// Load every variable of `varmap` from `path`. Each one must be present in
/// the file with a matching shape.
pub fn load_varmap(varmap: &VarMap, path: &Path, device: &Device) -> Result<()> {
    let tensors = read_safetensors(path, device)?;
    let data = varmap
        .data()
        .lock()
        .map_err(|_| anyhow::anyhow!("varmap lock poisoned"))?;
    for (name, var) in data.iter() {
        let saved = tensors
            .get(name)
            .ok_or_else(|| ReprogramError::checkpoint(format!("missing tensor '{name}'"), path))?;
        if saved.dims() != var.as_tensor().dims() {
            return Err(ReprogramError::checkpoint(
                format!(
                    "tensor '{name}' has shape {:?}, expected {:?}",
                    saved.dims(),
                    var.as_tensor().dims()
                ),
                path,
            )
            .into());
        }
        var.set(&saved.to_dtype(var.as_tensor().dtype())?)?;
    }
    tracing::info!("loaded {} params from {}", data.len(), path.display());
    Ok(())
}

// ---------------------------------------------------------------------------
// Program snapshots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ProgramCheckpoint {
    pub program: Tensor,
    pub mask: Tensor,
    pub epoch: usize,
    pub loss_history: Vec<f32>,
}

/// `{save_path}_epoch{NNNN}.safetensors`
pub fn checkpoint_path(save_path: &Path, epoch: usize) -> PathBuf {
    let mut name = save_path.as_os_str().to_owned();
    name.push(format!("_epoch{epoch:04}.safetensors"));
    PathBuf::from(name)
}

impl ProgramCheckpoint {
    pub fn save(&self, path: &Path) -> Result<()> {
        let device = self.program.device();
        let mut named = HashMap::new();
        named.insert(KEY_PROGRAM.to_string(), self.program.to_dtype(DType::F32)?);
        named.insert(KEY_MASK.to_string(), self.mask.to_dtype(DType::F32)?);
        named.insert(
            KEY_EPOCH.to_string(),
            Tensor::new(&[self.epoch as u32], device)?,
        );
        if !self.loss_history.is_empty() {
            named.insert(
                KEY_LOSSES.to_string(),
                Tensor::from_slice(&self.loss_history, self.loss_history.len(), device)?,
            );
        }
        ensure_parent(path)?;
        candle_core::safetensors::save(&named, path)?;
        tracing::info!("[checkpoint] epoch {} -> {}", self.epoch, path.display());
        Ok(())
    }

    pub fn load(path: &Path, device: &Device) -> Result<Self> {
        let mut tensors = read_safetensors(path, device)?;
        let mut take = |key: &str| {
            tensors
                .remove(key)
                .ok_or_else(|| ReprogramError::checkpoint(format!("missing tensor '{key}'"), path))
        };
        let program = take(KEY_PROGRAM)?;
        let mask = take(KEY_MASK)?;
        let epoch = take(KEY_EPOCH)?.flatten_all()?.to_vec1::<u32>()?;
        let epoch = *epoch
            .first()
            .ok_or_else(|| ReprogramError::checkpoint("empty epoch tensor", path))? as usize;
        let loss_history = match take(KEY_LOSSES) {
            Ok(t) => t.to_vec1::<f32>()?,
            Err(_) => Vec::new(),
        };
        if program.rank() != 3 || program.dims() != mask.dims() {
            return Err(ReprogramError::checkpoint(
                format!(
                    "program {:?} and mask {:?} must share a (C, H, W) shape",
                    program.dims(),
                    mask.dims()
                ),
                path,
            )
            .into());
        }
        Ok(Self { program, mask, epoch, loss_history })
    }
}

fn read_safetensors(path: &Path, device: &Device) -> Result<HashMap<String, Tensor>> {
    if !path.exists() {
        return Err(ReprogramError::checkpoint("file not found", path).into());
    }
    candle_core::safetensors::load(path, device)
        .map_err(|e| ReprogramError::checkpoint(format!("cannot deserialize: {e}"), path).into())
}

pub(crate) fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
