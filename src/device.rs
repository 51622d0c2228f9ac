// Compute device selection.
//
// The device is chosen once at startup from the config and the resolved
// candle Device is passed by reference to every component.

use crate::error::ReprogramError;
use anyhow::Result;
use candle_core::Device;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ComputeDevice {
    #[default]
    Cpu,
    Cuda(usize),
}

impl ComputeDevice {
    /// Resolve to a candle device. Asking for CUDA in a build without the
    /// `cuda` feature, or on a machine without a GPU, is an error rather than a
    /// silent fallback to CPU.
    pub fn resolve(&self) -> Result<Device> {
        match *self {
            ComputeDevice::Cpu => Ok(Device::Cpu),
            ComputeDevice::Cuda(ordinal) => resolve_cuda(ordinal),
        }
    }
}

#[cfg(feature = "cuda")]
fn resolve_cuda(ordinal: usize) -> Result<Device> {
    if !candle_core::utils::cuda_is_available() {
        return Err(ReprogramError::Device("CUDA not available".into()).into());
    }
    let dev = Device::new_cuda(ordinal)
        .map_err(|e| ReprogramError::Device(format!("CUDA init failed for device {ordinal}: {e}")))?;
    tracing::info!("using CUDA device {ordinal}");
    Ok(dev)
}

#[cfg(not(feature = "cuda"))]
fn resolve_cuda(ordinal: usize) -> Result<Device> {
    Err(ReprogramError::Device(format!(
        "cuda:{ordinal} requested but built without CUDA (rebuild with --features cuda)"
    ))
    .into())
}

impl fmt::Display for ComputeDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComputeDevice::Cpu => write!(f, "cpu"),
            ComputeDevice::Cuda(n) => write!(f, "cuda:{n}"),
        }
    }
}

impl FromStr for ComputeDevice {
    type Err = ReprogramError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(ComputeDevice::Cpu),
            "cuda" | "gpu" => Ok(ComputeDevice::Cuda(0)),
            other => match other.strip_prefix("cuda:") {
                Some(n) => n
                    .parse()
                    .map(ComputeDevice::Cuda)
                    .map_err(|_| ReprogramError::config(format!("invalid CUDA ordinal in '{s}'"))),
                None => Err(ReprogramError::config(format!(
                    "unknown device '{s}' (expected cpu, cuda or cuda:N)"
                ))),
            },
        }
    }
}

impl TryFrom<String> for ComputeDevice {
    type Error = ReprogramError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ComputeDevice> for String {
    fn from(d: ComputeDevice) -> Self {
        d.to_string()
    }
}
