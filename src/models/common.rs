// Common model utilities: device and precision selection

use anyhow::{Context, Result};
use candle_core::{DType, Device};

use crate::config::{DTypeChoice, DeviceChoice};

/// Resolve the requested device.
///
/// `Auto` tries CUDA (when compiled in), then Metal on macOS, then CPU. An
/// explicit `Cuda`/`Metal` choice that cannot be satisfied falls back to CPU
/// with a warning.
pub fn get_device(choice: DeviceChoice) -> Result<Device> {
    match choice {
        DeviceChoice::Cpu => Ok(Device::Cpu),
        DeviceChoice::Cuda => match Device::new_cuda(0) {
            Ok(device) => Ok(device),
            Err(e) => {
                tracing::warn!("CUDA unavailable ({}), falling back to CPU", e);
                Ok(Device::Cpu)
            }
        },
        DeviceChoice::Metal => match Device::new_metal(0) {
            Ok(device) => Ok(device),
            Err(e) => {
                tracing::warn!("Metal unavailable ({}), falling back to CPU", e);
                Ok(Device::Cpu)
            }
        },
        DeviceChoice::Auto => {
            let device = Device::cuda_if_available(0).context("Failed to probe CUDA device")?;
            if device.is_cuda() {
                return Ok(device);
            }

            #[cfg(target_os = "macos")]
            {
                if let Ok(device) = Device::new_metal(0) {
                    return Ok(device);
                }
            }

            Ok(Device::Cpu)
        }
    }
}

/// Resolve the requested precision for `device`; `Auto` is F16 on
/// accelerators and F32 on CPU
pub fn get_dtype(choice: DTypeChoice, device: &Device) -> DType {
    match choice {
        DTypeChoice::F32 => DType::F32,
        DTypeChoice::F16 => DType::F16,
        DTypeChoice::Bf16 => DType::BF16,
        DTypeChoice::Auto => {
            if device.is_cpu() {
                DType::F32
            } else {
                DType::F16
            }
        }
    }
}

/// Human-readable device name for logs and training metadata
pub fn device_label(device: &Device) -> &'static str {
    if device.is_cuda() {
        "cuda"
    } else if device.is_metal() {
        "metal"
    } else {
        "cpu"
    }
}
