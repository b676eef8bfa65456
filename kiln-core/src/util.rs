use anyhow::Result;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{Device, Tensor};
use image::DynamicImage;
use serde::Serialize;
use tracing::{info, warn};

use crate::DeviceMap;

/// Coarse label for the device a model is bound to.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionDevice {
    Cpu,
    Cuda,
    Metal,
}

serde_plain::derive_display_from_serialize!(ExecutionDevice);

impl From<&Device> for ExecutionDevice {
    fn from(device: &Device) -> Self {
        if device.is_cuda() {
            Self::Cuda
        } else if device.is_metal() {
            Self::Metal
        } else {
            Self::Cpu
        }
    }
}

pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    let device = match device_map {
        DeviceMap::ForceCpu => Device::Cpu,
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Device::new_cuda(ordinal)?,
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Device::new_metal(ordinal)?,
        DeviceMap::Ordinal(_) => {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            warn!("no accelerator available, running on CPU; build with `--features metal` to use the GPU");
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            warn!("no accelerator available, running on CPU; build with `--features cuda` to use the GPU");
            Device::Cpu
        }
    };
    info!(requested = %device_map, selected = %ExecutionDevice::from(&device), "selected execution device");
    Ok(device)
}

/// Converts a tensor with shape (3, height, width) into an RGB image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels, got {channels}");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| anyhow::anyhow!("error converting tensor to image buffer"))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}
