//! Center-crop post-processing. Pure: no I/O, no shared state.

use image::DynamicImage;

use crate::{Error, Result};

/// Portrait 2:3, the shape every generated image is delivered in.
pub const PORTRAIT_2_3: f64 = 2.0 / 3.0;

/// Absorbs representation error so that e.g. `900 * (2/3)` floors to 600.
const FLOOR_TOLERANCE: f64 = 1e-6;

/// Pixel rectangle `[left, left + width) x [top, top + height)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

impl CropRect {
    pub fn right(&self) -> u32 {
        self.left + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.top + self.height
    }
}

/// Largest centered rectangle with `width / height == target_ratio` that fits
/// in a `width x height` source.
///
/// The full source width is tried first; if the matching height does not fit,
/// the full source height is used instead. Sides are floored and never drop
/// below one pixel.
pub fn center_crop_rect(width: u32, height: u32, target_ratio: f64) -> Result<CropRect> {
    if !target_ratio.is_finite() || target_ratio <= 0.0 {
        return Err(Error::invalid_argument(format!(
            "crop ratio must be a positive number, got {target_ratio}"
        )));
    }
    if width == 0 || height == 0 {
        return Err(Error::invalid_argument(format!(
            "cannot crop an empty {width}x{height} image"
        )));
    }

    let mut crop_width = width as f64;
    let mut crop_height = floor(crop_width / target_ratio);
    if crop_height > height as f64 {
        crop_height = height as f64;
        crop_width = floor(crop_height * target_ratio);
    }
    let crop_width = (crop_width as u32).clamp(1, width);
    let crop_height = (crop_height as u32).clamp(1, height);

    Ok(CropRect {
        left: (width - crop_width) / 2,
        top: (height - crop_height) / 2,
        width: crop_width,
        height: crop_height,
    })
}

/// Crops `image` to the centered `target_ratio` rectangle.
pub fn center_crop(image: &DynamicImage, target_ratio: f64) -> Result<DynamicImage> {
    let rect = center_crop_rect(image.width(), image.height(), target_ratio)?;
    Ok(image.crop_imm(rect.left, rect.top, rect.width, rect.height))
}

fn floor(value: f64) -> f64 {
    (value + FLOOR_TOLERANCE).floor()
}
