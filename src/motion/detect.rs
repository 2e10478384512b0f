//! Frame comparison for motion detection.
//!
//! Frames are decoded, shrunk to a fixed width and compared on a sparse
//! grid of sample points rather than pixel by pixel.

use anyhow::{Context, Result};
use image::{imageops::FilterType, RgbImage};

/// Width of the downsampled frame used for comparison.
pub const ANALYSIS_WIDTH: u32 = 200;

/// Decode a JPEG and scale it to [`ANALYSIS_WIDTH`], keeping aspect ratio.
pub fn downsample(jpeg: &[u8]) -> Result<RgbImage> {
    let decoded = image::load_from_memory_with_format(jpeg, image::ImageFormat::Jpeg)
        .context("failed to decode frame")?;
    let (width, height) = (decoded.width(), decoded.height());
    if width == 0 || height == 0 {
        anyhow::bail!("frame has no pixels");
    }
    let scaled_height = ((u64::from(height) * u64::from(ANALYSIS_WIDTH)) / u64::from(width)).max(1);
    let scaled_height = u32::try_from(scaled_height).context("scaled frame too tall")?;
    Ok(decoded
        .resize_exact(ANALYSIS_WIDTH, scaled_height, FilterType::Triangle)
        .to_rgb8())
}

/// Channel-wise colour distance on a 0-100 scale.
pub fn compare_colors(a: [u8; 3], b: [u8; 3]) -> f64 {
    let delta: u32 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| u32::from(x.abs_diff(*y)))
        .sum();
    100.0 * f64::from(delta) / (256.0 * 3.0)
}

/// Percentage of grid samples whose colour moved more than
/// `ignore_percentage` between `previous` and `current`.
///
/// Returns `None` when the frames differ in size.
pub fn changed_percentage(
    previous: &RgbImage,
    current: &RgbImage,
    ignore_percentage: f64,
) -> Option<f64> {
    if previous.dimensions() != current.dimensions() {
        return None;
    }
    let (width, height) = current.dimensions();
    let step = (height / 10).max(1);
    let first = step / 2;

    let mut changed = 0u32;
    let mut total = 0u32;
    for y in (first..height).step_by(step as usize) {
        for x in (first..width).step_by(step as usize) {
            let diff = compare_colors(previous.get_pixel(x, y).0, current.get_pixel(x, y).0);
            if diff > ignore_percentage {
                changed += 1;
            }
            total += 1;
        }
    }
    if total == 0 {
        return Some(0.0);
    }
    Some(f64::from(changed) / f64::from(total) * 100.0)
}
