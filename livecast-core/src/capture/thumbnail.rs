//! Stream thumbnails from the encoder surface

use image::imageops::FilterType;
use image::{DynamicImage, RgbaImage};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

use crate::error::{LivecastError, Result};
use crate::types::VideoSurface;

/// Downscale `surface` by `scale` and write it as `thumb_<unix-millis>.jpg`
/// in `dir`
pub fn write_thumbnail(surface: &VideoSurface, dir: &Path, scale: u32) -> Result<PathBuf> {
    let scale = scale.max(1);
    let image = RgbaImage::from_raw(surface.width, surface.height, surface.data.clone())
        .ok_or_else(|| {
            LivecastError::encoder(format!(
                "Surface buffer does not hold {}x{} RGBA",
                surface.width, surface.height
            ))
        })?;

    let width = (surface.width / scale).max(1);
    let height = (surface.height / scale).max(1);
    let thumb = DynamicImage::ImageRgba8(image)
        .resize_exact(width, height, FilterType::Triangle)
        .to_rgb8();

    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let path = dir.join(format!("thumb_{}.jpg", millis));
    thumb.save(&path)?;

    debug!("Thumbnail {}x{} written to {:?}", width, height, path);
    Ok(path)
}
