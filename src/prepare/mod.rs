//! Image preparation pipeline.
//!
//! Produces the exact byte buffer the external model receives for a
//! requested viewport: decode (or tile-stitch), crop, resize to the model
//! input size, re-encode. All of it is CPU-bound and runs on the blocking
//! pool via [`prepare_buffer`].
//!
//! Whether an image is plain or tiled is hidden behind the [`SourceImage`]
//! enum; the workflow only ever calls [`SourceImage::prepare`].

mod stitch;

pub use stitch::{Tile, TiledImage, TILE_SIZE};

use crate::extent::Extent;
use bytes::Bytes;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;
use thiserror::Error;
use tracing::debug;

/// Errors from the image preparation pipeline.
#[derive(Debug, Error)]
pub enum PrepareError {
    /// The source image (or a tile) could not be decoded.
    #[error("failed to decode source image: {0}")]
    Decode(String),

    /// The crop rectangle has a non-positive width or height.
    #[error("degenerate crop extent {0}")]
    DegenerateCrop(Extent),

    /// The crop rectangle lies outside the image raster.
    #[error("crop extent {extent} outside image bounds {width}x{height}")]
    OutOfBounds {
        extent: Extent,
        width: u32,
        height: u32,
    },

    /// Tile stitching failed.
    #[error("tile stitch failed: {0}")]
    Stitch(String),

    /// Re-encoding the prepared raster failed.
    #[error("failed to encode prepared image: {0}")]
    Encode(String),

    /// The blocking preparation task panicked.
    #[error("preparation task failed: {0}")]
    TaskFailed(String),
}

/// Parameters of the preparation pipeline.
#[derive(Debug, Clone, Copy)]
pub struct PrepareConfig {
    /// Longest-edge size in pixels the model expects.
    pub target_size: u32,
    /// Lossy encode quality.
    pub quality: u8,
}

/// A source image to prepare a model input buffer from.
///
/// `Simple` carries the original encoded bytes; `Tiled` carries the zoomify
/// tiles of a tiled image together with its declared extent.
#[derive(Debug, Clone)]
pub enum SourceImage {
    Simple(Bytes),
    Tiled(TiledImage),
}

impl SourceImage {
    /// Returns true for tiled sources. Tiled stitches are too large for the
    /// interactive path and are always deferred by the workflow.
    pub fn is_tiled(&self) -> bool {
        matches!(self, SourceImage::Tiled(_))
    }

    /// Produces the byte buffer for the external model, cropped to
    /// `requested` and resized to the configured input size.
    pub fn prepare(&self, requested: Extent, config: &PrepareConfig) -> Result<Bytes, PrepareError> {
        match self {
            SourceImage::Simple(data) => prepare_simple(data, requested, config),
            SourceImage::Tiled(tiled) => prepare_tiled(tiled, requested, config),
        }
    }
}

/// Runs [`SourceImage::prepare`] on the blocking pool.
pub async fn prepare_buffer(
    source: SourceImage,
    requested: Extent,
    config: PrepareConfig,
) -> Result<Bytes, PrepareError> {
    tokio::task::spawn_blocking(move || source.prepare(requested, &config))
        .await
        .map_err(|e| PrepareError::TaskFailed(e.to_string()))?
}

fn prepare_simple(
    data: &Bytes,
    requested: Extent,
    config: &PrepareConfig,
) -> Result<Bytes, PrepareError> {
    let format = image::guess_format(data).map_err(|e| PrepareError::Decode(e.to_string()))?;
    // The image crate does not apply EXIF orientation on decode. That is
    // intentional here: embedded orientation metadata of source images is
    // unreliable and must be ignored.
    let mut raster =
        image::load_from_memory(data).map_err(|e| PrepareError::Decode(e.to_string()))?;

    if !requested.covers_image(raster.width(), raster.height()) {
        raster = crop(&raster, requested)?;
    }
    let raster = resize_to_target(raster, config.target_size);
    let encoded = encode(&raster, format, config.quality)?;

    debug!(
        format = ?format,
        width = raster.width(),
        height = raster.height(),
        size_bytes = encoded.len(),
        "prepared model input buffer"
    );
    Ok(encoded)
}

fn prepare_tiled(
    tiled: &TiledImage,
    requested: Extent,
    config: &PrepareConfig,
) -> Result<Bytes, PrepareError> {
    let canvas = tiled.stitch()?;
    let mut raster = DynamicImage::ImageRgba8(canvas);

    let declared_width = tiled.extent.width();
    let declared_height = tiled.extent.height();
    let full = requested.x == 0.0
        && requested.y == declared_height
        && requested.x2 == declared_width
        && requested.y2 == 0.0;

    if !full {
        // The stitched raster does not necessarily have the declared
        // dimensions of the tiled image; rescale the extent into raster
        // coordinates first.
        if declared_width <= 0.0 {
            return Err(PrepareError::Stitch(
                "tiled image extent has zero width".to_string(),
            ));
        }
        let ratio = f64::from(raster.width()) / declared_width;
        raster = crop(&raster, requested.scaled(ratio))?;
    }

    let raster = resize_to_target(raster, config.target_size);
    // Stitched rasters have no original encoding; tiles are lossy already.
    encode(&raster, ImageFormat::Jpeg, config.quality)
}

/// Crops a raster to an extent, failing fast on degenerate or out-of-bounds
/// rectangles instead of silently producing a corrupt buffer.
fn crop(raster: &DynamicImage, extent: Extent) -> Result<DynamicImage, PrepareError> {
    if extent.is_degenerate() {
        return Err(PrepareError::DegenerateCrop(extent));
    }

    let left = extent.x.min(extent.x2).max(0.0).round() as u32;
    let top = extent.y.min(extent.y2).max(0.0).round() as u32;
    let width = extent.width().round() as u32;
    let height = extent.height().round() as u32;

    if left >= raster.width() || top >= raster.height() || width == 0 || height == 0 {
        return Err(PrepareError::OutOfBounds {
            extent,
            width: raster.width(),
            height: raster.height(),
        });
    }

    let width = width.min(raster.width() - left);
    let height = height.min(raster.height() - top);
    Ok(raster.crop_imm(left, top, width, height))
}

/// Resizes so the longest edge equals `target_size`, preserving aspect ratio
/// and rounding the short edge down. A raster whose longest edge already
/// matches is returned untouched.
fn resize_to_target(raster: DynamicImage, target_size: u32) -> DynamicImage {
    let longest = raster.width().max(raster.height());
    if longest == target_size {
        return raster;
    }

    let factor = f64::from(target_size) / f64::from(longest);
    let width = if raster.width() == longest {
        target_size
    } else {
        ((f64::from(raster.width()) * factor).floor() as u32).max(1)
    };
    let height = if raster.height() == longest {
        target_size
    } else {
        ((f64::from(raster.height()) * factor).floor() as u32).max(1)
    };

    raster.resize_exact(width, height, FilterType::Triangle)
}

/// Re-encodes the prepared raster in the source image's format. Re-encoding
/// drops all metadata. Formats without an encoder fall back to JPEG.
fn encode(raster: &DynamicImage, format: ImageFormat, quality: u8) -> Result<Bytes, PrepareError> {
    let mut out = Vec::new();
    match format {
        ImageFormat::Png => {
            raster
                .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
                .map_err(|e| PrepareError::Encode(e.to_string()))?;
        }
        _ => {
            let mut cursor = Cursor::new(&mut out);
            let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut cursor, quality);
            raster
                .to_rgb8()
                .write_with_encoder(encoder)
                .map_err(|e| PrepareError::Encode(e.to_string()))?;
        }
    }
    Ok(Bytes::from(out))
}
