//! Embedding request payload and validation.
//!
//! Validation happens before admission: a rejected request never touches the
//! in-flight counters.

use crate::error::EmbeddingError;
use crate::extent::Extent;
use crate::prepare::{SourceImage, Tile, TiledImage};
use crate::store::ImageRecord;
use bytes::Bytes;
use serde::Deserialize;

/// Reference to one zoomify tile in a request.
#[derive(Debug, Clone, Deserialize)]
pub struct TileRef {
    pub group: u32,
    pub zoom: u32,
    /// Column index.
    pub x: u32,
    /// Row index.
    pub y: u32,
}

/// An embedding request for one image.
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingRequest {
    /// Requested viewport extent `[x, y, x2, y2]`.
    pub extent: [f64; 4],

    /// Embedding to exclude from the reuse lookup; set when refining an
    /// existing viewport.
    #[serde(default, rename = "excludeEmbeddingId")]
    pub exclude_embedding_id: Option<i64>,

    /// Tiles of the viewport's zoom level. Required for tiled images.
    #[serde(default)]
    pub tiles: Option<Vec<TileRef>>,

    /// Declared extent of the tiled image. Required for tiled images.
    #[serde(default, rename = "tiledImageExtent")]
    pub tiled_image_extent: Option<[f64; 4]>,

    /// Tile column count at the viewport's zoom level. Required for tiled
    /// images.
    #[serde(default)]
    pub columns: Option<u32>,
}

impl EmbeddingRequest {
    /// The requested extent.
    pub fn extent(&self) -> Extent {
        Extent::from_array(self.extent)
    }

    /// Validates the payload against the image it targets.
    pub fn validate(&self, image: &ImageRecord, target_size: u32) -> Result<(), EmbeddingError> {
        for coord in self.extent {
            if !coord.is_finite() || coord < 0.0 {
                return Err(EmbeddingError::Validation(format!(
                    "extent coordinates must be non-negative numbers, got {coord}"
                )));
            }
        }

        let extent = self.extent();
        let target = f64::from(target_size);
        if extent.width() < target || extent.height() < target {
            return Err(EmbeddingError::Validation(format!(
                "the extent's width and height need to be greater or equal than {target_size} pixel"
            )));
        }

        if let Some(id) = self.exclude_embedding_id {
            if id <= 0 {
                return Err(EmbeddingError::Validation(
                    "excludeEmbeddingId must be a positive integer".to_string(),
                ));
            }
        }

        if image.tiled {
            if self.tiles.as_ref().map_or(true, |t| t.is_empty()) {
                return Err(EmbeddingError::Validation(
                    "tiles are required for tiled images".to_string(),
                ));
            }
            if self.tiled_image_extent.is_none() {
                return Err(EmbeddingError::Validation(
                    "tiledImageExtent is required for tiled images".to_string(),
                ));
            }
            match self.columns {
                Some(columns) if columns >= 1 => {}
                _ => {
                    return Err(EmbeddingError::Validation(
                        "columns must be at least 1 for tiled images".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Builds the tiled source image from a validated request, pairing each
    /// tile reference with its fetched data.
    pub fn tiled_source(&self, tile_data: Vec<Bytes>) -> Result<SourceImage, EmbeddingError> {
        let refs = self
            .tiles
            .as_ref()
            .ok_or_else(|| EmbeddingError::Validation("tiles are required".to_string()))?;
        if refs.len() != tile_data.len() {
            return Err(EmbeddingError::Validation(format!(
                "got {} tile buffers for {} tile references",
                tile_data.len(),
                refs.len()
            )));
        }
        let extent = self
            .tiled_image_extent
            .map(Extent::from_array)
            .ok_or_else(|| {
                EmbeddingError::Validation("tiledImageExtent is required".to_string())
            })?;
        let columns = self
            .columns
            .ok_or_else(|| EmbeddingError::Validation("columns is required".to_string()))?;

        let tiles = refs
            .iter()
            .zip(tile_data)
            .map(|(r, data)| Tile {
                group: r.group,
                zoom: r.zoom,
                col: r.x,
                row: r.y,
                data,
            })
            .collect();

        Ok(SourceImage::Tiled(TiledImage {
            tiles,
            columns,
            extent,
        }))
    }
}
