//! Tile stitching for zoomify-tiled images.
//!
//! Assembles the tiles of one zoom level into a single raster before the
//! crop/resize stages. Tiles are 256px squares except at the right and
//! bottom edges, placed row-major by their row index.

use super::PrepareError;
use crate::extent::Extent;
use bytes::Bytes;
use image::imageops;
use image::RgbaImage;

/// Edge length in pixels of a full zoomify tile.
pub const TILE_SIZE: u32 = 256;

/// One zoomify tile of a tiled image.
#[derive(Debug, Clone)]
pub struct Tile {
    /// Tile group directory index.
    pub group: u32,
    /// Zoom level the tile belongs to.
    pub zoom: u32,
    /// Column index within the zoom level.
    pub col: u32,
    /// Row index within the zoom level.
    pub row: u32,
    /// Encoded tile data (JPEG).
    pub data: Bytes,
}

/// A tiled source image: the tiles of one zoom level plus the declared
/// extent of the tiled image in viewport coordinates.
#[derive(Debug, Clone)]
pub struct TiledImage {
    pub tiles: Vec<Tile>,
    /// Number of tile columns at this zoom level.
    pub columns: u32,
    /// Declared extent of the tiled image, `(0, height, width, 0)`.
    pub extent: Extent,
}

impl TiledImage {
    /// Assembles the tiles into a single RGBA raster.
    ///
    /// Canvas dimensions are derived from the column count and the highest
    /// row index; edge tiles smaller than 256px are placed clipped. A tile
    /// that cannot be decoded fails the stitch, a corrupt source must never
    /// silently produce a corrupt buffer.
    pub fn stitch(&self) -> Result<RgbaImage, PrepareError> {
        if self.tiles.is_empty() {
            return Err(PrepareError::Stitch("no tiles to stitch".to_string()));
        }
        if self.columns == 0 {
            return Err(PrepareError::Stitch("column count is zero".to_string()));
        }

        let rows = self
            .tiles
            .iter()
            .map(|t| t.row)
            .max()
            .expect("tiles checked non-empty")
            + 1;
        let mut canvas = RgbaImage::new(self.columns * TILE_SIZE, rows * TILE_SIZE);

        for tile in &self.tiles {
            if tile.col >= self.columns {
                return Err(PrepareError::Stitch(format!(
                    "tile column {} exceeds column count {}",
                    tile.col, self.columns
                )));
            }
            let raster = image::load_from_memory(&tile.data)
                .map_err(|e| {
                    PrepareError::Stitch(format!(
                        "failed to decode tile {}/{}-{}-{}: {}",
                        tile.group, tile.zoom, tile.col, tile.row, e
                    ))
                })?
                .to_rgba8();

            imageops::replace(
                &mut canvas,
                &raster,
                i64::from(tile.col * TILE_SIZE),
                i64::from(tile.row * TILE_SIZE),
            );
        }

        Ok(canvas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;

    fn tile_data(width: u32, height: u32, color: [u8; 3]) -> Bytes {
        let img = RgbaImage::from_pixel(width, height, Rgba([color[0], color[1], color[2], 255]));
        let mut out = Vec::new();
        DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        Bytes::from(out)
    }

    fn tile(col: u32, row: u32, color: [u8; 3]) -> Tile {
        Tile {
            group: 0,
            zoom: 2,
            col,
            row,
            data: tile_data(TILE_SIZE, TILE_SIZE, color),
        }
    }

    #[test]
    fn test_stitch_places_tiles_row_major() {
        let tiled = TiledImage {
            tiles: vec![
                tile(0, 0, [255, 0, 0]),
                tile(1, 0, [0, 255, 0]),
                tile(0, 1, [0, 0, 255]),
                tile(1, 1, [255, 255, 0]),
            ],
            columns: 2,
            extent: Extent::new(0.0, 512.0, 512.0, 0.0),
        };

        let canvas = tiled.stitch().unwrap();
        assert_eq!(canvas.width(), 512);
        assert_eq!(canvas.height(), 512);
        assert_eq!(canvas.get_pixel(0, 0)[0], 255);
        assert_eq!(canvas.get_pixel(256, 0)[1], 255);
        assert_eq!(canvas.get_pixel(0, 256)[2], 255);
        assert_eq!(*canvas.get_pixel(256, 256), Rgba([255, 255, 0, 255]));
    }

    #[test]
    fn test_stitch_clips_small_edge_tiles() {
        let mut edge = tile(1, 0, [0, 255, 0]);
        edge.data = tile_data(100, 256, [0, 255, 0]);

        let tiled = TiledImage {
            tiles: vec![tile(0, 0, [255, 0, 0]), edge],
            columns: 2,
            extent: Extent::new(0.0, 256.0, 356.0, 0.0),
        };

        let canvas = tiled.stitch().unwrap();
        assert_eq!(canvas.get_pixel(256, 0)[1], 255);
        // Past the edge tile's width the canvas stays empty.
        assert_eq!(*canvas.get_pixel(256 + 100, 0), Rgba([0, 0, 0, 0]));
    }

    #[test]
    fn test_stitch_rejects_empty_tile_list() {
        let tiled = TiledImage {
            tiles: vec![],
            columns: 2,
            extent: Extent::new(0.0, 512.0, 512.0, 0.0),
        };
        assert!(matches!(
            tiled.stitch().unwrap_err(),
            PrepareError::Stitch(_)
        ));
    }

    #[test]
    fn test_stitch_rejects_undecodable_tile() {
        let mut bad = tile(0, 0, [0, 0, 0]);
        bad.data = Bytes::from_static(b"garbage");

        let tiled = TiledImage {
            tiles: vec![bad],
            columns: 1,
            extent: Extent::new(0.0, 256.0, 256.0, 0.0),
        };
        let err = tiled.stitch().unwrap_err();
        assert!(err.to_string().contains("failed to decode tile"));
    }

    #[test]
    fn test_stitch_rejects_out_of_range_column() {
        let tiled = TiledImage {
            tiles: vec![tile(3, 0, [0, 0, 0])],
            columns: 2,
            extent: Extent::new(0.0, 256.0, 512.0, 0.0),
        };
        let err = tiled.stitch().unwrap_err();
        assert!(err.to_string().contains("exceeds column count"));
    }
}
