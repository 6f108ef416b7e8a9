//! Viewport extents in image pixel coordinates.
//!
//! An extent is the axis-aligned rectangle `(x, y, x2, y2)` describing the
//! region of an image an embedding was (or should be) computed for. `(x, y)`
//! is the lower-left-ish corner and `(x2, y2)` the opposite corner. No
//! canonical ordering is enforced: source data produced from tiled coordinate
//! flips can carry `x > x2`, so width and height are always derived with
//! `abs`.

/// An axis-aligned rectangle in image pixel coordinates, float precision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extent {
    pub x: f64,
    pub y: f64,
    pub x2: f64,
    pub y2: f64,
}

impl Extent {
    /// Creates an extent from its four corner coordinates.
    pub fn new(x: f64, y: f64, x2: f64, y2: f64) -> Self {
        Self { x, y, x2, y2 }
    }

    /// Creates an extent from a `[x, y, x2, y2]` array as sent by clients.
    pub fn from_array(coords: [f64; 4]) -> Self {
        Self::new(coords[0], coords[1], coords[2], coords[3])
    }

    /// Returns the extent as a `[x, y, x2, y2]` array.
    pub fn to_array(&self) -> [f64; 4] {
        [self.x, self.y, self.x2, self.y2]
    }

    /// Width of the extent. Corners are unordered, hence the `abs`.
    #[inline]
    pub fn width(&self) -> f64 {
        (self.x2 - self.x).abs()
    }

    /// Height of the extent. Corners are unordered, hence the `abs`.
    #[inline]
    pub fn height(&self) -> f64 {
        (self.y2 - self.y).abs()
    }

    /// Center point of the extent.
    pub fn center(&self) -> (f64, f64) {
        ((self.x + self.x2) / 2.0, (self.y + self.y2) / 2.0)
    }

    /// Euclidean distance between the centers of two extents.
    pub fn center_distance(&self, other: &Extent) -> f64 {
        let (cx, cy) = self.center();
        let (ox, oy) = other.center();
        ((cx - ox).powi(2) + (cy - oy).powi(2)).sqrt()
    }

    /// Returns true if this extent exactly covers an image of the given
    /// dimensions, including the coordinate-flip convention: the full-image
    /// extent is `(0, height, width, 0)`.
    pub fn covers_image(&self, width: u32, height: u32) -> bool {
        self.x == 0.0 && self.y == f64::from(height) && self.x2 == f64::from(width) && self.y2 == 0.0
    }

    /// Returns true if the extent has a non-positive width or height and can
    /// therefore not be cropped to.
    pub fn is_degenerate(&self) -> bool {
        self.width() <= 0.0 || self.height() <= 0.0
    }

    /// Returns a copy of this extent with all coordinates multiplied by
    /// `factor`. Used to map a viewport extent into the coordinate space of a
    /// stitched tile raster.
    pub fn scaled(&self, factor: f64) -> Extent {
        Extent::new(
            self.x * factor,
            self.y * factor,
            self.x2 * factor,
            self.y2 * factor,
        )
    }
}

impl std::fmt::Display for Extent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}, {}, {}]", self.x, self.y, self.x2, self.y2)
    }
}
