//! Tile sampling: snapping label geometries to fixed-size, grid-aligned tiles
//! and keeping accepted tiles of a split free of overlap.

use crate::types::Bounds;

/// Pixel grid of the fetched imagery.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelGrid {
    /// Pixel size in CRS units.
    pub pixel_x_size: f64,
    pub pixel_y_size: f64,
    /// Tile size in pixels.
    pub pixel_width: u32,
    pub pixel_height: u32,
}

impl Default for PixelGrid {
    fn default() -> Self {
        Self {
            pixel_x_size: 0.25,
            pixel_y_size: 0.25,
            pixel_width: 512,
            pixel_height: 512,
        }
    }
}

impl PixelGrid {
    /// Tile width in CRS units.
    pub fn tile_width(&self) -> f64 {
        (self.pixel_width as f64 * self.pixel_x_size).abs()
    }

    /// Tile height in CRS units.
    pub fn tile_height(&self) -> f64 {
        (self.pixel_height as f64 * self.pixel_y_size).abs()
    }

    /// The tile anchored at the lower-left corner of `bounds`, snapped down to
    /// the pixel grid.
    ///
    /// Geometries larger than one tile only get their lower-left tile.
    pub fn tile_for(&self, bounds: &Bounds) -> Bounds {
        self.tile_for_padded(bounds, 0.0)
    }

    /// Like [`PixelGrid::tile_for`], with the snapped anchor shifted by `-padding`
    /// in both directions.
    pub fn tile_for_padded(&self, bounds: &Bounds, padding: f64) -> Bounds {
        let xmin = bounds.xmin - bounds.xmin.rem_euclid(self.pixel_x_size) - padding;
        let ymin = bounds.ymin - bounds.ymin.rem_euclid(self.pixel_y_size) - padding;
        Bounds::new(
            xmin,
            ymin,
            xmin + self.tile_width(),
            ymin + self.tile_height(),
        )
    }
}

/// Ordered registry of the tiles accepted so far within one split.
///
/// Lookups are a linear scan; fine for the thousands of locations a dataset has.
#[derive(Debug, Default, Clone)]
pub struct AcceptedTiles {
    tiles: Vec<Bounds>,
}

impl AcceptedTiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `candidate` intersects any accepted tile.
    pub fn is_covered(&self, candidate: &Bounds) -> bool {
        self.tiles.iter().any(|tile| tile.intersects(candidate))
    }

    /// Accept `candidate` unless it overlaps an accepted tile.
    pub fn try_accept(&mut self, candidate: Bounds) -> bool {
        if self.is_covered(&candidate) {
            return false;
        }
        self.tiles.push(candidate);
        true
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bounds> {
        self.tiles.iter()
    }
}
