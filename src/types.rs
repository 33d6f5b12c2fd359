use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Attribute holding the split a label location belongs to.
pub const SPLIT_ATTRIBUTE: &str = "traindata_type";
/// Attribute holding the optional per-location image layer override.
pub const IMAGE_LAYER_ATTRIBUTE: &str = "image_layer";
/// Attribute holding the label name of a label datum.
pub const LABEL_NAME_ATTRIBUTE: &str = "label_name";

/// One partition of the label locations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Validation,
    Test,
}

impl Split {
    pub const ALL: [Split; 3] = [Split::Train, Split::Validation, Split::Test];

    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Validation => "validation",
            Split::Test => "test",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Split {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "train" => Ok(Split::Train),
            "validation" => Ok(Split::Validation),
            "test" => Ok(Split::Test),
            other => Err(format!("unknown split {other:?}")),
        }
    }
}

/// A coordinate pair in the units of the source CRS.
///
/// Extra ordinates (z, m) are accepted on input and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "[f64; 2]")]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

impl TryFrom<Vec<f64>> for Position {
    type Error = String;

    fn try_from(value: Vec<f64>) -> Result<Self, Self::Error> {
        match value.as_slice() {
            [x, y, ..] => Ok(Position { x: *x, y: *y }),
            _ => Err(format!("position needs at least 2 ordinates, got {}", value.len())),
        }
    }
}

impl From<Position> for [f64; 2] {
    fn from(p: Position) -> Self {
        [p.x, p.y]
    }
}

pub type Ring = Vec<Position>;

/// Areal geometries as they appear in the label files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "coordinates")]
pub enum Geometry {
    Polygon(Vec<Ring>),
    MultiPolygon(Vec<Vec<Ring>>),
}

impl Geometry {
    /// Closed rectangular polygon covering `bounds`.
    pub fn from_bounds(bounds: &Bounds) -> Self {
        let Bounds {
            xmin,
            ymin,
            xmax,
            ymax,
        } = *bounds;
        Geometry::Polygon(vec![vec![
            Position::new(xmin, ymin),
            Position::new(xmax, ymin),
            Position::new(xmax, ymax),
            Position::new(xmin, ymax),
            Position::new(xmin, ymin),
        ]])
    }

    /// Iterate over the polygons of this geometry as lists of rings.
    pub fn polygons(&self) -> Box<dyn Iterator<Item = &[Ring]> + '_> {
        match self {
            Geometry::Polygon(rings) => Box::new(std::iter::once(rings.as_slice())),
            Geometry::MultiPolygon(polygons) => Box::new(polygons.iter().map(|p| p.as_slice())),
        }
    }

    /// Bounds of all positions, `None` for an empty geometry.
    pub fn bounds(&self) -> Option<Bounds> {
        self.polygons()
            .flat_map(|rings| rings.iter())
            .flat_map(|ring| ring.iter())
            .fold(None, |acc: Option<Bounds>, p| match acc {
                None => Some(Bounds::new(p.x, p.y, p.x, p.y)),
                Some(b) => Some(Bounds::new(
                    b.xmin.min(p.x),
                    b.ymin.min(p.y),
                    b.xmax.max(p.x),
                    b.ymax.max(p.y),
                )),
            })
    }
}

/// Axis-aligned bounding box in CRS units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
}

impl Bounds {
    pub fn new(xmin: f64, ymin: f64, xmax: f64, ymax: f64) -> Self {
        Self {
            xmin,
            ymin,
            xmax,
            ymax,
        }
    }

    pub fn width(&self) -> f64 {
        self.xmax - self.xmin
    }

    pub fn height(&self) -> f64 {
        self.ymax - self.ymin
    }

    /// Closed-box intersection: boxes sharing only an edge or corner intersect.
    pub fn intersects(&self, other: &Bounds) -> bool {
        self.xmin <= other.xmax
            && other.xmin <= self.xmax
            && self.ymin <= other.ymax
            && other.ymin <= self.ymax
    }

    /// Grow the box by `dx`/`dy` on every side.
    pub fn buffered(&self, dx: f64, dy: f64) -> Bounds {
        Bounds::new(self.xmin - dx, self.ymin - dy, self.xmax + dx, self.ymax + dy)
    }
}

impl fmt::Display for Bounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {}, {})",
            self.xmin, self.ymin, self.xmax, self.ymax
        )
    }
}

/// Where to sample a tile.
#[derive(Debug, Clone)]
pub struct LabelLocation {
    pub geometry: Geometry,
    /// `None` when the source record carries an unrecognised split value.
    pub split: Option<Split>,
    pub image_layer: Option<String>,
}

impl LabelLocation {
    /// The image layer override, ignoring empty strings.
    pub fn image_layer_override(&self) -> Option<&str> {
        self.image_layer.as_deref().filter(|layer| !layer.is_empty())
    }
}

/// A labeled geometry that may be burned into masks.
#[derive(Debug, Clone)]
pub struct LabelDatum {
    pub geometry: Geometry,
    pub label_name: Option<String>,
    pub properties: serde_json::Map<String, serde_json::Value>,
}

/// A published (promoted) dataset version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetVersion {
    pub version: u32,
    pub dir: PathBuf,
}

/// Image and mask directories of one split in a dataset tree.
#[derive(Debug, Clone)]
pub struct SplitDirs {
    pub image_dir: PathBuf,
    pub mask_dir: PathBuf,
}

/// Counters for one split of a build.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SplitStats {
    pub locations: usize,
    pub accepted_tiles: usize,
    pub skipped_overlap: usize,
    pub skipped_empty_geometry: usize,
    pub images_fetched: usize,
    pub images_already_present: usize,
    pub masks_written: usize,
    pub masks_below_minimum: usize,
}

impl SplitStats {
    pub fn print_summary(&self, split: Split) {
        log::info!("=== {} split summary ===", split);
        log::info!("Label locations: {}", self.locations);
        log::info!("Accepted tiles: {}", self.accepted_tiles);
        log::info!("Skipped (overlap with accepted tile): {}", self.skipped_overlap);
        log::info!(
            "Images fetched: {}, already on disk: {}",
            self.images_fetched,
            self.images_already_present
        );
        log::info!(
            "Masks written: {}, below minimum labeled fraction: {}",
            self.masks_written,
            self.masks_below_minimum
        );
        if self.skipped_empty_geometry > 0 {
            log::warn!(
                "Skipped {} {} locations with an empty geometry",
                self.skipped_empty_geometry,
                split
            );
        }
    }
}
