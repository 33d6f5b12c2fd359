//! One-time migration of per-split legacy label files into the locations +
//! data schema.

use log::info;
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::error::PrepareResult;
use crate::geofile::{self, Feature, FeatureCollection};
use crate::mask::BURN_FLAG_ATTRIBUTE;
use crate::sampler::PixelGrid;
use crate::types::{Geometry, Split, IMAGE_LAYER_ATTRIBUTE, LABEL_NAME_ATTRIBUTE, SPLIT_ATTRIBUTE};

/// Legacy flag: the record's bounds are usable as a label location.
pub const USE_BOUNDS_ATTRIBUTE: &str = "usebounds";
/// Offset applied to converted location tiles, in CRS units.
pub const LEGACY_TILE_PADDING: f64 = 10.0;

const LEGACY_RENAMES: [(&str, &str); 2] = [("desc", "description"), ("image", IMAGE_LAYER_ATTRIBUTE)];

/// Legacy label tables, one per split.
#[derive(Debug, Clone)]
pub struct LegacyTables {
    pub train: FeatureCollection,
    pub validation: FeatureCollection,
    pub test: Option<FeatureCollection>,
}

/// Paths of the legacy files that sit beside `labellocations_path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyPaths {
    pub subject: String,
    pub train: PathBuf,
    pub validation: PathBuf,
    pub test: PathBuf,
}

impl LegacyPaths {
    /// `<dir>/<subject>_labellocations.<ext>` gives `<dir>/<subject>_trainlabels.<ext>` etc.
    pub fn beside(labellocations_path: &Path) -> Self {
        let dir = labellocations_path.parent().unwrap_or_else(|| Path::new(""));
        let file_name = labellocations_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let subject = file_name
            .split('_')
            .next()
            .unwrap_or_default()
            .split('.')
            .next()
            .unwrap_or_default()
            .to_string();
        let ext = labellocations_path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let path_for = |kind: &str| dir.join(format!("{}_{}labels{}", subject, kind, ext));

        Self {
            train: path_for("train"),
            validation: path_for("validation"),
            test: path_for("test"),
            subject,
        }
    }
}

/// Convert legacy tables into `(locations, data)`.
///
/// Every record is tagged with its split and labeled `subject`. Records flagged
/// `usebounds` become locations, their geometry replaced by the padded tile at
/// their lower-left corner; records flagged `burninmask` become data.
pub fn convert_tables(
    subject: &str,
    tables: LegacyTables,
    grid: &PixelGrid,
) -> (FeatureCollection, FeatureCollection) {
    let crs = tables.train.crs.clone();
    let tagged = [
        (Split::Train, Some(tables.train)),
        (Split::Validation, Some(tables.validation)),
        (Split::Test, tables.test),
    ];

    let mut locations = Vec::new();
    let mut data = Vec::new();
    for (split, table) in tagged {
        let Some(table) = table else {
            continue;
        };
        for mut feature in table.features {
            let props = &mut feature.properties;
            props.insert(SPLIT_ATTRIBUTE.to_string(), Value::from(split.as_str()));
            props
                .entry("image".to_string())
                .or_insert(Value::Null);
            props.insert(LABEL_NAME_ATTRIBUTE.to_string(), Value::from(subject));
            for (old, new) in LEGACY_RENAMES {
                if let Some(value) = props.remove(old) {
                    props.insert(new.to_string(), value);
                }
            }

            let use_bounds = feature.flag_property(USE_BOUNDS_ATTRIBUTE);
            let burn = feature.flag_property(BURN_FLAG_ATTRIBUTE);
            feature.properties.remove(USE_BOUNDS_ATTRIBUTE);
            feature.properties.remove(BURN_FLAG_ATTRIBUTE);

            if use_bounds {
                if let Some(bounds) = feature.geometry.as_ref().and_then(Geometry::bounds) {
                    let tile = grid.tile_for_padded(&bounds, LEGACY_TILE_PADDING);
                    let mut location = feature.clone();
                    location.geometry = Some(Geometry::from_bounds(&tile));
                    locations.push(location);
                }
            }
            if burn {
                let mut datum: Feature = feature;
                datum.properties.remove(SPLIT_ATTRIBUTE);
                data.push(datum);
            }
        }
    }

    (
        FeatureCollection::new(crs.clone(), locations),
        FeatureCollection::new(crs, data),
    )
}

/// Convert legacy files beside `labellocations_path` into the two current
/// files. Returns false when there is nothing to convert.
pub fn convert_legacy_files(
    labellocations_path: &Path,
    labeldata_path: &Path,
    grid: &PixelGrid,
) -> PrepareResult<bool> {
    let paths = LegacyPaths::beside(labellocations_path);
    if !paths.train.exists() || !paths.validation.exists() {
        return Ok(false);
    }

    info!(
        "Convert legacy label files for subject {} into {} and {}",
        paths.subject,
        labellocations_path.display(),
        labeldata_path.display()
    );
    let tables = LegacyTables {
        train: geofile::read_file(&paths.train)?,
        validation: geofile::read_file(&paths.validation)?,
        test: if paths.test.exists() {
            Some(geofile::read_file(&paths.test)?)
        } else {
            None
        },
    };
    let (locations, data) = convert_tables(&paths.subject, tables, grid);
    geofile::to_file(&locations, labellocations_path)?;
    geofile::to_file(&data, labeldata_path)?;
    Ok(true)
}
