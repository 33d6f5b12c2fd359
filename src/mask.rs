//! Mask rasterization: burning label polygons into single-band rasters that are
//! pixel-aligned with a reference image.

use glob::{glob, Pattern};
use log::{debug, info};
use std::path::{Path, PathBuf};

use crate::error::{PrepareError, PrepareResult};
use crate::geofile;
use crate::raster::{self, GeoTransform};
use crate::staging::{create_dir, StagingDir};
use crate::types::{Geometry, Ring};
use crate::version::{resolve_version, Resolution, VersionLayout};

/// Attribute flagging records of a label file that are burned into masks.
pub const BURN_FLAG_ATTRIBUTE: &str = "burninmask";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaskOptions {
    pub burn_value: u8,
    /// Minimum fraction of labeled pixels for a mask to be written.
    pub minimum_fraction_labeled: f64,
    /// Overwrite masks that already exist.
    pub force: bool,
}

impl Default for MaskOptions {
    fn default() -> Self {
        Self {
            burn_value: 255,
            minimum_fraction_labeled: 0.0,
            force: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MaskOutcome {
    /// The mask existed already and `force` was off.
    AlreadyExists,
    Written { fraction_labeled: f64 },
    BelowMinimum { fraction_labeled: f64 },
}

impl MaskOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, MaskOutcome::Written { .. })
    }
}

/// Burn `geometries` into a `width`×`height` grid described by `transform`.
///
/// A pixel gets `burn_value` when its centre lies inside a polygon; holes are
/// handled with the even-odd rule per polygon and polygons are unioned.
pub fn rasterize(
    geometries: &[&Geometry],
    transform: &GeoTransform,
    width: u32,
    height: u32,
    burn_value: u8,
) -> PrepareResult<Vec<u8>> {
    if !transform.is_north_up() {
        return Err(PrepareError::InvalidConfig(
            "rasterizing onto a rotated grid is not supported".to_string(),
        ));
    }
    let mut burned = vec![0u8; width as usize * height as usize];
    if width == 0 || height == 0 {
        return Ok(burned);
    }

    let mut crossings: Vec<f64> = Vec::new();
    for geometry in geometries {
        for rings in geometry.polygons() {
            let Some((row_start, row_end)) = row_range(rings, transform, height) else {
                continue;
            };
            for row in row_start..row_end {
                let (_, y) = transform.pixel_center(0.0, row as f64);
                crossings.clear();
                for ring in rings {
                    ring_crossings(ring, y, &mut crossings);
                }
                crossings.sort_by(|a, b| a.total_cmp(b));

                let row_offset = row * width as usize;
                for span in crossings.chunks_exact(2) {
                    let (start, end) = column_span(span[0], span[1], transform, width);
                    burned[row_offset + start..row_offset + end].fill(burn_value);
                }
            }
        }
    }
    Ok(burned)
}

// Rows whose centre may fall within the polygon's vertical extent.
fn row_range(rings: &[Ring], transform: &GeoTransform, height: u32) -> Option<(usize, usize)> {
    let (ymin, ymax) = rings
        .iter()
        .flat_map(|ring| ring.iter())
        .fold(None, |acc: Option<(f64, f64)>, p| match acc {
            None => Some((p.y, p.y)),
            Some((lo, hi)) => Some((lo.min(p.y), hi.max(p.y))),
        })?;

    // row = (y - center_y) / pixel_y_size, where pixel_y_size < 0 for north-up.
    let to_row = |y: f64| (y - transform.center_y) / transform.pixel_y_size;
    let (a, b) = (to_row(ymin), to_row(ymax));
    let (lo, hi) = if a < b { (a, b) } else { (b, a) };
    let start = lo.floor().max(0.0);
    let end = (hi.ceil() + 1.0).min(height as f64);
    if end <= start {
        return None;
    }
    Some((start as usize, end as usize))
}

// X coordinates where the ring's edges cross the horizontal line at `y`.
fn ring_crossings(ring: &Ring, y: f64, crossings: &mut Vec<f64>) {
    if ring.len() < 2 {
        return;
    }
    let mut prev = ring[ring.len() - 1];
    for &p in ring {
        if (prev.y > y) != (p.y > y) {
            crossings.push(prev.x + (y - prev.y) * (p.x - prev.x) / (p.y - prev.y));
        }
        prev = p;
    }
}

// Columns whose centre x lies in [x_start, x_end).
fn column_span(x_start: f64, x_end: f64, transform: &GeoTransform, width: u32) -> (usize, usize) {
    let to_col = |x: f64| ((x - transform.center_x) / transform.pixel_x_size).ceil();
    let clamp = |c: f64| c.max(0.0).min(width as f64) as usize;
    let (a, b) = (clamp(to_col(x_start)), clamp(to_col(x_end)));
    if a <= b {
        (a, b)
    } else {
        (b, b)
    }
}

/// Create the mask for `image_path` at `mask_path`, optionally copying the
/// image to `image_copy_path` when the mask is written.
pub fn create_mask(
    geometries: &[&Geometry],
    image_path: &Path,
    mask_path: &Path,
    image_copy_path: Option<&Path>,
    options: &MaskOptions,
) -> PrepareResult<MaskOutcome> {
    if !options.force && mask_path.exists() {
        debug!(
            "Output file already exists and force is false: {}",
            mask_path.display()
        );
        return Ok(MaskOutcome::AlreadyExists);
    }

    let image_profile = raster::read_profile(image_path)?;
    let mask_profile = image_profile.mask_profile(mask_path)?;
    let burned = rasterize(
        geometries,
        &mask_profile.transform,
        mask_profile.width,
        mask_profile.height,
        options.burn_value,
    )?;

    let nb_pixels = burned.len();
    let nb_labeled = burned.iter().filter(|&&v| v != 0).count();
    let fraction_labeled = if nb_pixels == 0 {
        0.0
    } else {
        nb_labeled as f64 / nb_pixels as f64
    };
    debug!(
        "nb_pixels: {}, nb_pixels_labeled: {}, fraction labeled: {}",
        nb_pixels, nb_labeled, fraction_labeled
    );

    if fraction_labeled < options.minimum_fraction_labeled {
        return Ok(MaskOutcome::BelowMinimum { fraction_labeled });
    }

    raster::write_single_band(mask_path, &mask_profile, &burned)?;
    if let Some(image_copy_path) = image_copy_path {
        raster::copy_with_sidecars(image_path, image_copy_path)?;
    }
    Ok(MaskOutcome::Written { fraction_labeled })
}

/// Parameters of [`create_masks_for_images`].
#[derive(Debug, Clone)]
pub struct MasksForImagesParams<'a> {
    /// Label file; records flagged with `burninmask` are burned.
    pub label_path: &'a Path,
    pub image_dir: &'a Path,
    /// Versions are written to `<output_base>_<NN>`.
    pub output_base: &'a Path,
    pub image_subdir: &'a str,
    pub mask_subdir: &'a str,
    pub image_extension: &'a str,
    pub options: MaskOptions,
}

/// Copy every image of a directory into a new dataset version and create a
/// mask beside each copy.
///
/// Returns the version directory and number; an existing version is returned
/// as-is when the label file didn't change.
pub fn create_masks_for_images(params: &MasksForImagesParams) -> PrepareResult<(PathBuf, u32)> {
    let missing: Vec<PathBuf> = [params.label_path, params.image_dir]
        .iter()
        .filter(|p| !p.exists())
        .map(|p| p.to_path_buf())
        .collect();
    if !missing.is_empty() {
        return Err(PrepareError::MissingInput { paths: missing });
    }

    let layout = VersionLayout::beside(params.output_base);
    let version = match resolve_version(&layout, None, &[params.label_path])? {
        Resolution::Reuse(existing) => return Ok((existing.dir, existing.version)),
        Resolution::Build { version } => version,
    };

    let staging = StagingDir::create(&layout, version)?;
    let image_dir = staging.path().join(params.image_subdir);
    let mask_dir = staging.path().join(params.mask_subdir);
    create_dir(&image_dir)?;
    create_dir(&mask_dir)?;
    staging.copy_inputs(&[params.label_path])?;

    let labels = geofile::read_file(params.label_path)?;
    let to_burn: Vec<&Geometry> = labels
        .features
        .iter()
        .filter(|feature| feature.flag_property(BURN_FLAG_ATTRIBUTE))
        .filter_map(|feature| feature.geometry.as_ref())
        .collect();

    let pattern = format!(
        "{}/*.{}",
        Pattern::escape(&params.image_dir.to_string_lossy()),
        params.image_extension
    );
    let image_paths: Vec<PathBuf> = glob(&pattern)
        .map_err(|e| PrepareError::InvalidConfig(format!("bad glob pattern {pattern}: {e}")))?
        .filter_map(|entry| entry.ok())
        .collect();
    info!("Process {} input images", image_paths.len());

    for input_image in image_paths {
        let Some(file_name) = input_image.file_name() else {
            continue;
        };
        let image_path = image_dir.join(file_name);
        raster::copy_with_sidecars(&input_image, &image_path)?;
        create_mask(
            &to_burn,
            &image_path,
            &mask_dir.join(file_name),
            None,
            &params.options,
        )?;
    }

    let final_dir = staging.promote()?;
    Ok((final_dir, version))
}
