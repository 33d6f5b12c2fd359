use log::{debug, info};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::config::PrepareConfig;
use crate::error::{PrepareError, PrepareResult};
use crate::fetch::{GetMapRequest, ImageFetcher, ImageFormat};
use crate::geofile;
use crate::legacy;
use crate::mask::{create_mask, MaskOptions, MaskOutcome};
use crate::progress::{BuildObserver, Throughput};
use crate::sampler::{AcceptedTiles, PixelGrid};
use crate::staging::StagingDir;
use crate::types::{Geometry, LabelLocation, Split, SplitDirs, SplitStats};
use crate::version::{resolve_version, Resolution, VersionLayout};

/// Prefix of version directories written by older releases.
pub const LEGACY_VERSION_PREFIX: &str = "train_";

/// Everything the tile loop of one split needs.
pub struct TileBuildContext<'a> {
    pub config: &'a PrepareConfig,
    pub crs: &'a str,
    pub burn_geometries: &'a [&'a Geometry],
    pub mask_options: MaskOptions,
    pub observer: &'a dyn BuildObserver,
}

/// Build (or reuse) the dataset version for the configured label files.
///
/// Returns the version directory and its number. A failure leaves the
/// `<NN>_BUSY` staging directory behind for inspection.
pub fn prepare_traindatasets<F: ImageFetcher>(
    config: &PrepareConfig,
    fetcher: &mut F,
    observer: &dyn BuildObserver,
) -> PrepareResult<(PathBuf, u32)> {
    config.validate()?;
    let locations_path = config.labellocations_path.as_path();
    let data_path = config.labeldata_path.as_path();
    ensure_inputs(locations_path, data_path, &config.grid)?;

    let inputs = [locations_path, data_path];
    let layout = VersionLayout::new(&config.training_dir);
    let legacy_layout = VersionLayout::with_prefix(&config.training_dir, LEGACY_VERSION_PREFIX);
    let version = match resolve_version(&layout, Some(&legacy_layout), &inputs)? {
        Resolution::Reuse(existing) => return Ok((existing.dir, existing.version)),
        Resolution::Build { version } => version,
    };

    let locations_collection = geofile::read_file(locations_path)?;
    let crs = locations_collection
        .crs_name()
        .ok_or_else(|| PrepareError::MissingCrs {
            path: locations_path.to_path_buf(),
        })?
        .to_string();
    let locations = locations_collection.label_locations();
    let data = geofile::read_file(data_path)?.label_data();
    let burn_geometries: Vec<&Geometry> = data
        .iter()
        .filter(|datum| {
            datum
                .label_name
                .as_ref()
                .is_some_and(|name| config.label_names_to_burn.contains(name))
        })
        .map(|datum| &datum.geometry)
        .collect();
    info!(
        "Preparing dataset version {} with {} label locations and {} labels to burn",
        version,
        locations.len(),
        burn_geometries.len()
    );

    let staging = StagingDir::create_for_splits(&layout, version, &Split::ALL)?;
    staging.copy_inputs(&inputs)?;

    let ctx = TileBuildContext {
        config,
        crs: &crs,
        burn_geometries: &burn_geometries,
        mask_options: config.mask_options(),
        observer,
    };
    for split in Split::ALL {
        let split_locations: Vec<&LabelLocation> = locations
            .iter()
            .filter(|location| location.split == Some(split))
            .collect();
        build_split(&ctx, split, &split_locations, &staging.split_dirs(split), fetcher)
            .map_err(|e| PrepareError::build(split, e))?;
    }

    let final_dir = staging.promote()?;
    Ok((final_dir, version))
}

// Make sure the current-schema inputs exist, converting legacy files if needed.
fn ensure_inputs(locations_path: &Path, data_path: &Path, grid: &PixelGrid) -> PrepareResult<()> {
    if locations_path.exists() && data_path.exists() {
        return Ok(());
    }
    if legacy::convert_legacy_files(locations_path, data_path, grid)? {
        return Ok(());
    }
    Err(PrepareError::MissingInput {
        paths: vec![locations_path.to_path_buf(), data_path.to_path_buf()],
    })
}

/// Sample, fetch and mask the tiles of one split.
pub fn build_split<F: ImageFetcher>(
    ctx: &TileBuildContext,
    split: Split,
    locations: &[&LabelLocation],
    dirs: &SplitDirs,
    fetcher: &mut F,
) -> PrepareResult<SplitStats> {
    let config = ctx.config;
    let todo = locations.len();
    info!(
        "Get images for {} {} labels in {}",
        todo,
        split,
        config.labellocations_path.display()
    );
    ctx.observer.split_started(split, todo);

    let mut stats = SplitStats {
        locations: todo,
        ..SplitStats::default()
    };
    let mut accepted = AcceptedTiles::new();
    let start_time = Instant::now();
    let mut nb_processed = 0;

    for (i, location) in locations.iter().enumerate() {
        if process_location(ctx, location, dirs, fetcher, &mut accepted, &mut stats)? {
            nb_processed += 1;
        }
        // Skipped locations still move the progress position.
        let throughput = Throughput::measure(nb_processed, i + 1, todo, start_time.elapsed());
        ctx.observer.location_processed(split, i + 1, throughput);
    }

    ctx.observer.split_finished(split, &stats);
    Ok(stats)
}

// Fetch and mask the tile of one location. Returns false when it was skipped.
fn process_location<F: ImageFetcher>(
    ctx: &TileBuildContext,
    location: &LabelLocation,
    dirs: &SplitDirs,
    fetcher: &mut F,
    accepted: &mut AcceptedTiles,
    stats: &mut SplitStats,
) -> PrepareResult<bool> {
    let config = ctx.config;
    let Some(bounds) = location.geometry.bounds() else {
        stats.skipped_empty_geometry += 1;
        return Ok(false);
    };
    let tile = config.grid.tile_for(&bounds);
    if !accepted.try_accept(tile) {
        debug!("Bounds overlap with already created image, skip: {}", tile);
        stats.skipped_overlap += 1;
        return Ok(false);
    }
    stats.accepted_tiles += 1;

    let layer_name = location
        .image_layer_override()
        .unwrap_or(config.default_image_layer.as_str());
    let layer = config
        .image_layers
        .get(layer_name)
        .ok_or_else(|| PrepareError::UnknownImageLayer {
            name: layer_name.to_string(),
        })?;
    let request = GetMapRequest {
        layers: layer.wms_layernames.clone(),
        styles: layer.wms_layerstyles.clone(),
        crs: ctx.crs.to_string(),
        bbox: tile,
        width: config.grid.pixel_width,
        height: config.grid.pixel_height,
        output_dir: dirs.image_dir.clone(),
        format: ImageFormat::Jpeg,
        pixels_ignore_border: layer.image_pixels_ignore_border,
        transparent: false,
    };

    // No path means the image was fetched by an earlier run.
    match fetcher.get_map(layer, &request)? {
        Some(image_path) => {
            stats.images_fetched += 1;
            let mask_path = mask_path_for(&image_path, dirs);
            match create_mask(
                ctx.burn_geometries,
                &image_path,
                &mask_path,
                None,
                &ctx.mask_options,
            )? {
                MaskOutcome::Written { .. } => stats.masks_written += 1,
                MaskOutcome::BelowMinimum { .. } => stats.masks_below_minimum += 1,
                MaskOutcome::AlreadyExists => {}
            }
        }
        None => stats.images_already_present += 1,
    }
    Ok(true)
}

/// The mask mirroring `image_path` in the mask directory.
pub fn mask_path_for(image_path: &Path, dirs: &SplitDirs) -> PathBuf {
    match image_path.file_name() {
        Some(file_name) => dirs.mask_dir.join(file_name),
        None => dirs.mask_dir.join(image_path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_path_mirrors_image_file_name() {
        let dirs = SplitDirs {
            image_dir: PathBuf::from("/t/01_BUSY/train/image"),
            mask_dir: PathBuf::from("/t/01_BUSY/train/mask"),
        };

        let mask = mask_path_for(Path::new("/t/01_BUSY/train/image/0_0_128_128_512_512.jpg"), &dirs);

        assert_eq!(mask, PathBuf::from("/t/01_BUSY/train/mask/0_0_128_128_512_512.jpg"));
    }
}
