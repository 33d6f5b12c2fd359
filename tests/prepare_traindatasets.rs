use serde_json::{json, Value};
use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use orthoseg_traindata::config::{ImageLayer, ImageLayers, PrepareConfig};
use orthoseg_traindata::mask::MasksForImagesParams;
use orthoseg_traindata::progress::Throughput;
use orthoseg_traindata::raster::{self, GeoTransform};
use orthoseg_traindata::types::SplitStats;
use orthoseg_traindata::{
    create_masks_for_images, prepare_traindatasets, BuildObserver, Bounds, GetMapRequest,
    ImageFetcher, MaskOptions, NoopObserver, PixelGrid, PrepareError, PrepareResult, Split,
};

const CRS: &str = "EPSG:31370";
const LAYER: &str = "BEFL-2019";

/// Writes a blank georeferenced tile for each request, like a WMS would.
#[derive(Default)]
struct ScriptedFetcher {
    requests: Vec<Bounds>,
    /// Index of the request that fails with a service exception.
    fail_on: Option<usize>,
    without_world_file: bool,
}

impl ImageFetcher for ScriptedFetcher {
    fn get_map(
        &mut self,
        _layer: &ImageLayer,
        request: &GetMapRequest,
    ) -> PrepareResult<Option<PathBuf>> {
        let output_path = request.output_path();
        if output_path.exists() {
            return Ok(None);
        }
        self.requests.push(request.bbox);
        if self.fail_on == Some(self.requests.len() - 1) {
            return Err(PrepareError::ServiceException {
                url: "https://example.org/wms".to_string(),
                body: "<ServiceException>layer not available</ServiceException>".to_string(),
            });
        }

        image::RgbImage::from_pixel(request.width, request.height, image::Rgb([90, 120, 60]))
            .save(&output_path)
            .unwrap();
        if !self.without_world_file {
            let transform = GeoTransform::from_bounds(&request.bbox, request.width, request.height);
            raster::write_georeference(&output_path, &transform, Some(&request.crs))?;
        }
        Ok(Some(output_path))
    }
}

#[derive(Default)]
struct RecordingObserver {
    positions: RefCell<Vec<(Split, usize)>>,
    finished: RefCell<Vec<(Split, SplitStats)>>,
}

impl BuildObserver for RecordingObserver {
    fn split_started(&self, _split: Split, _todo: usize) {}
    fn location_processed(&self, split: Split, position: usize, _throughput: Option<Throughput>) {
        self.positions.borrow_mut().push((split, position));
    }
    fn split_finished(&self, split: Split, stats: &SplitStats) {
        self.finished.borrow_mut().push((split, stats.clone()));
    }
}

fn square(xmin: f64, ymin: f64, xmax: f64, ymax: f64) -> Value {
    json!({
        "type": "Polygon",
        "coordinates": [[[xmin, ymin], [xmax, ymin], [xmax, ymax], [xmin, ymax], [xmin, ymin]]]
    })
}

fn collection(features: Vec<Value>, with_crs: bool) -> Value {
    let mut collection = json!({ "type": "FeatureCollection", "features": features });
    if with_crs {
        collection["crs"] = json!({ "type": "name", "properties": { "name": CRS } });
    }
    collection
}

fn location(geometry: Value, split: &str, image_layer: Option<&str>) -> Value {
    json!({
        "type": "Feature",
        "geometry": geometry,
        "properties": { "traindata_type": split, "image_layer": image_layer }
    })
}

fn label(geometry: Value, label_name: &str) -> Value {
    json!({
        "type": "Feature",
        "geometry": geometry,
        "properties": { "label_name": label_name }
    })
}

fn write_json(path: &Path, value: &Value) {
    fs::write(path, serde_json::to_string_pretty(value).unwrap()).unwrap();
}

fn write_default_inputs(config: &PrepareConfig) {
    let locations = collection(
        vec![
            location(square(0.0, 0.0, 100.0, 100.0), "train", None),
            // Snaps to (8, 8)-(136, 136), which overlaps the first tile.
            location(square(10.0, 10.0, 20.0, 20.0), "train", None),
            location(square(1000.0, 1000.0, 1050.0, 1050.0), "validation", Some(LAYER)),
        ],
        true,
    );
    let data = collection(
        vec![
            label(square(10.0, 10.0, 60.0, 60.0), "roof"),
            label(square(70.0, 70.0, 120.0, 120.0), "tree"),
        ],
        true,
    );
    write_json(&config.labellocations_path, &locations);
    write_json(&config.labeldata_path, &data);
}

fn test_config(dir: &TempDir) -> PrepareConfig {
    let label_dir = dir.path().join("labels");
    fs::create_dir_all(&label_dir).unwrap();
    let mut image_layers = ImageLayers::new();
    image_layers.insert(
        LAYER.to_string(),
        ImageLayer {
            wms_server_url: "https://example.org/wms".to_string(),
            wms_version: "1.3.0".to_string(),
            wms_layernames: vec!["ofw".to_string()],
            wms_layerstyles: vec!["default".to_string()],
            image_pixels_ignore_border: 0,
        },
    );

    PrepareConfig {
        labellocations_path: label_dir.join("roofs_labellocations.geojson"),
        labeldata_path: label_dir.join("roofs_labeldata.geojson"),
        label_names_to_burn: vec!["roof".to_string()],
        image_layers,
        default_image_layer: LAYER.to_string(),
        training_dir: dir.path().join("training"),
        grid: PixelGrid {
            pixel_x_size: 8.0,
            pixel_y_size: 8.0,
            pixel_width: 16,
            pixel_height: 16,
        },
        burn_value: 255,
        minimum_fraction_labeled: 0.0,
        force: false,
    }
}

fn files_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn test_first_build_creates_version_one() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    write_default_inputs(&config);
    let mut fetcher = ScriptedFetcher::default();

    let (output_dir, version) = prepare_traindatasets(&config, &mut fetcher, &NoopObserver).unwrap();

    assert_eq!(version, 1);
    assert_eq!(output_dir, config.training_dir.join("01"));
    assert!(!config.training_dir.join("01_BUSY").exists());
    assert_eq!(fetcher.requests.len(), 2);

    let train_image = output_dir.join("train/image/0_0_128_128_16_16.jpg");
    let train_mask = output_dir.join("train/mask/0_0_128_128_16_16.jpg");
    assert!(train_image.is_file());
    assert!(train_mask.is_file());
    assert!(output_dir
        .join("validation/mask/1000_1000_1128_1128_16_16.jpg")
        .is_file());
    assert!(files_in(&output_dir.join("test/image")).is_empty());

    // Input copies make the version self-describing.
    assert!(output_dir.join("roofs_labellocations.geojson").is_file());
    assert!(output_dir.join("roofs_labeldata.geojson").is_file());

    // Mask and image share the pixel grid.
    assert_eq!(
        raster::read_geotransform(&train_mask).unwrap(),
        raster::read_geotransform(&train_image).unwrap()
    );
    assert_eq!(raster::read_crs(&train_mask).unwrap().as_deref(), Some(CRS));

    // The roof covers the lower-left of the tile, the tree is not burned.
    let mask = image::open(&train_mask).unwrap().to_luma8();
    assert_eq!(mask.dimensions(), (16, 16));
    assert!(mask.get_pixel(4, 11)[0] > 128);
    assert!(mask.get_pixel(12, 4)[0] < 128);
    assert!(mask.get_pixel(15, 1)[0] < 128);
}

#[test]
fn test_overlapping_locations_are_skipped_per_split() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    write_default_inputs(&config);
    let observer = RecordingObserver::default();

    prepare_traindatasets(&config, &mut ScriptedFetcher::default(), &observer).unwrap();

    let finished = observer.finished.borrow();
    let splits: Vec<Split> = finished.iter().map(|(split, _)| *split).collect();
    assert_eq!(splits, vec![Split::Train, Split::Validation, Split::Test]);

    let train = &finished[0].1;
    assert_eq!(train.locations, 2);
    assert_eq!(train.accepted_tiles, 1);
    assert_eq!(train.skipped_overlap, 1);
    assert_eq!(train.masks_written, 1);
    assert_eq!(finished[2].1, SplitStats::default());

    // The skipped duplicate still advances the position.
    assert_eq!(
        *observer.positions.borrow(),
        vec![(Split::Train, 1), (Split::Train, 2), (Split::Validation, 1)]
    );
}

#[test]
fn test_unchanged_inputs_reuse_the_latest_version() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    write_default_inputs(&config);
    prepare_traindatasets(&config, &mut ScriptedFetcher::default(), &NoopObserver).unwrap();

    let mut fetcher = ScriptedFetcher::default();
    let (output_dir, version) = prepare_traindatasets(&config, &mut fetcher, &NoopObserver).unwrap();

    assert_eq!(version, 1);
    assert_eq!(output_dir, config.training_dir.join("01"));
    assert!(fetcher.requests.is_empty());
    assert!(!config.training_dir.join("02").exists());
}

#[test]
fn test_changed_input_builds_the_next_version() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    write_default_inputs(&config);
    prepare_traindatasets(&config, &mut ScriptedFetcher::default(), &NoopObserver).unwrap();

    // A single extra byte is enough to count as a change.
    let mut text = fs::read_to_string(&config.labeldata_path).unwrap();
    text.push('\n');
    fs::write(&config.labeldata_path, text).unwrap();
    let (output_dir, version) =
        prepare_traindatasets(&config, &mut ScriptedFetcher::default(), &NoopObserver).unwrap();

    assert_eq!(version, 2);
    assert_eq!(output_dir, config.training_dir.join("02"));
    assert!(config.training_dir.join("01").is_dir());
}

#[test]
fn test_failed_build_leaves_busy_dir_only() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    write_default_inputs(&config);
    let mut fetcher = ScriptedFetcher {
        fail_on: Some(0),
        ..ScriptedFetcher::default()
    };

    let err = prepare_traindatasets(&config, &mut fetcher, &NoopObserver).unwrap_err();

    match &err {
        PrepareError::Build { split, source } => {
            assert_eq!(*split, Split::Train);
            assert!(matches!(**source, PrepareError::ServiceException { .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.to_string(), "error preparing dataset (train split)");
    assert!(config.training_dir.join("01_BUSY").is_dir());
    assert!(!config.training_dir.join("01").exists());

    // The next run starts over in the same busy directory.
    let (output_dir, version) =
        prepare_traindatasets(&config, &mut ScriptedFetcher::default(), &NoopObserver).unwrap();
    assert_eq!(version, 1);
    assert!(output_dir.is_dir());
    assert!(!config.training_dir.join("01_BUSY").exists());
}

#[test]
fn test_failure_in_later_split_keeps_earlier_output_staged() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    write_default_inputs(&config);
    // The train tile is fetched first, the validation tile second.
    let mut fetcher = ScriptedFetcher {
        fail_on: Some(1),
        ..ScriptedFetcher::default()
    };

    let err = prepare_traindatasets(&config, &mut fetcher, &NoopObserver).unwrap_err();

    assert!(matches!(err, PrepareError::Build { split: Split::Validation, .. }));
    let busy = config.training_dir.join("01_BUSY");
    assert_eq!(
        files_in(&busy.join("train/image"))
            .into_iter()
            .filter(|name| name.ends_with(".jpg"))
            .collect::<Vec<_>>(),
        vec!["0_0_128_128_16_16.jpg".to_string()]
    );
    assert!(busy.join("train/mask/0_0_128_128_16_16.jpg").is_file());
    assert!(!config.training_dir.join("01").exists());
    assert_eq!(files_in(&config.training_dir), vec!["01_BUSY".to_string()]);
}

#[test]
fn test_mask_failure_aborts_the_build() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    write_default_inputs(&config);
    let mut fetcher = ScriptedFetcher {
        without_world_file: true,
        ..ScriptedFetcher::default()
    };

    let err = prepare_traindatasets(&config, &mut fetcher, &NoopObserver).unwrap_err();

    match err {
        PrepareError::Build { split, source } => {
            assert_eq!(split, Split::Train);
            assert!(matches!(*source, PrepareError::MissingWorldFile { .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
    let busy = config.training_dir.join("01_BUSY");
    assert!(busy.join("train/image/0_0_128_128_16_16.jpg").is_file());
    assert!(files_in(&busy.join("train/mask")).is_empty());
    assert!(!config.training_dir.join("01").exists());
}

#[test]
fn test_invalid_pixel_grid_is_rejected_before_fetching() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    write_default_inputs(&config);
    config.grid.pixel_x_size = 0.0;
    let mut fetcher = ScriptedFetcher::default();

    let err = prepare_traindatasets(&config, &mut fetcher, &NoopObserver).unwrap_err();

    assert!(matches!(err, PrepareError::InvalidConfig(_)));
    assert!(fetcher.requests.is_empty());
    assert!(!config.training_dir.exists());
}

#[test]
fn test_stale_busy_dir_is_recreated() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    write_default_inputs(&config);
    let stale = config.training_dir.join("01_BUSY");
    fs::create_dir_all(&stale).unwrap();
    fs::write(stale.join("leftover.txt"), "partial").unwrap();

    let (output_dir, _) =
        prepare_traindatasets(&config, &mut ScriptedFetcher::default(), &NoopObserver).unwrap();

    assert!(!output_dir.join("leftover.txt").exists());
}

#[test]
fn test_missing_inputs_are_reported() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    let err = prepare_traindatasets(&config, &mut ScriptedFetcher::default(), &NoopObserver)
        .unwrap_err();

    assert!(matches!(err, PrepareError::MissingInput { .. }));
    assert!(err.to_string().starts_with("stop: input file(s) don't exist"));
    assert!(!config.training_dir.exists());
}

#[test]
fn test_locations_without_crs_are_rejected() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    write_default_inputs(&config);
    let locations = collection(
        vec![location(square(0.0, 0.0, 100.0, 100.0), "train", None)],
        false,
    );
    write_json(&config.labellocations_path, &locations);

    let err = prepare_traindatasets(&config, &mut ScriptedFetcher::default(), &NoopObserver)
        .unwrap_err();

    assert!(matches!(err, PrepareError::MissingCrs { .. }));
}

#[test]
fn test_unknown_image_layer_fails_the_split() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    write_default_inputs(&config);
    let locations = collection(
        vec![location(square(0.0, 0.0, 100.0, 100.0), "validation", Some("BEFL-1971"))],
        true,
    );
    write_json(&config.labellocations_path, &locations);

    let err = prepare_traindatasets(&config, &mut ScriptedFetcher::default(), &NoopObserver)
        .unwrap_err();

    match err {
        PrepareError::Build { split, source } => {
            assert_eq!(split, Split::Validation);
            assert!(matches!(*source, PrepareError::UnknownImageLayer { ref name } if name == "BEFL-1971"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_legacy_version_dirs_continue_numbering() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    write_default_inputs(&config);
    fs::create_dir_all(config.training_dir.join("train_03")).unwrap();

    let (output_dir, version) =
        prepare_traindatasets(&config, &mut ScriptedFetcher::default(), &NoopObserver).unwrap();

    assert_eq!(version, 4);
    assert_eq!(output_dir, config.training_dir.join("04"));
}

#[test]
fn test_legacy_label_files_are_converted() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let label_dir = config.labellocations_path.parent().unwrap();
    let legacy = |geometry: Value| {
        json!({
            "type": "Feature",
            "geometry": geometry,
            "properties": { "usebounds": 1, "burninmask": 1, "image": null }
        })
    };
    write_json(
        &label_dir.join("roofs_trainlabels.geojson"),
        &collection(vec![legacy(square(200.0, 200.0, 250.0, 250.0))], true),
    );
    write_json(
        &label_dir.join("roofs_validationlabels.geojson"),
        &collection(vec![legacy(square(2000.0, 2000.0, 2050.0, 2050.0))], true),
    );

    let (output_dir, version) =
        prepare_traindatasets(&config, &mut ScriptedFetcher::default(), &NoopObserver).unwrap();

    assert_eq!(version, 1);
    assert!(config.labellocations_path.is_file());
    assert!(config.labeldata_path.is_file());
    // Converted tiles are padded by 10 units.
    assert_eq!(
        files_in(&output_dir.join("train/image"))
            .into_iter()
            .filter(|name| name.ends_with(".jpg"))
            .collect::<Vec<_>>(),
        vec!["190_190_318_318_16_16.jpg".to_string()]
    );
}

#[test]
fn test_create_masks_for_image_dir() {
    let dir = TempDir::new().unwrap();
    let image_dir = dir.path().join("images");
    fs::create_dir_all(&image_dir).unwrap();
    let image_path = image_dir.join("tile.png");
    image::RgbImage::from_pixel(16, 16, image::Rgb([10, 10, 10]))
        .save(&image_path)
        .unwrap();
    let transform = GeoTransform::from_bounds(&Bounds::new(0.0, 0.0, 128.0, 128.0), 16, 16);
    raster::write_georeference(&image_path, &transform, Some(CRS)).unwrap();

    let label_path = dir.path().join("roofs.geojson");
    write_json(
        &label_path,
        &collection(
            vec![
                json!({ "type": "Feature", "geometry": square(0.0, 0.0, 64.0, 128.0), "properties": { "burninmask": 1 } }),
                json!({ "type": "Feature", "geometry": square(64.0, 0.0, 128.0, 128.0), "properties": { "burninmask": 0 } }),
            ],
            true,
        ),
    );
    let output_base = dir.path().join("masks");
    let params = MasksForImagesParams {
        label_path: &label_path,
        image_dir: &image_dir,
        output_base: &output_base,
        image_subdir: "image",
        mask_subdir: "mask",
        image_extension: "png",
        options: MaskOptions::default(),
    };

    let (output_dir, version) = create_masks_for_images(&params).unwrap();

    assert_eq!(version, 1);
    assert_eq!(output_dir, dir.path().join("masks_01"));
    assert!(output_dir.join("image/tile.png").is_file());
    assert!(output_dir.join("image/tile.pgw").is_file());
    let mask = image::open(output_dir.join("mask/tile.png")).unwrap().to_luma8();
    assert_eq!(mask.get_pixel(0, 0)[0], 255);
    assert_eq!(mask.get_pixel(7, 15)[0], 255);
    assert_eq!(mask.get_pixel(8, 0)[0], 0);

    // Same labels: the existing version is returned.
    let (again, version) = create_masks_for_images(&params).unwrap();
    assert_eq!(version, 1);
    assert_eq!(again, output_dir);
}
