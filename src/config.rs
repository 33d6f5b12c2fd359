use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{PrepareError, PrepareResult};
use crate::mask::MaskOptions;
use crate::sampler::PixelGrid;

/// Connection details of one imagery layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageLayer {
    pub wms_server_url: String,
    #[serde(default = "default_wms_version")]
    pub wms_version: String,
    pub wms_layernames: Vec<String>,
    #[serde(default)]
    pub wms_layerstyles: Vec<String>,
    #[serde(default)]
    pub image_pixels_ignore_border: u32,
}

fn default_wms_version() -> String {
    "1.3.0".to_string()
}

pub type ImageLayers = BTreeMap<String, ImageLayer>;

/// Read the image layer definitions from a JSON object keyed by layer name.
pub fn load_image_layers(path: &Path) -> PrepareResult<ImageLayers> {
    let file = File::open(path).map_err(|e| PrepareError::io(path, e))?;
    serde_json::from_reader(BufReader::new(file)).map_err(|source| PrepareError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Parameters of a dataset build.
#[derive(Debug, Clone)]
pub struct PrepareConfig {
    pub labellocations_path: PathBuf,
    pub labeldata_path: PathBuf,
    pub label_names_to_burn: Vec<String>,
    pub image_layers: ImageLayers,
    pub default_image_layer: String,
    pub training_dir: PathBuf,
    pub grid: PixelGrid,
    pub burn_value: u8,
    pub minimum_fraction_labeled: f64,
    pub force: bool,
}

impl PrepareConfig {
    pub fn mask_options(&self) -> MaskOptions {
        MaskOptions {
            burn_value: self.burn_value,
            minimum_fraction_labeled: self.minimum_fraction_labeled,
            force: self.force,
        }
    }

    /// Check settings that would otherwise only fail halfway a build.
    pub fn validate(&self) -> PrepareResult<()> {
        if !self.image_layers.contains_key(&self.default_image_layer) {
            return Err(PrepareError::UnknownImageLayer {
                name: self.default_image_layer.clone(),
            });
        }
        if self.grid.pixel_width == 0 || self.grid.pixel_height == 0 {
            return Err(PrepareError::InvalidConfig(
                "tile size in pixels must be positive".to_string(),
            ));
        }
        if !(self.grid.pixel_x_size > 0.0 && self.grid.pixel_y_size > 0.0) {
            return Err(PrepareError::InvalidConfig(
                "pixel size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Prepare versioned segmentation training datasets from vector labels and WMS imagery.
#[derive(Parser, Debug, Clone)]
#[command(version, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Build (or reuse) a dataset version from label locations and label data
    Prepare(PrepareArgs),
    /// Create masks for a directory of existing georeferenced images
    CreateMasks(CreateMasksArgs),
}

#[derive(Args, Debug, Clone)]
pub struct PrepareArgs {
    /// GeoJSON file with the label locations to sample tiles for
    #[arg(long = "labellocations")]
    pub labellocations_path: PathBuf,

    /// GeoJSON file with the label data to burn into the masks
    #[arg(long = "labeldata")]
    pub labeldata_path: PathBuf,

    /// Label names to burn into the masks
    #[arg(long = "label_names_to_burn", required = true, use_value_delimiter = true)]
    pub label_names_to_burn: Vec<String>,

    /// JSON file with the image layer definitions
    #[arg(long = "image_layers")]
    pub image_layers_path: PathBuf,

    /// Image layer used for locations without their own image_layer
    #[arg(long = "default_image_layer")]
    pub default_image_layer: String,

    /// Directory the dataset versions are written to
    #[arg(long = "training_dir")]
    pub training_dir: PathBuf,

    /// Pixel width in units of the CRS
    #[arg(long = "pixel_x_size", default_value_t = 0.25, value_parser = validate_positive)]
    pub pixel_x_size: f64,

    /// Pixel height in units of the CRS
    #[arg(long = "pixel_y_size", default_value_t = 0.25, value_parser = validate_positive)]
    pub pixel_y_size: f64,

    /// Tile width in pixels
    #[arg(long = "pixel_width", default_value_t = 512)]
    pub pixel_width: u32,

    /// Tile height in pixels
    #[arg(long = "pixel_height", default_value_t = 512)]
    pub pixel_height: u32,

    /// Value written to labeled mask pixels
    #[arg(long = "burn_value", default_value_t = 255)]
    pub burn_value: u8,

    /// Minimum fraction of labeled pixels for a mask to be written
    #[arg(long = "min_labeled_fraction", default_value_t = 0.0, value_parser = validate_fraction)]
    pub minimum_fraction_labeled: f64,

    /// Recreate masks that already exist
    #[arg(long = "force")]
    pub force: bool,
}

impl PrepareArgs {
    pub fn to_config(&self) -> PrepareResult<PrepareConfig> {
        let config = PrepareConfig {
            labellocations_path: self.labellocations_path.clone(),
            labeldata_path: self.labeldata_path.clone(),
            label_names_to_burn: self.label_names_to_burn.clone(),
            image_layers: load_image_layers(&self.image_layers_path)?,
            default_image_layer: self.default_image_layer.clone(),
            training_dir: self.training_dir.clone(),
            grid: PixelGrid {
                pixel_x_size: self.pixel_x_size,
                pixel_y_size: self.pixel_y_size,
                pixel_width: self.pixel_width,
                pixel_height: self.pixel_height,
            },
            burn_value: self.burn_value,
            minimum_fraction_labeled: self.minimum_fraction_labeled,
            force: self.force,
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Args, Debug, Clone)]
pub struct CreateMasksArgs {
    /// GeoJSON label file; features with burninmask = 1 are burned
    #[arg(long = "labels")]
    pub label_path: PathBuf,

    /// Directory with the georeferenced input images
    #[arg(long = "image_dir")]
    pub image_dir: PathBuf,

    /// Output base path; versions are written to <output_base>_<NN>
    #[arg(long = "output_base")]
    pub output_base: PathBuf,

    /// Extension of the input images
    #[arg(long = "image_ext", default_value = "tif")]
    pub image_extension: String,

    /// Value written to labeled mask pixels
    #[arg(long = "burn_value", default_value_t = 255)]
    pub burn_value: u8,

    /// Recreate masks that already exist
    #[arg(long = "force")]
    pub force: bool,
}

// Validate that a size is strictly positive
pub fn validate_positive(s: &str) -> Result<f64, String> {
    match f64::from_str(s) {
        Ok(val) if val > 0.0 && val.is_finite() => Ok(val),
        _ => Err("value must be a positive number".to_string()),
    }
}

// Validate that a fraction is between 0.0 and 1.0
pub fn validate_fraction(s: &str) -> Result<f64, String> {
    match f64::from_str(s) {
        Ok(val) if (0.0..=1.0).contains(&val) => Ok(val),
        _ => Err("FRACTION must be between 0.0 and 1.0".to_string()),
    }
}
