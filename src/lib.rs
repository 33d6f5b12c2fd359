//! Versioned training dataset preparation for orthophoto segmentation
//!
//! This library samples non-overlapping tiles from vector label locations, fetches the
//! imagery for each tile and burns the labels into pixel-aligned masks. Every build is
//! staged in a `<NN>_BUSY` directory and only promoted to `<NN>` when it completes.

pub mod config;
pub mod dataset;
pub mod error;
pub mod fetch;
pub mod geofile;
pub mod legacy;
pub mod mask;
pub mod progress;
pub mod raster;
pub mod sampler;
pub mod staging;
pub mod types;
pub mod version;

// Re-export commonly used types and functions
pub use config::{Cli, Command, ImageLayer, ImageLayers, PrepareConfig};
pub use dataset::prepare_traindatasets;
pub use error::{PrepareError, PrepareResult};
pub use fetch::{GetMapRequest, ImageFetcher, WmsImageFetcher};
pub use mask::{create_mask, create_masks_for_images, MaskOptions, MaskOutcome};
pub use progress::{BuildObserver, NoopObserver, ProgressBarObserver};
pub use sampler::{AcceptedTiles, PixelGrid};
pub use types::{Bounds, Geometry, LabelDatum, LabelLocation, Split};
