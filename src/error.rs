//! Error taxonomy for dataset preparation.

use std::path::PathBuf;
use thiserror::Error;

use crate::types::Split;

pub type PrepareResult<T> = Result<T, PrepareError>;

#[derive(Debug, Error)]
pub enum PrepareError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("image error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("tiff error at {path}: {source}")]
    Tiff {
        path: PathBuf,
        #[source]
        source: tiff::TiffError,
    },
    #[error("http error for {url}: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("stop: input file(s) don't exist: {}", .paths.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(" and/or "))]
    MissingInput { paths: Vec<PathBuf> },
    #[error("no crs found in vector file {path}")]
    MissingCrs { path: PathBuf },
    #[error("image layer {name:?} is not configured")]
    UnknownImageLayer { name: String },
    #[error("no world file found for raster {path}")]
    MissingWorldFile { path: PathBuf },
    #[error("invalid world file {path}: {msg}")]
    InvalidWorldFile { path: PathBuf, msg: String },
    #[error("unsupported raster format for {path}")]
    UnsupportedRasterFormat { path: PathBuf },
    #[error("imagery service returned an exception for {url}: {body}")]
    ServiceException { url: String, body: String },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("error preparing dataset ({split} split)")]
    Build {
        split: Split,
        #[source]
        source: Box<PrepareError>,
    },
}

impl PrepareError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PrepareError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn image(path: impl Into<PathBuf>, source: image::ImageError) -> Self {
        PrepareError::Image {
            path: path.into(),
            source,
        }
    }

    /// Wrap a failure raised inside the tile loop of one split.
    pub fn build(split: Split, source: PrepareError) -> Self {
        PrepareError::Build {
            split,
            source: Box::new(source),
        }
    }
}
