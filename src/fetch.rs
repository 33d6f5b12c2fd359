//! Imagery fetching: the [`ImageFetcher`] seam used by the tile builder and a
//! blocking WMS GetMap implementation of it.

use image::codecs::jpeg::JpegEncoder;
use log::debug;
use reqwest::blocking::Client;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::ImageLayer;
use crate::error::{PrepareError, PrepareResult};
use crate::raster::{self, GeoTransform};
use crate::types::Bounds;

const JPEG_QUALITY: u8 = 95;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Jpeg,
    Png,
}

impl ImageFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Png => "image/png",
        }
    }

    /// Whether a response `Content-Type` carries this format.
    pub fn matches_content_type(&self, content_type: &str) -> bool {
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match self {
            ImageFormat::Jpeg => mime == "image/jpeg" || mime == "image/jpg",
            ImageFormat::Png => mime == "image/png",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Png => "png",
        }
    }
}

/// One image request for a tile.
#[derive(Debug, Clone, PartialEq)]
pub struct GetMapRequest {
    pub layers: Vec<String>,
    pub styles: Vec<String>,
    pub crs: String,
    pub bbox: Bounds,
    pub width: u32,
    pub height: u32,
    pub output_dir: PathBuf,
    pub format: ImageFormat,
    /// Pixels fetched around the tile and cut off again, to avoid border artifacts.
    pub pixels_ignore_border: u32,
    pub transparent: bool,
}

impl GetMapRequest {
    /// File the image of this request is written to.
    pub fn output_path(&self) -> PathBuf {
        self.output_dir.join(format!(
            "{:.0}_{:.0}_{:.0}_{:.0}_{}_{}.{}",
            self.bbox.xmin,
            self.bbox.ymin,
            self.bbox.xmax,
            self.bbox.ymax,
            self.width,
            self.height,
            self.format.extension()
        ))
    }
}

/// Source of georeferenced tile images.
pub trait ImageFetcher {
    /// Fetch the image for `request` into `request.output_dir`.
    ///
    /// Returns the new file, or `None` if the file already existed.
    fn get_map(&mut self, layer: &ImageLayer, request: &GetMapRequest)
        -> PrepareResult<Option<PathBuf>>;
}

/// Fetches tiles from an OGC WMS server.
pub struct WmsImageFetcher {
    client: Client,
}

impl WmsImageFetcher {
    pub fn new() -> PrepareResult<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|source| PrepareError::Http {
                url: String::new(),
                source,
            })?;
        Ok(Self { client })
    }

    /// Query parameters of the GetMap call, border pixels included.
    pub fn query_params(layer: &ImageLayer, request: &GetMapRequest) -> Vec<(String, String)> {
        let border = request.pixels_ignore_border;
        let (bbox, width, height) = if border > 0 {
            let dx = border as f64 * request.bbox.width() / request.width as f64;
            let dy = border as f64 * request.bbox.height() / request.height as f64;
            (
                request.bbox.buffered(dx, dy),
                request.width + 2 * border,
                request.height + 2 * border,
            )
        } else {
            (request.bbox, request.width, request.height)
        };
        let srs_key = if layer.wms_version.starts_with("1.3") {
            "CRS"
        } else {
            "SRS"
        };

        vec![
            ("SERVICE".to_string(), "WMS".to_string()),
            ("VERSION".to_string(), layer.wms_version.clone()),
            ("REQUEST".to_string(), "GetMap".to_string()),
            ("LAYERS".to_string(), request.layers.join(",")),
            ("STYLES".to_string(), request.styles.join(",")),
            (srs_key.to_string(), request.crs.clone()),
            (
                "BBOX".to_string(),
                format!("{},{},{},{}", bbox.xmin, bbox.ymin, bbox.xmax, bbox.ymax),
            ),
            ("WIDTH".to_string(), width.to_string()),
            ("HEIGHT".to_string(), height.to_string()),
            ("FORMAT".to_string(), request.format.mime_type().to_string()),
            (
                "TRANSPARENT".to_string(),
                if request.transparent { "TRUE" } else { "FALSE" }.to_string(),
            ),
        ]
    }

    // Response body and its content type.
    fn download(
        &self,
        layer: &ImageLayer,
        request: &GetMapRequest,
    ) -> PrepareResult<(Vec<u8>, String)> {
        let url = layer.wms_server_url.as_str();
        let http_err = |source: reqwest::Error| PrepareError::Http {
            url: url.to_string(),
            source,
        };
        let response = self
            .client
            .get(url)
            .query(&Self::query_params(layer, request))
            .send()
            .map_err(http_err)?
            .error_for_status()
            .map_err(http_err)?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let bytes = response.bytes().map_err(http_err)?;
        if content_type.contains("xml") || !content_type.starts_with("image/") {
            return Err(PrepareError::ServiceException {
                url: url.to_string(),
                body: String::from_utf8_lossy(&bytes).chars().take(500).collect(),
            });
        }
        Ok((bytes.to_vec(), content_type))
    }
}

impl ImageFetcher for WmsImageFetcher {
    fn get_map(
        &mut self,
        layer: &ImageLayer,
        request: &GetMapRequest,
    ) -> PrepareResult<Option<PathBuf>> {
        let output_path = request.output_path();
        if output_path.exists() {
            debug!("Image already exists, skip: {}", output_path.display());
            return Ok(None);
        }

        debug!("Get image for coordinates {}", request.bbox);
        let (bytes, content_type) = self.download(layer, request)?;
        let service_err = |body: String| PrepareError::ServiceException {
            url: layer.wms_server_url.clone(),
            body,
        };
        if request.pixels_ignore_border == 0 && request.format.matches_content_type(&content_type) {
            let size = image::ImageReader::new(Cursor::new(&bytes))
                .with_guessed_format()
                .map_err(|e| PrepareError::io(&output_path, e))?
                .into_dimensions()
                .map_err(|e| PrepareError::image(&output_path, e))?;
            if size != (request.width, request.height) {
                return Err(service_err(format!(
                    "expected a {}x{} image, got {}x{}",
                    request.width, request.height, size.0, size.1
                )));
            }
            fs::write(&output_path, &bytes).map_err(|e| PrepareError::io(&output_path, e))?;
        } else {
            let fetched =
                image::load_from_memory(&bytes).map_err(|e| PrepareError::image(&output_path, e))?;
            let tile = crop_to_request(fetched, request).map_err(service_err)?;
            write_image(&output_path, &tile, request.format)?;
        }

        let transform = GeoTransform::from_bounds(&request.bbox, request.width, request.height);
        raster::write_georeference(&output_path, &transform, Some(&request.crs))?;
        Ok(Some(output_path))
    }
}

/// Cut the ignored border off a fetched image. Errors with a description
/// when the server did not return the requested size.
pub fn crop_to_request(
    fetched: image::DynamicImage,
    request: &GetMapRequest,
) -> Result<image::DynamicImage, String> {
    let border = request.pixels_ignore_border;
    let expected = (request.width + 2 * border, request.height + 2 * border);
    let actual = (fetched.width(), fetched.height());
    if actual != expected {
        return Err(format!(
            "expected a {}x{} image, got {}x{}",
            expected.0, expected.1, actual.0, actual.1
        ));
    }
    if border == 0 {
        return Ok(fetched);
    }
    Ok(fetched.crop_imm(border, border, request.width, request.height))
}

fn write_image(path: &Path, img: &image::DynamicImage, format: ImageFormat) -> PrepareResult<()> {
    match format {
        ImageFormat::Jpeg => {
            let file = fs::File::create(path).map_err(|e| PrepareError::io(path, e))?;
            let mut writer = std::io::BufWriter::new(file);
            JpegEncoder::new_with_quality(&mut writer, JPEG_QUALITY)
                .encode_image(&img.to_rgb8())
                .map_err(|e| PrepareError::image(path, e))
        }
        ImageFormat::Png => img
            .save_with_format(path, image::ImageFormat::Png)
            .map_err(|e| PrepareError::image(path, e)),
    }
}
