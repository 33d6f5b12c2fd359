//! Raster file I/O: georeferenced images described by a [`RasterProfile`],
//! georeferencing stored in world file and `.prj` sidecars.

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{ExtendedColorType, ImageDecoder, ImageEncoder, ImageReader};
use log::debug;
use std::fs::{self, File};
use std::io::{BufWriter, Seek, Write};
use std::path::{Path, PathBuf};
use tiff::encoder::compression::{Compression as TiffCompression, Deflate, Lzw, Uncompressed};
use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;

use crate::error::{PrepareError, PrepareResult};
use crate::types::Bounds;

/// JPEG quality used for single-band outputs.
const JPEG_QUALITY: u8 = 100;
/// GDAL's private TIFF tag holding the nodata value as ASCII.
const GDAL_NODATA_TAG: u16 = 42113;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RasterFormat {
    Jpeg,
    Png,
    Tiff,
}

impl RasterFormat {
    pub fn from_path(path: &Path) -> PrepareResult<Self> {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "jpg" | "jpeg" => Ok(RasterFormat::Jpeg),
            "png" => Ok(RasterFormat::Png),
            "tif" | "tiff" => Ok(RasterFormat::Tiff),
            _ => Err(PrepareError::UnsupportedRasterFormat {
                path: path.to_path_buf(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Lzw,
    Deflate,
}

/// Affine pixel-to-world transform in world file convention: the origin is the
/// centre of the upper-left pixel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform {
    pub pixel_x_size: f64,
    pub row_rotation: f64,
    pub col_rotation: f64,
    /// Negative for north-up rasters.
    pub pixel_y_size: f64,
    pub center_x: f64,
    pub center_y: f64,
}

impl GeoTransform {
    /// North-up transform mapping a `width`×`height` raster onto `bounds`.
    pub fn from_bounds(bounds: &Bounds, width: u32, height: u32) -> Self {
        let pixel_x_size = bounds.width() / width as f64;
        let pixel_y_size = -bounds.height() / height as f64;
        Self {
            pixel_x_size,
            row_rotation: 0.0,
            col_rotation: 0.0,
            pixel_y_size,
            center_x: bounds.xmin + pixel_x_size / 2.0,
            center_y: bounds.ymax + pixel_y_size / 2.0,
        }
    }

    pub fn is_north_up(&self) -> bool {
        self.row_rotation == 0.0 && self.col_rotation == 0.0
    }

    /// World coordinates of the centre of pixel (`col`, `row`).
    pub fn pixel_center(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.center_x + col * self.pixel_x_size + row * self.col_rotation,
            self.center_y + col * self.row_rotation + row * self.pixel_y_size,
        )
    }

    pub fn parse_world_file(path: &Path, text: &str) -> PrepareResult<Self> {
        let values = text
            .split_whitespace()
            .map(|token| token.parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| PrepareError::InvalidWorldFile {
                path: path.to_path_buf(),
                msg: e.to_string(),
            })?;
        match values.as_slice() {
            [a, d, b, e, c, f] => Ok(Self {
                pixel_x_size: *a,
                row_rotation: *d,
                col_rotation: *b,
                pixel_y_size: *e,
                center_x: *c,
                center_y: *f,
            }),
            _ => Err(PrepareError::InvalidWorldFile {
                path: path.to_path_buf(),
                msg: format!("expected 6 values, found {}", values.len()),
            }),
        }
    }

    pub fn to_world_file(&self) -> String {
        format!(
            "{}\n{}\n{}\n{}\n{}\n{}\n",
            self.pixel_x_size,
            self.row_rotation,
            self.col_rotation,
            self.pixel_y_size,
            self.center_x,
            self.center_y
        )
    }
}

/// Everything needed to write a raster aligned with another one.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterProfile {
    pub format: RasterFormat,
    pub width: u32,
    pub height: u32,
    pub count: u8,
    pub transform: GeoTransform,
    pub crs: Option<String>,
    pub nodata: Option<u8>,
    pub compress: Option<Compression>,
}

impl RasterProfile {
    /// Profile for a single-band 8-bit mask written to `mask_path`, keeping
    /// this profile's grid, transform and CRS.
    pub fn mask_profile(&self, mask_path: &Path) -> PrepareResult<RasterProfile> {
        let format = RasterFormat::from_path(mask_path)?;
        let mut profile = RasterProfile {
            format,
            count: 1,
            nodata: Some(0),
            compress: Some(Compression::Lzw),
            ..self.clone()
        };
        // Only TIFF has a place to record nodata.
        match format {
            RasterFormat::Tiff => {}
            RasterFormat::Png => {
                profile.compress = Some(Compression::Deflate);
                profile.nodata = None;
            }
            RasterFormat::Jpeg => {
                profile.compress = None;
                profile.nodata = None;
            }
        }
        Ok(profile)
    }
}

/// Sidecar world file path: `.jpg` → `.jgw`, `.png` → `.pgw`, `.tif` → `.tfw`.
pub fn world_file_path(path: &Path) -> PathBuf {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let chars: Vec<char> = ext.chars().collect();
    let world_ext = match chars.as_slice() {
        [first, _, last] => format!("{}{}w", first, last),
        _ if ext == "jpeg" => "jgw".to_string(),
        _ if ext == "tiff" => "tfw".to_string(),
        _ => format!("{}w", ext),
    };
    path.with_extension(world_ext)
}

pub fn crs_file_path(path: &Path) -> PathBuf {
    path.with_extension("prj")
}

pub fn read_geotransform(path: &Path) -> PrepareResult<GeoTransform> {
    let world_file = world_file_path(path);
    if !world_file.is_file() {
        return Err(PrepareError::MissingWorldFile {
            path: path.to_path_buf(),
        });
    }
    let text = fs::read_to_string(&world_file).map_err(|e| PrepareError::io(&world_file, e))?;
    GeoTransform::parse_world_file(&world_file, &text)
}

pub fn read_crs(path: &Path) -> PrepareResult<Option<String>> {
    let crs_file = crs_file_path(path);
    if !crs_file.is_file() {
        return Ok(None);
    }
    let text = fs::read_to_string(&crs_file).map_err(|e| PrepareError::io(&crs_file, e))?;
    Ok(Some(text.trim().to_string()).filter(|crs| !crs.is_empty()))
}

/// Write the world file and, when known, the CRS sidecar of `path`.
pub fn write_georeference(
    path: &Path,
    transform: &GeoTransform,
    crs: Option<&str>,
) -> PrepareResult<()> {
    let world_file = world_file_path(path);
    fs::write(&world_file, transform.to_world_file())
        .map_err(|e| PrepareError::io(&world_file, e))?;
    if let Some(crs) = crs {
        let crs_file = crs_file_path(path);
        fs::write(&crs_file, format!("{}\n", crs)).map_err(|e| PrepareError::io(&crs_file, e))?;
    }
    Ok(())
}

/// Read the profile of a georeferenced raster.
pub fn read_profile(path: &Path) -> PrepareResult<RasterProfile> {
    let format = RasterFormat::from_path(path)?;
    let decoder = ImageReader::open(path)
        .map_err(|e| PrepareError::io(path, e))?
        .with_guessed_format()
        .map_err(|e| PrepareError::io(path, e))?
        .into_decoder()
        .map_err(|e| PrepareError::image(path, e))?;
    let (width, height) = decoder.dimensions();
    let count = decoder.color_type().channel_count();

    Ok(RasterProfile {
        format,
        width,
        height,
        count,
        transform: read_geotransform(path)?,
        crs: read_crs(path)?,
        nodata: None,
        compress: None,
    })
}

/// Write a single-band 8-bit raster plus its georeferencing sidecars.
pub fn write_single_band(path: &Path, profile: &RasterProfile, data: &[u8]) -> PrepareResult<()> {
    let expected = profile.width as usize * profile.height as usize;
    if data.len() != expected || profile.count != 1 {
        return Err(PrepareError::InvalidConfig(format!(
            "raster data of {} pixels does not fit a {}x{}x{} profile",
            data.len(),
            profile.width,
            profile.height,
            profile.count
        )));
    }
    debug!("Write {}x{} raster to {}", profile.width, profile.height, path.display());

    match profile.format {
        RasterFormat::Png => {
            let file = File::create(path).map_err(|e| PrepareError::io(path, e))?;
            let mut writer = BufWriter::new(file);
            let compression = match profile.compress {
                Some(_) => CompressionType::Best,
                None => CompressionType::Default,
            };
            PngEncoder::new_with_quality(&mut writer, compression, FilterType::Adaptive)
                .write_image(data, profile.width, profile.height, ExtendedColorType::L8)
                .map_err(|e| PrepareError::image(path, e))?;
            writer.flush().map_err(|e| PrepareError::io(path, e))?;
        }
        RasterFormat::Jpeg => {
            let file = File::create(path).map_err(|e| PrepareError::io(path, e))?;
            let mut writer = BufWriter::new(file);
            JpegEncoder::new_with_quality(&mut writer, JPEG_QUALITY)
                .write_image(data, profile.width, profile.height, ExtendedColorType::L8)
                .map_err(|e| PrepareError::image(path, e))?;
            writer.flush().map_err(|e| PrepareError::io(path, e))?;
        }
        RasterFormat::Tiff => {
            let file = File::create(path).map_err(|e| PrepareError::io(path, e))?;
            let mut writer = BufWriter::new(file);
            match profile.compress {
                Some(Compression::Lzw) => write_tiff(&mut writer, profile, data, Lzw::default()),
                Some(Compression::Deflate) => {
                    write_tiff(&mut writer, profile, data, Deflate::default())
                }
                None => write_tiff(&mut writer, profile, data, Uncompressed::default()),
            }
            .map_err(|source| PrepareError::Tiff {
                path: path.to_path_buf(),
                source,
            })?;
            writer.flush().map_err(|e| PrepareError::io(path, e))?;
        }
    }

    write_georeference(path, &profile.transform, profile.crs.as_deref())
}

// Gray8 strips with the requested codec; nodata goes into the GDAL tag.
fn write_tiff<W: Write + Seek, D: TiffCompression>(
    writer: &mut W,
    profile: &RasterProfile,
    data: &[u8],
    compression: D,
) -> tiff::TiffResult<()> {
    let mut encoder = TiffEncoder::new(writer)?;
    let mut image = encoder.new_image_with_compression::<colortype::Gray8, D>(
        profile.width,
        profile.height,
        compression,
    )?;
    if let Some(nodata) = profile.nodata {
        image
            .encoder()
            .write_tag(Tag::Unknown(GDAL_NODATA_TAG), nodata.to_string().as_str())?;
    }
    image.write_data(data)
}

/// Copy a raster together with its georeferencing sidecars.
pub fn copy_with_sidecars(src: &Path, dest: &Path) -> PrepareResult<()> {
    fs::copy(src, dest).map_err(|e| PrepareError::io(src, e))?;
    for (src_sidecar, dest_sidecar) in [
        (world_file_path(src), world_file_path(dest)),
        (crs_file_path(src), crs_file_path(dest)),
    ] {
        if src_sidecar.is_file() {
            fs::copy(&src_sidecar, &dest_sidecar).map_err(|e| PrepareError::io(&src_sidecar, e))?;
        }
    }
    Ok(())
}
