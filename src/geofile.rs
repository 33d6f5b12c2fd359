//! Vector file I/O for label files stored as GeoJSON feature collections.

use log::{debug, warn};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{PrepareError, PrepareResult};
use crate::types::{
    Geometry, LabelDatum, LabelLocation, Split, IMAGE_LAYER_ATTRIBUTE, LABEL_NAME_ATTRIBUTE,
    SPLIT_ATTRIBUTE,
};

/// Named CRS member as written by most GIS tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Crs {
    #[serde(rename = "type")]
    pub kind: String,
    pub properties: CrsProperties,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrsProperties {
    pub name: String,
}

impl Crs {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            kind: "name".to_string(),
            properties: CrsProperties { name: name.into() },
        }
    }

    pub fn name(&self) -> &str {
        &self.properties.name
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    #[serde(rename = "type")]
    pub kind: String,
    pub geometry: Option<Geometry>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub properties: Map<String, Value>,
}

fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Map<String, Value>, D::Error> {
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}

impl Feature {
    pub fn new(geometry: Geometry, properties: Map<String, Value>) -> Self {
        Self {
            kind: "Feature".to_string(),
            geometry: Some(geometry),
            properties,
        }
    }

    pub fn str_property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }

    /// True for the integer/boolean flag conventions used by older label files.
    pub fn flag_property(&self, key: &str) -> bool {
        match self.properties.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64() == Some(1.0),
            Some(Value::String(s)) => s.trim() == "1",
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureCollection {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crs: Option<Crs>,
    pub features: Vec<Feature>,
}

impl FeatureCollection {
    pub fn new(crs: Option<Crs>, features: Vec<Feature>) -> Self {
        Self {
            kind: "FeatureCollection".to_string(),
            crs,
            features,
        }
    }

    pub fn crs_name(&self) -> Option<&str> {
        self.crs.as_ref().map(Crs::name)
    }

    /// Interpret the features as label locations.
    pub fn label_locations(&self) -> Vec<LabelLocation> {
        self.features
            .iter()
            .filter_map(|feature| {
                let geometry = feature.geometry.clone()?;
                let split = match feature.str_property(SPLIT_ATTRIBUTE) {
                    Some(value) => match value.parse::<Split>() {
                        Ok(split) => Some(split),
                        Err(e) => {
                            warn!("Label location is not sampled: {}", e);
                            None
                        }
                    },
                    None => {
                        warn!("Label location without {} is not sampled", SPLIT_ATTRIBUTE);
                        None
                    }
                };
                Some(LabelLocation {
                    geometry,
                    split,
                    image_layer: feature.str_property(IMAGE_LAYER_ATTRIBUTE).map(str::to_string),
                })
            })
            .collect()
    }

    /// Interpret the features as label data.
    pub fn label_data(&self) -> Vec<LabelDatum> {
        self.features
            .iter()
            .filter_map(|feature| {
                Some(LabelDatum {
                    geometry: feature.geometry.clone()?,
                    label_name: feature.str_property(LABEL_NAME_ATTRIBUTE).map(str::to_string),
                    properties: feature.properties.clone(),
                })
            })
            .collect()
    }
}

/// Read a GeoJSON feature collection.
pub fn read_file(path: &Path) -> PrepareResult<FeatureCollection> {
    debug!("Open vector file {}", path.display());
    let file = File::open(path).map_err(|e| PrepareError::io(path, e))?;
    serde_json::from_reader(BufReader::new(file)).map_err(|source| PrepareError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Write a feature collection, replacing any existing file.
pub fn to_file(collection: &FeatureCollection, path: &Path) -> PrepareResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| PrepareError::io(parent, e))?;
    }
    let mut writer = BufWriter::new(File::create(path).map_err(|e| PrepareError::io(path, e))?);
    serde_json::to_writer_pretty(&mut writer, collection).map_err(|source| PrepareError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    writer.flush().map_err(|e| PrepareError::io(path, e))
}

/// Copy a vector file into `dest_dir`, keeping its file name.
pub fn copy(src: &Path, dest_dir: &Path) -> PrepareResult<PathBuf> {
    let file_name = src
        .file_name()
        .ok_or_else(|| PrepareError::InvalidConfig(format!("not a file path: {}", src.display())))?;
    let dest = dest_dir.join(file_name);
    fs::copy(src, &dest).map_err(|e| PrepareError::io(src, e))?;
    Ok(dest)
}

/// Exact content comparison of two files.
pub fn cmp(a: &Path, b: &Path) -> PrepareResult<bool> {
    let len_a = fs::metadata(a).map_err(|e| PrepareError::io(a, e))?.len();
    let len_b = fs::metadata(b).map_err(|e| PrepareError::io(b, e))?.len();
    if len_a != len_b {
        return Ok(false);
    }

    let mut reader_a = BufReader::new(File::open(a).map_err(|e| PrepareError::io(a, e))?);
    let mut reader_b = BufReader::new(File::open(b).map_err(|e| PrepareError::io(b, e))?);
    let mut buf_a = [0u8; 8192];
    let mut buf_b = [0u8; 8192];
    loop {
        let n = read_full(&mut reader_a, &mut buf_a).map_err(|e| PrepareError::io(a, e))?;
        let m = read_full(&mut reader_b, &mut buf_b).map_err(|e| PrepareError::io(b, e))?;
        if n != m || buf_a[..n] != buf_b[..m] {
            return Ok(false);
        }
        if n == 0 {
            return Ok(true);
        }
    }
}

// Fill the buffer unless EOF comes first.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}
