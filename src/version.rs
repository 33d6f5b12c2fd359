//! Dataset version discovery and reuse detection.

use glob::{glob, Pattern};
use log::{debug, info};
use std::path::{Path, PathBuf};

use crate::error::{PrepareError, PrepareResult};
use crate::geofile;
use crate::types::DatasetVersion;

/// Suffix marking an in-progress (or failed) version directory.
pub const BUSY_SUFFIX: &str = "_BUSY";

/// Naming scheme of version directories: `<root>/<prefix><NN>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionLayout {
    root: PathBuf,
    prefix: String,
}

impl VersionLayout {
    /// Version directories named `NN` directly under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_prefix(root, "")
    }

    pub fn with_prefix(root: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            prefix: prefix.into(),
        }
    }

    /// Layout for `<base>_NN` directories beside `base`.
    pub fn beside(base: &Path) -> Self {
        let parent = base
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let name = base
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::with_prefix(parent, format!("{}_", name))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn version_dir(&self, version: u32) -> PathBuf {
        self.root.join(format!("{}{:02}", self.prefix, version))
    }

    pub fn busy_dir(&self, version: u32) -> PathBuf {
        self.root
            .join(format!("{}{:02}{}", self.prefix, version, BUSY_SUFFIX))
    }

    /// Parse a directory name into its version number.
    ///
    /// Only `<prefix>` followed by digits qualifies; busy or otherwise suffixed
    /// names are rejected.
    pub fn parse_version(&self, dir_name: &str) -> Option<u32> {
        let digits = dir_name.strip_prefix(self.prefix.as_str())?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }

    /// All published versions, oldest first. A missing root yields none.
    pub fn existing_versions(&self) -> PrepareResult<Vec<DatasetVersion>> {
        // A bare relative base has an empty parent: search the working directory.
        let search_root = if self.root.as_os_str().is_empty() {
            Path::new(".")
        } else {
            self.root.as_path()
        };
        if !search_root.is_dir() {
            return Ok(Vec::new());
        }
        let pattern = format!(
            "{}/{}[0-9]*",
            Pattern::escape(&search_root.to_string_lossy()),
            Pattern::escape(&self.prefix)
        );
        let entries = glob(&pattern)
            .map_err(|e| PrepareError::InvalidConfig(format!("bad glob pattern {pattern}: {e}")))?;

        let mut versions: Vec<DatasetVersion> = entries
            .filter_map(|entry| entry.ok())
            .filter(|path| path.is_dir())
            .filter_map(|dir| {
                let name = dir.file_name()?.to_str()?;
                let version = self.parse_version(name)?;
                let dir = self.root.join(name);
                Some(DatasetVersion { version, dir })
            })
            .collect();
        versions.sort_by_key(|v| v.version);
        Ok(versions)
    }

    pub fn most_recent(&self) -> PrepareResult<Option<DatasetVersion>> {
        Ok(self.existing_versions()?.pop())
    }
}

/// Outcome of resolving the version for a build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Inputs are unchanged since the most recent version: reuse it.
    Reuse(DatasetVersion),
    /// A new version must be built under this number.
    Build { version: u32 },
}

/// Decide whether the most recent version in `layout` can be reused for
/// `inputs`, or which number the next version gets.
///
/// When `layout` holds no versions, the optional `legacy` layout is consulted
/// only to continue its numbering.
pub fn resolve_version(
    layout: &VersionLayout,
    legacy: Option<&VersionLayout>,
    inputs: &[&Path],
) -> PrepareResult<Resolution> {
    let most_recent = match layout.most_recent()? {
        Some(most_recent) => most_recent,
        None => {
            let legacy_recent = match legacy {
                Some(legacy) => legacy.most_recent()?,
                None => None,
            };
            let version = legacy_recent.map_or(1, |v| v.version + 1);
            debug!("No dataset versions found in {}, next version {}", layout.root().display(), version);
            return Ok(Resolution::Build { version });
        }
    };

    debug!("Most recent dataset version: {}", most_recent.dir.display());
    if inputs_unchanged(&most_recent.dir, inputs)? {
        info!(
            "Input label files didn't change since version {}, so no need to recreate",
            most_recent.version
        );
        return Ok(Resolution::Reuse(most_recent));
    }

    Ok(Resolution::Build {
        version: most_recent.version + 1,
    })
}

// Every input has a byte-identical copy in `version_dir`.
fn inputs_unchanged(version_dir: &Path, inputs: &[&Path]) -> PrepareResult<bool> {
    for input in inputs {
        let Some(file_name) = input.file_name() else {
            return Ok(false);
        };
        let copy = version_dir.join(file_name);
        if !copy.is_file() || !geofile::cmp(input, &copy)? {
            return Ok(false);
        }
    }
    Ok(true)
}
