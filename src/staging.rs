//! Staging of a new dataset version under a BUSY-suffixed directory and its
//! promotion to the final version name.

use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{PrepareError, PrepareResult};
use crate::geofile;
use crate::types::{Split, SplitDirs};
use crate::version::VersionLayout;

pub const IMAGE_SUBDIR: &str = "image";
pub const MASK_SUBDIR: &str = "mask";

/// An in-progress dataset version.
///
/// Dropping a staging directory without promoting it leaves it on disk for
/// inspection; the next build for the same version removes it.
#[derive(Debug)]
pub struct StagingDir {
    version: u32,
    busy_dir: PathBuf,
    final_dir: PathBuf,
}

impl StagingDir {
    /// Create (or recreate) `<root>/<NN>_BUSY`.
    pub fn create(layout: &VersionLayout, version: u32) -> PrepareResult<Self> {
        let busy_dir = layout.busy_dir(version);
        if busy_dir.exists() {
            warn!(
                "Removing leftover staging directory of an earlier run: {}",
                busy_dir.display()
            );
            fs::remove_dir_all(&busy_dir).map_err(|e| PrepareError::io(&busy_dir, e))?;
        }
        fs::create_dir_all(&busy_dir).map_err(|e| PrepareError::io(&busy_dir, e))?;

        Ok(Self {
            version,
            busy_dir,
            final_dir: layout.version_dir(version),
        })
    }

    /// Create a staging directory with `image/` and `mask/` for every split.
    pub fn create_for_splits(
        layout: &VersionLayout,
        version: u32,
        splits: &[Split],
    ) -> PrepareResult<Self> {
        let staging = Self::create(layout, version)?;
        for split in splits {
            let dirs = staging.split_dirs(*split);
            create_dir(&dirs.image_dir)?;
            create_dir(&dirs.mask_dir)?;
        }
        Ok(staging)
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn path(&self) -> &Path {
        &self.busy_dir
    }

    pub fn split_dirs(&self, split: Split) -> SplitDirs {
        let split_dir = self.busy_dir.join(split.as_str());
        SplitDirs {
            image_dir: split_dir.join(IMAGE_SUBDIR),
            mask_dir: split_dir.join(MASK_SUBDIR),
        }
    }

    /// Copy the input files into the staging root so the version records
    /// which inputs produced it.
    pub fn copy_inputs(&self, inputs: &[&Path]) -> PrepareResult<()> {
        for input in inputs {
            geofile::copy(input, &self.busy_dir)?;
        }
        Ok(())
    }

    /// Rename the staging directory to its final version name.
    pub fn promote(self) -> PrepareResult<PathBuf> {
        fs::rename(&self.busy_dir, &self.final_dir)
            .map_err(|e| PrepareError::io(&self.busy_dir, e))?;
        info!(
            "Dataset version {} ready in {}",
            self.version,
            self.final_dir.display()
        );
        Ok(self.final_dir)
    }
}

pub(crate) fn create_dir(path: &Path) -> PrepareResult<()> {
    fs::create_dir_all(path).map_err(|e| PrepareError::io(path, e))
}
