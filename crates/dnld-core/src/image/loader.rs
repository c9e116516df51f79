//! Firmware image loaders.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::info;

use super::ImageKind;
use super::firmware::{FirmwareImage, ImageError};

/// Resolves a named firmware image to its bytes.
pub trait ImageLoader: Send + Sync {
    fn load(&self, kind: ImageKind) -> Result<FirmwareImage, ImageError>;
}

impl<L: ImageLoader + ?Sized> ImageLoader for std::sync::Arc<L> {
    fn load(&self, kind: ImageKind) -> Result<FirmwareImage, ImageError> {
        (**self).load(kind)
    }
}

/// Loads raw image files from disk.
#[derive(Debug, Clone, Default)]
pub struct FsImageLoader {
    paths: HashMap<ImageKind, PathBuf>,
}

impl FsImageLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the file backing `kind`.
    pub fn with_path(mut self, kind: ImageKind, path: impl Into<PathBuf>) -> Self {
        self.paths.insert(kind, path.into());
        self
    }

    pub fn path(&self, kind: ImageKind) -> Option<&Path> {
        self.paths.get(&kind).map(PathBuf::as_path)
    }
}

impl ImageLoader for FsImageLoader {
    fn load(&self, kind: ImageKind) -> Result<FirmwareImage, ImageError> {
        let path = self
            .paths
            .get(&kind)
            .ok_or(ImageError::NotAvailable { kind })?;
        info!(kind = %kind, path = %path.display(), "Loading firmware image");
        let data = std::fs::read(path).map_err(|source| ImageError::Read {
            path: path.display().to_string(),
            source,
        })?;
        FirmwareImage::from_bytes(data)
    }
}

/// Serves images held in memory.
#[derive(Debug, Clone, Default)]
pub struct StaticImageLoader {
    images: HashMap<ImageKind, FirmwareImage>,
}

impl StaticImageLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(mut self, kind: ImageKind, image: FirmwareImage) -> Self {
        self.images.insert(kind, image);
        self
    }
}

impl ImageLoader for StaticImageLoader {
    fn load(&self, kind: ImageKind) -> Result<FirmwareImage, ImageError> {
        self.images
            .get(&kind)
            .cloned()
            .ok_or(ImageError::NotAvailable { kind })
    }
}
