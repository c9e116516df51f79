//! Firmware image handling module.
//!
//! Provides parsing of download images, loaders, and recovery image selection.

pub mod firmware;
pub mod loader;
pub mod recovery;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use firmware::{FirmwareImage, FwVersion, ImageError, RecordIter};
pub use loader::{FsImageLoader, ImageLoader, StaticImageLoader};
pub use recovery::select_image;

/// Named firmware images the engine can source write data from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageKind {
    /// Regular firmware update image.
    Primary,
    /// Recovery image for parts that reported a PLL error.
    PlatformRecovery,
    /// Recovery image signed with the production key.
    ProductionKey,
}

impl fmt::Display for ImageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageKind::Primary => write!(f, "primary"),
            ImageKind::PlatformRecovery => write!(f, "platform-recovery"),
            ImageKind::ProductionKey => write!(f, "production-key"),
        }
    }
}
