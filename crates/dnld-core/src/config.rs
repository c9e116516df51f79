//! Engine configuration.

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::image::{FsImageLoader, ImageKind};
use crate::protocol::constants::{
    PN547C2_USERDATA_LEN, PN547C2_USERDATA_OFFSET, PN548AD_USERDATA_LEN, PN548AD_USERDATA_OFFSET,
};

/// Controller family; selects the EEPROM user-data area for integrity checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChipType {
    #[default]
    Pn548ad,
    Pn547c2,
}

impl ChipType {
    /// `(offset, length)` of the user-data area.
    pub fn userdata_area(&self) -> (u16, u16) {
        match self {
            ChipType::Pn548ad => (PN548AD_USERDATA_OFFSET, PN548AD_USERDATA_LEN),
            ChipType::Pn547c2 => (PN547C2_USERDATA_OFFSET, PN547C2_USERDATA_LEN),
        }
    }
}

/// Files backing the named firmware images.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImagePaths {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform_recovery: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub production_key: Option<String>,
}

/// Configuration for a download engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Time allowed for a response after a frame was written.
    pub response_timeout_ms: u64,
    /// Wait before retransmitting a frame the device answered with memory busy.
    pub resend_wait_ms: u64,
    /// Consecutive busy resends tolerated in one session. `None` retries forever.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resend_limit: Option<u32>,
    /// Toggle the controller through normal mode when a response times out
    /// after a signature error.
    pub ven_reset_on_timeout: bool,
    pub chip: ChipType,
    pub images: ImagePaths,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: 2500,
            resend_wait_ms: 50,
            resend_limit: None,
            ven_reset_on_timeout: true,
            chip: ChipType::default(),
            images: ImagePaths::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn resend_wait(&self) -> Duration {
        Duration::from_millis(self.resend_wait_ms)
    }

    /// Build a loader for the configured image files.
    pub fn image_loader(&self) -> FsImageLoader {
        let mut loader = FsImageLoader::new();
        let entries = [
            (ImageKind::Primary, &self.images.primary),
            (ImageKind::PlatformRecovery, &self.images.platform_recovery),
            (ImageKind::ProductionKey, &self.images.production_key),
        ];
        for (kind, path) in entries {
            if let Some(path) = path {
                loader = loader.with_path(kind, path);
            }
        }
        loader
    }
}
