//! Recovery image selection.

use super::ImageKind;
use crate::protocol::status::DlStatus;

/// Choose the image a write without an explicit buffer should source from.
///
/// A PLL failure is recovered with the platform image and a signature
/// mismatch with the production-key image. Every other case, and every
/// non-recovery write, uses the primary image.
pub fn select_image(use_recovery: bool, last_status: Option<DlStatus>) -> ImageKind {
    if !use_recovery {
        return ImageKind::Primary;
    }
    match last_status {
        Some(DlStatus::PllError) => ImageKind::PlatformRecovery,
        Some(DlStatus::SignatureError) => ImageKind::ProductionKey,
        _ => ImageKind::Primary,
    }
}
