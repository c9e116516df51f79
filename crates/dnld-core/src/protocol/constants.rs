//! Protocol constants for the PN54x download mode.
//!
//! Frame geometry, command identifiers and EEPROM layout used by the
//! secure firmware update (SFWU) bootloader.

// ============================================================================
// Frame Geometry
// ============================================================================

/// Size of the command/response frame buffer.
pub const MAX_FRAME_SIZE: usize = 0x100; // 256 bytes

/// Length header (2 bytes, big-endian).
pub const FRAME_HDR_LEN: usize = 2;

/// CRC16 trailer (2 bytes, big-endian).
pub const FRAME_CRC_LEN: usize = 2;

/// Offset of the frame-id (request) or status (response) byte.
pub const FRAME_ID_OFFSET: usize = FRAME_HDR_LEN;

/// Largest frame body (id/status byte plus payload) that fits in one frame.
pub const MAX_FRAME_BODY: usize = MAX_FRAME_SIZE - FRAME_HDR_LEN - FRAME_CRC_LEN; // 252 bytes

/// Body length of the fixed-shape commands: id followed by three zero bytes.
pub const MIN_BODY_LEN: usize = 4;

/// Bit 10 of the length header: more fragments of this record follow.
pub const FRAG_BIT: u16 = 1 << 10;

/// Mask for the length bits of the header.
pub const LEN_MASK: u16 = FRAG_BIT - 1;

/// Offset of the read length echoed in a read response.
pub const READ_RSP_LEN_OFFSET: usize = FRAME_ID_OFFSET + 2;

/// Offset of the data in a read response.
pub const READ_RSP_DATA_OFFSET: usize = FRAME_ID_OFFSET + MIN_BODY_LEN;

/// Largest read that a single frame can carry.
pub const MAX_READ_PER_FRAME: usize = MAX_FRAME_BODY - MIN_BODY_LEN; // 248 bytes

// ============================================================================
// Command IDs (Host -> Device)
// ============================================================================

pub const CMD_RESET: u8 = 0xF0;
pub const CMD_GET_VERSION: u8 = 0xF1;
pub const CMD_GET_SESSION_STATE: u8 = 0xF2;
pub const CMD_CHECK_INTEGRITY: u8 = 0xE0;
pub const CMD_WRITE: u8 = 0xC0;
pub const CMD_READ: u8 = 0xA2;
pub const CMD_LOG: u8 = 0xA7;
pub const CMD_FORCE: u8 = 0xD0;

// ============================================================================
// EEPROM Layout
// ============================================================================

/// Start of the EEPROM log area.
pub const EEPROM_LOG_START: u32 = 0x201F80;

/// End of the EEPROM log area (inclusive).
pub const EEPROM_LOG_END: u32 = 0x201FBF;

/// Maximum bytes a Log command may store.
pub const MAX_LOG_SIZE: usize = (EEPROM_LOG_END - EEPROM_LOG_START + 1) as usize; // 64 bytes

/// Start of the platform-specific EEPROM area.
pub const EEPROM_PLATFORM_START: u32 = 0x2011C0;

/// Size of the platform-specific EEPROM area.
pub const EEPROM_PLATFORM_LEN: usize = 3519;

/// User-data area checked by CheckIntegrity on PN548AD.
pub const PN548AD_USERDATA_OFFSET: u16 = 0x02BC;
pub const PN548AD_USERDATA_LEN: u16 = 0x0C00;

/// User-data area checked by CheckIntegrity on PN547C2.
pub const PN547C2_USERDATA_OFFSET: u16 = 0x023C;
pub const PN547C2_USERDATA_LEN: u16 = 0x0C80;

// ============================================================================
// Hardware Versions
// ============================================================================

/// Silicon revisions with the long version report.
pub const HW_VERSION_MRA1_0: u8 = 0x01;
pub const HW_VERSION_MRA1_1: u8 = 0x02;
pub const HW_VERSION_MRA2_0: u8 = 0x03;

/// Silicon revisions whose integrity check must carry the user-data area.
pub const HW_VERSION_MRA2_1: u8 = 0x04;
pub const HW_VERSION_MRA2_2: u8 = 0x05;
pub const HW_VERSION_PN548AD_MRA1_0: u8 = 0x08;

/// Check whether an integrity check on `hw_version` includes the user-data area.
#[inline]
pub const fn needs_userdata_area(hw_version: u8) -> bool {
    matches!(
        hw_version,
        HW_VERSION_MRA2_1 | HW_VERSION_MRA2_2 | HW_VERSION_PN548AD_MRA1_0
    )
}

/// Expected GetVersion report length for `hw_version` (low nibble of the
/// first report byte), or `None` for an unknown revision.
pub const fn version_report_len(hw_version: u8) -> Option<usize> {
    match hw_version {
        HW_VERSION_MRA2_1 | HW_VERSION_MRA2_2 | HW_VERSION_PN548AD_MRA1_0 => {
            Some(VERSION_REPORT_LEN_SHORT)
        }
        HW_VERSION_MRA1_0..=HW_VERSION_MRA2_0 => Some(VERSION_REPORT_LEN),
        _ => None,
    }
}

// ============================================================================
// Response Layouts
// ============================================================================

/// GetVersion report length on MRA1.x and MRA2.0.
pub const VERSION_REPORT_LEN: usize = 11;

/// GetVersion report length on MRA2.1, MRA2.2 and PN548AD.
pub const VERSION_REPORT_LEN_SHORT: usize = 9;

/// ROM code version of ES2.2 parts, which only accept major firmware version 1.
pub const ROM_VERSION_ES2_2: u8 = 0x07;

/// GetSessionState report length: session flag, reserved, life cycle.
pub const SESSION_STATE_LEN: usize = 3;

/// Session flag of an interrupted download.
pub const SESSION_OPEN: u8 = 0x01;

/// Life-cycle byte reported by an operational part.
pub const LIFE_CYCLE_OPERATIONAL: u8 = 17;

/// Length of the integrity check report. Byte 0 carries the CRC flags.
pub const INTEGRITY_REPORT_LEN: usize = 31;

/// Length of the download statistics record kept in the EEPROM log area.
pub const DOWNLOAD_LOG_LEN: usize = 13;

// ============================================================================
// Download Sequence
// ============================================================================

/// Write attempts, recovery writes and forced restarts counted together.
pub const MAX_DOWNLOAD_ATTEMPTS: u8 = 3;

/// NCI CORE_RESET_CMD keeping the configuration, sent in normal mode after
/// a production-key recovery.
pub const NCI_CORE_RESET_KEEP_CONFIG: [u8; 4] = [0x20, 0x00, 0x01, 0x00];

/// Length of the CORE_RESET_RSP answering it.
pub const NCI_CORE_RESET_RSP_LEN: usize = 6;

// ============================================================================
// Force Command Defaults
// ============================================================================

/// Force payload used when no clock configuration is supplied.
pub const DEFAULT_FORCE_PAYLOAD: [u8; 3] = [0x11, 0x00, 0x00];

// ============================================================================
// Firmware Image Layout
// ============================================================================

/// Offset of the minor firmware version in a download image.
pub const IMAGE_FW_MINOR_OFFSET: usize = 4;

/// Offset of the major firmware version in a download image.
pub const IMAGE_FW_MAJOR_OFFSET: usize = 5;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_report_len_by_revision() {
        assert_eq!(version_report_len(HW_VERSION_MRA1_0), Some(11));
        assert_eq!(version_report_len(HW_VERSION_MRA1_1), Some(11));
        assert_eq!(version_report_len(HW_VERSION_MRA2_0), Some(11));
        assert_eq!(version_report_len(HW_VERSION_MRA2_1), Some(9));
        assert_eq!(version_report_len(HW_VERSION_PN548AD_MRA1_0), Some(9));
        assert_eq!(version_report_len(0x00), None);
        assert_eq!(version_report_len(0x06), None);
    }

    #[test]
    fn test_download_log_fits_log_area() {
        assert!(DOWNLOAD_LOG_LEN <= MAX_LOG_SIZE);
    }

    #[test]
    fn test_platform_area_ends_below_log_area() {
        assert!(EEPROM_PLATFORM_START + EEPROM_PLATFORM_LEN as u32 <= EEPROM_LOG_START);
    }
}
