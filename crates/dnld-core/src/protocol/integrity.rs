//! Integrity check report decoding.
//!
//! The first byte of the CheckIntegrity report holds one pass flag per
//! memory region. A set bit means the region's CRC matched.

use std::fmt;

/// Memory region covered by the integrity check, in flag bit order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrcRegion {
    UserData,
    TrimData,
    ProtectedData,
    PatchCode,
    FunctionCode,
    PatchTable,
    FunctionTable,
}

impl CrcRegion {
    pub const ALL: [CrcRegion; 7] = [
        CrcRegion::UserData,
        CrcRegion::TrimData,
        CrcRegion::ProtectedData,
        CrcRegion::PatchCode,
        CrcRegion::FunctionCode,
        CrcRegion::PatchTable,
        CrcRegion::FunctionTable,
    ];

    /// Flag bit of this region.
    pub const fn mask(self) -> u8 {
        1 << self as u8
    }
}

impl fmt::Display for CrcRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CrcRegion::UserData => "user data",
            CrcRegion::TrimData => "trim data",
            CrcRegion::ProtectedData => "protected data",
            CrcRegion::PatchCode => "patch code",
            CrcRegion::FunctionCode => "function code",
            CrcRegion::PatchTable => "patch table",
            CrcRegion::FunctionTable => "function table",
        };
        f.write_str(name)
    }
}

/// Per-region CRC flags from an integrity report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrcStatus(u8);

impl CrcStatus {
    /// Flags of a report where every region passed. Bit 7 is unused.
    pub const ALL_OK: u8 = 0x7F;

    pub const fn from_byte(flags: u8) -> Self {
        Self(flags)
    }

    /// Decode the flags from a full integrity report.
    pub fn from_report(report: &[u8]) -> Option<Self> {
        report.first().map(|&b| Self(b))
    }

    pub const fn as_byte(&self) -> u8 {
        self.0
    }

    pub const fn passed(&self, region: CrcRegion) -> bool {
        self.0 & region.mask() != 0
    }

    pub fn failed_regions(&self) -> Vec<CrcRegion> {
        CrcRegion::ALL
            .into_iter()
            .filter(|r| !self.passed(*r))
            .collect()
    }

    pub fn is_ok(&self) -> bool {
        self.0 & Self::ALL_OK == Self::ALL_OK
    }
}

impl fmt::Display for CrcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let failed = self.failed_regions();
        if failed.is_empty() {
            return write!(f, "all regions OK (0x{:02X})", self.0);
        }
        write!(f, "CRC mismatch in ")?;
        for (i, region) in failed.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", region)?;
        }
        write!(f, " (0x{:02X})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_regions_pass() {
        let status = CrcStatus::from_byte(0x7F);
        assert!(status.is_ok());
        assert!(status.failed_regions().is_empty());

        // Bit 7 carries no region
        assert!(CrcStatus::from_byte(0xFF).is_ok());
    }

    #[test]
    fn test_each_cleared_bit_fails_its_region() {
        for (bit, region) in CrcRegion::ALL.into_iter().enumerate() {
            let status = CrcStatus::from_byte(CrcStatus::ALL_OK & !(1 << bit));
            assert!(!status.is_ok());
            assert_eq!(status.failed_regions(), vec![region]);
        }
    }

    #[test]
    fn test_from_report_reads_first_byte() {
        let mut report = [0u8; 31];
        report[0] = 0x7E;
        report[30] = 0xFF;
        let status = CrcStatus::from_report(&report).unwrap();
        assert!(!status.passed(CrcRegion::UserData));
        assert!(status.passed(CrcRegion::FunctionTable));
        assert_eq!(
            status.to_string(),
            "CRC mismatch in user data (0x7E)"
        );
        assert!(CrcStatus::from_report(&[]).is_none());
    }

    #[test]
    fn test_zeroed_report_fails_everything() {
        let status = CrcStatus::from_byte(0x00);
        assert_eq!(status.failed_regions().len(), 7);
        assert!(status.to_string().starts_with("CRC mismatch in user data, trim data"));
    }
}
