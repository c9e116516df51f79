//! Firmware download image parsing.
//!
//! A download image is a sequence of write records. Each record is a 2-byte
//! big-endian body length followed by the body, and every body begins with
//! the write command id. Records larger than one frame are fragmented on the
//! wire; the image itself never is.

use std::fmt;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

use crate::protocol::constants::{
    CMD_WRITE, FRAME_HDR_LEN, IMAGE_FW_MAJOR_OFFSET, IMAGE_FW_MINOR_OFFSET,
};

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("Image is empty")]
    Empty,
    #[error("Record at offset {offset} truncated: needs {needed} bytes, {available} left")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },
    #[error("Record at offset {offset} has an empty body")]
    EmptyRecord { offset: usize },
    #[error("Record at offset {offset} starts with 0x{id:02X}, expected write command")]
    BadRecordId { offset: usize, id: u8 },
    #[error("{kind} image not available")]
    NotAvailable { kind: super::ImageKind },
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Firmware version stored in a download image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FwVersion {
    pub major: u8,
    pub minor: u8,
}

impl fmt::Display for FwVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}.{:02X}", self.major, self.minor)
    }
}

/// Validated download image.
///
/// The bytes are shared, so handing the image to a write session never copies it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    data: Arc<[u8]>,
    record_count: usize,
}

impl FirmwareImage {
    /// Parse and validate an image from raw bytes.
    pub fn from_bytes(data: impl Into<Arc<[u8]>>) -> Result<Self, ImageError> {
        let data = data.into();
        if data.is_empty() {
            return Err(ImageError::Empty);
        }

        let mut record_count = 0;
        let mut offset = 0;
        while offset < data.len() {
            let available = data.len() - offset;
            if available < FRAME_HDR_LEN {
                return Err(ImageError::Truncated {
                    offset,
                    needed: FRAME_HDR_LEN,
                    available,
                });
            }
            let body_len = BigEndian::read_u16(&data[offset..]) as usize;
            if body_len == 0 {
                return Err(ImageError::EmptyRecord { offset });
            }
            if available < FRAME_HDR_LEN + body_len {
                return Err(ImageError::Truncated {
                    offset,
                    needed: FRAME_HDR_LEN + body_len,
                    available,
                });
            }
            let id = data[offset + FRAME_HDR_LEN];
            if id != CMD_WRITE {
                return Err(ImageError::BadRecordId { offset, id });
            }
            record_count += 1;
            offset += FRAME_HDR_LEN + body_len;
        }

        Ok(Self { data, record_count })
    }

    /// Build an image from record bodies.
    pub fn from_records<'a>(bodies: impl IntoIterator<Item = &'a [u8]>) -> Result<Self, ImageError> {
        let mut data = Vec::new();
        for body in bodies {
            let mut hdr = [0u8; FRAME_HDR_LEN];
            BigEndian::write_u16(&mut hdr, body.len() as u16);
            data.extend_from_slice(&hdr);
            data.extend_from_slice(body);
        }
        Self::from_bytes(data)
    }

    /// Firmware version carried by the image, if it is long enough to hold one.
    pub fn version(&self) -> Option<FwVersion> {
        Some(FwVersion {
            major: *self.data.get(IMAGE_FW_MAJOR_OFFSET)?,
            minor: *self.data.get(IMAGE_FW_MINOR_OFFSET)?,
        })
    }

    /// Iterate over record bodies.
    pub fn records(&self) -> RecordIter<'_> {
        RecordIter {
            data: &self.data,
            offset: 0,
        }
    }

    pub fn record_count(&self) -> usize {
        self.record_count
    }

    /// Shared raw bytes.
    pub fn bytes(&self) -> Arc<[u8]> {
        Arc::clone(&self.data)
    }

    /// Get raw data.
    pub fn raw_data(&self) -> &[u8] {
        &self.data
    }

    /// Get total size.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Iterator over the record bodies of a validated image.
#[derive(Debug)]
pub struct RecordIter<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        let hdr = self.data.get(self.offset..self.offset + FRAME_HDR_LEN)?;
        let len = BigEndian::read_u16(hdr) as usize;
        let start = self.offset + FRAME_HDR_LEN;
        let body = self.data.get(start..start + len)?;
        self.offset = start + len;
        Some(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(len: usize) -> Vec<u8> {
        let mut b = vec![0x5Au8; len];
        b[0] = CMD_WRITE;
        b
    }

    #[test]
    fn test_records_iterate() {
        let a = body(10);
        let b = body(600);
        let image = FirmwareImage::from_records([a.as_slice(), b.as_slice()]).unwrap();

        assert_eq!(image.record_count(), 2);
        assert_eq!(image.len(), 2 + 10 + 2 + 600);
        let records: Vec<_> = image.records().collect();
        assert_eq!(records, vec![a.as_slice(), b.as_slice()]);
    }

    #[test]
    fn test_version_bytes() {
        let mut b = body(8);
        // image[4] = minor, image[5] = major; image[2] is the C0 id
        b[2] = 0x1A;
        b[3] = 0x08;
        let image = FirmwareImage::from_records([b.as_slice()]).unwrap();
        assert_eq!(
            image.version(),
            Some(FwVersion {
                major: 0x08,
                minor: 0x1A
            })
        );
        assert_eq!(image.version().unwrap().to_string(), "08.1A");
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(matches!(FirmwareImage::from_bytes(Vec::new()), Err(ImageError::Empty)));
        assert!(matches!(
            FirmwareImage::from_bytes(vec![0x00]),
            Err(ImageError::Truncated { offset: 0, .. })
        ));
        assert!(matches!(
            FirmwareImage::from_bytes(vec![0x00, 0x05, CMD_WRITE, 0x00]),
            Err(ImageError::Truncated { .. })
        ));
        assert!(matches!(
            FirmwareImage::from_bytes(vec![0x00, 0x00]),
            Err(ImageError::EmptyRecord { .. })
        ));
        assert!(matches!(
            FirmwareImage::from_bytes(vec![0x00, 0x01, 0xA2]),
            Err(ImageError::BadRecordId { id: 0xA2, .. })
        ));
    }
}
