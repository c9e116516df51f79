//! Read/write chunking.
//!
//! A write walks the image record by record. Records whose body fits in one
//! frame go out verbatim; larger ones are cut into `MAX_FRAME_BODY` fragments
//! with the fragmentation bit set on all but the last. A read is split into
//! requests of at most `MAX_READ_PER_FRAME` bytes whose data is concatenated
//! into the response buffer.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::error::{DownloadError, Failure};
use crate::image::ImageError;
use crate::protocol::{
    CMD_CHECK_INTEGRITY, CMD_FORCE, CMD_LOG, CMD_READ, DlStatus, FRAME_HDR_LEN, Frame,
    FrameBuffer, MAX_FRAME_BODY, MAX_READ_PER_FRAME,
};

/// Progress of a read or write session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RwInfo {
    /// Bytes still to transfer over the whole buffer.
    pub remaining: usize,
    /// Current offset into the user data (write) or response buffer (read).
    pub offset: usize,
    /// Bytes of the current record body not yet acknowledged.
    pub remaining_chunk: usize,
    /// Bytes carried by the frame in flight.
    pub frame_len: usize,
    /// Body length of the current record.
    pub record_len: usize,
    pub bytes_read: usize,
    pub first_write: bool,
    /// The first fragment of the current record was acknowledged.
    pub first_chunk_resp: bool,
    /// The frame in flight is a non-final fragment (write) or the read
    /// needs more than one frame.
    pub segmented: bool,
    pub addr: u32,
}

fn slice_at(data: &[u8], offset: usize, len: usize) -> Result<&[u8], DownloadError> {
    data.get(offset..offset + len).ok_or_else(|| {
        ImageError::Truncated {
            offset,
            needed: len,
            available: data.len().saturating_sub(offset),
        }
        .into()
    })
}

/// Build the next write frame from `data`.
pub fn build_write_frame(
    rw: &mut RwInfo,
    data: &[u8],
    frame: &mut FrameBuffer,
) -> Result<(), DownloadError> {
    if rw.first_write {
        rw.remaining = data.len();
        rw.offset = 0;
        rw.first_write = false;
    }

    if !rw.segmented {
        let hdr = slice_at(data, rw.offset, FRAME_HDR_LEN)?;
        rw.record_len = BigEndian::read_u16(hdr) as usize;
    }

    if rw.record_len > MAX_FRAME_BODY {
        if !rw.first_chunk_resp {
            rw.remaining_chunk = rw.record_len;
            rw.offset += FRAME_HDR_LEN;
        }
        let n = rw.remaining_chunk.min(MAX_FRAME_BODY);
        rw.segmented = rw.remaining_chunk > MAX_FRAME_BODY;
        frame.encode_body(slice_at(data, rw.offset, n)?, rw.segmented)?;
        rw.frame_len = n;
    } else {
        let body = slice_at(data, rw.offset + FRAME_HDR_LEN, rw.record_len)?;
        frame.encode_body(body, false)?;
        rw.frame_len = rw.record_len + FRAME_HDR_LEN;
    }
    Ok(())
}

/// Apply the status answering a write frame.
///
/// Memory busy is not handled here; the caller resends without touching
/// the bookkeeping.
pub fn apply_write_status(rw: &mut RwInfo, status: DlStatus) -> Result<(), DownloadError> {
    let n = rw.frame_len;
    match status {
        DlStatus::Ok if !rw.segmented => {
            if rw.first_chunk_resp {
                rw.remaining_chunk = rw.remaining_chunk.saturating_sub(n);
                rw.first_chunk_resp = false;
            }
            rw.remaining = rw.remaining.saturating_sub(n);
            rw.offset += n;
            Ok(())
        }
        DlStatus::FirstChunkAck if rw.segmented && !rw.first_chunk_resp => {
            rw.first_chunk_resp = true;
            rw.remaining_chunk = rw.remaining_chunk.saturating_sub(n);
            rw.remaining = rw.remaining.saturating_sub(n + FRAME_HDR_LEN);
            rw.offset += n;
            Ok(())
        }
        DlStatus::NextChunkAck if rw.segmented && rw.first_chunk_resp => {
            rw.remaining_chunk = rw.remaining_chunk.saturating_sub(n);
            rw.remaining = rw.remaining.saturating_sub(n);
            rw.offset += n;
            Ok(())
        }
        DlStatus::FirmwareVersionError => {
            rw.remaining = 0;
            rw.offset = 0;
            Err(DownloadError::FwVersionError)
        }
        DlStatus::PllError => Err(DownloadError::WriteFailed),
        DlStatus::SignatureError => Err(DownloadError::Rejected),
        other => Err(Failure::UnexpectedStatus(other).into()),
    }
}

/// Arm `rw` for a read of `capacity` bytes starting at `addr`.
pub fn start_read(rw: &mut RwInfo, addr: u32, capacity: usize) {
    *rw = RwInfo {
        remaining: capacity,
        addr,
        segmented: capacity > MAX_READ_PER_FRAME,
        ..RwInfo::default()
    };
}

/// Build the next read request: `A2 00 len(LE16) addr(LE32)`.
pub fn build_read_frame(rw: &mut RwInfo, frame: &mut FrameBuffer) -> Result<(), DownloadError> {
    let n = rw.remaining.min(MAX_READ_PER_FRAME);
    let mut payload = [0u8; 7];
    LittleEndian::write_u16(&mut payload[1..3], n as u16);
    LittleEndian::write_u32(&mut payload[3..7], rw.addr);
    frame.encode(CMD_READ, &payload, false)?;
    rw.frame_len = n;
    Ok(())
}

/// Copy the data of a read response into `response` and advance.
///
/// The response payload is `00 len(LE16) data`, and `len` must echo the
/// length requested.
pub fn apply_read_response(
    rw: &mut RwInfo,
    rsp: &Frame<'_>,
    response: &mut [u8],
) -> Result<(), DownloadError> {
    let status = rsp.status();
    if status != DlStatus::Ok {
        return Err(Failure::UnexpectedStatus(status).into());
    }

    let n = rw.frame_len;
    let short = |actual| Failure::ShortRead {
        expected: n,
        actual,
    };
    let echoed = match rsp.payload.get(1..3) {
        Some(len) => LittleEndian::read_u16(len) as usize,
        None => return Err(short(0).into()),
    };
    let data = &rsp.payload[3..];
    if echoed != n || data.len() < n {
        return Err(short(echoed.min(data.len())).into());
    }

    let capacity = response.len();
    let dst = response
        .get_mut(rw.offset..rw.offset + n)
        .ok_or(Failure::ResponseOverflow {
            len: rw.offset + n,
            capacity,
        })?;
    dst.copy_from_slice(&data[..n]);

    rw.bytes_read += n;
    rw.remaining = rw.remaining.saturating_sub(n);
    rw.addr = rw.addr.wrapping_add(n as u32);
    rw.offset += n;
    Ok(())
}

/// `id 00 00 00`.
pub fn build_fixed_frame(id: u8, frame: &mut FrameBuffer) -> Result<(), DownloadError> {
    frame.encode(id, &[0, 0, 0], false)?;
    Ok(())
}

/// `E0 00 00 00`, followed by `offset(LE16) len(LE16)` when a user-data
/// area is given.
pub fn build_integrity_frame(
    userdata: Option<(u16, u16)>,
    frame: &mut FrameBuffer,
) -> Result<(), DownloadError> {
    let mut payload = [0u8; 7];
    let len = match userdata {
        Some((offset, area_len)) => {
            LittleEndian::write_u16(&mut payload[3..5], offset);
            LittleEndian::write_u16(&mut payload[5..7], area_len);
            7
        }
        None => 3,
    };
    frame.encode(CMD_CHECK_INTEGRITY, &payload[..len], false)?;
    Ok(())
}

/// `A7 00 00 00 data`.
pub fn build_log_frame(data: &[u8], frame: &mut FrameBuffer) -> Result<(), DownloadError> {
    let mut payload = Vec::with_capacity(3 + data.len());
    payload.extend_from_slice(&[0, 0, 0]);
    payload.extend_from_slice(data);
    frame.encode(CMD_LOG, &payload, false)?;
    Ok(())
}

/// `D0 p0 p1 p2`.
pub fn build_force_frame(payload: [u8; 3], frame: &mut FrameBuffer) -> Result<(), DownloadError> {
    frame.encode(CMD_FORCE, &payload, false)?;
    Ok(())
}
