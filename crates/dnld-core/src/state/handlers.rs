//! Frame building and response handling for each command.

use tracing::{debug, warn};

use crate::error::{DownloadError, Failure};
use crate::protocol::{DlStatus, decode};
use crate::state::chunker;
use crate::state::machine::{Command, DownloadContext, FrameRequest, Sequence};

/// Decision taken after a response was handled.
#[derive(Debug)]
pub enum HandleResult {
    /// More frames to send.
    Continue,
    /// Controller busy: wait, then send the same frame again.
    Resend,
    /// Command complete.
    Done,
    /// Command failed.
    Error(DownloadError),
}

/// Build the frame for the current request into the context's frame buffer.
pub fn build_frame(ctx: &mut DownloadContext) -> Result<(), DownloadError> {
    let frame = &mut ctx.frame;
    match ctx.request {
        FrameRequest::None => Err(DownloadError::InvalidParameter(
            "no frame requested".to_string(),
        )),
        FrameRequest::Fixed(id) => chunker::build_fixed_frame(id, frame),
        FrameRequest::Integrity { userdata } => chunker::build_integrity_frame(userdata, frame),
        FrameRequest::Read { .. } => chunker::build_read_frame(&mut ctx.rw, frame),
        FrameRequest::Force(payload) => chunker::build_force_frame(payload, frame),
        FrameRequest::Write | FrameRequest::Log | FrameRequest::Raw => {
            let data = ctx
                .user_data
                .as_deref()
                .ok_or_else(|| DownloadError::InvalidParameter("no user data".to_string()))?;
            match ctx.request {
                FrameRequest::Write => chunker::build_write_frame(&mut ctx.rw, data, frame),
                FrameRequest::Log => chunker::build_log_frame(data, frame),
                _ => {
                    frame.set_raw(data)?;
                    Ok(())
                }
            }
        }
    }
}

/// Handle a received response for the command in flight.
pub fn handle_response(ctx: &mut DownloadContext, raw: &[u8]) -> HandleResult {
    let Some(command) = ctx.command else {
        return HandleResult::Error(DownloadError::InvalidParameter(
            "no command in flight".to_string(),
        ));
    };

    if command == Command::Raw {
        return match store_response(ctx, raw) {
            Ok(()) => HandleResult::Done,
            Err(e) => HandleResult::Error(e),
        };
    }

    let rsp = match decode(raw) {
        Ok(rsp) => rsp,
        Err(e) => {
            warn!(error = %e, "Invalid response frame");
            return HandleResult::Error(e.into());
        }
    };
    let status = rsp.status();
    debug!(command = %command, status = %status, len = rsp.payload.len(), "Response");

    if status == DlStatus::MemBusy && command.sequence() == Sequence::ReadWrite {
        ctx.last_status = Some(DlStatus::MemBusy);
        return HandleResult::Resend;
    }
    ctx.resend_count = 0;

    let applied = match command {
        Command::Write => {
            if matches!(status, DlStatus::PllError | DlStatus::SignatureError) {
                ctx.last_status = Some(status);
            }
            chunker::apply_write_status(&mut ctx.rw, status)
        }
        Command::Read => {
            let applied = chunker::apply_read_response(&mut ctx.rw, &rsp, &mut ctx.response);
            ctx.response_len = ctx.rw.offset;
            applied
        }
        _ if status == DlStatus::Ok => store_response(ctx, rsp.payload),
        _ => Err(Failure::UnexpectedStatus(status).into()),
    };

    match applied {
        Err(e) => HandleResult::Error(e),
        Ok(()) if command.sequence() == Sequence::ReadWrite && ctx.rw.remaining > 0 => {
            HandleResult::Continue
        }
        Ok(()) => HandleResult::Done,
    }
}

/// Copy `bytes` into the caller's response buffer.
///
/// Commands called without a response buffer discard the bytes.
fn store_response(ctx: &mut DownloadContext, bytes: &[u8]) -> Result<(), DownloadError> {
    let capacity = ctx.response_capacity();
    if capacity == 0 {
        return Ok(());
    }
    if bytes.len() > capacity {
        return Err(Failure::ResponseOverflow {
            len: bytes.len(),
            capacity,
        }
        .into());
    }
    ctx.response[..bytes.len()].copy_from_slice(bytes);
    ctx.response_len = bytes.len();
    Ok(())
}
