//! Download session state machine types and context.

use std::fmt;
use std::sync::Arc;

use crate::engine::CompletionFn;
use crate::protocol::{CMD_GET_SESSION_STATE, CMD_GET_VERSION, CMD_RESET, DlStatus, FrameBuffer};
use crate::state::chunker::RwInfo;
use crate::timer::TimerId;

/// State of the command session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Idle, or allocating the session timer.
    #[default]
    Init,
    /// Building (or reusing) a frame and writing it.
    Send,
    /// Waiting for the write to complete.
    Recv,
    /// Response timer or resend-wait timer armed.
    Timer,
    /// Validating and applying a response, or handling a timeout.
    Response,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Init => write!(f, "INIT"),
            SessionState::Send => write!(f, "SEND"),
            SessionState::Recv => write!(f, "RECV"),
            SessionState::Timer => write!(f, "TIMER"),
            SessionState::Response => write!(f, "RESPONSE"),
        }
    }
}

/// Shape of a command session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sequence {
    /// One Send/Recv/Response cycle.
    Plain,
    /// Loops until all bytes are transferred; resends on memory busy.
    ReadWrite,
}

/// Facade command driving a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Reset,
    GetVersion,
    GetSessionState,
    CheckIntegrity,
    Read,
    Write,
    Log,
    Force,
    Raw,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Reset => write!(f, "RESET"),
            Command::GetVersion => write!(f, "GET_VERSION"),
            Command::GetSessionState => write!(f, "GET_SESSION_STATE"),
            Command::CheckIntegrity => write!(f, "CHECK_INTEGRITY"),
            Command::Read => write!(f, "READ"),
            Command::Write => write!(f, "WRITE"),
            Command::Log => write!(f, "LOG"),
            Command::Force => write!(f, "FORCE"),
            Command::Raw => write!(f, "RAW"),
        }
    }
}

impl Command {
    pub fn sequence(&self) -> Sequence {
        match self {
            Command::Reset
            | Command::GetVersion
            | Command::GetSessionState
            | Command::CheckIntegrity
            | Command::Raw => Sequence::Plain,
            Command::Read | Command::Write | Command::Log | Command::Force => Sequence::ReadWrite,
        }
    }
}

/// What the next Send builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameRequest {
    #[default]
    None,
    /// `id 00 00 00` commands.
    Fixed(u8),
    /// Integrity check, optionally over the EEPROM user-data area `(offset, len)`.
    Integrity { userdata: Option<(u16, u16)> },
    /// Memory read starting at `addr`.
    Read { addr: u32 },
    /// Next record (or fragment) of the user data.
    Write,
    /// Log entry held in the user data.
    Log,
    /// Force with the encoded clock payload.
    Force([u8; 3]),
    /// Frame held verbatim in the user data.
    Raw,
}

impl FrameRequest {
    /// Request for the `id 00 00 00` commands; `None` for the others.
    pub fn for_fixed(command: Command) -> Option<Self> {
        match command {
            Command::Reset => Some(FrameRequest::Fixed(CMD_RESET)),
            Command::GetVersion => Some(FrameRequest::Fixed(CMD_GET_VERSION)),
            Command::GetSessionState => Some(FrameRequest::Fixed(CMD_GET_SESSION_STATE)),
            _ => None,
        }
    }
}

/// What the armed timer is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimerPurpose {
    #[default]
    Response,
    ResendWait,
}

/// Session timer bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimerInfo {
    pub id: Option<TimerId>,
    pub running: bool,
    pub purpose: TimerPurpose,
    /// Ticket of the current arming.
    pub ticket: Option<u64>,
    /// The last response timer expired before a response arrived.
    pub timed_out: bool,
}

/// Download context: everything one command session needs.
///
/// Created once per engine and reset at the end of every session.
/// `last_status` and the frame buffer survive the reset.
pub struct DownloadContext {
    pub command: Option<Command>,
    pub state: SessionState,
    pub busy: bool,
    pub request: FrameRequest,
    /// Outgoing frame.
    pub frame: FrameBuffer,
    /// Bytes to write (write records, log entry or raw frame).
    pub user_data: Option<Arc<[u8]>>,
    /// Caller's response storage; its length is the capacity.
    pub response: Vec<u8>,
    /// Valid bytes in `response`.
    pub response_len: usize,
    pub rw: RwInfo,
    pub timer: TimerInfo,
    /// Most recent failure class reported by the controller.
    pub last_status: Option<DlStatus>,
    pub resend_last_frame: bool,
    /// Consecutive memory-busy resends in this session.
    pub resend_count: u32,
    pub callback: Option<CompletionFn>,
    pub write_ticket: Option<u64>,
    pub read_ticket: Option<u64>,
    /// Return the transport to normal mode when the session ends.
    pub restore_normal_mode: bool,
}

impl DownloadContext {
    pub fn new() -> Self {
        Self {
            command: None,
            state: SessionState::Init,
            busy: false,
            request: FrameRequest::None,
            frame: FrameBuffer::new(),
            user_data: None,
            response: Vec::new(),
            response_len: 0,
            rw: RwInfo::default(),
            timer: TimerInfo::default(),
            last_status: None,
            resend_last_frame: false,
            resend_count: 0,
            callback: None,
            write_ticket: None,
            read_ticket: None,
            restore_normal_mode: false,
        }
    }

    /// Transition to a new state.
    pub fn goto_state(&mut self, new_state: SessionState) {
        tracing::debug!(from = %self.state, to = %new_state, "State transition");
        self.state = new_state;
    }

    /// Return to idle.
    pub fn reset(&mut self) {
        self.command = None;
        self.state = SessionState::Init;
        self.busy = false;
        self.request = FrameRequest::None;
        self.user_data = None;
        self.response = Vec::new();
        self.response_len = 0;
        self.rw = RwInfo::default();
        self.timer = TimerInfo::default();
        self.resend_last_frame = false;
        self.resend_count = 0;
        self.callback = None;
        self.write_ticket = None;
        self.read_ticket = None;
        self.restore_normal_mode = false;
    }

    /// Capacity of the caller's response buffer.
    pub fn response_capacity(&self) -> usize {
        self.response.len()
    }

    /// Hand back the response bytes received so far.
    pub fn take_response(&mut self) -> Vec<u8> {
        let mut response = std::mem::take(&mut self.response);
        response.truncate(self.response_len);
        self.response_len = 0;
        response
    }
}

impl Default for DownloadContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DownloadContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadContext")
            .field("command", &self.command)
            .field("state", &self.state)
            .field("busy", &self.busy)
            .field("request", &self.request)
            .field("frame", &self.frame)
            .field("user_data_len", &self.user_data.as_ref().map(|d| d.len()))
            .field("response_capacity", &self.response.len())
            .field("response_len", &self.response_len)
            .field("rw", &self.rw)
            .field("timer", &self.timer)
            .field("last_status", &self.last_status)
            .field("resend_last_frame", &self.resend_last_frame)
            .field("resend_count", &self.resend_count)
            .field("has_callback", &self.callback.is_some())
            .field("restore_normal_mode", &self.restore_normal_mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequences() {
        assert_eq!(Command::Reset.sequence(), Sequence::Plain);
        assert_eq!(Command::Raw.sequence(), Sequence::Plain);
        assert_eq!(Command::CheckIntegrity.sequence(), Sequence::Plain);
        assert_eq!(Command::Write.sequence(), Sequence::ReadWrite);
        assert_eq!(Command::Force.sequence(), Sequence::ReadWrite);
    }

    #[test]
    fn test_fixed_requests() {
        assert_eq!(
            FrameRequest::for_fixed(Command::GetVersion),
            Some(FrameRequest::Fixed(0xF1))
        );
        assert_eq!(FrameRequest::for_fixed(Command::Write), None);
    }

    #[test]
    fn test_reset_keeps_status_and_frame() {
        let mut ctx = DownloadContext::new();
        ctx.frame.encode(0xF0, &[0, 0, 0], false).unwrap();
        ctx.last_status = Some(DlStatus::SignatureError);
        ctx.busy = true;
        ctx.command = Some(Command::Write);
        ctx.resend_last_frame = true;
        ctx.response = vec![0; 8];
        ctx.response_len = 3;
        ctx.goto_state(SessionState::Response);

        let response = ctx.take_response();
        assert_eq!(response.len(), 3);

        ctx.reset();
        assert_eq!(ctx.state, SessionState::Init);
        assert!(!ctx.busy);
        assert!(!ctx.resend_last_frame);
        assert_eq!(ctx.command, None);
        assert_eq!(ctx.last_status, Some(DlStatus::SignatureError));
        assert_eq!(ctx.frame.len(), 8);
    }
}
