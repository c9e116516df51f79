//! Download engine - command facade and session driver.
//!
//! Each facade call validates its arguments, arms the download context and
//! writes the first frame. Everything after that happens in [`DownloadEngine::dispatch`]
//! or [`DownloadEngine::wait_idle`], which drain the completions posted by
//! the transport and the timer service and step the state machine.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, channel};
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use crate::config::EngineConfig;
use crate::dispatch::{EngineEvent, ReadCompletion, TimerExpiry, WriteCompletion};
use crate::error::{DownloadError, Failure};
use crate::events::{DnldEvent, DnldObserver, PacketDirection, TracingObserver};
use crate::image::{FirmwareImage, FwVersion, ImageKind, ImageLoader, select_image};
use crate::protocol::{
    ClockSource, DlStatus, EEPROM_LOG_START, EEPROM_PLATFORM_LEN, EEPROM_PLATFORM_START,
    MAX_FRAME_SIZE, MAX_LOG_SIZE, decode, force_payload, needs_userdata_area,
};
use crate::state::chunker::{self, RwInfo};
use crate::state::{
    Command, DownloadContext, FrameRequest, HandleResult, SessionState, TimerPurpose, build_frame,
    handle_response,
};
use crate::timer::{TimerError, TimerService};
use crate::transport::{DeviceMode, Transport, TransportError};

/// Result of a finished command.
#[derive(Debug)]
pub struct Completion {
    pub command: Command,
    pub result: Result<(), DownloadError>,
    /// Response bytes received, truncated to the valid length.
    pub response: Vec<u8>,
}

/// Callback receiving the [`Completion`] of a command, exactly once.
pub type CompletionFn = Box<dyn FnOnce(Completion) + Send>;

/// Firmware download engine.
pub struct DownloadEngine<T, S, L, O = TracingObserver>
where
    T: Transport,
    S: TimerService,
    L: ImageLoader,
    O: DnldObserver,
{
    transport: T,
    timers: S,
    loader: L,
    observer: Arc<O>,
    config: EngineConfig,
    ctx: DownloadContext,
    primary: Option<FirmwareImage>,
    events_tx: Sender<EngineEvent>,
    events_rx: Receiver<EngineEvent>,
    next_ticket: u64,
}

impl<T: Transport, S: TimerService, L: ImageLoader> DownloadEngine<T, S, L, TracingObserver> {
    /// Create an engine with the default tracing observer.
    pub fn new(transport: T, timers: S, loader: L, config: EngineConfig) -> Self {
        Self::with_observer(transport, timers, loader, config, Arc::new(TracingObserver))
    }
}

impl<T, S, L, O> DownloadEngine<T, S, L, O>
where
    T: Transport,
    S: TimerService,
    L: ImageLoader,
    O: DnldObserver,
{
    /// Create an engine with a custom observer.
    pub fn with_observer(
        transport: T,
        timers: S,
        loader: L,
        config: EngineConfig,
        observer: Arc<O>,
    ) -> Self {
        let (events_tx, events_rx) = channel();
        Self {
            transport,
            timers,
            loader,
            observer,
            config,
            ctx: DownloadContext::new(),
            primary: None,
            events_tx,
            events_rx,
            next_ticket: 0,
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn is_busy(&self) -> bool {
        self.ctx.busy
    }

    pub fn state(&self) -> SessionState {
        self.ctx.state
    }

    /// Most recent failure class reported by the controller.
    pub fn last_status(&self) -> Option<DlStatus> {
        self.ctx.last_status
    }

    pub fn rw_info(&self) -> &RwInfo {
        &self.ctx.rw
    }

    /// Last frame built for transmission.
    pub fn last_frame(&self) -> &[u8] {
        self.ctx.frame.as_bytes()
    }

    pub fn context(&self) -> &DownloadContext {
        &self.ctx
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Version of the primary image loaded by [`Self::init_image_info`].
    pub fn primary_version(&self) -> Option<FwVersion> {
        self.primary.as_ref().and_then(FirmwareImage::version)
    }

    // ------------------------------------------------------------------
    // Facade
    // ------------------------------------------------------------------

    /// Load the primary image and report the firmware version it carries.
    #[instrument(skip(self))]
    pub fn init_image_info(&mut self) -> Result<Option<FwVersion>, DownloadError> {
        let image = self.loader.load(ImageKind::Primary)?;
        let version = image.version();
        match version {
            Some(v) => info!(version = %v, records = image.record_count(), "Primary image loaded"),
            None => warn!("Primary image too short to carry a version"),
        }
        self.primary = Some(image);
        Ok(version)
    }

    /// Reset the controller. A missing response counts as success.
    pub fn reset<F>(&mut self, on_complete: F) -> Result<(), DownloadError>
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        self.start_fixed(Command::Reset, Vec::new(), on_complete)
    }

    /// Read the version report into `buf`. The report is 9 or 11 bytes
    /// depending on the hardware revision.
    pub fn get_version<F>(&mut self, buf: Vec<u8>, on_complete: F) -> Result<(), DownloadError>
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        self.check_idle()?;
        require_buffer(&buf, "version")?;
        self.start_fixed(Command::GetVersion, buf, on_complete)
    }

    /// Read the session state report into `buf`.
    pub fn get_session_state<F>(
        &mut self,
        buf: Vec<u8>,
        on_complete: F,
    ) -> Result<(), DownloadError>
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        self.check_idle()?;
        require_buffer(&buf, "session state")?;
        self.start_fixed(Command::GetSessionState, buf, on_complete)
    }

    /// Run the integrity check. Chip versions that need it also check the
    /// EEPROM user-data area of the configured chip.
    pub fn check_integrity<F>(
        &mut self,
        chip_version: u8,
        buf: Vec<u8>,
        on_complete: F,
    ) -> Result<(), DownloadError>
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        self.check_idle()?;
        require_buffer(&buf, "integrity")?;
        let userdata = needs_userdata_area(chip_version).then(|| self.config.chip.userdata_area());
        self.start(
            Command::CheckIntegrity,
            FrameRequest::Integrity { userdata },
            None,
            buf,
            Box::new(on_complete),
        )
    }

    /// Read `buf.len()` bytes of controller memory starting at `addr`.
    pub fn read<F>(&mut self, addr: u32, buf: Vec<u8>, on_complete: F) -> Result<(), DownloadError>
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        self.check_idle()?;
        require_buffer(&buf, "read")?;
        self.start_read(addr, buf, Box::new(on_complete))
    }

    /// Read the EEPROM log area.
    pub fn read_log<F>(&mut self, buf: Vec<u8>, on_complete: F) -> Result<(), DownloadError>
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        self.check_idle()?;
        require_buffer(&buf, "log")?;
        self.start_read(EEPROM_LOG_START, buf, Box::new(on_complete))
    }

    /// Dump the EEPROM platform area.
    ///
    /// Switches the transport to download mode for the read and back to
    /// normal mode once the session ends, whatever its outcome.
    pub fn read_mem<F>(&mut self, on_complete: F) -> Result<(), DownloadError>
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        self.check_idle()?;
        self.transport
            .set_mode(DeviceMode::Download)
            .map_err(Failure::Transport)?;
        self.ctx.restore_normal_mode = true;
        info!(
            addr = format_args!("{:#08X}", EEPROM_PLATFORM_START),
            len = EEPROM_PLATFORM_LEN,
            "Reading EEPROM platform area"
        );
        self.start_read(
            EEPROM_PLATFORM_START,
            vec![0; EEPROM_PLATFORM_LEN],
            Box::new(on_complete),
        )
    }

    /// Switch the transport between normal and download mode.
    pub fn set_mode(&mut self, mode: DeviceMode) -> Result<(), DownloadError> {
        self.check_idle()?;
        debug!(mode = %mode, "Switching device mode");
        self.transport.set_mode(mode).map_err(Failure::Transport)?;
        Ok(())
    }

    /// Write a firmware image.
    ///
    /// An explicit buffer is written as is. Otherwise the image is picked by
    /// the recovery selector from `use_recovery` and the last status.
    #[instrument(skip(self, data, on_complete), fields(explicit = data.is_some()))]
    pub fn write<F>(
        &mut self,
        use_recovery: bool,
        data: Option<Arc<[u8]>>,
        on_complete: F,
    ) -> Result<(), DownloadError>
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        self.check_idle()?;
        let data = match data {
            Some(buf) => {
                if buf.is_empty() {
                    return Err(DownloadError::InvalidParameter(
                        "write buffer is empty".to_string(),
                    ));
                }
                FirmwareImage::from_bytes(Arc::clone(&buf))
                    .map_err(|e| DownloadError::InvalidParameter(e.to_string()))?;
                buf
            }
            None => self.resolve_image(use_recovery)?.bytes(),
        };

        self.ctx.rw = RwInfo {
            first_write: true,
            ..RwInfo::default()
        };
        self.ctx.resend_last_frame = false;
        self.start(
            Command::Write,
            FrameRequest::Write,
            Some(data),
            Vec::new(),
            Box::new(on_complete),
        )
    }

    /// Store `data` (1 to 64 bytes) in the EEPROM log area.
    pub fn log<F>(&mut self, data: &[u8], on_complete: F) -> Result<(), DownloadError>
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        self.check_idle()?;
        if data.is_empty() || data.len() > MAX_LOG_SIZE {
            return Err(DownloadError::InvalidParameter(format!(
                "log entry of {} bytes, expected 1..={}",
                data.len(),
                MAX_LOG_SIZE
            )));
        }
        self.start(
            Command::Log,
            FrameRequest::Log,
            Some(Arc::from(data)),
            Vec::new(),
            Box::new(on_complete),
        )
    }

    /// Force the controller clock configuration.
    pub fn force<F>(&mut self, clock: Option<ClockSource>, on_complete: F) -> Result<(), DownloadError>
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        self.check_idle()?;
        self.start(
            Command::Force,
            FrameRequest::Force(force_payload(clock)),
            None,
            Vec::new(),
            Box::new(on_complete),
        )
    }

    /// Send `frame` verbatim and copy the raw response into `buf`.
    pub fn raw_request<F>(
        &mut self,
        frame: &[u8],
        buf: Vec<u8>,
        on_complete: F,
    ) -> Result<(), DownloadError>
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        self.check_idle()?;
        if frame.is_empty() || frame.len() > MAX_FRAME_SIZE {
            return Err(DownloadError::InvalidParameter(format!(
                "raw frame of {} bytes, expected 1..={}",
                frame.len(),
                MAX_FRAME_SIZE
            )));
        }
        require_buffer(&buf, "raw response")?;
        self.start(
            Command::Raw,
            FrameRequest::Raw,
            Some(Arc::from(frame)),
            buf,
            Box::new(on_complete),
        )
    }

    // ------------------------------------------------------------------
    // Event processing
    // ------------------------------------------------------------------

    /// Process every queued completion without blocking. Returns the number
    /// of events handled.
    pub fn dispatch(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    /// Process completions until the session in flight finishes or `limit`
    /// elapses. Returns `true` when the engine is idle.
    pub fn wait_idle(&mut self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while self.ctx.busy {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.events_rx.recv_timeout(left) {
                Ok(event) => self.handle_event(event),
                Err(RecvTimeoutError::Timeout) => return false,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        !self.ctx.busy
    }

    fn handle_event(&mut self, event: EngineEvent) {
        let state = self.ctx.state;
        match (state, event) {
            (SessionState::Recv, EngineEvent::WriteDone { ticket, result })
                if self.ctx.write_ticket == Some(ticket) =>
            {
                self.ctx.write_ticket = None;
                self.on_write_done(result);
            }
            (SessionState::Timer, EngineEvent::ReadDone { ticket, result })
                if self.ctx.read_ticket == Some(ticket) =>
            {
                self.ctx.read_ticket = None;
                self.on_read_done(result);
            }
            (SessionState::Timer, EngineEvent::TimerExpired { ticket })
                if self.ctx.timer.ticket == Some(ticket) =>
            {
                self.ctx.timer.running = false;
                self.ctx.timer.ticket = None;
                match self.ctx.timer.purpose {
                    TimerPurpose::Response => self.on_response_timeout(),
                    TimerPurpose::ResendWait => self.on_resend_wait_over(),
                }
            }
            (
                SessionState::Init
                | SessionState::Send
                | SessionState::Recv
                | SessionState::Timer
                | SessionState::Response,
                event,
            ) => {
                debug!(state = %state, ticket = event.ticket(), "Ignoring stale completion");
            }
        }
    }

    // ------------------------------------------------------------------
    // Session steps
    // ------------------------------------------------------------------

    fn check_idle(&self) -> Result<(), DownloadError> {
        if self.ctx.busy {
            warn!(command = ?self.ctx.command, "Download session busy");
            return Err(DownloadError::Busy);
        }
        Ok(())
    }

    fn resolve_image(&mut self, use_recovery: bool) -> Result<FirmwareImage, DownloadError> {
        let kind = select_image(use_recovery, self.ctx.last_status);
        info!(kind = %kind, last_status = ?self.ctx.last_status, "Selected write image");
        if kind == ImageKind::Primary {
            if let Some(image) = &self.primary {
                return Ok(image.clone());
            }
            let image = self.loader.load(kind)?;
            self.primary = Some(image.clone());
            return Ok(image);
        }
        Ok(self.loader.load(kind)?)
    }

    fn start_fixed<F>(
        &mut self,
        command: Command,
        buf: Vec<u8>,
        on_complete: F,
    ) -> Result<(), DownloadError>
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        let request = FrameRequest::for_fixed(command).ok_or_else(|| {
            DownloadError::InvalidParameter(format!("{} is not a fixed command", command))
        })?;
        self.start(command, request, None, buf, Box::new(on_complete))
    }

    fn start_read(
        &mut self,
        addr: u32,
        buf: Vec<u8>,
        on_complete: CompletionFn,
    ) -> Result<(), DownloadError> {
        chunker::start_read(&mut self.ctx.rw, addr, buf.len());
        self.start(Command::Read, FrameRequest::Read { addr }, None, buf, on_complete)
    }

    /// Arm the context and run Init and Send.
    #[instrument(skip(self, user_data, response, on_complete))]
    fn start(
        &mut self,
        command: Command,
        request: FrameRequest,
        user_data: Option<Arc<[u8]>>,
        response: Vec<u8>,
        on_complete: CompletionFn,
    ) -> Result<(), DownloadError> {
        self.check_idle()?;
        self.ctx.command = Some(command);
        self.ctx.busy = true;
        self.ctx.request = request;
        self.ctx.user_data = user_data;
        self.ctx.response = response;
        self.ctx.response_len = 0;
        self.ctx.resend_count = 0;
        self.ctx.callback = Some(on_complete);
        self.emit(DnldEvent::CommandStarted { command });

        let started = self.init_timer().and_then(|()| {
            self.goto(SessionState::Send);
            self.send_frame()
        });
        if let Err(e) = started {
            warn!(command = %command, error = %e, "Failed to start command");
            self.teardown();
            self.ctx.reset();
            self.emit(DnldEvent::Finished {
                command,
                error: Some(e.to_string()),
            });
            return Err(e);
        }
        Ok(())
    }

    fn init_timer(&mut self) -> Result<(), DownloadError> {
        let id = self.timers.create()?;
        self.ctx.timer.id = Some(id);
        Ok(())
    }

    /// Write the current frame, rebuilding it unless a resend is pending.
    fn send_frame(&mut self) -> Result<(), DownloadError> {
        if self.ctx.resend_last_frame {
            self.ctx.resend_last_frame = false;
        } else {
            build_frame(&mut self.ctx)?;
        }

        let ticket = self.ticket();
        self.ctx.write_ticket = Some(ticket);
        self.goto(SessionState::Recv);
        let frame = self.ctx.frame.as_bytes();
        self.observer.on_event(&DnldEvent::Packet {
            direction: PacketDirection::Tx,
            length: frame.len(),
            data: Some(frame.to_vec()),
        });
        self.transport
            .write(frame, WriteCompletion::new(ticket, self.events_tx.clone()))?;
        Ok(())
    }

    fn arm_timer(&mut self, purpose: TimerPurpose, timeout: Duration) -> Result<(), DownloadError> {
        let id = self
            .ctx
            .timer
            .id
            .ok_or(Failure::Timer(TimerError::Exhausted))?;
        let ticket = self.ticket();
        self.timers
            .start(id, timeout, TimerExpiry::new(ticket, self.events_tx.clone()))?;
        self.ctx.timer.purpose = purpose;
        self.ctx.timer.ticket = Some(ticket);
        self.ctx.timer.running = true;
        self.ctx.timer.timed_out = false;
        Ok(())
    }

    fn on_write_done(&mut self, result: Result<(), TransportError>) {
        let step = result.map_err(DownloadError::from).and_then(|()| {
            self.arm_timer(TimerPurpose::Response, self.config.response_timeout())?;
            self.goto(SessionState::Timer);
            let ticket = self.ticket();
            self.ctx.read_ticket = Some(ticket);
            self.transport
                .read(MAX_FRAME_SIZE, ReadCompletion::new(ticket, self.events_tx.clone()))?;
            Ok(())
        });
        if let Err(e) = step {
            self.finish(Err(e));
        }
    }

    fn on_read_done(&mut self, result: Result<Vec<u8>, TransportError>) {
        self.stop_timer();
        self.goto(SessionState::Response);

        let raw = match result {
            Ok(raw) => raw,
            Err(e) => return self.finish(Err(e.into())),
        };
        self.emit(DnldEvent::Packet {
            direction: PacketDirection::Rx,
            length: raw.len(),
            data: Some(raw.clone()),
        });

        if self.ctx.command != Some(Command::Raw)
            && let Ok(rsp) = decode(&raw)
        {
            self.emit(DnldEvent::StatusReceived {
                status: rsp.status(),
            });
        }
        let outcome = handle_response(&mut self.ctx, &raw);
        self.emit_progress();

        match outcome {
            HandleResult::Done => self.finish(Ok(())),
            HandleResult::Error(e) => self.finish(Err(e)),
            HandleResult::Continue => {
                self.goto(SessionState::Send);
                if let Err(e) = self.send_frame() {
                    self.finish(Err(e));
                }
            }
            HandleResult::Resend => self.schedule_resend(),
        }
    }

    fn schedule_resend(&mut self) {
        self.ctx.resend_count += 1;
        let attempt = self.ctx.resend_count;
        if let Some(limit) = self.config.resend_limit
            && attempt > limit
        {
            warn!(limit, "Controller still busy, giving up");
            return self.finish(Err(Failure::ResendLimit(limit).into()));
        }
        self.emit(DnldEvent::Resend { attempt });
        match self.arm_timer(TimerPurpose::ResendWait, self.config.resend_wait()) {
            Ok(()) => self.goto(SessionState::Timer),
            Err(e) => self.finish(Err(e)),
        }
    }

    fn on_resend_wait_over(&mut self) {
        self.goto(SessionState::Send);
        self.ctx.resend_last_frame = true;
        if let Err(e) = self.send_frame() {
            self.finish(Err(e));
        }
    }

    fn on_response_timeout(&mut self) {
        self.ctx.timer.timed_out = true;
        self.goto(SessionState::Response);
        let Some(command) = self.ctx.command else {
            return;
        };
        self.emit(DnldEvent::Timeout { command });

        if self.config.ven_reset_on_timeout
            && self.ctx.last_status == Some(DlStatus::SignatureError)
        {
            self.ven_reset();
        }

        if command == Command::Reset {
            info!("No response to reset, assuming the controller restarted");
            self.finish(Ok(()));
        } else {
            self.finish(Err(DownloadError::Timeout));
        }
    }

    /// Toggle the controller through normal mode and back to download mode.
    fn ven_reset(&mut self) {
        self.emit(DnldEvent::VenReset);
        for mode in [DeviceMode::Normal, DeviceMode::Download] {
            if let Err(e) = self.transport.set_mode(mode) {
                warn!(mode = %mode, error = %e, "VEN reset step failed");
            }
        }
    }

    fn stop_timer(&mut self) {
        if let Some(id) = self.ctx.timer.id
            && self.ctx.timer.running
        {
            if let Err(e) = self.timers.stop(id) {
                warn!(timer = %id, error = %e, "Failed to stop timer");
            }
        }
        self.ctx.timer.running = false;
        self.ctx.timer.ticket = None;
    }

    /// Abort the outstanding read and release the session timer.
    fn teardown(&mut self) {
        self.transport.abort_read();
        if std::mem::take(&mut self.ctx.restore_normal_mode)
            && let Err(e) = self.transport.set_mode(DeviceMode::Normal)
        {
            warn!(error = %e, "Failed to restore normal mode");
        }
        if let Some(id) = self.ctx.timer.id.take() {
            if self.ctx.timer.running
                && let Err(e) = self.timers.stop(id)
            {
                warn!(timer = %id, error = %e, "Failed to stop timer");
            }
            if let Err(e) = self.timers.delete(id) {
                warn!(timer = %id, error = %e, "Failed to delete timer");
            }
        }
        self.ctx.timer.running = false;
    }

    /// End the session and deliver the completion.
    fn finish(&mut self, result: Result<(), DownloadError>) {
        let Some(command) = self.ctx.command else {
            return;
        };
        self.teardown();
        let response = self.ctx.take_response();
        let callback = self.ctx.callback.take();
        self.goto(SessionState::Init);
        self.ctx.reset();

        self.emit(DnldEvent::Finished {
            command,
            error: result.as_ref().err().map(|e| e.to_string()),
        });
        if let Some(callback) = callback {
            callback(Completion {
                command,
                result,
                response,
            });
        }
    }

    fn emit_progress(&self) {
        let (current, total) = match self.ctx.request {
            FrameRequest::Write => (
                self.ctx.rw.offset,
                self.ctx.user_data.as_ref().map_or(0, |d| d.len()),
            ),
            FrameRequest::Read { .. } => (self.ctx.rw.bytes_read, self.ctx.response_capacity()),
            _ => return,
        };
        if let Some(command) = self.ctx.command {
            self.emit(DnldEvent::Progress {
                command,
                current: current as u64,
                total: total as u64,
            });
        }
    }

    fn goto(&mut self, state: SessionState) {
        let from = self.ctx.state;
        self.ctx.goto_state(state);
        if from != state {
            self.emit(DnldEvent::StateChanged { from, to: state });
        }
    }

    fn ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    fn emit(&self, event: DnldEvent) {
        self.observer.on_event(&event);
    }
}

impl<T, S, L, O> Drop for DownloadEngine<T, S, L, O>
where
    T: Transport,
    S: TimerService,
    L: ImageLoader,
    O: DnldObserver,
{
    fn drop(&mut self) {
        if self.ctx.busy || self.ctx.timer.id.is_some() {
            debug!("Engine dropped with a session in flight");
            self.teardown();
        }
    }
}

fn require_buffer(buf: &[u8], what: &str) -> Result<(), DownloadError> {
    if buf.is_empty() {
        return Err(DownloadError::InvalidParameter(format!(
            "{} response buffer is empty",
            what
        )));
    }
    Ok(())
}
