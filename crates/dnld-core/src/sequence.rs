//! Download sequencer - runs a complete firmware update on top of the engine.
//!
//! The main sequence checks the session state and the running version,
//! writes the primary image, then verifies the result and logs the attempt
//! in the EEPROM log area. A PLL failure during the write triggers a forced
//! restart, a signature failure a production-key recovery write followed by
//! an NCI core reset, and either one reruns the main sequence. Attempts are
//! capped at [`SequenceOptions::max_attempts`].
//!
//! Each step blocks on its command, so the sequencer suits callers that own
//! the engine on a dedicated thread.

use std::fmt;
use std::sync::mpsc::{Receiver, channel};
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, info, instrument, warn};

use crate::config::ChipType;
use crate::engine::{Completion, CompletionFn, DownloadEngine};
use crate::error::{DownloadError, Failure};
use crate::events::DnldObserver;
use crate::image::{FwVersion, ImageLoader};
use crate::protocol::{
    ClockSource, CrcStatus, DOWNLOAD_LOG_LEN, INTEGRITY_REPORT_LEN, LIFE_CYCLE_OPERATIONAL,
    MAX_DOWNLOAD_ATTEMPTS, NCI_CORE_RESET_KEEP_CONFIG, NCI_CORE_RESET_RSP_LEN,
    ROM_VERSION_ES2_2, SESSION_OPEN, SESSION_STATE_LEN, VERSION_REPORT_LEN, version_report_len,
};
use crate::timer::TimerService;
use crate::transport::{DeviceMode, Transport};

/// Knobs of a download sequence.
#[derive(Debug, Clone)]
pub struct SequenceOptions {
    /// Clock configuration sent with Force. `None` sends the default payload.
    pub clock: Option<ClockSource>,
    /// Middleware version recorded in the download log.
    pub mw_version: u16,
    pub max_attempts: u8,
    /// Write the image even when the chip already runs its version.
    pub force_download: bool,
    /// Upper bound on a single command, resends included.
    pub step_limit: Duration,
}

impl Default for SequenceOptions {
    fn default() -> Self {
        Self {
            clock: None,
            mw_version: 0,
            max_attempts: MAX_DOWNLOAD_ATTEMPTS,
            force_download: false,
            step_limit: Duration::from_secs(30),
        }
    }
}

/// Download statistics kept in the EEPROM log area.
///
/// Stored as six little-endian `u16` counters followed by the config flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadLog {
    pub curr_mw_ver: u16,
    pub curr_fw_ver: u16,
    pub num_trig: u16,
    pub num_success: u16,
    pub num_fail: u16,
    /// Failures since the last successful download.
    pub fail_cnt: u16,
    /// Set after a successful download until normal mode applies the
    /// configuration.
    pub config: bool,
}

impl DownloadLog {
    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        if raw.len() < DOWNLOAD_LOG_LEN {
            return None;
        }
        let word = |i: usize| LittleEndian::read_u16(&raw[i * 2..i * 2 + 2]);
        Some(Self {
            curr_mw_ver: word(0),
            curr_fw_ver: word(1),
            num_trig: word(2),
            num_success: word(3),
            num_fail: word(4),
            fail_cnt: word(5),
            config: raw[12] != 0,
        })
    }

    pub fn to_bytes(&self) -> [u8; DOWNLOAD_LOG_LEN] {
        let mut raw = [0u8; DOWNLOAD_LOG_LEN];
        let words = [
            self.curr_mw_ver,
            self.curr_fw_ver,
            self.num_trig,
            self.num_success,
            self.num_fail,
            self.fail_cnt,
        ];
        for (i, w) in words.into_iter().enumerate() {
            LittleEndian::write_u16(&mut raw[i * 2..i * 2 + 2], w);
        }
        raw[12] = u8::from(self.config);
        raw
    }

    fn record_failure(&mut self) {
        self.num_fail = self.num_fail.wrapping_add(1);
        self.fail_cnt = self.fail_cnt.wrapping_add(1);
        self.config = false;
    }

    fn record_success(&mut self) {
        self.num_success = self.num_success.wrapping_add(1);
        self.fail_cnt = 0;
        self.config = true;
    }
}

/// Outcome of [`DownloadSequencer::run`].
#[derive(Debug)]
pub struct SequenceReport {
    pub result: Result<(), DownloadError>,
    /// Writes, recovery writes and recovery forces issued.
    pub attempts: u8,
    /// Silicon revision from the last version report.
    pub chip_version: Option<u8>,
    pub image_version: Option<FwVersion>,
    /// The chip already ran the image version, nothing was written.
    pub up_to_date: bool,
    pub log: DownloadLog,
    pub integrity: Option<CrcStatus>,
}

impl SequenceReport {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// One step of a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Force with the clock configuration, ignoring a failed answer.
    Normal,
    GetSessionState,
    GetVersion,
    LogRead,
    Write,
    Log,
    CheckIntegrity,
    Reset,
    Force,
    Recover,
    SendNciReset,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::Normal => "normal",
            Step::GetSessionState => "get-session-state",
            Step::GetVersion => "get-version",
            Step::LogRead => "log-read",
            Step::Write => "write",
            Step::Log => "log",
            Step::CheckIntegrity => "check-integrity",
            Step::Reset => "reset",
            Step::Force => "force",
            Step::Recover => "recover",
            Step::SendNciReset => "send-nci-reset",
        };
        f.write_str(name)
    }
}

const MAIN_STEPS: &[Step] = &[
    Step::GetSessionState,
    Step::GetVersion,
    Step::LogRead,
    Step::Write,
    Step::GetSessionState,
    Step::GetVersion,
    Step::Log,
    Step::CheckIntegrity,
];

const PN547C2_MAIN_STEPS: &[Step] = &[
    Step::Normal,
    Step::Normal,
    Step::GetSessionState,
    Step::GetVersion,
    Step::LogRead,
    Step::Write,
    Step::GetSessionState,
    Step::GetVersion,
    Step::Log,
    Step::CheckIntegrity,
];

const RECOVERY_STEPS: &[Step] = &[Step::Reset, Step::Force, Step::Recover, Step::SendNciReset];

const LOG_STEPS: &[Step] = &[Step::Log];

/// Main sequence for `chip`. PN547C2 parts get two clock forces up front.
pub fn main_steps(chip: ChipType) -> &'static [Step] {
    match chip {
        ChipType::Pn547c2 => PN547C2_MAIN_STEPS,
        ChipType::Pn548ad => MAIN_STEPS,
    }
}

#[derive(Debug, Default)]
struct Flags {
    prev_session_open: bool,
    /// A counted write started and has not been logged yet.
    initiated: bool,
    skip_seq: bool,
    force_dnld: bool,
    recovery: bool,
    retry: bool,
    skip_reset: bool,
    skip_force: bool,
    send_nci: bool,
}

/// Drives an engine through the download sequence.
pub struct DownloadSequencer<'a, T, S, L, O>
where
    T: Transport,
    S: TimerService,
    L: ImageLoader,
    O: DnldObserver,
{
    engine: &'a mut DownloadEngine<T, S, L, O>,
    options: SequenceOptions,
    flags: Flags,
    attempts: u8,
    chip_version: Option<u8>,
    image_version: Option<FwVersion>,
    up_to_date: bool,
    log: DownloadLog,
    integrity: Option<CrcStatus>,
}

impl<'a, T, S, L, O> DownloadSequencer<'a, T, S, L, O>
where
    T: Transport,
    S: TimerService,
    L: ImageLoader,
    O: DnldObserver,
{
    pub fn new(engine: &'a mut DownloadEngine<T, S, L, O>, options: SequenceOptions) -> Self {
        Self {
            engine,
            options,
            flags: Flags::default(),
            attempts: 0,
            chip_version: None,
            image_version: None,
            up_to_date: false,
            log: DownloadLog::default(),
            integrity: None,
        }
    }

    /// Run the whole sequence, recovery included, and leave the controller
    /// in normal mode.
    #[instrument(skip(self))]
    pub fn run(mut self) -> SequenceReport {
        let mut status = self.begin();
        let mut recoveries = 0u8;

        loop {
            if let Err(e) = &status
                && e.is_recoverable()
            {
                self.flags.recovery = self.attempts < self.options.max_attempts;
                if !self.flags.recovery {
                    warn!(attempts = self.attempts, "Download attempts exhausted");
                    self.flags.retry = false;
                } else if matches!(e, DownloadError::Rejected) {
                    // Signature errors go straight to the recovery write
                    self.flags.skip_force = true;
                }
            }

            if self.flags.initiated {
                info!("Logging the interrupted download");
                self.flags.initiated = false;
                let logged = self.run_steps(LOG_STEPS);
                if status.is_ok() {
                    status = logged;
                }
            } else if self.flags.recovery {
                recoveries += 1;
                if recoveries > self.options.max_attempts {
                    warn!(recoveries, "Recovery sequence keeps failing");
                    break;
                }
                info!(attempts = self.attempts, "Running recovery sequence");
                status = self.run_steps(RECOVERY_STEPS);
            } else if self.flags.retry {
                info!(attempts = self.attempts, "Retrying download sequence");
                self.flags = Flags {
                    retry: true,
                    skip_reset: self.flags.skip_reset,
                    ..Flags::default()
                };
                status = self.run_steps(main_steps(self.engine.config().chip));
            } else {
                break;
            }
        }

        status = self.finish(status);
        SequenceReport {
            result: status,
            attempts: self.attempts,
            chip_version: self.chip_version,
            image_version: self.image_version,
            up_to_date: self.up_to_date,
            log: self.log,
            integrity: self.integrity,
        }
    }

    fn begin(&mut self) -> Result<(), DownloadError> {
        self.image_version = self.engine.init_image_info()?;
        self.engine.set_mode(DeviceMode::Download)?;
        self.run_steps(main_steps(self.engine.config().chip))
    }

    fn finish(&mut self, status: Result<(), DownloadError>) -> Result<(), DownloadError> {
        match &status {
            Ok(()) if self.up_to_date => info!("Firmware already up to date"),
            Ok(()) => info!(attempts = self.attempts, "Firmware download complete"),
            Err(e) => warn!(error = %e, attempts = self.attempts, "Firmware download failed"),
        }
        match self.engine.set_mode(DeviceMode::Normal) {
            Ok(()) => status,
            Err(e) => {
                warn!(error = %e, "Switching to normal mode failed");
                status.and(Err(e))
            }
        }
    }

    /// Run `steps` in order, stopping at the first failure.
    fn run_steps(&mut self, steps: &[Step]) -> Result<(), DownloadError> {
        for &step in steps {
            debug!(step = %step, "Sequence step");
            if let Err(e) = self.step(step) {
                warn!(step = %step, error = %e, "Sequence step failed");
                return Err(e);
            }
        }
        Ok(())
    }

    fn step(&mut self, step: Step) -> Result<(), DownloadError> {
        match step {
            Step::Normal => self.normal(),
            Step::GetSessionState => self.get_session_state(),
            Step::GetVersion => self.get_version(),
            Step::LogRead => self.log_read(),
            Step::Write => self.write(),
            Step::Log => self.write_log(),
            Step::CheckIntegrity => self.check_integrity(),
            Step::Reset => self.reset(),
            Step::Force => self.force(),
            Step::Recover => self.recover(),
            Step::SendNciReset => self.send_nci_reset(),
        }
    }

    /// Start a command. The receiver yields its completion.
    fn start<F>(&mut self, start: F) -> Result<Receiver<Completion>, DownloadError>
    where
        F: FnOnce(&mut DownloadEngine<T, S, L, O>, CompletionFn) -> Result<(), DownloadError>,
    {
        let (tx, rx) = channel();
        start(
            &mut *self.engine,
            Box::new(move |c| {
                let _ = tx.send(c);
            }),
        )?;
        Ok(rx)
    }

    /// Block until the command in flight completes.
    fn wait(&mut self, rx: Receiver<Completion>) -> Result<Vec<u8>, DownloadError> {
        if !self.engine.wait_idle(self.options.step_limit) {
            warn!(limit = ?self.options.step_limit, "Command did not finish in time");
            return Err(DownloadError::Timeout);
        }
        let done = rx.try_recv().map_err(|_| Failure::Abandoned)?;
        done.result.map(|()| done.response)
    }

    fn exec<F>(&mut self, start: F) -> Result<Vec<u8>, DownloadError>
    where
        F: FnOnce(&mut DownloadEngine<T, S, L, O>, CompletionFn) -> Result<(), DownloadError>,
    {
        let rx = self.start(start)?;
        self.wait(rx)
    }

    /// Send Force with the clock configuration. Returns whether the
    /// controller accepted it; a rejected force does not stop the sequence.
    fn clock_force(&mut self) -> Result<bool, DownloadError> {
        if self.flags.recovery {
            self.attempts += 1;
        }
        let clock = self.options.clock;
        let rx = match self.start(|e, cb| e.force(clock, cb)) {
            Ok(rx) => rx,
            Err(e) => {
                self.flags.skip_force = false;
                self.flags.retry = false;
                return Err(e);
            }
        };
        match self.wait(rx) {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!(error = %e, "Force failed, continuing");
                Ok(false)
            }
        }
    }

    fn normal(&mut self) -> Result<(), DownloadError> {
        if self.flags.skip_force {
            return Ok(());
        }
        self.clock_force().map(drop)
    }

    fn get_session_state(&mut self) -> Result<(), DownloadError> {
        if self.flags.skip_seq {
            return Ok(());
        }
        let rsp = self.exec(|e, cb| e.get_session_state(vec![0; SESSION_STATE_LEN], cb))?;
        if rsp.len() != SESSION_STATE_LEN {
            return Err(bad_report("session state", format!("{} bytes", rsp.len())));
        }
        if rsp[2] != LIFE_CYCLE_OPERATIONAL {
            return Err(bad_report(
                "session state",
                format!("life cycle {} is not operational", rsp[2]),
            ));
        }

        self.flags.prev_session_open = rsp[0] == SESSION_OPEN;
        if self.flags.prev_session_open {
            warn!("Previous download session still open");
            if self.flags.initiated {
                self.flags.retry = self.attempts < self.options.max_attempts;
                return Err(bad_report(
                    "session state",
                    "session still open after the download".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn get_version(&mut self) -> Result<(), DownloadError> {
        if self.flags.skip_seq || self.flags.prev_session_open {
            return Ok(());
        }
        let rsp = self.exec(|e, cb| e.get_version(vec![0; VERSION_REPORT_LEN], cb))?;
        let Some(&hw) = rsp.first() else {
            return Err(bad_report("version", "empty".to_string()));
        };
        let hw = hw & 0x0F;
        let expected = version_report_len(hw)
            .ok_or_else(|| bad_report("version", format!("unknown chip version 0x{:02X}", hw)))?;
        self.chip_version = Some(hw);
        if rsp.len() != expected {
            warn!(len = rsp.len(), expected, "Version report length mismatch");
            return Ok(());
        }

        let current = FwVersion {
            major: rsp[expected - 1],
            minor: rsp[expected - 2],
        };
        let image = self.image_version.unwrap_or(FwVersion { major: 0, minor: 0 });
        info!(chip = %current, image = %image, rom = rsp[1], "Version check");

        if rsp[1] == ROM_VERSION_ES2_2 && image.major != 0x01 {
            warn!("Only major firmware version 1 runs on ES2.2 parts");
            return Err(DownloadError::FwVersionError);
        }
        if !self.flags.initiated {
            if image.major < current.major {
                warn!("Refusing to downgrade the major firmware version");
                return Err(DownloadError::FwVersionError);
            }
            if image == current {
                if self.options.force_download {
                    self.flags.force_dnld = true;
                } else {
                    info!("Firmware version already up to date");
                    self.flags.skip_seq = true;
                    self.up_to_date = true;
                }
            }
            return Ok(());
        }
        if image != current {
            return Err(Failure::VersionMismatch {
                expected: image,
                actual: current,
            }
            .into());
        }
        self.log.curr_mw_ver = self.options.mw_version;
        self.log.curr_fw_ver = (u16::from(current.major) << 8) | u16::from(current.minor);
        Ok(())
    }

    fn log_read(&mut self) -> Result<(), DownloadError> {
        let f = &self.flags;
        if ((f.skip_seq || f.force_dnld) && !f.prev_session_open)
            || (f.prev_session_open && f.retry)
        {
            return Ok(());
        }
        let rsp = self.exec(|e, cb| e.read_log(vec![0; DOWNLOAD_LOG_LEN], cb))?;
        self.log = DownloadLog::from_bytes(&rsp)
            .ok_or_else(|| bad_report("download log", format!("{} bytes", rsp.len())))?;
        debug!(log = ?self.log, "Download log read");
        Ok(())
    }

    fn write(&mut self) -> Result<(), DownloadError> {
        self.flags.retry = false;
        if self.flags.skip_seq && !self.flags.prev_session_open {
            return Ok(());
        }
        let counted = !self.flags.force_dnld;
        if counted {
            self.flags.initiated = true;
            self.attempts += 1;
            self.log.num_trig = self.log.num_trig.wrapping_add(1);
        }
        info!(attempt = self.attempts, forced = !counted, "Writing primary image");

        let rx = match self.start(|e, cb| e.write(false, None, cb)) {
            Ok(rx) => rx,
            Err(e) => {
                if counted {
                    self.log.record_failure();
                }
                return Err(e);
            }
        };

        match self.wait(rx) {
            Ok(_) => {
                if self.flags.initiated {
                    self.log.record_success();
                }
                Ok(())
            }
            Err(e) => {
                if self.flags.initiated {
                    self.log.record_failure();
                }
                if matches!(e, DownloadError::WriteFailed) {
                    self.flags.skip_seq = true;
                    self.flags.recovery = true;
                }
                Err(e)
            }
        }
    }

    fn write_log(&mut self) -> Result<(), DownloadError> {
        if (self.flags.skip_seq || self.flags.force_dnld) && !self.flags.initiated {
            return Ok(());
        }
        let record = self.log.to_bytes();
        self.exec(|e, cb| e.log(&record, cb))?;
        self.flags.initiated = false;
        Ok(())
    }

    fn check_integrity(&mut self) -> Result<(), DownloadError> {
        if self.flags.prev_session_open || self.flags.skip_seq {
            return Ok(());
        }
        let chip_version = self.chip_version.unwrap_or_default();
        let rsp = self.exec(|e, cb| {
            e.check_integrity(chip_version, vec![0; INTEGRITY_REPORT_LEN], cb)
        })?;
        if rsp.len() != INTEGRITY_REPORT_LEN {
            warn!(len = rsp.len(), "Integrity report length mismatch");
            return Ok(());
        }
        let Some(crc) = CrcStatus::from_report(&rsp) else {
            return Ok(());
        };
        self.integrity = Some(crc);
        if !crc.is_ok() {
            return Err(Failure::Integrity(crc).into());
        }
        info!(crc = %crc, "Integrity check passed");
        Ok(())
    }

    fn reset(&mut self) -> Result<(), DownloadError> {
        if self.flags.skip_reset {
            self.flags.skip_reset = false;
            return Ok(());
        }
        if self.flags.skip_seq {
            return Ok(());
        }
        self.exec(|e, cb| e.reset(cb)).map(drop)
    }

    fn force(&mut self) -> Result<(), DownloadError> {
        if self.flags.skip_force {
            return Ok(());
        }
        if self.clock_force()? {
            self.flags.recovery = false;
            self.flags.retry = true;
            self.flags.skip_reset = true;
        }
        Ok(())
    }

    fn recover(&mut self) -> Result<(), DownloadError> {
        if !self.flags.recovery {
            return Ok(());
        }
        self.attempts += 1;
        self.flags.recovery = false;
        info!(attempt = self.attempts, last_status = ?self.engine.last_status(), "Writing recovery image");

        let rx = match self.start(|e, cb| e.write(true, None, cb)) {
            Ok(rx) => rx,
            Err(e) => {
                self.flags.skip_force = false;
                self.flags.retry = false;
                return Err(e);
            }
        };
        let result = self.wait(rx);
        if result.is_ok() {
            if self.flags.skip_force {
                self.flags.send_nci = true;
            } else {
                self.flags.retry = true;
            }
        }
        self.flags.skip_force = false;
        result.map(drop)
    }

    fn send_nci_reset(&mut self) -> Result<(), DownloadError> {
        if !std::mem::take(&mut self.flags.send_nci) {
            return Ok(());
        }
        if let Err(e) = self.engine.set_mode(DeviceMode::Normal) {
            self.flags.retry = false;
            return Err(e);
        }
        let rsp = self.exec(|e, cb| {
            e.raw_request(
                &NCI_CORE_RESET_KEEP_CONFIG,
                vec![0; NCI_CORE_RESET_RSP_LEN],
                cb,
            )
        })?;
        match rsp.get(3) {
            Some(0x00) => info!("NCI core reset accepted"),
            other => warn!(status = ?other, "NCI core reset not accepted"),
        }
        match self.engine.set_mode(DeviceMode::Download) {
            Ok(()) => {
                self.flags.retry = true;
                Ok(())
            }
            Err(e) => {
                self.flags.retry = false;
                Err(e)
            }
        }
    }
}

fn bad_report(what: &'static str, detail: String) -> DownloadError {
    Failure::BadReport { what, detail }.into()
}
