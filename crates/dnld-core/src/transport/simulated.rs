//! Simulated PN54x bootloader.
//!
//! Decodes every frame the engine writes and answers the way the download-mode
//! firmware does: fixed-shape commands get a status plus payload, read and log
//! commands operate on a sparse memory map, and segmented write records are
//! acknowledged fragment by fragment. Faults can be injected to exercise the
//! busy, PLL, signature, integrity and timeout paths.
//!
//! The download session counts as open while a write is interrupted: from
//! the first fragment of a record until the record commits, and after a
//! write fault until the next reset. The first record of every write burst
//! carries the firmware version the chip reports afterwards.
//!
//! In normal mode the model only understands the NCI core reset.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, trace};

use super::traits::{DeviceMode, Transport, TransportError};
use crate::dispatch::{ReadCompletion, WriteCompletion};
use crate::protocol::constants::*;
use crate::protocol::frame::{self, FrameBuffer};
use crate::protocol::integrity::{CrcRegion, CrcStatus};
use crate::protocol::status::DlStatus;

/// Identity reported by the simulated chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipIdentity {
    pub hw_version: u8,
    pub rom_version: u8,
    pub fw_major: u8,
    pub fw_minor: u8,
}

impl Default for ChipIdentity {
    fn default() -> Self {
        Self {
            hw_version: HW_VERSION_PN548AD_MRA1_0,
            rom_version: 0x10,
            fw_major: 0x01,
            fw_minor: 0x00,
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    identity: ChipIdentity,
    memory: HashMap<u32, u8>,
    session_open: bool,
    /// Previous frame was a write record; the next one continues the burst.
    in_burst: bool,
    records_written: usize,
    /// Regions reported with a CRC mismatch.
    corrupt: u8,
    /// Body bytes of the record currently being reassembled.
    partial_record: Option<Vec<u8>>,
    /// Statuses forced onto upcoming write/read/log frames.
    injected: VecDeque<DlStatus>,
    /// Statuses forced onto upcoming write records only.
    write_faults: VecDeque<DlStatus>,
    normal_mode: bool,
    silent: bool,
    outbox: VecDeque<Vec<u8>>,
    pending_read: Option<ReadCompletion>,
    write_log: Vec<Vec<u8>>,
    mode_log: Vec<DeviceMode>,
}

/// Transport that talks to an in-process model of the bootloader.
#[derive(Clone, Default)]
pub struct SimulatedController {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedController {
    pub fn new(identity: ChipIdentity) -> Self {
        let sim = Self::default();
        sim.state.lock().unwrap().identity = identity;
        sim
    }

    /// Answer the next `count` data frames with `status` instead of processing them.
    pub fn inject_status(&self, status: DlStatus, count: usize) {
        let mut st = self.state.lock().unwrap();
        for _ in 0..count {
            st.injected.push_back(status);
        }
    }

    /// Answer the next `count` write records with `status`, leaving reads
    /// and log commands alone.
    pub fn inject_write_status(&self, status: DlStatus, count: usize) {
        let mut st = self.state.lock().unwrap();
        for _ in 0..count {
            st.write_faults.push_back(status);
        }
    }

    /// Stop (or resume) answering frames.
    pub fn set_silent(&self, silent: bool) {
        self.state.lock().unwrap().silent = silent;
    }

    /// Preload memory at `addr`.
    pub fn poke(&self, addr: u32, data: &[u8]) {
        let mut st = self.state.lock().unwrap();
        for (i, &b) in data.iter().enumerate() {
            st.memory.insert(addr.wrapping_add(i as u32), b);
        }
    }

    /// Read back simulated memory; unprogrammed cells read as 0xFF.
    pub fn peek(&self, addr: u32, len: usize) -> Vec<u8> {
        let st = self.state.lock().unwrap();
        (0..len)
            .map(|i| *st.memory.get(&addr.wrapping_add(i as u32)).unwrap_or(&0xFF))
            .collect()
    }

    /// Report a CRC mismatch for `region` in every integrity check.
    pub fn corrupt_region(&self, region: CrcRegion) {
        self.state.lock().unwrap().corrupt |= region.mask();
    }

    /// Leave a download session open, as an interrupted update would.
    pub fn set_session_open(&self, open: bool) {
        self.state.lock().unwrap().session_open = open;
    }

    pub fn identity(&self) -> ChipIdentity {
        self.state.lock().unwrap().identity
    }

    /// Number of complete write records accepted.
    pub fn records_written(&self) -> usize {
        self.state.lock().unwrap().records_written
    }

    pub fn session_open(&self) -> bool {
        self.state.lock().unwrap().session_open
    }

    /// All frames received from the host.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().write_log.clone()
    }

    pub fn get_modes(&self) -> Vec<DeviceMode> {
        self.state.lock().unwrap().mode_log.clone()
    }
}

impl SimState {
    fn respond(&mut self, status: DlStatus, payload: &[u8]) {
        let mut buf = FrameBuffer::new();
        match buf.encode(status.as_byte(), payload, false) {
            Ok(()) => self.outbox.push_back(buf.as_bytes().to_vec()),
            Err(e) => debug!(error = %e, "Simulated response dropped"),
        }
    }

    fn deliver(&mut self) {
        if self.pending_read.is_none() {
            return;
        }
        if let Some(bytes) = self.outbox.pop_front()
            && let Some(done) = self.pending_read.take()
        {
            done.complete(Ok(bytes));
        }
    }

    fn handle_frame(&mut self, raw: &[u8]) {
        if self.silent {
            trace!(len = raw.len(), "Simulator silent, frame ignored");
            return;
        }
        if self.normal_mode {
            self.handle_nci(raw);
            return;
        }
        let frame = match frame::decode(raw) {
            Ok(f) => f,
            Err(e) => {
                debug!(error = %e, "Simulator received malformed frame");
                self.respond(DlStatus::ProtocolError, &[]);
                return;
            }
        };

        // An open record only accepts its own continuation fragments
        if let Some(mut body) = self.partial_record.take() {
            if let Some(status) = self.injected.pop_front() {
                self.partial_record = Some(body);
                self.respond(status, &[]);
                return;
            }
            body.push(frame.code);
            body.extend_from_slice(frame.payload);
            if frame.more {
                self.partial_record = Some(body);
                self.respond(DlStatus::NextChunkAck, &[]);
            } else {
                self.commit_record(&body);
            }
            return;
        }

        let code = frame.code;
        let first_in_burst = code == CMD_WRITE && !self.in_burst;
        self.in_burst = code == CMD_WRITE;
        let injected = match code {
            CMD_WRITE => self
                .write_faults
                .pop_front()
                .or_else(|| self.injected.pop_front()),
            CMD_READ | CMD_LOG => self.injected.pop_front(),
            _ => None,
        };
        if let Some(status) = injected {
            if code == CMD_WRITE && status != DlStatus::MemBusy {
                self.session_open = true;
            }
            // A resent first record still opens the burst
            if code == CMD_WRITE && (status != DlStatus::MemBusy || first_in_burst) {
                self.in_burst = false;
            }
            self.respond(status, &[]);
            return;
        }

        match code {
            CMD_RESET => {
                self.session_open = false;
                self.respond(DlStatus::Ok, &[]);
            }
            CMD_GET_VERSION => {
                let id = self.identity;
                let len = version_report_len(id.hw_version & 0x0F).unwrap_or(VERSION_REPORT_LEN);
                let mut report = vec![0u8; len];
                report[0] = id.hw_version;
                report[1] = id.rom_version;
                report[len - 2] = id.fw_minor;
                report[len - 1] = id.fw_major;
                self.respond(DlStatus::Ok, &report);
            }
            CMD_GET_SESSION_STATE => {
                let open = u8::from(self.session_open);
                self.respond(DlStatus::Ok, &[open, 0x00, LIFE_CYCLE_OPERATIONAL]);
            }
            CMD_CHECK_INTEGRITY => {
                let mut report = [0u8; INTEGRITY_REPORT_LEN];
                report[0] = CrcStatus::ALL_OK & !self.corrupt;
                self.respond(DlStatus::Ok, &report);
            }
            CMD_READ => self.handle_read(frame.payload),
            CMD_LOG => {
                let data = frame.payload.get(3..).unwrap_or(&[]);
                for (i, &b) in data.iter().enumerate() {
                    self.memory.insert(EEPROM_LOG_START + i as u32, b);
                }
                self.respond(DlStatus::Ok, &[]);
            }
            CMD_FORCE => self.respond(DlStatus::Ok, &[]),
            CMD_WRITE => {
                self.session_open = true;
                let mut body = vec![code];
                body.extend_from_slice(frame.payload);
                if first_in_burst
                    && let (Some(&minor), Some(&major)) = (body.get(2), body.get(3))
                {
                    self.identity.fw_minor = minor;
                    self.identity.fw_major = major;
                }
                if frame.more {
                    self.partial_record = Some(body);
                    self.respond(DlStatus::FirstChunkAck, &[]);
                } else {
                    self.commit_record(&body);
                }
            }
            _ => self.respond(DlStatus::UnknownCmd, &[]),
        }
    }

    fn handle_nci(&mut self, raw: &[u8]) {
        if raw.starts_with(&NCI_CORE_RESET_KEEP_CONFIG[..2]) {
            // CORE_RESET_RSP: OK, NCI 1.1, configuration kept
            self.outbox.push_back(vec![0x40, 0x00, 0x03, 0x00, 0x11, 0x01]);
        } else {
            debug!(len = raw.len(), "Simulator ignored NCI packet");
        }
    }

    fn handle_read(&mut self, payload: &[u8]) {
        // payload: [0] [len LE16] [addr LE32]
        if payload.len() < 7 {
            self.respond(DlStatus::ProtocolError, &[]);
            return;
        }
        let len = LittleEndian::read_u16(&payload[1..3]);
        let addr = LittleEndian::read_u32(&payload[3..7]);
        if len as usize > MAX_READ_PER_FRAME {
            self.respond(DlStatus::BufferOverflow, &[]);
            return;
        }
        let mut rsp = vec![0u8; 3 + len as usize];
        LittleEndian::write_u16(&mut rsp[1..3], len);
        for i in 0..len as u32 {
            let Some(cell) = addr.checked_add(i) else {
                debug!(addr, len, "Simulated read past the end of the address space");
                self.respond(DlStatus::AddrRangeOverflow, &[]);
                return;
            };
            rsp[3 + i as usize] = *self.memory.get(&cell).unwrap_or(&0xFF);
        }
        self.respond(DlStatus::Ok, &rsp);
    }

    fn commit_record(&mut self, body: &[u8]) {
        self.records_written += 1;
        self.session_open = false;
        trace!(
            record = self.records_written,
            len = body.len(),
            "Simulator committed record"
        );
        self.respond(DlStatus::Ok, &[]);
    }
}

impl Transport for SimulatedController {
    fn write(&self, frame: &[u8], done: WriteCompletion) -> Result<(), TransportError> {
        let mut st = self.state.lock().unwrap();
        st.write_log.push(frame.to_vec());
        st.handle_frame(frame);
        done.complete(Ok(()));
        st.deliver();
        Ok(())
    }

    fn read(&self, _max_len: usize, done: ReadCompletion) -> Result<(), TransportError> {
        let mut st = self.state.lock().unwrap();
        if st.pending_read.is_some() {
            return Err(TransportError::ReadPending);
        }
        st.pending_read = Some(done);
        st.deliver();
        Ok(())
    }

    fn abort_read(&self) {
        self.state.lock().unwrap().pending_read.take();
    }

    fn set_mode(&self, mode: DeviceMode) -> Result<(), TransportError> {
        let mut st = self.state.lock().unwrap();
        st.mode_log.push(mode);
        st.normal_mode = mode == DeviceMode::Normal;
        st.partial_record = None;
        st.in_burst = false;
        st.outbox.clear();
        Ok(())
    }
}
