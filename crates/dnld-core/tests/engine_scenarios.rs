//! End-to-end command sessions against the mock transport and the simulator.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dnld_core::config::EngineConfig;
use dnld_core::engine::{Completion, DownloadEngine};
use dnld_core::error::{DownloadError, Failure};
use dnld_core::events::{DnldEvent, RecordingObserver};
use dnld_core::image::{FirmwareImage, FwVersion, ImageKind, StaticImageLoader};
use dnld_core::protocol::{ClockFrequency, ClockSource, DlStatus, FRAG_BIT, encode};
use dnld_core::state::{Command, SessionState, TimerPurpose};
use dnld_core::timer::{ManualTimerService, ThreadTimerService};
use dnld_core::transport::{
    ChipIdentity, DeviceMode, MockTransport, SimulatedController, WriteBehavior,
};

type MockEngine =
    DownloadEngine<MockTransport, ManualTimerService, StaticImageLoader, RecordingObserver>;

const RESPONSE_TIMEOUT: Duration = Duration::from_millis(2500);
const RESEND_WAIT: Duration = Duration::from_millis(50);

/// Shared sink for completions.
#[derive(Clone, Default)]
struct Completions(Arc<Mutex<Vec<Completion>>>);

impl Completions {
    fn callback(&self) -> impl FnOnce(Completion) + Send + 'static {
        let sink = Arc::clone(&self.0);
        move |c| sink.lock().unwrap().push(c)
    }

    fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    fn take_one(&self) -> Completion {
        let mut all = self.0.lock().unwrap();
        assert_eq!(all.len(), 1, "expected exactly one completion");
        all.remove(0)
    }
}

fn record(tag: u8, len: usize) -> Vec<u8> {
    let mut body = vec![tag; len];
    body[0] = 0xC0;
    body
}

fn image(records: &[Vec<u8>]) -> FirmwareImage {
    FirmwareImage::from_records(records.iter().map(Vec::as_slice)).unwrap()
}

fn loader() -> StaticImageLoader {
    // Version bytes: image[4] = minor, image[5] = major
    let mut primary = record(0x11, 8);
    primary[2] = 0x1A;
    primary[3] = 0x08;
    StaticImageLoader::new()
        .with_image(ImageKind::Primary, image(&[primary]))
        .with_image(ImageKind::PlatformRecovery, image(&[record(0x22, 8)]))
        .with_image(ImageKind::ProductionKey, image(&[record(0x33, 8)]))
}

fn mock_engine(
    config: EngineConfig,
) -> (MockEngine, MockTransport, ManualTimerService, Arc<RecordingObserver>) {
    let mock = MockTransport::new();
    let timers = ManualTimerService::new();
    let observer = Arc::new(RecordingObserver::new());
    let engine = DownloadEngine::with_observer(
        mock.clone(),
        timers.clone(),
        loader(),
        config,
        Arc::clone(&observer),
    );
    (engine, mock, timers, observer)
}

#[test]
fn test_get_version_pending_then_complete() {
    let (mut engine, mock, timers, _) = mock_engine(EngineConfig::default());
    let done = Completions::default();
    let report = [0x18, 0x10, 0x00, 0x00, 0x00, 0x00, 0x1A, 0x08];
    mock.queue_status(0x00, &report);

    engine.get_version(vec![0; 8], done.callback()).unwrap();
    assert!(engine.is_busy());
    assert_eq!(done.len(), 0);

    engine.dispatch();
    let c = done.take_one();
    assert_eq!(c.command, Command::GetVersion);
    assert!(c.result.is_ok());
    assert_eq!(c.response, report);

    assert_eq!(
        mock.get_writes(),
        vec![vec![0x00, 0x04, 0xF1, 0x00, 0x00, 0x00, 0x6E, 0xEF]]
    );
    assert!(!engine.is_busy());
    assert_eq!(engine.state(), SessionState::Init);
    assert_eq!(timers.live_timers(), 0);
}

#[test]
fn test_reset_timeout_is_success() {
    let (mut engine, mock, timers, _) = mock_engine(EngineConfig::default());
    let done = Completions::default();

    engine.reset(done.callback()).unwrap();
    engine.dispatch();
    assert!(mock.has_pending_read());
    assert_eq!(engine.state(), SessionState::Timer);
    assert!(engine.context().timer.running);
    assert_eq!(engine.context().timer.purpose, TimerPurpose::Response);
    assert_eq!(done.len(), 0);

    assert_eq!(timers.fire_next(), Some(RESPONSE_TIMEOUT));
    engine.dispatch();

    let c = done.take_one();
    assert_eq!(c.command, Command::Reset);
    assert!(c.result.is_ok());
    assert!(!mock.has_pending_read());
    assert_eq!(timers.live_timers(), 0);
    assert!(mock.get_modes().is_empty());
}

#[test]
fn test_get_version_timeout() {
    let (mut engine, _mock, timers, observer) = mock_engine(EngineConfig::default());
    let done = Completions::default();

    engine.get_version(vec![0; 8], done.callback()).unwrap();
    engine.dispatch();
    timers.fire_next();
    engine.dispatch();

    let c = done.take_one();
    assert!(matches!(c.result, Err(DownloadError::Timeout)));
    assert!(c.response.is_empty());
    assert!(
        observer
            .events()
            .iter()
            .any(|e| matches!(e, DnldEvent::Timeout { command: Command::GetVersion }))
    );
}

#[test]
fn test_busy_resends_identical_frame() {
    let (mut engine, mock, timers, observer) = mock_engine(EngineConfig::default());
    let done = Completions::default();
    let data = image(&[record(0x44, 20)]);
    let busy = 3;

    mock.queue_status_n(0x20, busy);
    mock.queue_status(0x00, &[]);
    engine.write(false, Some(data.bytes()), done.callback()).unwrap();

    for _ in 0..busy {
        engine.dispatch();
        assert_eq!(engine.rw_info().remaining, data.len());
        assert_eq!(timers.armed().len(), 1);
        assert_eq!(timers.fire_next(), Some(RESEND_WAIT));
    }
    engine.dispatch();

    let c = done.take_one();
    assert!(c.result.is_ok(), "{:?}", c.result);

    let writes = mock.get_writes();
    assert_eq!(writes.len(), busy + 1);
    assert!(writes.iter().all(|w| w == &writes[0]));
    assert_eq!(
        timers.start_history(),
        vec![
            RESPONSE_TIMEOUT,
            RESEND_WAIT,
            RESPONSE_TIMEOUT,
            RESEND_WAIT,
            RESPONSE_TIMEOUT,
            RESEND_WAIT,
            RESPONSE_TIMEOUT
        ]
    );
    let resends = observer
        .events()
        .iter()
        .filter(|e| matches!(e, DnldEvent::Resend { .. }))
        .count();
    assert_eq!(resends, busy);
    assert_eq!(engine.last_status(), Some(DlStatus::MemBusy));
}

#[test]
fn test_multi_record_write_aborts_read_once() {
    let (mut engine, mock, timers, _) = mock_engine(EngineConfig::default());
    let done = Completions::default();
    let data = image(&[record(0x01, 20), record(0x02, 30), record(0x03, 40)]);

    mock.queue_status_n(0x00, 3);
    engine.write(false, Some(data.bytes()), done.callback()).unwrap();
    engine.dispatch();

    assert!(done.take_one().result.is_ok());
    assert_eq!(mock.get_writes().len(), 3);
    // Only the final teardown aborts, completed reads are left alone
    assert_eq!(mock.abort_count(), 1);
    assert_eq!(timers.live_timers(), 0);
}

#[test]
fn test_resend_limit() {
    let config = EngineConfig {
        resend_limit: Some(2),
        ..Default::default()
    };
    let (mut engine, mock, timers, _) = mock_engine(config);
    assert_eq!(engine.config().resend_limit, Some(2));
    let done = Completions::default();
    mock.queue_status_n(0x20, 5);

    engine.write(false, None, done.callback()).unwrap();
    engine.dispatch();
    while timers.fire_next().is_some() {
        engine.dispatch();
    }

    let c = done.take_one();
    assert!(matches!(
        c.result,
        Err(DownloadError::Failed(Failure::ResendLimit(2)))
    ));
    assert_eq!(mock.get_writes().len(), 3);
    assert_eq!(mock.queued_responses(), 2);
}

#[test]
fn test_single_flight() {
    let (mut engine, mock, _timers, _) = mock_engine(EngineConfig::default());
    let done = Completions::default();
    let second = Completions::default();

    engine.write(false, None, done.callback()).unwrap();
    engine.dispatch();
    assert!(engine.is_busy());

    let rw = engine.rw_info().clone();
    let last_status = engine.last_status();
    let frame = engine.last_frame().to_vec();

    assert!(matches!(
        engine.get_version(vec![0; 8], second.callback()),
        Err(DownloadError::Busy)
    ));
    // Busy is reported before argument validation
    assert!(matches!(engine.log(&[], second.callback()), Err(DownloadError::Busy)));
    assert!(matches!(
        engine.write(true, None, second.callback()),
        Err(DownloadError::Busy)
    ));
    assert!(matches!(engine.reset(second.callback()), Err(DownloadError::Busy)));

    assert_eq!(engine.rw_info(), &rw);
    assert_eq!(engine.last_status(), last_status);
    assert_eq!(engine.last_frame(), frame.as_slice());
    assert_eq!(mock.get_writes().len(), 1);

    mock.queue_status(0x00, &[]);
    engine.dispatch();
    assert!(done.take_one().result.is_ok());
    assert_eq!(second.len(), 0);
}

#[test]
fn test_recovery_after_signature_error() {
    let (mut engine, mock, timers, _) = mock_engine(EngineConfig::default());
    let done = Completions::default();

    mock.queue_status(0x21, &[]);
    engine.write(false, None, done.callback()).unwrap();
    engine.dispatch();
    assert!(matches!(done.take_one().result, Err(DownloadError::Rejected)));
    assert_eq!(engine.last_status(), Some(DlStatus::SignatureError));

    // First frame of the primary image
    assert_eq!(mock.get_writes()[0][2..5], [0xC0, 0x11, 0x1A]);
    mock.clear_writes();

    let done = Completions::default();
    mock.queue_status(0x00, &[]);
    engine.write(true, None, done.callback()).unwrap();
    engine.dispatch();
    assert!(done.take_one().result.is_ok());
    assert_eq!(mock.get_writes()[0][2..5], [0xC0, 0x33, 0x33]);
    assert_eq!(timers.live_timers(), 0);
}

#[test]
fn test_recovery_after_pll_error() {
    let (mut engine, mock, _timers, _) = mock_engine(EngineConfig::default());
    let done = Completions::default();

    mock.queue_status(0x0D, &[]);
    engine.write(false, None, done.callback()).unwrap();
    engine.dispatch();
    assert!(matches!(done.take_one().result, Err(DownloadError::WriteFailed)));
    mock.clear_writes();

    let done = Completions::default();
    mock.queue_status(0x00, &[]);
    engine.write(true, None, done.callback()).unwrap();
    engine.dispatch();
    assert!(done.take_one().result.is_ok());
    assert_eq!(mock.get_writes()[0][2..5], [0xC0, 0x22, 0x22]);
}

#[test]
fn test_recovery_without_failure_uses_primary() {
    let (mut engine, mock, _timers, _) = mock_engine(EngineConfig::default());
    let done = Completions::default();
    mock.queue_status(0x00, &[]);

    engine.write(true, None, done.callback()).unwrap();
    engine.dispatch();
    assert!(done.take_one().result.is_ok());
    assert_eq!(mock.get_writes()[0][2..4], [0xC0, 0x11]);
}

#[test]
fn test_explicit_buffer_wins_over_recovery() {
    let (mut engine, mock, _timers, _) = mock_engine(EngineConfig::default());
    let done = Completions::default();
    mock.queue_status(0x21, &[]);
    engine.write(false, None, done.callback()).unwrap();
    engine.dispatch();
    done.take_one();
    mock.clear_writes();

    let explicit = image(&[record(0x55, 4)]);
    mock.queue_status(0x00, &[]);
    engine
        .write(true, Some(explicit.bytes()), done.callback())
        .unwrap();
    engine.dispatch();
    assert!(done.take_one().result.is_ok());
    assert_eq!(mock.get_writes()[0][2..4], [0xC0, 0x55]);
}

#[test]
fn test_ven_reset_on_timeout_after_signature_error() {
    let (mut engine, mock, timers, observer) = mock_engine(EngineConfig::default());
    let done = Completions::default();

    mock.queue_status(0x21, &[]);
    engine.write(false, None, done.callback()).unwrap();
    engine.dispatch();
    done.take_one();

    engine.get_version(vec![0; 8], done.callback()).unwrap();
    engine.dispatch();
    timers.fire_next();
    engine.dispatch();

    assert!(matches!(done.take_one().result, Err(DownloadError::Timeout)));
    assert_eq!(mock.get_modes(), vec![DeviceMode::Normal, DeviceMode::Download]);
    let ven_resets = observer
        .events()
        .iter()
        .filter(|e| matches!(e, DnldEvent::VenReset))
        .count();
    assert_eq!(ven_resets, 1);
}

#[test]
fn test_ven_reset_can_be_disabled() {
    let config = EngineConfig {
        ven_reset_on_timeout: false,
        ..Default::default()
    };
    let (mut engine, mock, timers, _) = mock_engine(config);
    let done = Completions::default();

    mock.queue_status(0x21, &[]);
    engine.write(false, None, done.callback()).unwrap();
    engine.dispatch();
    done.take_one();

    engine.reset(done.callback()).unwrap();
    engine.dispatch();
    timers.fire_next();
    engine.dispatch();
    assert!(done.take_one().result.is_ok());
    assert!(mock.get_modes().is_empty());
}

#[test]
fn test_firmware_version_error() {
    let (mut engine, mock, _timers, _) = mock_engine(EngineConfig::default());
    let done = Completions::default();
    mock.queue_status(0x24, &[]);

    engine.write(false, None, done.callback()).unwrap();
    engine.dispatch();
    assert!(matches!(done.take_one().result, Err(DownloadError::FwVersionError)));
}

#[test]
fn test_invalid_parameters() {
    let (mut engine, mock, timers, _) = mock_engine(EngineConfig::default());
    let done = Completions::default();

    let invalid = |r: Result<(), DownloadError>| matches!(r, Err(DownloadError::InvalidParameter(_)));
    assert!(invalid(engine.get_version(Vec::new(), done.callback())));
    assert!(invalid(engine.get_session_state(Vec::new(), done.callback())));
    assert!(invalid(engine.check_integrity(0x08, Vec::new(), done.callback())));
    assert!(invalid(engine.read(0x1000, Vec::new(), done.callback())));
    assert!(invalid(engine.read_log(Vec::new(), done.callback())));
    assert!(invalid(engine.log(&[], done.callback())));
    assert!(invalid(engine.log(&[0; 65], done.callback())));
    assert!(invalid(engine.raw_request(&[], vec![0; 8], done.callback())));
    assert!(invalid(engine.raw_request(&[0xF1], Vec::new(), done.callback())));
    assert!(invalid(engine.write(false, Some(Arc::from(Vec::new())), done.callback())));
    assert!(invalid(engine.write(
        false,
        Some(Arc::from(vec![0x00, 0x01, 0xA2])),
        done.callback()
    )));

    assert!(!engine.is_busy());
    assert!(mock.get_writes().is_empty());
    assert_eq!(timers.live_timers(), 0);
    assert_eq!(done.len(), 0);
}

#[test]
fn test_synchronous_start_failures() {
    let (mut engine, mock, timers, _) = mock_engine(EngineConfig::default());
    let done = Completions::default();

    timers.set_fail_create(true);
    assert!(matches!(
        engine.reset(done.callback()),
        Err(DownloadError::Failed(Failure::Timer(_)))
    ));
    assert!(!engine.is_busy());
    timers.set_fail_create(false);

    mock.set_write_behavior(WriteBehavior::Reject);
    assert!(matches!(
        engine.get_version(vec![0; 8], done.callback()),
        Err(DownloadError::Failed(Failure::Transport(_)))
    ));
    assert!(!engine.is_busy());
    assert_eq!(timers.live_timers(), 0);

    engine.dispatch();
    assert_eq!(done.len(), 0);
}

#[test]
fn test_async_write_failure() {
    let (mut engine, mock, timers, _) = mock_engine(EngineConfig::default());
    let done = Completions::default();
    mock.set_write_behavior(WriteBehavior::FailAsync);

    engine.get_version(vec![0; 8], done.callback()).unwrap();
    engine.dispatch();
    assert!(matches!(
        done.take_one().result,
        Err(DownloadError::Failed(Failure::Transport(_)))
    ));
    assert_eq!(timers.live_timers(), 0);
}

#[test]
fn test_unknown_image_fails_synchronously() {
    let mock = MockTransport::new();
    let mut engine = DownloadEngine::new(
        mock.clone(),
        ManualTimerService::new(),
        StaticImageLoader::new(),
        EngineConfig::default(),
    );
    let done = Completions::default();
    assert!(matches!(
        engine.write(false, None, done.callback()),
        Err(DownloadError::Failed(Failure::Image(_)))
    ));
    assert!(engine.init_image_info().is_err());
    assert!(mock.get_writes().is_empty());
}

#[test]
fn test_init_image_info_reports_version() {
    let (mut engine, _mock, _timers, _) = mock_engine(EngineConfig::default());
    let version = engine.init_image_info().unwrap();
    assert_eq!(
        version,
        Some(FwVersion {
            major: 0x08,
            minor: 0x1A
        })
    );
    assert_eq!(engine.primary_version(), version);
}

#[test]
fn test_fixed_frame_shapes() {
    let (mut engine, mock, _timers, _) = mock_engine(EngineConfig::default());
    let done = Completions::default();

    mock.queue_status_n(0x00, 4);
    engine.force(None, done.callback()).unwrap();
    engine.dispatch();
    engine
        .force(Some(ClockSource::Pll(ClockFrequency::Mhz26)), done.callback())
        .unwrap();
    engine.dispatch();
    engine.log(&[0xAB, 0xCD], done.callback()).unwrap();
    engine.dispatch();
    mock.queue_status(0x00, &[0u8; 31]);
    engine.check_integrity(0x02, vec![0; 32], done.callback()).unwrap();
    engine.dispatch();
    engine.check_integrity(0x08, vec![0; 32], done.callback()).unwrap();
    engine.dispatch();

    let writes = mock.get_writes();
    assert_eq!(writes[0], encode(0xD0, &[0x11, 0x00, 0x00], false).unwrap());
    assert_eq!(writes[1], encode(0xD0, &[0x13, 0x00, 0x00], false).unwrap());
    assert_eq!(writes[2], encode(0xA7, &[0, 0, 0, 0xAB, 0xCD], false).unwrap());
    assert_eq!(writes[3], encode(0xE0, &[0, 0, 0], false).unwrap());
    assert_eq!(
        writes[4],
        encode(0xE0, &[0, 0, 0, 0xBC, 0x02, 0x00, 0x0C], false).unwrap()
    );

    let all = done.0.lock().unwrap();
    assert_eq!(all.len(), 5);
    assert!(all.iter().all(|c| c.result.is_ok()));
    assert_eq!(all[3].response.len(), 0);
    assert_eq!(all[4].response.len(), 31);
    assert!(!engine.is_busy());
}

#[test]
fn test_raw_request_round_trip() {
    let (mut engine, mock, _timers, _) = mock_engine(EngineConfig::default());
    let done = Completions::default();
    let request = encode(0xF2, &[0, 0, 0], false).unwrap();
    let response = encode(0x00, &[0x01, 0x00, 0x11], false).unwrap();
    mock.queue_response(&response);

    engine.raw_request(&request, vec![0; 64], done.callback()).unwrap();
    engine.dispatch();

    let c = done.take_one();
    assert!(c.result.is_ok());
    assert_eq!(c.response, response);
    assert_eq!(mock.get_writes(), vec![request]);
}

#[test]
fn test_drop_releases_session() {
    let (mut engine, mock, timers, _) = mock_engine(EngineConfig::default());
    let done = Completions::default();
    engine.get_version(vec![0; 8], done.callback()).unwrap();
    engine.dispatch();
    assert!(mock.has_pending_read());
    assert_eq!(timers.live_timers(), 1);

    drop(engine);
    assert!(!mock.has_pending_read());
    assert_eq!(timers.live_timers(), 0);
    assert_eq!(done.len(), 0);
}

#[test]
fn test_observer_sees_session() {
    let (mut engine, mock, _timers, observer) = mock_engine(EngineConfig::default());
    let done = Completions::default();
    mock.queue_status(0x00, &[]);
    engine.reset(done.callback()).unwrap();
    engine.dispatch();

    let events = observer.events();
    assert!(matches!(
        events.first(),
        Some(DnldEvent::CommandStarted { command: Command::Reset })
    ));
    assert!(matches!(
        events.last(),
        Some(DnldEvent::Finished {
            command: Command::Reset,
            error: None
        })
    ));
    let states: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            DnldEvent::StateChanged { to, .. } => Some(*to),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            SessionState::Send,
            SessionState::Recv,
            SessionState::Timer,
            SessionState::Response,
            SessionState::Init
        ]
    );
}

// ============================================================================
// Simulated controller
// ============================================================================

fn sim_engine(
    sim: &SimulatedController,
) -> DownloadEngine<SimulatedController, ManualTimerService, StaticImageLoader> {
    DownloadEngine::new(
        sim.clone(),
        ManualTimerService::new(),
        loader(),
        EngineConfig::default(),
    )
}

#[test]
fn test_segmented_write_against_simulator() {
    let sim = SimulatedController::new(ChipIdentity::default());
    let mut engine = sim_engine(&sim);
    let done = Completions::default();
    let data = image(&[record(0x01, 10), record(0x02, 600), record(0x03, 300)]);

    engine.write(false, Some(data.bytes()), done.callback()).unwrap();
    engine.dispatch();

    assert!(done.take_one().result.is_ok());
    assert_eq!(sim.records_written(), 3);
    let writes = sim.get_writes();
    assert_eq!(writes.len(), 1 + 3 + 2);
    let fragmented = writes
        .iter()
        .filter(|w| u16::from_be_bytes([w[0], w[1]]) & FRAG_BIT != 0)
        .count();
    assert_eq!(fragmented, 2 + 1);
    assert!(!sim.session_open());
    // The first record announces the new firmware version
    assert_eq!(sim.identity().fw_minor, 0x01);
    assert_eq!(sim.identity().fw_major, 0x01);
}

#[test]
fn test_busy_then_segmented_write_against_simulator() {
    let sim = SimulatedController::new(ChipIdentity::default());
    let timers = ManualTimerService::new();
    let mut engine = DownloadEngine::new(
        sim.clone(),
        timers.clone(),
        loader(),
        EngineConfig::default(),
    );
    let done = Completions::default();
    let data = image(&[record(0x02, 600)]);

    sim.inject_status(DlStatus::MemBusy, 1);
    engine.write(false, Some(data.bytes()), done.callback()).unwrap();
    engine.dispatch();
    assert!(engine.is_busy());
    assert_eq!(engine.rw_info().remaining, data.len());

    assert_eq!(timers.fire_next(), Some(RESEND_WAIT));
    engine.dispatch();
    assert!(done.take_one().result.is_ok());
    assert_eq!(sim.records_written(), 1);

    let writes = sim.get_writes();
    assert_eq!(writes.len(), 1 + 3);
    assert_eq!(writes[0], writes[1]);
}

#[test]
fn test_multi_frame_read_against_simulator() {
    let sim = SimulatedController::new(ChipIdentity::default());
    let mut engine = sim_engine(&sim);
    let done = Completions::default();
    let contents: Vec<u8> = (0..600u32).map(|i| (i * 7) as u8).collect();
    sim.poke(0x0001_0000, &contents);

    engine.read(0x0001_0000, vec![0; 600], done.callback()).unwrap();
    engine.dispatch();

    let c = done.take_one();
    assert!(c.result.is_ok(), "{:?}", c.result);
    assert_eq!(c.response, contents);
    assert_eq!(sim.get_writes().len(), 3);
}

#[test]
fn test_read_past_address_space_end() {
    let sim = SimulatedController::default();
    let mut engine = sim_engine(&sim);
    let done = Completions::default();

    engine.read(0xFFFF_FFF0, vec![0; 32], done.callback()).unwrap();
    engine.dispatch();
    let c = done.take_one();
    assert!(matches!(
        c.result,
        Err(DownloadError::Failed(Failure::UnexpectedStatus(
            DlStatus::AddrRangeOverflow
        )))
    ));

    // The controller keeps serving requests afterwards
    engine.read(0xFFFF_FFF0, vec![0; 16], done.callback()).unwrap();
    engine.dispatch();
    assert!(done.take_one().result.is_ok());
}

#[test]
fn test_read_mem_dumps_platform_area() {
    let sim = SimulatedController::default();
    let mut engine = sim_engine(&sim);
    let done = Completions::default();
    let contents: Vec<u8> = (0..3519u32).map(|i| (i % 251) as u8).collect();
    sim.poke(0x2011C0, &contents);

    engine.read_mem(done.callback()).unwrap();
    engine.dispatch();

    let c = done.take_one();
    assert_eq!(c.command, Command::Read);
    assert!(c.result.is_ok(), "{:?}", c.result);
    assert_eq!(c.response, contents);
    assert_eq!(sim.get_writes().len(), 15);
    assert_eq!(sim.get_modes(), vec![DeviceMode::Download, DeviceMode::Normal]);
}

#[test]
fn test_read_mem_restores_normal_mode_on_failure() {
    let (mut engine, mock, timers, _) = mock_engine(EngineConfig::default());
    let done = Completions::default();

    engine.read_mem(done.callback()).unwrap();
    engine.dispatch();
    assert_eq!(mock.get_modes(), vec![DeviceMode::Download]);

    timers.fire_next();
    engine.dispatch();
    assert!(matches!(done.take_one().result, Err(DownloadError::Timeout)));
    assert_eq!(mock.get_modes(), vec![DeviceMode::Download, DeviceMode::Normal]);

    // Later sessions leave the mode alone
    mock.queue_status(0x00, &[0x00, 0x00, 17]);
    engine.get_session_state(vec![0; 3], done.callback()).unwrap();
    engine.dispatch();
    assert!(done.take_one().result.is_ok());
    assert_eq!(mock.get_modes().len(), 2);
}

#[test]
fn test_log_then_read_log() {
    let sim = SimulatedController::new(ChipIdentity::default());
    let mut engine = sim_engine(&sim);
    let done = Completions::default();

    engine.log(b"fw-update", done.callback()).unwrap();
    engine.dispatch();
    assert!(done.take_one().result.is_ok());

    engine.read_log(vec![0; 64], done.callback()).unwrap();
    engine.dispatch();
    let c = done.take_one();
    assert!(c.result.is_ok());
    assert_eq!(c.response.len(), 64);
    assert_eq!(&c.response[..9], b"fw-update");
    assert!(c.response[9..].iter().all(|&b| b == 0xFF));
}

#[test]
fn test_session_state_and_integrity_against_simulator() {
    let sim = SimulatedController::new(ChipIdentity::default());
    let mut engine = sim_engine(&sim);
    let done = Completions::default();

    engine.get_session_state(vec![0; 3], done.callback()).unwrap();
    engine.dispatch();
    assert_eq!(done.take_one().response, vec![0x00, 0x00, 17]);

    engine.check_integrity(0x08, vec![0; 32], done.callback()).unwrap();
    engine.dispatch();
    let c = done.take_one();
    assert!(c.result.is_ok());
    assert_eq!(c.response.len(), 31);
}

// ============================================================================
// Real timer threads
// ============================================================================

#[test]
fn test_threaded_session() {
    let sim = SimulatedController::new(ChipIdentity {
        fw_major: 0x08,
        fw_minor: 0x1A,
        ..Default::default()
    });
    let mut engine = DownloadEngine::new(
        sim.clone(),
        ThreadTimerService::new(),
        loader(),
        EngineConfig::default(),
    );
    let done = Completions::default();

    engine.get_version(vec![0; 11], done.callback()).unwrap();
    assert!(engine.wait_idle(Duration::from_secs(5)));
    let c = done.take_one();
    assert!(c.result.is_ok());
    assert_eq!(c.response.len(), 9);
    assert_eq!(c.response[7..], [0x1A, 0x08]);
}

#[test]
fn test_threaded_timeout() {
    let sim = SimulatedController::new(ChipIdentity::default());
    sim.set_silent(true);
    let config = EngineConfig {
        response_timeout_ms: 50,
        ..Default::default()
    };
    let mut engine =
        DownloadEngine::new(sim.clone(), ThreadTimerService::new(), loader(), config);
    let done = Completions::default();

    engine.get_version(vec![0; 11], done.callback()).unwrap();
    assert!(engine.wait_idle(Duration::from_secs(5)));
    assert!(matches!(done.take_one().result, Err(DownloadError::Timeout)));
}
