use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use dnld_core::config::EngineConfig;
use dnld_core::engine::{Completion, DownloadEngine};
use dnld_core::error::DownloadError;
use dnld_core::image::{FirmwareImage, FsImageLoader, ImageKind};
use dnld_core::protocol::{DlStatus, FrameBuffer, frame};
use dnld_core::sequence::{DownloadSequencer, SequenceOptions, SequenceReport};
use dnld_core::state::chunker::{self, RwInfo};
use dnld_core::timer::ThreadTimerService;
use dnld_core::transport::{ChipIdentity, SimulatedController};
use tracing::{error, info, warn};

/// Upper bound on a single simulated command, resends included.
const COMMAND_LIMIT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(author, version, about = "PN54x NFC firmware download tool", long_about = None)]
struct Args {
    /// Engine configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate a hex-encoded response or request frame and print its fields
    Decode {
        /// Frame bytes, e.g. "0004F10000006EEF" (spaces and colons ignored)
        frame: String,
    },
    /// List the frames a write of an image file produces
    Plan {
        /// Download image (sequence of length-prefixed write records)
        image: PathBuf,

        /// Print every frame in hex
        #[arg(long)]
        dump: bool,
    },
    /// Run the download sequence against the simulated controller
    Simulate(SimulateOpts),
}

#[derive(clap::Args, Debug)]
struct SimulateOpts {
    /// Primary image to write (overrides the configuration)
    #[arg(long)]
    image: Option<PathBuf>,

    /// Answer the first N data frames with "memory busy"
    #[arg(long, default_value_t = 0)]
    busy: usize,

    /// Silicon version reported by the simulated chip
    #[arg(long, default_value_t = 0x08, value_parser = parse_u8)]
    hw_version: u8,

    /// Firmware major version the simulated chip starts with
    #[arg(long, default_value_t = 0x01, value_parser = parse_u8)]
    fw_major: u8,

    /// Firmware minor version the simulated chip starts with
    #[arg(long, default_value_t = 0x00, value_parser = parse_u8)]
    fw_minor: u8,

    /// Download even when the chip already runs the image's version
    #[arg(long)]
    force_download: bool,

    /// Fail write records with this status to exercise recovery
    #[arg(long, value_enum)]
    write_fault: Option<WriteFault>,

    /// Number of write records the fault applies to
    #[arg(long, default_value_t = 1)]
    fault_count: usize,

    /// Read the EEPROM platform area after the sequence
    #[arg(long)]
    dump_platform: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum WriteFault {
    /// PLL lock failure; recovered by forcing the clock
    Pll,
    /// Signature check failure; recovered with the production-key image
    Signature,
}

impl WriteFault {
    fn status(self) -> DlStatus {
        match self {
            WriteFault::Pll => DlStatus::PllError,
            WriteFault::Signature => DlStatus::SignatureError,
        }
    }
}

fn parse_u8(s: &str) -> Result<u8, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| e.to_string())
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => EngineConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => EngineConfig::default(),
    };

    match args.command {
        Commands::Decode { frame } => decode(&frame),
        Commands::Plan { image, dump } => plan(&image, dump),
        Commands::Simulate(opts) => simulate(config, opts),
    }
}

fn decode(text: &str) -> Result<()> {
    let cleaned: String = text
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    let raw = hex::decode(&cleaned).context("frame is not valid hex")?;
    let f = frame::decode(&raw)?;

    println!("length   : {} bytes", raw.len());
    println!(
        "code     : 0x{:02X} (as status: {})",
        f.code,
        DlStatus::from_byte(f.code)
    );
    println!("more     : {}", f.more);
    println!("payload  : {} bytes", f.payload.len());
    if !f.payload.is_empty() {
        println!("           {}", hex::encode_upper(f.payload));
    }
    Ok(())
}

fn plan(path: &Path, dump: bool) -> Result<()> {
    let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let image = FirmwareImage::from_bytes(data)?;
    match image.version() {
        Some(v) => info!(version = %v, records = image.record_count(), "Image parsed"),
        None => warn!("Image too short to carry a version"),
    }

    // Replay the write with the acknowledgements a healthy controller sends
    let mut rw = RwInfo {
        first_write: true,
        ..Default::default()
    };
    let mut buf = FrameBuffer::new();
    let mut frames = 0usize;
    let mut fragments = 0usize;
    loop {
        chunker::build_write_frame(&mut rw, image.raw_data(), &mut buf)?;
        frames += 1;
        if rw.segmented {
            fragments += 1;
        }
        println!(
            "frame {:5}  offset {:7}  len {:3}{}",
            frames,
            rw.offset,
            buf.len(),
            if rw.segmented { "  +more" } else { "" }
        );
        if dump {
            println!("    {}", hex::encode_upper(buf.as_bytes()));
        }

        let ack = match (rw.segmented, rw.first_chunk_resp) {
            (false, _) => DlStatus::Ok,
            (true, false) => DlStatus::FirstChunkAck,
            (true, true) => DlStatus::NextChunkAck,
        };
        chunker::apply_write_status(&mut rw, ack)?;
        if rw.remaining == 0 {
            break;
        }
    }

    println!(
        "{} records, {} bytes -> {} frames ({} with more-fragments set)",
        image.record_count(),
        image.len(),
        frames,
        fragments
    );
    Ok(())
}

type SimEngine = DownloadEngine<SimulatedController, ThreadTimerService, FsImageLoader>;

/// Start a command and block until its completion arrives.
fn run_command<F>(engine: &mut SimEngine, start: F) -> Result<Completion>
where
    F: FnOnce(&mut SimEngine, Box<dyn FnOnce(Completion) + Send>) -> Result<(), DownloadError>,
{
    let (tx, rx) = mpsc::channel();
    start(
        &mut *engine,
        Box::new(move |c| {
            let _ = tx.send(c);
        }),
    )?;
    if !engine.wait_idle(COMMAND_LIMIT) {
        bail!("command did not finish within {:?}", COMMAND_LIMIT);
    }
    rx.try_recv().map_err(|_| anyhow!("no completion delivered"))
}

fn report(c: &Completion) {
    match &c.result {
        Ok(()) if c.response.is_empty() => println!("{:<18} OK", c.command.to_string()),
        Ok(()) => println!(
            "{:<18} OK  {} bytes  {}",
            c.command.to_string(),
            c.response.len(),
            hex::encode_upper(&c.response[..c.response.len().min(32)])
        ),
        Err(e) => println!("{:<18} {}", c.command.to_string(), e),
    }
}

fn print_report(report: &SequenceReport) {
    match &report.result {
        Ok(()) => println!("result     : OK"),
        Err(e) => println!("result     : {}", e),
    }
    println!("attempts   : {}", report.attempts);
    if let Some(hw) = report.chip_version {
        println!("chip       : 0x{:02X}", hw);
    }
    if let Some(v) = report.image_version {
        println!("image      : {}", v);
    }
    println!("up to date : {}", report.up_to_date);
    let log = &report.log;
    println!(
        "log        : fw {:04X} mw {:04X} trig {} ok {} fail {} (consecutive {}) config {}",
        log.curr_fw_ver,
        log.curr_mw_ver,
        log.num_trig,
        log.num_success,
        log.num_fail,
        log.fail_cnt,
        log.config
    );
    if let Some(crc) = report.integrity {
        println!("integrity  : {}", crc);
    }
}

/// Middleware version stamped into the download log, from the package version.
fn mw_version() -> u16 {
    let major: u16 = env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0);
    let minor: u16 = env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0);
    (major << 8) | (minor & 0xFF)
}

fn simulate(config: EngineConfig, opts: SimulateOpts) -> Result<()> {
    let loader = match &opts.image {
        Some(path) => config.image_loader().with_path(ImageKind::Primary, path.clone()),
        None => config.image_loader(),
    };

    let sim = SimulatedController::new(ChipIdentity {
        hw_version: opts.hw_version,
        fw_major: opts.fw_major,
        fw_minor: opts.fw_minor,
        ..Default::default()
    });
    if opts.busy > 0 {
        sim.inject_status(DlStatus::MemBusy, opts.busy);
    }
    if let Some(fault) = opts.write_fault {
        sim.inject_write_status(fault.status(), opts.fault_count);
    }
    let mut engine = DownloadEngine::new(sim.clone(), ThreadTimerService::new(), loader, config);

    let options = SequenceOptions {
        mw_version: mw_version(),
        force_download: opts.force_download,
        step_limit: COMMAND_LIMIT,
        ..Default::default()
    };
    let outcome = DownloadSequencer::new(&mut engine, options).run();
    print_report(&outcome);
    info!(
        records = sim.records_written(),
        frames = sim.get_writes().len(),
        "Simulated controller state"
    );

    if opts.dump_platform {
        let c = run_command(&mut engine, |e, cb| e.read_mem(cb))?;
        report(&c);
    }

    outcome.result.map_err(Into::into)
}
