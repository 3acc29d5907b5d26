use fingertime::{
    cli::{self, AsciiRenderer, Visualizer},
    common::{Config, DevMode},
    core::{CaptureStatus, CycleReport, Kiosk, KioskEvent, LogSync, Matcher, QualitySignal},
    sensor::{FrameSource, ReplaySensor, V4lSensor},
    storage::{EventFilter, FileStore, Gallery, Ledger},
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossterm::terminal;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "fingertime")]
#[command(about = "Fingerprint attendance kiosk")]
struct Cli {
    /// Enable development mode (saves data locally for testing)
    #[arg(long, global = true)]
    dev: bool,

    /// Config file to use instead of the default search path
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Read frames from a directory of PNG/raw captures instead of a sensor
    #[arg(long, global = true)]
    replay: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a new identity (three scans)
    Enroll {
        #[arg(short, long)]
        id: String,
        #[arg(short, long)]
        name: String,
    },
    /// Identify one finger and record attendance
    Identify,
    /// Run continuous attendance until ESC is pressed
    Attend,
    /// Show attendance history
    History {
        #[arg(short, long)]
        identity: Option<String>,
        /// Only the most recent N events
        #[arg(short, long)]
        limit: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// List V4L2 devices and detect the fingerprint sensor
    Sensors,
    /// Capture one stable frame and save it as PNG
    Snapshot {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Gallery and ledger reports
    Report {
        #[command(subcommand)]
        command: Option<ReportCommands>,
    },
}

#[derive(Subcommand, Clone, Copy)]
enum ReportCommands {
    /// Template-vs-template score matrix
    Scores,
    /// Descriptor statistics per template
    Stats,
    /// Export the ledger to CSV
    Export,
    /// Generate all reports
    All,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging based on mode
    setup_logging(cli.dev);

    let config = match &cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    let dev_mode = DevMode::new(cli.dev)?;

    match cli.command {
        Commands::Enroll { id, name } => {
            println!("Enrolling {} ({})", name, id);
            let store = Arc::new(FileStore::new_with_dev_mode(&dev_mode, &config)?);
            let (tx, rx) = mpsc::channel();
            let printer = spawn_printer(rx, false);

            let sensor = open_sensor(&config, cli.replay.as_deref())?;
            let mut kiosk = Kiosk::new(sensor, config.clone(), store.clone(), store)
                .with_status(Arc::new(tx))
                .with_sync(Arc::new(LogSync));
            let report = kiosk.enroll(&id, &name);
            drop(kiosk);
            printer.join().ok();
            println!("{}", report?.message());
        }
        Commands::Identify => {
            let store = Arc::new(FileStore::new_with_dev_mode(&dev_mode, &config)?);
            let (tx, rx) = mpsc::channel();
            let printer = spawn_printer(rx, false);

            let sensor = open_sensor(&config, cli.replay.as_deref())?;
            let mut kiosk = Kiosk::new(sensor, config.clone(), store.clone(), store)
                .with_status(Arc::new(tx))
                .with_sync(Arc::new(LogSync));
            let report = kiosk.identify_once();
            drop(kiosk);
            printer.join().ok();
            println!("{}", report?.message());
        }
        Commands::Attend => {
            let store = Arc::new(FileStore::new_with_dev_mode(&dev_mode, &config)?);
            let sensor = open_sensor(&config, cli.replay.as_deref())?;
            run_attend(sensor, config, store)?;
        }
        Commands::History { identity, limit, json } => {
            let store = FileStore::new_with_dev_mode(&dev_mode, &config)?;
            let events = store.events(&EventFilter {
                identity_id: identity,
                limit,
                ..Default::default()
            })?;

            if json {
                println!("{}", serde_json::to_string_pretty(&events)?);
            } else if events.is_empty() {
                println!("No attendance events recorded");
            } else {
                for event in &events {
                    println!(
                        "{:>5}  {}  {:<12} {:<10} {:<20} {}",
                        event.sequence,
                        event.timestamp.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S"),
                        event.kind.as_str(),
                        event.identity_id.as_deref().unwrap_or("-"),
                        event.display_name.as_deref().unwrap_or("-"),
                        event.match_score.map(|s| s.to_string()).unwrap_or_default()
                    );
                }
            }
        }
        Commands::Sensors => {
            println!("🔍 Detecting available sensors...\n");

            let sensors = V4lSensor::list_devices()?;
            if sensors.is_empty() {
                println!("❌ No V4L2 devices found!");
                println!("\nTroubleshooting:");
                println!("  1. Check that the reader is connected");
                println!("  2. Ensure you have permission to access /dev/video*");
                return Ok(());
            }

            for sensor in &sensors {
                println!("🖐  /dev/video{}: {}", sensor.index, sensor.name);
                for feature in &sensor.features {
                    println!("   - {}", feature);
                }
                println!();
            }

            println!("═══════════════════════════════════════════════════════");
            match sensors.iter().find(|s| s.grayscale) {
                Some(s) => {
                    println!("✅ Auto-detected grayscale sensor: /dev/video{}", s.index);
                    println!("\nThis will be used when device_index = 999 (auto-detect)");
                }
                None => println!("⚠️  No device offers a GREY format"),
            }
            println!("\n📝 To pin a device, set in the config:");
            println!("   [sensor]");
            println!("   device_index = <NUMBER>");
        }
        Commands::Snapshot { output } => {
            let sensor = open_sensor(&config, cli.replay.as_deref())?;
            let store = Arc::new(fingertime::MemoryStore::new());
            let mut kiosk = Kiosk::new(sensor, config.clone(), store.clone(), store);

            println!("Place finger on the sensor...");
            let captured = kiosk
                .capture_frame(config.capture.capture_timeout())?
                .context("No stable capture")?;

            let renderer = AsciiRenderer::new(None, None);
            println!(
                "{}",
                renderer
                    .render_frame_with_quality(captured.frame.image(), &captured.quality, &config.capture, None)
                    .replace("\r\n", "\n")
            );
            println!("{}", captured.quality.get_quality_assessment(&config.capture));
            let descriptors = kiosk.extractor().extract(&captured.frame);
            println!("Descriptors: {}", descriptors.len());

            let path = output.unwrap_or_else(|| dev_mode.get_capture_path("snapshot"));
            captured.frame.image().save(&path)?;
            println!("Saved {}", path.display());
        }
        Commands::Report { command } => {
            let store = FileStore::new_with_dev_mode(&dev_mode, &config)?;
            let visualizer = Visualizer::new(&dev_mode)?;
            let matcher = Matcher::new(config.matcher.clone());
            let gallery = store.all_templates()?;
            let command = command.unwrap_or(ReportCommands::All);

            if matches!(command, ReportCommands::Scores | ReportCommands::All) {
                visualizer.generate_score_matrix(&gallery, &matcher)?;
            }
            if matches!(command, ReportCommands::Stats | ReportCommands::All) {
                visualizer.generate_descriptor_stats(&gallery)?;
            }
            if matches!(command, ReportCommands::Export | ReportCommands::All) {
                let events = store.events(&EventFilter::default())?;
                visualizer.export_ledger_csv(&events)?;
            }
        }
    }

    Ok(())
}

fn open_sensor(config: &Config, replay: Option<&Path>) -> Result<Box<dyn FrameSource>> {
    Ok(match replay {
        Some(dir) => Box::new(ReplaySensor::open(dir, config.sensor.width, config.sensor.height, true)?),
        None => Box::new(V4lSensor::new(config)?),
    })
}

/// Attendance loop on this thread; a watcher thread turns ESC into a stop.
fn run_attend(sensor: Box<dyn FrameSource>, config: Config, store: Arc<FileStore>) -> Result<()> {
    let (tx, rx) = mpsc::channel();
    let mut kiosk = Kiosk::new(sensor, config, store.clone(), store)
        .with_status(Arc::new(tx))
        .with_sync(Arc::new(LogSync));
    let stop = kiosk.stop_signal();

    terminal::enable_raw_mode().context("Failed to enable raw mode")?;
    let printer = spawn_printer(rx, true);
    print_line("Attendance running. Press ESC to stop.", true);

    let watcher = {
        let stop = stop.clone();
        std::thread::spawn(move || {
            while !stop.is_stopped() {
                match cli::check_for_escape() {
                    Ok(true) => stop.stop(),
                    Ok(false) => std::thread::sleep(Duration::from_millis(50)),
                    Err(e) => {
                        tracing::warn!("Keyboard polling failed: {}", e);
                        break;
                    }
                }
            }
        })
    };

    let result = kiosk.run_attendance_loop();
    stop.stop();
    drop(kiosk);
    watcher.join().ok();
    printer.join().ok();

    terminal::disable_raw_mode().context("Failed to disable raw mode")?;
    result?;
    Ok(())
}

fn spawn_printer(rx: Receiver<KioskEvent>, raw: bool) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut last = None;
        for event in rx {
            match event {
                KioskEvent::Status(status) => {
                    let line = describe_status(&status);
                    if last.as_ref() != Some(&line) {
                        print_line(&line, raw);
                        last = Some(line);
                    }
                }
                KioskEvent::Report(report) => {
                    print_line(&format!("» {}", describe_report(&report)), raw);
                    last = None;
                }
            }
        }
    })
}

fn describe_status(status: &CaptureStatus) -> String {
    match status {
        CaptureStatus::WaitingForContact => "Place finger on the sensor".to_string(),
        CaptureStatus::Measuring { quality, hint, stable_count, .. } => {
            format!("Hold still... quality {} {:?} [{}]", quality.sharpness, hint, stable_count)
        }
        CaptureStatus::Captured { quality } => format!("Captured (quality {})", quality_label(quality)),
        CaptureStatus::LiftFinger => "Lift finger".to_string(),
        CaptureStatus::FingerRemoved => "Finger removed".to_string(),
    }
}

fn quality_label(quality: &QualitySignal) -> String {
    format!("{}%", quality.sharpness)
}

fn describe_report(report: &CycleReport) -> String {
    let time = chrono::Local::now().format("%H:%M:%S");
    format!("[{}] {}", time, report.message())
}

fn print_line(line: &str, raw: bool) {
    if raw {
        print!("{}\r\n", line);
    } else {
        println!("{}", line);
    }
}

fn setup_logging(dev_mode: bool) {
    if dev_mode {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt::init();
    }
}
