use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use autobone::calibration::{CalibrationEvent, ProcessStatus, SessionKind};
use autobone::config::{AppConfig, DEFAULT_CONFIG_PATH};
use autobone::recording::RecordingStore;
use autobone::skeleton::{SegmentLengths, SkeletonConfigStore};
use autobone::tracking::SyntheticTrackerSource;
use autobone::SessionController;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};

#[derive(Parser, Debug)]
#[command(
    name = "autobone-cli",
    about = "Record, process and apply automatic bone-length calibrations"
)]
struct Cli {
    /// Configuration file (defaults to assets/autobone_config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Print every calibration event as a JSON line
    #[arg(long, global = true)]
    events: bool,
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Capture a recording from the synthetic tracker source
    Record {
        #[arg(long)]
        samples: Option<u32>,
        #[arg(long)]
        interval_ms: Option<u64>,
        /// Also keep a permanently named copy
        #[arg(long)]
        save: bool,
    },
    /// Optimize segment lengths from the last recording
    Process {
        /// Include every recording in the recordings directory
        #[arg(long)]
        include_saved: bool,
    },
    /// Record, process and apply in one go
    Calibrate {
        #[arg(long)]
        samples: Option<u32>,
        #[arg(long)]
        interval_ms: Option<u64>,
    },
    /// Print a summary of a recording container
    Inspect { file: PathBuf },
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::from(1)
        }
    }
}

fn run() -> Result<ExitCode> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let mut config = AppConfig::load_from_file(config_path);

    match cli.command {
        Commands::Record {
            samples,
            interval_ms,
            save,
        } => {
            override_capture(&mut config, samples, interval_ms);
            config.recording.save_recordings |= save;
            let session = Session::new(config, cli.events);
            let status = session.run(SessionKind::Record)?;
            Ok(exit_code(&status))
        }
        Commands::Process { include_saved } => {
            config.recording.process_saved_recordings |= include_saved;
            let session = Session::new(config, cli.events);
            if let Err(err) = session.controller.restore_last_recording() {
                if !session.controller.config().recording.process_saved_recordings {
                    return Err(err).context("loading the last recording");
                }
                tracing::warn!("No last recording ({}); processing saved recordings only", err);
            }
            let status = session.run(SessionKind::Process)?;
            print_result(&session.controller)?;
            Ok(exit_code(&status))
        }
        Commands::Calibrate {
            samples,
            interval_ms,
        } => {
            override_capture(&mut config, samples, interval_ms);
            let session = Session::new(config, cli.events);
            for kind in [SessionKind::Record, SessionKind::Process] {
                let status = session.run(kind)?;
                if !status.success {
                    return Ok(exit_code(&status));
                }
            }
            print_result(&session.controller)?;
            session.apply()
        }
        Commands::Inspect { file } => run_inspect(&config, &file),
    }
}

fn override_capture(config: &mut AppConfig, samples: Option<u32>, interval_ms: Option<u64>) {
    if let Some(samples) = samples {
        config.recording.sample_count = samples;
    }
    if let Some(interval_ms) = interval_ms {
        config.recording.sample_interval_ms = interval_ms;
    }
}

fn exit_code(status: &ProcessStatus) -> ExitCode {
    if status.success {
        ExitCode::from(0)
    } else {
        ExitCode::from(2)
    }
}

/// Controller wired to the synthetic source.
struct Session {
    controller: SessionController,
    print_events: bool,
}

impl Session {
    fn new(config: AppConfig, print_events: bool) -> Self {
        let skeleton = Arc::new(SkeletonConfigStore::load_or_default(
            config.skeleton.config_path.clone(),
        ));
        let source = Arc::new(SyntheticTrackerSource::full_body(SegmentLengths::defaults()));
        Self {
            controller: SessionController::new(config, source, skeleton),
            print_events,
        }
    }

    /// Receiver that sees every event emitted from now on.
    fn events(&self) -> broadcast::Receiver<CalibrationEvent> {
        self.controller.broadcaster().subscribe_channel()
    }

    /// Start a session and block until its terminal status.
    fn run(&self, kind: SessionKind) -> Result<ProcessStatus> {
        // Subscribed before the start: a fast session may finish before
        // try_start returns.
        let mut events = self.events();
        let session_id = self.controller.try_start(kind)?;
        let mut last_percent = None;

        loop {
            let event = match events.blocking_recv() {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Skipped {} events", skipped);
                    continue;
                }
                Err(RecvError::Closed) => bail!("event channel closed"),
            };
            if event.session_id() != Some(session_id) {
                continue;
            }
            if self.print_events {
                println!("{}", serde_json::to_string(&event)?);
            }

            if let CalibrationEvent::Status(status) = &event {
                if status.completed {
                    let outcome = if status.success { "ok" } else { "failed" };
                    eprintln!("{} {}: {}", kind.display_name(), outcome, status.message);
                    return Ok(status.clone());
                }
                let percent = status.percentage() / 10 * 10;
                if last_percent != Some(percent) {
                    last_percent = Some(percent);
                    eprintln!("{} {:>3}% {}", kind.display_name(), percent, status.message);
                }
            }
        }
    }

    fn apply(&self) -> Result<ExitCode> {
        let mut events = self.events();
        self.controller.apply_values()?;
        loop {
            match events.blocking_recv() {
                Ok(CalibrationEvent::ValuesApplied { success, message }) => {
                    eprintln!("Apply {}: {}", if success { "ok" } else { "failed" }, message);
                    return Ok(ExitCode::from(if success { 0 } else { 2 }));
                }
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => bail!("event channel closed"),
            }
        }
    }
}

fn print_result(controller: &SessionController) -> Result<()> {
    if let Some(outcome) = controller.last_result() {
        println!("{}", serde_json::to_string_pretty(outcome.as_ref())?);
    }
    Ok(())
}

#[derive(Serialize)]
struct TrackerSummary {
    id: u32,
    name: String,
    body_part: Option<String>,
    frames: usize,
    with_rotation: usize,
    with_position: usize,
}

#[derive(Serialize)]
struct RecordingSummary {
    file: PathBuf,
    trackers: Vec<TrackerSummary>,
    max_frame_count: usize,
}

fn run_inspect(config: &AppConfig, file: &Path) -> Result<ExitCode> {
    let store = RecordingStore::new(
        config.recording.recordings_dir.clone(),
        config.recording.last_recording_path.clone(),
    );
    let recording = store
        .load(file)
        .with_context(|| format!("loading {}", file.display()))?;

    let summary = RecordingSummary {
        file: file.to_path_buf(),
        max_frame_count: recording.max_frame_count(),
        trackers: recording
            .trackers
            .iter()
            .map(|t| TrackerSummary {
                id: t.tracker.id,
                name: t.tracker.name.clone(),
                body_part: t.body_part().map(|p| p.display_name().to_string()),
                frames: t.frames.len(),
                with_rotation: t.frames.iter().filter(|f| f.resolved_rotation().is_some()).count(),
                with_position: t.frames.iter().filter(|f| f.position.is_some()).count(),
            })
            .collect(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(ExitCode::from(0))
}
