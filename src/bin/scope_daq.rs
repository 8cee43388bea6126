//! scope-daq - acquire (and optionally record) from a Miniscope
//!
//! Connects the configured device, streams frames until Ctrl-C or
//! `--seconds` elapses, and prints controller messages and live statistics.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use miniscope_daq::ui::{AcquisitionStatus, StatusLine, Ui};
use miniscope_daq::{create_device, MiniScope, ScopeConfig};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (TOML, or JSON by extension). Defaults to MINISCOPE_CONFIG.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Device URI (`stub://name`, `/dev/videoN`).
    #[arg(long)]
    device: Option<String>,
    /// Camera id passed to the device on open.
    #[arg(long)]
    cam_id: Option<i32>,
    /// Target frames per second.
    #[arg(long)]
    fps: Option<u32>,
    /// Stop after this many seconds (0 runs until Ctrl-C).
    #[arg(long, default_value_t = 0)]
    seconds: u64,
    /// Record the session to the output directory.
    #[arg(long)]
    record: bool,
    /// Output directory for recordings.
    #[arg(long)]
    out_dir: Option<PathBuf>,
    /// Demosaic RG Bayer frames into color.
    #[arg(long)]
    color: bool,
    /// Output mode: auto, plain or pretty.
    #[arg(long, default_value = "auto")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let ui = Ui::from_args(Some(&args.ui), std::io::stderr().is_terminal());

    let mut cfg = match &args.config {
        Some(path) => ScopeConfig::from_path(path)?,
        None => ScopeConfig::load()?,
    };
    if let Some(device) = &args.device {
        cfg.device.uri = device.clone();
    }
    if let Some(cam_id) = args.cam_id {
        cfg.cam_id = cam_id;
    }
    if let Some(fps) = args.fps {
        if fps == 0 {
            return Err(anyhow!("fps must be >= 1"));
        }
        cfg.acquisition.fps = fps;
    }
    if let Some(out_dir) = &args.out_dir {
        cfg.recording.data_dir = out_dir.clone();
    }
    if args.color {
        cfg.acquisition.color_check = true;
    }

    let stop = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&stop);
    ctrlc::set_handler(move || handler_flag.store(true, Ordering::SeqCst))
        .context("error setting Ctrl-C handler")?;

    let mut scope = MiniScope::new(create_device(&cfg.device)?);
    scope.set_scope_cam_id(cfg.cam_id);
    {
        let _stage = ui.stage(&format!("connect {} (camera {})", cfg.device.uri, cfg.cam_id));
        scope.connect()?;
        cfg.apply(&scope)?;
    }

    scope.run()?;
    if args.record {
        let path = recording_path(&cfg.recording.data_dir)?;
        scope.start_recording(&path)?;
        log::info!("recording to {}", path.display());
    }

    let status_line = ui.acquisition();
    let outcome = acquire(&mut scope, status_line, &stop, args.seconds);

    scope.stop_recording();
    scope.stop();
    while let Some(msg) = scope.next_message() {
        eprintln!("{msg}");
    }
    outcome
}

/// `<data_dir>/<unix seconds>_scope`; the encoder adds the extension.
fn recording_path(data_dir: &std::path::Path) -> Result<PathBuf> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("create data dir {}", data_dir.display()))?;
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| anyhow!("system clock before unix epoch: {}", e))?
        .as_secs();
    Ok(data_dir.join(format!("{}_scope", secs)))
}

fn acquire(
    scope: &mut MiniScope,
    mut status_line: StatusLine,
    stop: &AtomicBool,
    seconds: u64,
) -> Result<()> {
    let started = Instant::now();
    let deadline = (seconds > 0).then(|| Duration::from_secs(seconds));
    let mut status = AcquisitionStatus::default();

    loop {
        while scope.current_frame().is_some() {
            status.frames += 1;
        }
        while let Some(msg) = scope.next_message() {
            status_line.message(&msg);
        }

        status.fps = scope.current_fps();
        status.dropped = scope.dropped_frames_count();
        status.min_fluor = scope.min_fluor();
        status.max_fluor = scope.max_fluor();
        status.recording = scope.is_recording();
        status_line.update(&status);

        if !scope.is_running() {
            status_line.finish(&status);
            let reason = scope
                .last_error()
                .unwrap_or_else(|| "capture stopped".to_string());
            return Err(anyhow!("acquisition ended: {}", reason));
        }
        if stop.load(Ordering::SeqCst) {
            log::info!("shutdown signal received, stopping acquisition...");
            break;
        }
        if deadline.map_or(false, |limit| started.elapsed() >= limit) {
            break;
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    status_line.finish(&status);
    Ok(())
}
