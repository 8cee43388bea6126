//! Capture thread body.
//!
//! One `CaptureSession` runs per `MiniScope::run`. Each iteration:
//! settings snapshot -> external trigger -> grab -> retrieve -> process ->
//! record -> ring push -> pacing sleep. The loop exits when `running` is
//! cleared, either by `stop` or by `Shared::fail`.

use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::device::{Device, DeviceProperty, TRIG_RECORD_EXT};
use crate::encoder::{EncoderSettings, VideoEncoder};
use crate::frame::Frame;
use crate::process::{self, BackgroundModel};
use crate::scope::{led_power, lock, ScopeSettings, Shared};

/// Dropped frames tolerated in one session before it gives up.
pub const MAX_DROPPED_FRAMES: u64 = 80;

pub(crate) fn run_session(shared: Arc<Shared>) {
    let mut session = CaptureSession::new(shared);
    session.run();
}

enum Flow {
    Continue,
    Exit,
}

/// Encoder bound to one output file.
struct Recorder {
    encoder: Box<dyn VideoEncoder>,
    settings: EncoderSettings,
    generation: u64,
    opened_at: Instant,
    frames: u64,
}

struct CaptureSession {
    shared: Arc<Shared>,
    recorder: Option<Recorder>,
    background: BackgroundModel,
    placeholder: Frame,
    last_grab: Option<Instant>,
}

impl CaptureSession {
    fn new(shared: Arc<Shared>) -> Self {
        let settings = shared.settings();
        Self {
            shared,
            recorder: None,
            background: BackgroundModel::new(settings.bg_diff, settings.bg_alpha),
            placeholder: Frame::dropped_placeholder(),
            last_grab: None,
        }
    }

    fn run(&mut self) {
        let status = &self.shared.status;
        status.dropped_frames.store(0, Ordering::SeqCst);
        status.current_fps.store(0, Ordering::SeqCst);
        log::info!("CaptureSession: started");

        while self.shared.status.running.load(Ordering::SeqCst) {
            if let Flow::Exit = self.iterate() {
                break;
            }
        }

        self.close_recorder();
        self.shared.status.current_fps.store(0, Ordering::SeqCst);
        log::info!(
            "CaptureSession: stopped ({} dropped frames)",
            self.shared.status.dropped_frames.load(Ordering::SeqCst)
        );
    }

    fn with_device<T>(&self, f: impl FnOnce(&mut dyn Device) -> Result<T>) -> Result<T> {
        let mut device = lock(&self.shared.device);
        f(device.as_mut())
    }

    fn iterate(&mut self) -> Flow {
        let started = Instant::now();
        let settings = self.shared.settings();

        if settings.external_record_trigger {
            self.poll_external_trigger(&settings);
        }

        if let Err(err) = self.with_device(|device| device.grab()) {
            log::warn!("CaptureSession: grab failed: {:#}", err);
            self.shared.fail("Failed to grab frame.");
            return Flow::Exit;
        }
        self.measure_fps();

        let frame = match self.with_device(|device| device.retrieve()) {
            Ok(frame) => frame,
            Err(err) => return self.handle_dropped_frame(&settings, err),
        };

        if let Err(err) = self.process(&settings, frame) {
            log::warn!("CaptureSession: frame processing failed: {:#}", err);
        }

        self.pace(&settings, started);
        Flow::Continue
    }

    fn measure_fps(&mut self) {
        let now = Instant::now();
        if let Some(previous) = self.last_grab {
            let elapsed = now.duration_since(previous).as_secs_f64();
            if elapsed > 0.0 {
                let fps = (1.0 / elapsed).round() as u32;
                self.shared.status.current_fps.store(fps, Ordering::SeqCst);
            }
        }
        self.last_grab = Some(now);
    }

    fn pace(&self, settings: &ScopeSettings, started: Instant) {
        let interval = Duration::from_secs_f64(1.0 / settings.fps.max(1) as f64);
        if let Some(remaining) = interval.checked_sub(started.elapsed()) {
            std::thread::sleep(remaining);
        }
    }

    // -------------------- Dropped frames --------------------

    /// Placeholder frame, device reopen, and the session limit check.
    fn handle_dropped_frame(&mut self, settings: &ScopeSettings, err: anyhow::Error) -> Flow {
        let messages = &self.shared.messages;
        let dropped = self.shared.status.dropped_frames.fetch_add(1, Ordering::SeqCst) + 1;
        log::warn!("CaptureSession: retrieve failed: {:#}", err);
        messages.emit("Dropped frame.");
        self.shared.push_frame(self.placeholder.clone());

        messages.emit("Reconnecting Miniscope...");
        match self.reopen_device(settings) {
            Ok(()) => messages.emit("Miniscope reconnected."),
            Err(err) => messages.emit_error(format!("Unable to reconnect Miniscope: {:#}", err)),
        }

        if dropped > MAX_DROPPED_FRAMES {
            self.shared.fail("Too many dropped frames. Giving up.");
            return Flow::Exit;
        }
        Flow::Continue
    }

    fn reopen_device(&self, settings: &ScopeSettings) -> Result<()> {
        let led = if self.shared.status.recording.load(Ordering::SeqCst)
            || !settings.external_record_trigger
        {
            led_power(settings.excitation)
        } else {
            0.0
        };
        let mut device = lock(&self.shared.device);
        device.release();
        device
            .open(settings.cam_id)
            .with_context(|| format!("reopen camera {}", settings.cam_id))?;
        self.shared
            .push_sensor_settings(device.as_mut(), settings, led);
        Ok(())
    }

    // -------------------- External trigger --------------------

    fn poll_external_trigger(&self, settings: &ScopeSettings) {
        let gpio = match self.with_device(|device| device.property(DeviceProperty::Saturation)) {
            Ok(value) => value as u32,
            Err(err) => {
                log::debug!("CaptureSession: GPIO read failed: {:#}", err);
                return;
            }
        };
        let requested = gpio & TRIG_RECORD_EXT != 0;
        let status = &self.shared.status;
        let recording = status.recording.load(Ordering::SeqCst);

        if requested && !recording {
            {
                let mut target = lock(&self.shared.recording_target);
                let Some(target) = target.as_mut() else {
                    return;
                };
                target.started = Instant::now();
            }
            status.last_recorded_ms.store(0, Ordering::SeqCst);
            status.recording.store(true, Ordering::SeqCst);
            self.set_led(led_power(settings.excitation));
            self.shared
                .messages
                .emit("External trigger: recording started.");
        } else if !requested && recording {
            status.recording.store(false, Ordering::SeqCst);
            self.set_led(0.0);
            self.shared
                .messages
                .emit("External trigger: recording stopped.");
        }
    }

    fn set_led(&self, power: f64) {
        if let Err(err) = self.with_device(|device| device.set_property(DeviceProperty::Hue, power)) {
            log::warn!("CaptureSession: failed to set LED power: {:#}", err);
        }
    }

    // -------------------- Processing --------------------

    fn process(&mut self, settings: &ScopeSettings, frame: Frame) -> Result<()> {
        let gray = process::to_gray(&frame)?;

        if settings.color_check {
            let color = process::demosaic_rg(&gray)?;
            self.record(settings, &color);
            self.shared.push_frame(color);
            return Ok(());
        }

        let (min, max) = process::min_max(&gray);
        self.shared.status.min_fluor.store(min);
        self.shared.status.max_fluor.store(max);

        self.record(settings, &gray);

        self.background.configure(settings.bg_diff, settings.bg_alpha);
        let corrected = self.background.apply(&gray)?;
        let display = process::rescale_display(
            &corrected,
            settings.min_fluor_display,
            settings.max_fluor_display,
        )?;
        self.shared.push_frame(display);
        Ok(())
    }

    // -------------------- Recording --------------------

    fn record(&mut self, settings: &ScopeSettings, frame: &Frame) {
        let status = &self.shared.status;
        let active =
            status.running.load(Ordering::SeqCst) && status.recording.load(Ordering::SeqCst);
        if !active {
            self.close_recorder();
            return;
        }

        if let Err(err) = self.prepare_recorder(settings, frame) {
            self.recording_failed(err);
            return;
        }
        let Some(recorder) = self.recorder.as_mut() else {
            return;
        };
        match recorder.encoder.encode_frame(frame) {
            Ok(()) => {
                recorder.frames += 1;
                let started = lock(&self.shared.recording_target)
                    .as_ref()
                    .map(|target| target.started);
                if let Some(started) = started {
                    let elapsed = frame.captured_at().saturating_duration_since(started);
                    self.shared
                        .status
                        .last_recorded_ms
                        .store(elapsed.as_millis() as u64, Ordering::SeqCst);
                }
            }
            Err(err) => self.recording_failed(err),
        }
    }

    /// Open the first file, rotate slices, or start a new file when the frame
    /// format changed mid-recording. A recorder left over from an earlier
    /// `start_recording` is finalized before the new target is opened.
    fn prepare_recorder(&mut self, settings: &ScopeSettings, frame: &Frame) -> Result<()> {
        let armed = lock(&self.shared.recording_target)
            .as_ref()
            .map(|target| target.generation);
        let Some(generation) = armed else {
            // Disarmed between the flag check and here.
            self.close_recorder();
            return Ok(());
        };
        let Some(recorder) = self.recorder.as_ref() else {
            return self.open_recorder(settings, frame);
        };

        let retargeted = recorder.generation != generation;
        let rotate = slice_due(recorder.opened_at.elapsed(), settings.slice_interval_min);
        let format_changed = recorder.settings.width != frame.width()
            || recorder.settings.height != frame.height()
            || recorder.settings.is_color != frame.is_color();
        if !(retargeted || rotate || format_changed) {
            return Ok(());
        }

        if format_changed && !retargeted {
            self.shared
                .messages
                .emit("Frame format changed, starting a new recording file.");
        }
        self.close_recorder();
        self.open_recorder(settings, frame)
    }

    /// Open the next slice of the armed target.
    fn open_recorder(&mut self, settings: &ScopeSettings, frame: &Frame) -> Result<()> {
        let (path, generation) = {
            let mut target = lock(&self.shared.recording_target);
            let target = target
                .as_mut()
                .ok_or_else(|| anyhow!("no recording path armed"))?;
            let slice = target.claim_slice();
            (slice_path(&target.path, slice), target.generation)
        };
        let encoder_settings = EncoderSettings {
            path: path.clone(),
            width: frame.width(),
            height: frame.height(),
            fps: settings.fps,
            is_color: frame.is_color(),
            codec: settings.codec,
            container: settings.container,
            lossless: settings.lossless,
        }
        .normalized();

        let factory = lock(&self.shared.encoder_factory).clone();
        let mut encoder = (*factory)();
        encoder
            .initialize(&encoder_settings)
            .with_context(|| format!("start recording {}", path.display()))?;

        self.shared
            .messages
            .emit(format!("Recording to {}", path.display()));
        self.recorder = Some(Recorder {
            encoder,
            settings: encoder_settings,
            generation,
            opened_at: Instant::now(),
            frames: 0,
        });
        Ok(())
    }

    fn close_recorder(&mut self) {
        let Some(mut recorder) = self.recorder.take() else {
            return;
        };
        match recorder.encoder.finalize() {
            Ok(()) => self.shared.messages.emit(format!(
                "Recording finalized: {} ({} frames)",
                recorder.settings.path.display(),
                recorder.frames
            )),
            Err(err) => {
                let msg = format!("Failed to finalize recording: {:#}", err);
                self.shared.set_last_error(&msg);
                self.shared.messages.emit_error(msg);
            }
        }
    }

    /// Encoder errors end the recording; capture keeps running.
    fn recording_failed(&mut self, err: anyhow::Error) {
        let msg = format!("Recording failed: {:#}", err);
        self.shared.status.recording.store(false, Ordering::SeqCst);
        self.shared.set_last_error(&msg);
        self.shared.messages.emit_error(msg);
        self.close_recorder();
    }
}

/// Whether a file open for `elapsed` has reached the slice interval.
/// Zero minutes disables slicing.
fn slice_due(elapsed: Duration, interval_min: u32) -> bool {
    interval_min > 0 && elapsed >= Duration::from_secs(u64::from(interval_min) * 60)
}

/// `base` for the first slice, `base_<n>` afterwards.
fn slice_path(base: &std::path::Path, slice: u32) -> PathBuf {
    if slice <= 1 {
        return base.to_path_buf();
    }
    let mut name = base.as_os_str().to_os_string();
    name.push(format!("_{}", slice));
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::RecordingTarget;
    use std::path::Path;

    #[test]
    fn slice_paths_are_numbered_from_two() {
        let base = Path::new("/data/1700000000_scope");
        assert_eq!(slice_path(base, 1), base);
        assert_eq!(slice_path(base, 2), Path::new("/data/1700000000_scope_2"));
        assert_eq!(slice_path(base, 10), Path::new("/data/1700000000_scope_10"));
    }

    #[test]
    fn slicing_waits_for_the_full_interval() {
        assert!(!slice_due(Duration::from_secs(3600), 0));
        assert!(!slice_due(Duration::from_secs(119), 2));
        assert!(slice_due(Duration::from_secs(120), 2));
    }

    #[test]
    fn each_claimed_slice_gets_a_fresh_name() {
        let base = Path::new("/data/mouse1.session");
        let mut target = RecordingTarget {
            path: base.to_path_buf(),
            started: Instant::now(),
            generation: 1,
            next_slice: 1,
        };
        let slice = target.claim_slice();
        let first = slice_path(&target.path, slice);
        let slice = target.claim_slice();
        let second = slice_path(&target.path, slice);
        assert_eq!(first, base);
        assert_eq!(second, Path::new("/data/mouse1.session_2"));
    }
}
