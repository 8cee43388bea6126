//! Miniscope acquisition controller.
//!
//! `MiniScope` owns the device, the capture thread and the recording
//! lifecycle. States:
//!
//! ```text
//! Disconnected --connect--> Connected --run--> Running --start_recording--> Recording
//!                                                 |                            |
//!                                                 +---------- fail ------------+--> Failed
//! ```
//!
//! `Failed` is a marker next to `Connected`: the next `run` tears the device
//! down and reconnects before starting a new session. `recording => running
//! => connected` holds at every observation because the getters compose the
//! flags in that order.
//!
//! Threads: the caller drives control operations, setters and polling; one
//! capture thread per session produces frames. Scalar session state lives in
//! atomics, the device and the frame ring behind their own mutexes.

use anyhow::{anyhow, bail, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::device::{Device, DeviceProperty, SET_CMOS_SETTINGS};
use crate::encoder::{default_encoder_factory, EncoderFactory, VideoCodec, VideoContainer};
use crate::frame::{Frame, FrameRing};
use crate::messages::{MessageCallback, MessageQueue};
use crate::process::{BackgroundDiffMethod, DEFAULT_BG_ACCUMULATE_ALPHA};

pub const DEFAULT_EXPOSURE: i32 = 100;
pub const DEFAULT_GAIN: i32 = 32;
pub const DEFAULT_EXCITATION: f64 = 1.0;
pub const DEFAULT_FPS: u32 = 20;

/// Exposure is kept within `[1, 100]`.
pub fn clamp_exposure(value: i32) -> i32 {
    value.clamp(1, 100)
}

/// Device LED power for a logical excitation level.
///
/// The LED saturates at half its drive range, so the logical 0..=100 scale
/// maps onto 0..=0.5 for finer control at the low end.
pub fn led_power(excitation: f64) -> f64 {
    excitation.clamp(0.0, 100.0) / 2.0 / 100.0
}

pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ----------------------------------------------------------------------------
// Shared state
// ----------------------------------------------------------------------------

/// Camera parameters set by the caller and read once per capture iteration.
#[derive(Clone, Debug, PartialEq)]
pub struct ScopeSettings {
    pub cam_id: i32,
    pub exposure: i32,
    pub gain: i32,
    pub excitation: f64,
    pub excitation_x10: bool,
    pub fps: u32,
    pub color_check: bool,
    pub codec: VideoCodec,
    pub container: VideoContainer,
    pub lossless: bool,
    pub min_fluor_display: i32,
    pub max_fluor_display: i32,
    pub bg_diff: BackgroundDiffMethod,
    pub bg_alpha: f64,
    pub slice_interval_min: u32,
    pub external_record_trigger: bool,
}

impl Default for ScopeSettings {
    fn default() -> Self {
        Self {
            cam_id: 0,
            exposure: DEFAULT_EXPOSURE,
            gain: DEFAULT_GAIN,
            excitation: DEFAULT_EXCITATION,
            excitation_x10: false,
            fps: DEFAULT_FPS,
            color_check: false,
            codec: VideoCodec::Ffv1,
            container: VideoContainer::Matroska,
            lossless: true,
            min_fluor_display: 0,
            max_fluor_display: 255,
            bg_diff: BackgroundDiffMethod::None,
            bg_alpha: DEFAULT_BG_ACCUMULATE_ALPHA,
            slice_interval_min: 0,
            external_record_trigger: false,
        }
    }
}

/// `f64` stored as bits in an `AtomicU64`.
#[derive(Debug, Default)]
pub(crate) struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub(crate) fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::SeqCst))
    }

    pub(crate) fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::SeqCst);
    }
}

/// Flags and counters written by the capture thread and read by the caller.
#[derive(Debug, Default)]
pub(crate) struct SessionStatus {
    pub(crate) connected: AtomicBool,
    pub(crate) running: AtomicBool,
    pub(crate) recording: AtomicBool,
    pub(crate) failed: AtomicBool,
    pub(crate) dropped_frames: AtomicU64,
    pub(crate) current_fps: AtomicU32,
    pub(crate) min_fluor: AtomicF64,
    pub(crate) max_fluor: AtomicF64,
    pub(crate) last_recorded_ms: AtomicU64,
}

/// Output armed by `start_recording`.
///
/// Every file opened for a target takes the next slice number, so closing
/// and reopening (trigger gaps, stop/run, rotation) never reuses a name.
#[derive(Clone, Debug)]
pub(crate) struct RecordingTarget {
    pub(crate) path: PathBuf,
    pub(crate) started: Instant,
    /// Distinguishes successive `start_recording` calls.
    pub(crate) generation: u64,
    pub(crate) next_slice: u32,
}

impl RecordingTarget {
    /// Reserve the next file for this target.
    pub(crate) fn claim_slice(&mut self) -> u32 {
        let slice = self.next_slice;
        self.next_slice += 1;
        slice
    }
}

pub(crate) struct Shared {
    pub(crate) device: Mutex<Box<dyn Device>>,
    pub(crate) ring: Mutex<FrameRing>,
    pub(crate) settings: Mutex<ScopeSettings>,
    pub(crate) status: SessionStatus,
    pub(crate) messages: MessageQueue,
    pub(crate) last_error: Mutex<Option<String>>,
    pub(crate) recording_target: Mutex<Option<RecordingTarget>>,
    pub(crate) recording_generation: AtomicU64,
    pub(crate) encoder_factory: Mutex<EncoderFactory>,
}

impl Shared {
    pub(crate) fn settings(&self) -> ScopeSettings {
        lock(&self.settings).clone()
    }

    pub(crate) fn push_frame(&self, frame: Frame) {
        lock(&self.ring).push(frame);
    }

    pub(crate) fn set_last_error(&self, msg: &str) {
        *lock(&self.last_error) = Some(msg.to_string());
    }

    /// Terminate the session: clears running/recording, marks failed.
    ///
    /// The message is queued before the flags change, so an observer that
    /// sees `failed` can already drain it.
    pub(crate) fn fail(&self, msg: &str) {
        self.set_last_error(msg);
        self.messages.emit_error(msg);
        self.status.recording.store(false, Ordering::SeqCst);
        self.status.running.store(false, Ordering::SeqCst);
        self.status.failed.store(true, Ordering::SeqCst);
    }

    /// Sensor init, exposure, gain and LED power, in that order.
    pub(crate) fn push_sensor_settings(
        &self,
        device: &mut dyn Device,
        settings: &ScopeSettings,
        led: f64,
    ) {
        let writes = [
            (DeviceProperty::Saturation, SET_CMOS_SETTINGS),
            (DeviceProperty::Brightness, settings.exposure as f64 / 100.0),
            (DeviceProperty::Gain, settings.gain as f64 / 100.0),
            (DeviceProperty::Hue, led),
        ];
        for (property, value) in writes {
            if let Err(err) = device.set_property(property, value) {
                log::warn!("MiniScope: failed to set {:?}={}: {:#}", property, value, err);
            }
        }
    }
}

// ----------------------------------------------------------------------------
// MiniScope
// ----------------------------------------------------------------------------

/// Acquisition controller for one Miniscope.
pub struct MiniScope {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
    on_message: Option<MessageCallback>,
}

impl MiniScope {
    pub fn new(device: Box<dyn Device>) -> Self {
        Self {
            shared: Arc::new(Shared {
                device: Mutex::new(device),
                ring: Mutex::new(FrameRing::new()),
                settings: Mutex::new(ScopeSettings::default()),
                status: SessionStatus::default(),
                messages: MessageQueue::new(),
                last_error: Mutex::new(None),
                recording_target: Mutex::new(None),
                recording_generation: AtomicU64::new(0),
                encoder_factory: Mutex::new(default_encoder_factory()),
            }),
            thread: None,
            on_message: None,
        }
    }

    /// Replace the encoder used for recordings started after this call.
    pub fn set_encoder_factory(&self, factory: EncoderFactory) {
        *lock(&self.shared.encoder_factory) = factory;
    }

    // -------------------- Connection / capture lifecycle --------------------

    /// Open the device, initialize the sensor with default parameters and
    /// switch the excitation LED off.
    pub fn connect(&mut self) -> Result<()> {
        let cam_id = lock(&self.shared.settings).cam_id;
        if self.is_connected() {
            log::warn!("MiniScope: tried to reconnect already connected camera {}", cam_id);
            bail!("camera {} is already connected", cam_id);
        }

        let settings = {
            let mut settings = lock(&self.shared.settings);
            settings.exposure = DEFAULT_EXPOSURE;
            settings.gain = DEFAULT_GAIN;
            settings.excitation = DEFAULT_EXCITATION;
            settings.clone()
        };
        {
            let mut device = lock(&self.shared.device);
            device
                .open(cam_id)
                .with_context(|| format!("unable to open camera {}", cam_id))?;
            self.shared
                .push_sensor_settings(device.as_mut(), &settings, led_power(0.0));
        }

        self.shared.status.connected.store(true, Ordering::SeqCst);
        self.shared.status.failed.store(false, Ordering::SeqCst);
        self.shared
            .messages
            .emit(format!("Initialized camera {}", cam_id));
        Ok(())
    }

    /// Stop capture and release the device. Idempotent.
    pub fn disconnect(&mut self) {
        self.stop();
        lock(&self.shared.device).release();
        let was_connected = self.shared.status.connected.swap(false, Ordering::SeqCst);
        if was_connected {
            let cam_id = lock(&self.shared.settings).cam_id;
            self.shared
                .messages
                .emit(format!("Disconnected camera {}", cam_id));
        }
    }

    /// Start a capture session. A failed controller first reconnects.
    pub fn run(&mut self) -> Result<()> {
        if !self.is_connected() {
            bail!("camera is not connected");
        }
        if self.has_failed() {
            self.shared
                .messages
                .emit("Reconnecting to recover from previous failure.");
            self.disconnect();
            self.connect()?;
        }
        self.start_capture_thread()
    }

    /// Clear running/recording and join the capture thread.
    ///
    /// Blocks until the current iteration, including a device recovery
    /// attempt, has finished.
    pub fn stop(&mut self) {
        self.shared.status.running.store(false, Ordering::SeqCst);
        self.shared.status.recording.store(false, Ordering::SeqCst);
        self.finish_capture_thread();
    }

    fn start_capture_thread(&mut self) -> Result<()> {
        self.finish_capture_thread();
        *lock(&self.shared.last_error) = None;
        self.shared.status.running.store(true, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("miniscope-capture".to_string())
            .spawn(move || crate::capture::run_session(shared))
            .map_err(|err| {
                self.shared.status.running.store(false, Ordering::SeqCst);
                anyhow!("failed to spawn capture thread: {}", err)
            })?;
        self.thread = Some(handle);
        Ok(())
    }

    fn finish_capture_thread(&mut self) {
        if let Some(handle) = self.thread.take() {
            self.shared.status.running.store(false, Ordering::SeqCst);
            if handle.join().is_err() {
                log::error!("MiniScope: capture thread panicked");
            }
        }
    }

    // -------------------- Recording --------------------

    /// Record to `path` (extension chosen by the encoder). Starts capture
    /// first when needed.
    ///
    /// With the external trigger enabled this only arms the path; the GPIO
    /// line then switches recording on and off.
    pub fn start_recording(&mut self, path: impl AsRef<Path>) -> Result<()> {
        if !self.is_connected() {
            bail!("camera is not connected");
        }
        if !self.is_running() {
            self.run()?;
        }

        let generation = self.shared.recording_generation.fetch_add(1, Ordering::SeqCst) + 1;
        *lock(&self.shared.recording_target) = Some(RecordingTarget {
            path: path.as_ref().to_path_buf(),
            started: Instant::now(),
            generation,
            next_slice: 1,
        });
        self.shared.status.last_recorded_ms.store(0, Ordering::SeqCst);

        if lock(&self.shared.settings).external_record_trigger {
            self.shared
                .messages
                .emit("Recording armed, waiting for external trigger.");
        } else {
            self.shared.status.recording.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Stop recording; capture continues. Idempotent.
    pub fn stop_recording(&self) {
        self.shared.status.recording.store(false, Ordering::SeqCst);
        *lock(&self.shared.recording_target) = None;
    }

    // -------------------- State --------------------

    pub fn is_connected(&self) -> bool {
        self.shared.status.connected.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.is_connected() && self.shared.status.running.load(Ordering::SeqCst)
    }

    pub fn is_recording(&self) -> bool {
        self.is_running() && self.shared.status.recording.load(Ordering::SeqCst)
    }

    /// The last session ended abnormally; the next `run` reconnects first.
    pub fn has_failed(&self) -> bool {
        self.shared.status.failed.load(Ordering::SeqCst)
    }

    /// Whether a capture thread is still executing (it may linger briefly
    /// after a failure until joined).
    pub fn capture_thread_alive(&self) -> bool {
        self.thread
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    // -------------------- Polling --------------------

    /// Oldest unseen frame, or `None` when the ring is empty. Never blocks on
    /// the producer beyond the ring's critical section.
    pub fn current_frame(&self) -> Option<Frame> {
        lock(&self.shared.ring).pop()
    }

    pub fn buffered_frames(&self) -> usize {
        lock(&self.shared.ring).len()
    }

    pub fn current_fps(&self) -> u32 {
        self.shared.status.current_fps.load(Ordering::SeqCst)
    }

    pub fn dropped_frames_count(&self) -> u64 {
        self.shared.status.dropped_frames.load(Ordering::SeqCst)
    }

    pub fn min_fluor(&self) -> f64 {
        self.shared.status.min_fluor.load()
    }

    pub fn max_fluor(&self) -> f64 {
        self.shared.status.max_fluor.load()
    }

    /// Time since record start of the most recently encoded frame.
    pub fn last_recorded_frame_time(&self) -> Duration {
        Duration::from_millis(self.shared.status.last_recorded_ms.load(Ordering::SeqCst))
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.shared.last_error).clone()
    }

    // -------------------- Messages --------------------

    /// Register the consumer callback run by `dispatch_messages`.
    pub fn set_on_message<F>(&mut self, callback: F)
    where
        F: FnMut(&str) + Send + 'static,
    {
        self.on_message = Some(Box::new(callback));
    }

    /// Deliver pending messages to the registered callback on the calling
    /// thread. Returns how many were delivered. Without a callback the
    /// messages stay queued.
    pub fn dispatch_messages(&mut self) -> usize {
        let Some(callback) = self.on_message.as_mut() else {
            return 0;
        };
        let pending = self.shared.messages.drain();
        for msg in &pending {
            callback(msg);
        }
        pending.len()
    }

    pub fn next_message(&self) -> Option<String> {
        self.shared.messages.try_next()
    }

    // -------------------- Parameters --------------------

    fn push_property(&self, property: DeviceProperty, value: f64) {
        if !self.is_connected() {
            return;
        }
        if let Err(err) = lock(&self.shared.device).set_property(property, value) {
            log::warn!("MiniScope: failed to set {:?}={}: {:#}", property, value, err);
        }
    }

    fn set_led(&self, excitation: f64) {
        self.push_property(DeviceProperty::Hue, led_power(excitation));
    }

    fn reject_while_recording(&self, what: &str) -> Result<()> {
        if self.is_recording() {
            bail!("cannot change {} while recording", what);
        }
        Ok(())
    }

    /// Snapshot of every parameter.
    pub fn settings(&self) -> ScopeSettings {
        self.shared.settings()
    }

    pub fn set_scope_cam_id(&self, id: i32) {
        lock(&self.shared.settings).cam_id = id;
    }

    pub fn scope_cam_id(&self) -> i32 {
        lock(&self.shared.settings).cam_id
    }

    pub fn set_exposure(&self, value: i32) {
        let value = clamp_exposure(value);
        lock(&self.shared.settings).exposure = value;
        self.push_property(DeviceProperty::Brightness, value as f64 / 100.0);
    }

    pub fn exposure(&self) -> i32 {
        lock(&self.shared.settings).exposure
    }

    pub fn set_gain(&self, value: i32) {
        lock(&self.shared.settings).gain = value;
        self.push_property(DeviceProperty::Gain, value as f64 / 100.0);
    }

    pub fn gain(&self) -> i32 {
        lock(&self.shared.settings).gain
    }

    pub fn set_excitation(&self, value: f64) {
        let value = value.clamp(0.0, 100.0);
        lock(&self.shared.settings).excitation = value;
        self.set_led(value);
    }

    pub fn excitation(&self) -> f64 {
        lock(&self.shared.settings).excitation
    }

    /// Flag for front ends that present excitation on a x10 scale.
    pub fn set_excitation_x10(&self, enabled: bool) {
        lock(&self.shared.settings).excitation_x10 = enabled;
    }

    pub fn excitation_x10(&self) -> bool {
        lock(&self.shared.settings).excitation_x10
    }

    /// Target capture rate; takes effect on the next iteration.
    pub fn set_fps(&self, fps: u32) {
        lock(&self.shared.settings).fps = fps.max(1);
    }

    pub fn fps(&self) -> u32 {
        lock(&self.shared.settings).fps
    }

    /// Treat sensor frames as an RG Bayer mosaic and display/record color.
    pub fn set_color_check(&self, enabled: bool) {
        lock(&self.shared.settings).color_check = enabled;
    }

    pub fn color_check(&self) -> bool {
        lock(&self.shared.settings).color_check
    }

    pub fn set_video_codec(&self, codec: VideoCodec) -> Result<()> {
        self.reject_while_recording("video codec")?;
        lock(&self.shared.settings).codec = codec;
        Ok(())
    }

    pub fn video_codec(&self) -> VideoCodec {
        lock(&self.shared.settings).codec
    }

    pub fn set_video_container(&self, container: VideoContainer) -> Result<()> {
        self.reject_while_recording("video container")?;
        lock(&self.shared.settings).container = container;
        Ok(())
    }

    pub fn video_container(&self) -> VideoContainer {
        lock(&self.shared.settings).container
    }

    pub fn set_record_lossless(&self, lossless: bool) -> Result<()> {
        self.reject_while_recording("lossless mode")?;
        lock(&self.shared.settings).lossless = lossless;
        Ok(())
    }

    pub fn record_lossless(&self) -> bool {
        lock(&self.shared.settings).lossless
    }

    pub fn set_min_fluor_display(&self, value: i32) {
        lock(&self.shared.settings).min_fluor_display = value.clamp(0, 255);
    }

    pub fn min_fluor_display(&self) -> i32 {
        lock(&self.shared.settings).min_fluor_display
    }

    pub fn set_max_fluor_display(&self, value: i32) {
        lock(&self.shared.settings).max_fluor_display = value.clamp(0, 255);
    }

    pub fn max_fluor_display(&self) -> i32 {
        lock(&self.shared.settings).max_fluor_display
    }

    pub fn set_display_bg_diff_method(&self, method: BackgroundDiffMethod) {
        lock(&self.shared.settings).bg_diff = method;
    }

    pub fn display_bg_diff_method(&self) -> BackgroundDiffMethod {
        lock(&self.shared.settings).bg_diff
    }

    /// Weight of the newest frame in the running background, in `(0, 1]`.
    pub fn set_bg_accumulate_alpha(&self, alpha: f64) {
        lock(&self.shared.settings).bg_alpha = alpha.clamp(f64::EPSILON, 1.0);
    }

    pub fn bg_accumulate_alpha(&self) -> f64 {
        lock(&self.shared.settings).bg_alpha
    }

    /// Split recordings into files of this many minutes (0 disables).
    pub fn set_recording_slice_interval(&self, minutes: u32) {
        lock(&self.shared.settings).slice_interval_min = minutes;
    }

    pub fn recording_slice_interval(&self) -> u32 {
        lock(&self.shared.settings).slice_interval_min
    }

    /// Let the DAQ GPIO line start and stop armed recordings.
    pub fn set_external_record_trigger(&self, enabled: bool) {
        lock(&self.shared.settings).external_record_trigger = enabled;
    }

    pub fn external_record_trigger(&self) -> bool {
        lock(&self.shared.settings).external_record_trigger
    }
}

impl Drop for MiniScope {
    fn drop(&mut self) {
        self.stop();
        self.set_excitation(0.0);
        self.disconnect();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{SyntheticConfig, SyntheticDevice, SyntheticFaults};

    fn make_scope() -> (MiniScope, SyntheticFaults) {
        let device = SyntheticDevice::new(SyntheticConfig {
            name: "stub://unit".to_string(),
            width: 16,
            height: 8,
            channels: 3,
        });
        let faults = device.faults();
        (MiniScope::new(Box::new(device)), faults)
    }

    #[test]
    fn defaults_match_documented_values() {
        let (scope, _) = make_scope();
        assert_eq!(scope.exposure(), 100);
        assert_eq!(scope.gain(), 32);
        assert_eq!(scope.excitation(), 1.0);
        assert_eq!(scope.fps(), 20);
        assert!(!scope.is_connected());
    }

    #[test]
    fn exposure_is_clamped() {
        let (scope, _) = make_scope();
        scope.set_exposure(0);
        assert_eq!(scope.exposure(), 1);
        scope.set_exposure(150);
        assert_eq!(scope.exposure(), 100);
        scope.set_exposure(50);
        assert_eq!(scope.exposure(), 50);
        scope.set_exposure(-4);
        assert_eq!(scope.exposure(), 1);
    }

    #[test]
    fn led_power_curve() {
        assert_eq!(led_power(100.0), 0.5);
        assert_eq!(led_power(0.0), 0.0);
        assert_eq!(led_power(50.0), 0.25);
        assert_eq!(led_power(250.0), 0.5);
    }

    #[test]
    fn connect_initializes_sensor_and_switches_led_off() -> Result<()> {
        let (mut scope, faults) = make_scope();
        scope.connect()?;
        assert_eq!(
            faults.last_property(DeviceProperty::Saturation),
            Some(SET_CMOS_SETTINGS)
        );
        assert_eq!(faults.last_property(DeviceProperty::Brightness), Some(1.0));
        assert_eq!(faults.last_property(DeviceProperty::Gain), Some(0.32));
        assert_eq!(faults.last_property(DeviceProperty::Hue), Some(0.0));
        assert_eq!(
            scope.next_message().as_deref(),
            Some("Initialized camera 0")
        );
        Ok(())
    }

    #[test]
    fn second_connect_fails() -> Result<()> {
        let (mut scope, _) = make_scope();
        scope.connect()?;
        assert!(scope.connect().is_err());
        assert!(scope.is_connected());
        Ok(())
    }

    #[test]
    fn setters_push_to_connected_device() -> Result<()> {
        let (mut scope, faults) = make_scope();
        scope.set_excitation(100.0);
        assert_eq!(faults.last_property(DeviceProperty::Hue), None);

        scope.connect()?;
        scope.set_excitation(100.0);
        assert_eq!(faults.last_property(DeviceProperty::Hue), Some(0.5));
        scope.set_excitation(50.0);
        assert_eq!(faults.last_property(DeviceProperty::Hue), Some(0.25));
        scope.set_excitation(0.0);
        assert_eq!(faults.last_property(DeviceProperty::Hue), Some(0.0));
        scope.set_exposure(40);
        assert_eq!(faults.last_property(DeviceProperty::Brightness), Some(0.4));
        scope.set_gain(64);
        assert_eq!(faults.last_property(DeviceProperty::Gain), Some(0.64));
        Ok(())
    }

    #[test]
    fn run_requires_connection() {
        let (mut scope, _) = make_scope();
        assert!(scope.run().is_err());
        assert!(!scope.is_running());
    }

    #[test]
    fn start_recording_requires_connection() {
        let (mut scope, _) = make_scope();
        assert!(scope.start_recording("/tmp/never").is_err());
        assert!(!scope.is_recording());
    }

    #[test]
    fn dispatch_runs_callback_on_caller_thread() -> Result<()> {
        let (mut scope, _) = make_scope();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        scope.set_on_message(move |msg| sink.lock().unwrap().push(msg.to_string()));
        scope.connect()?;
        scope.disconnect();
        assert_eq!(scope.dispatch_messages(), 2);
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["Initialized camera 0", "Disconnected camera 0"]
        );
        Ok(())
    }

    #[test]
    fn display_range_is_clamped() {
        let (scope, _) = make_scope();
        scope.set_min_fluor_display(-20);
        scope.set_max_fluor_display(400);
        assert_eq!(scope.min_fluor_display(), 0);
        assert_eq!(scope.max_fluor_display(), 255);
    }
}
