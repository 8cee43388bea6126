use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::device::DeviceConfig;
use crate::encoder::{VideoCodec, VideoContainer};
use crate::process::{BackgroundDiffMethod, DEFAULT_BG_ACCUMULATE_ALPHA};
use crate::scope::{MiniScope, DEFAULT_EXCITATION, DEFAULT_EXPOSURE, DEFAULT_FPS, DEFAULT_GAIN};

const DEFAULT_DEVICE_URI: &str = "stub://miniscope";
const DEFAULT_MIN_FLUOR: i32 = 0;
const DEFAULT_MAX_FLUOR: i32 = 255;

#[derive(Debug, Deserialize, Default)]
struct ScopeConfigFile {
    device: Option<DeviceConfigFile>,
    acquisition: Option<AcquisitionConfigFile>,
    display: Option<DisplayConfigFile>,
    recording: Option<RecordingConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct DeviceConfigFile {
    uri: Option<String>,
    cam_id: Option<i32>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct AcquisitionConfigFile {
    fps: Option<u32>,
    exposure: Option<i32>,
    gain: Option<i32>,
    excitation: Option<f64>,
    color_check: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct DisplayConfigFile {
    min_fluor: Option<i32>,
    max_fluor: Option<i32>,
    bg_diff: Option<BackgroundDiffMethod>,
    bg_alpha: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct RecordingConfigFile {
    data_dir: Option<PathBuf>,
    codec: Option<VideoCodec>,
    container: Option<VideoContainer>,
    lossless: Option<bool>,
    slice_interval_min: Option<u32>,
    external_trigger: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct ScopeConfig {
    pub device: DeviceConfig,
    pub cam_id: i32,
    pub acquisition: AcquisitionSettings,
    pub display: DisplaySettings,
    pub recording: RecordingSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionSettings {
    pub fps: u32,
    pub exposure: i32,
    pub gain: i32,
    pub excitation: f64,
    pub color_check: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DisplaySettings {
    pub min_fluor: i32,
    pub max_fluor: i32,
    pub bg_diff: BackgroundDiffMethod,
    pub bg_alpha: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordingSettings {
    pub data_dir: PathBuf,
    pub codec: VideoCodec,
    pub container: VideoContainer,
    pub lossless: bool,
    pub slice_interval_min: u32,
    pub external_trigger: bool,
}

impl ScopeConfig {
    /// Defaults, then the file named by `MINISCOPE_CONFIG`, then `MINISCOPE_*`
    /// environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("MINISCOPE_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load a specific file, still honouring environment overrides.
    pub fn from_path(path: &Path) -> Result<Self> {
        let mut cfg = Self::from_file(read_config_file(path)?);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ScopeConfigFile) -> Self {
        let device = file.device.unwrap_or_default();
        let acquisition = file.acquisition.unwrap_or_default();
        let display = file.display.unwrap_or_default();
        let recording = file.recording.unwrap_or_default();
        let device_defaults = DeviceConfig::default();

        Self {
            device: DeviceConfig {
                uri: device
                    .uri
                    .unwrap_or_else(|| DEFAULT_DEVICE_URI.to_string()),
                width: device.width.unwrap_or(device_defaults.width),
                height: device.height.unwrap_or(device_defaults.height),
            },
            cam_id: device.cam_id.unwrap_or(0),
            acquisition: AcquisitionSettings {
                fps: acquisition.fps.unwrap_or(DEFAULT_FPS),
                exposure: acquisition.exposure.unwrap_or(DEFAULT_EXPOSURE),
                gain: acquisition.gain.unwrap_or(DEFAULT_GAIN),
                excitation: acquisition.excitation.unwrap_or(DEFAULT_EXCITATION),
                color_check: acquisition.color_check.unwrap_or(false),
            },
            display: DisplaySettings {
                min_fluor: display.min_fluor.unwrap_or(DEFAULT_MIN_FLUOR),
                max_fluor: display.max_fluor.unwrap_or(DEFAULT_MAX_FLUOR),
                bg_diff: display.bg_diff.unwrap_or_default(),
                bg_alpha: display.bg_alpha.unwrap_or(DEFAULT_BG_ACCUMULATE_ALPHA),
            },
            recording: RecordingSettings {
                data_dir: recording.data_dir.unwrap_or_else(std::env::temp_dir),
                codec: recording.codec.unwrap_or_default(),
                container: recording.container.unwrap_or_default(),
                lossless: recording.lossless.unwrap_or(true),
                slice_interval_min: recording.slice_interval_min.unwrap_or(0),
                external_trigger: recording.external_trigger.unwrap_or(false),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(uri) = std::env::var("MINISCOPE_DEVICE") {
            if !uri.trim().is_empty() {
                self.device.uri = uri;
            }
        }
        if let Ok(id) = std::env::var("MINISCOPE_CAM_ID") {
            self.cam_id = id
                .trim()
                .parse()
                .map_err(|_| anyhow!("MINISCOPE_CAM_ID must be an integer camera id"))?;
        }
        if let Ok(fps) = std::env::var("MINISCOPE_FPS") {
            self.acquisition.fps = fps
                .trim()
                .parse()
                .map_err(|_| anyhow!("MINISCOPE_FPS must be a positive integer"))?;
        }
        if let Ok(dir) = std::env::var("MINISCOPE_DATA_DIR") {
            if !dir.trim().is_empty() {
                self.recording.data_dir = PathBuf::from(dir);
            }
        }
        if let Ok(codec) = std::env::var("MINISCOPE_CODEC") {
            if !codec.trim().is_empty() {
                self.recording.codec = codec.parse()?;
            }
        }
        if let Ok(container) = std::env::var("MINISCOPE_CONTAINER") {
            if !container.trim().is_empty() {
                self.recording.container = container.parse()?;
            }
        }
        if let Ok(excitation) = std::env::var("MINISCOPE_EXCITATION") {
            self.acquisition.excitation = excitation
                .trim()
                .parse()
                .map_err(|_| anyhow!("MINISCOPE_EXCITATION must be a number in 0..=100"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.device.uri.trim().is_empty() {
            return Err(anyhow!("device uri must not be empty"));
        }
        if self.acquisition.fps == 0 {
            return Err(anyhow!("fps must be greater than zero"));
        }
        if !(1..=100).contains(&self.acquisition.exposure) {
            return Err(anyhow!("exposure must be within 1..=100"));
        }
        if !(0.0..=100.0).contains(&self.acquisition.excitation) {
            return Err(anyhow!("excitation must be within 0..=100"));
        }
        let display = &self.display;
        if !(0..=255).contains(&display.min_fluor) || !(0..=255).contains(&display.max_fluor) {
            return Err(anyhow!("display range must be within 0..=255"));
        }
        if display.min_fluor >= display.max_fluor {
            return Err(anyhow!("display min_fluor must be below max_fluor"));
        }
        if !(display.bg_alpha > 0.0 && display.bg_alpha <= 1.0) {
            return Err(anyhow!("display bg_alpha must be within (0, 1]"));
        }
        if self.recording.data_dir.as_os_str().is_empty() {
            return Err(anyhow!("recording data_dir must not be empty"));
        }
        Ok(())
    }

    /// Push every setting into `scope`.
    ///
    /// `connect` resets exposure, gain and excitation to their defaults, so
    /// call this after connecting.
    pub fn apply(&self, scope: &MiniScope) -> Result<()> {
        scope.set_scope_cam_id(self.cam_id);
        scope.set_fps(self.acquisition.fps);
        scope.set_exposure(self.acquisition.exposure);
        scope.set_gain(self.acquisition.gain);
        scope.set_excitation(self.acquisition.excitation);
        scope.set_color_check(self.acquisition.color_check);
        scope.set_min_fluor_display(self.display.min_fluor);
        scope.set_max_fluor_display(self.display.max_fluor);
        scope.set_display_bg_diff_method(self.display.bg_diff);
        scope.set_bg_accumulate_alpha(self.display.bg_alpha);
        scope.set_video_codec(self.recording.codec)?;
        scope.set_video_container(self.recording.container)?;
        scope.set_record_lossless(self.recording.lossless)?;
        scope.set_recording_slice_interval(self.recording.slice_interval_min);
        scope.set_external_record_trigger(self.recording.external_trigger);
        Ok(())
    }
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self::from_file(ScopeConfigFile::default())
    }
}

fn read_config_file(path: &Path) -> Result<ScopeConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_json = path
        .extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case("json"));
    let cfg = if is_json {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
