use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use tempfile::NamedTempFile;

use miniscope_daq::config::ScopeConfig;
use miniscope_daq::encoder::{VideoCodec, VideoContainer};
use miniscope_daq::process::BackgroundDiffMethod;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "MINISCOPE_CONFIG",
        "MINISCOPE_DEVICE",
        "MINISCOPE_CAM_ID",
        "MINISCOPE_FPS",
        "MINISCOPE_DATA_DIR",
        "MINISCOPE_CODEC",
        "MINISCOPE_CONTAINER",
        "MINISCOPE_EXCITATION",
    ] {
        std::env::remove_var(key);
    }
}

fn config_file(suffix: &str, contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp config");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn defaults_without_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = ScopeConfig::load().expect("load defaults");
    assert_eq!(cfg.device.uri, "stub://miniscope");
    assert_eq!(cfg.cam_id, 0);
    assert_eq!(cfg.acquisition.fps, 20);
    assert_eq!(cfg.acquisition.exposure, 100);
    assert_eq!(cfg.acquisition.gain, 32);
    assert_eq!(cfg.acquisition.excitation, 1.0);
    assert_eq!(cfg.display.min_fluor, 0);
    assert_eq!(cfg.display.max_fluor, 255);
    assert_eq!(cfg.recording.codec, VideoCodec::Ffv1);
    assert_eq!(cfg.recording.container, VideoContainer::Matroska);
    assert!(cfg.recording.lossless);
    assert_eq!(cfg.recording.slice_interval_min, 0);
    assert_eq!(cfg.recording.data_dir, std::env::temp_dir());
}

#[test]
fn loads_toml_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = config_file(
        ".toml",
        r#"
            [device]
            uri = "stub://bench"
            cam_id = 2

            [acquisition]
            fps = 30
            exposure = 60
            gain = 16
            excitation = 12.5
            color_check = true

            [display]
            min_fluor = 10
            max_fluor = 200
            bg_diff = "division"
            bg_alpha = 0.05

            [recording]
            data_dir = "/data/scope"
            codec = "vp9"
            container = "avi"
            lossless = false
            slice_interval_min = 15
            external_trigger = true
        "#,
    );

    std::env::set_var("MINISCOPE_CONFIG", file.path());
    std::env::set_var("MINISCOPE_CAM_ID", "3");
    std::env::set_var("MINISCOPE_CODEC", "ffv1");

    let cfg = ScopeConfig::load().expect("load config");

    assert_eq!(cfg.device.uri, "stub://bench");
    assert_eq!(cfg.cam_id, 3);
    assert_eq!(cfg.acquisition.fps, 30);
    assert_eq!(cfg.acquisition.exposure, 60);
    assert_eq!(cfg.acquisition.gain, 16);
    assert_eq!(cfg.acquisition.excitation, 12.5);
    assert!(cfg.acquisition.color_check);
    assert_eq!(cfg.display.min_fluor, 10);
    assert_eq!(cfg.display.max_fluor, 200);
    assert_eq!(cfg.display.bg_diff, BackgroundDiffMethod::Division);
    assert_eq!(cfg.display.bg_alpha, 0.05);
    assert_eq!(cfg.recording.data_dir, PathBuf::from("/data/scope"));
    assert_eq!(cfg.recording.codec, VideoCodec::Ffv1);
    assert_eq!(cfg.recording.container, VideoContainer::Avi);
    assert!(!cfg.recording.lossless);
    assert_eq!(cfg.recording.slice_interval_min, 15);
    assert!(cfg.recording.external_trigger);

    clear_env();
}

#[test]
fn loads_json_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = config_file(
        ".json",
        r#"{ "acquisition": { "fps": 10 }, "recording": { "codec": "raw" } }"#,
    );
    std::env::set_var("MINISCOPE_CONFIG", file.path());
    std::env::set_var("MINISCOPE_FPS", "25");

    let cfg = ScopeConfig::load().expect("load json config");
    assert_eq!(cfg.acquisition.fps, 25);
    assert_eq!(cfg.recording.codec, VideoCodec::Raw);

    clear_env();
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = config_file(".toml", "[display]\nmin_fluor = 200\nmax_fluor = 100\n");
    std::env::set_var("MINISCOPE_CONFIG", file.path());
    assert!(ScopeConfig::load().is_err());

    let file = config_file(".toml", "[acquisition]\nexposure = 0\n");
    std::env::set_var("MINISCOPE_CONFIG", file.path());
    assert!(ScopeConfig::load().is_err());

    clear_env();
    std::env::set_var("MINISCOPE_FPS", "0");
    assert!(ScopeConfig::load().is_err());

    std::env::set_var("MINISCOPE_FPS", "fast");
    assert!(ScopeConfig::load().is_err());

    clear_env();
    std::env::set_var("MINISCOPE_CONTAINER", "webm");
    assert!(ScopeConfig::load().is_err());

    clear_env();
}

#[test]
fn missing_config_file_is_an_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("MINISCOPE_CONFIG", "/nonexistent/miniscope.toml");
    let err = ScopeConfig::load().expect_err("missing file");
    assert!(err.to_string().contains("failed to read config file"));

    clear_env();
}
