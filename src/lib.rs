//! Miniscope DAQ acquisition
//!
//! This crate drives a head-mounted fluorescence microscope (Miniscope)
//! through its USB DAQ box: connect, stream frames on a background thread,
//! process them for display, record them to video, and survive flaky cables
//! by reconnecting on dropped frames.
//!
//! # Architecture
//!
//! - `scope`: `MiniScope` controller, state machine and parameter setters
//! - `capture`: capture thread body (grab, process, record, pace)
//! - `device`: `Device` trait plus synthetic and V4L2 backends
//! - `encoder`: `VideoEncoder` trait plus raw and FFmpeg writers
//! - `process`: grayscale, demosaic, background difference, display rescale
//! - `frame`: immutable frames and the bounded display ring
//! - `messages`: non-blocking status message queue
//! - `config`: file + environment configuration
//! - `ui`: terminal spinners and status lines for the CLI
//!
//! The caller owns the controller and polls it; the capture thread never
//! calls back into caller code.

pub mod capture;
pub mod config;
pub mod device;
pub mod encoder;
pub mod frame;
pub mod messages;
pub mod process;
pub mod scope;
pub mod ui;

pub use capture::MAX_DROPPED_FRAMES;
pub use config::ScopeConfig;
pub use device::{
    create_device, Device, DeviceConfig, DeviceProperty, SyntheticConfig, SyntheticDevice,
    SyntheticFaults, SET_CMOS_SETTINGS, TRIG_RECORD_EXT,
};
pub use encoder::{
    default_encoder_factory, EncoderFactory, EncoderSettings, RawVideoWriter, VideoCodec,
    VideoContainer, VideoEncoder,
};
pub use frame::{Frame, FrameKind, FrameRing, FRAME_RING_CAPACITY};
pub use process::BackgroundDiffMethod;
pub use scope::{led_power, MiniScope, ScopeSettings};
