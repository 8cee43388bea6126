//! Imaging device boundary.
//!
//! This module provides the `Device` trait the acquisition controller drives and
//! the backends implementing it:
//! - Synthetic sensor (`stub://` URIs) with fault injection for tests and demos
//! - USB/V4L2 Miniscope DAQ boxes (feature: device-v4l2)
//!
//! A device exposes the blocking grab/retrieve contract of a UVC camera plus
//! scalar property writes. The Miniscope DAQ firmware repurposes several UVC
//! controls: hue drives the excitation LED, saturation carries sensor commands
//! on write and the GPIO state on read.

use anyhow::{anyhow, Result};

use crate::frame::Frame;

#[cfg(feature = "device-v4l2")]
mod normalize;
pub mod synthetic;
#[cfg(feature = "device-v4l2")]
pub mod v4l2;

pub use synthetic::{SyntheticConfig, SyntheticDevice, SyntheticFaults};
#[cfg(feature = "device-v4l2")]
pub use v4l2::V4l2Device;

/// Saturation value that initializes the CMOS sensor (enables FPS, gain and exposure control).
pub const SET_CMOS_SETTINGS: f64 = 16.0;

/// GPIO bit (read through saturation) signalling an external record request.
pub const TRIG_RECORD_EXT: u32 = 0x02;

/// Scalar device controls.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceProperty {
    /// Sensor exposure, normalized 0..=1.
    Brightness,
    /// Sensor gain, normalized.
    Gain,
    /// Excitation LED power, normalized 0..=1.
    Hue,
    /// Sensor command channel on write, GPIO state on read.
    Saturation,
}

/// A camera addressed by numeric id with a blocking grab/retrieve contract.
///
/// Calls may block for as long as the hardware takes; there is no timeout.
pub trait Device: Send {
    /// Open the camera with the given id. Re-opening an open device reopens it.
    fn open(&mut self, id: i32) -> Result<()>;

    /// Release the camera. Safe to call when not open.
    fn release(&mut self);

    fn is_open(&self) -> bool;

    /// Latch the next frame on the device.
    fn grab(&mut self) -> Result<()>;

    /// Decode the latched frame.
    fn retrieve(&mut self) -> Result<Frame>;

    fn set_property(&mut self, property: DeviceProperty, value: f64) -> Result<()>;

    fn property(&mut self, property: DeviceProperty) -> Result<f64>;
}

/// Where and how to create a device.
#[derive(Clone, Debug)]
pub struct DeviceConfig {
    /// `stub://<name>` for the synthetic sensor, anything else selects V4L2.
    pub uri: String,
    /// Preferred frame width.
    pub width: u32,
    /// Preferred frame height.
    pub height: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            uri: "stub://miniscope".to_string(),
            width: crate::frame::DROPPED_FRAME_WIDTH,
            height: crate::frame::DROPPED_FRAME_HEIGHT,
        }
    }
}

/// Build the backend named by `config.uri`. The device is not opened yet.
pub fn create_device(config: &DeviceConfig) -> Result<Box<dyn Device>> {
    if config.uri.trim().is_empty() {
        return Err(anyhow!("device uri must not be empty"));
    }
    if config.uri.starts_with("stub://") {
        return Ok(Box::new(SyntheticDevice::new(SyntheticConfig {
            name: config.uri.clone(),
            width: config.width,
            height: config.height,
            ..SyntheticConfig::default()
        })));
    }
    #[cfg(feature = "device-v4l2")]
    {
        Ok(Box::new(V4l2Device::new(config.clone())))
    }
    #[cfg(not(feature = "device-v4l2"))]
    {
        Err(anyhow!(
            "device '{}' requires the device-v4l2 feature",
            config.uri
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_uri_creates_synthetic_device() -> Result<()> {
        let mut device = create_device(&DeviceConfig::default())?;
        assert!(!device.is_open());
        device.open(0)?;
        device.grab()?;
        let frame = device.retrieve()?;
        assert_eq!(frame.width(), 752);
        assert_eq!(frame.height(), 480);
        Ok(())
    }

    #[test]
    fn empty_uri_is_rejected() {
        let config = DeviceConfig {
            uri: "  ".to_string(),
            ..DeviceConfig::default()
        };
        assert!(create_device(&config).is_err());
    }
}
