//! V4L2 Miniscope device.
//!
//! The Miniscope DAQ box enumerates as a UVC camera. `V4l2Device`:
//! - Opens `/dev/video<id>` (or the configured `/dev/...` node)
//! - Latches frames from an mmap stream on `grab`
//! - Converts the latched buffer (RGB24 or YUYV) to BGR on `retrieve`
//! - Maps normalized property values onto the V4L2 control ranges

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;
use std::collections::HashMap;

use super::normalize::{normalize_to_bgr, PixelFormat};
use super::{Device, DeviceConfig, DeviceProperty};
use crate::frame::Frame;

const V4L2_CID_BRIGHTNESS: u32 = 0x0098_0900;
const V4L2_CID_SATURATION: u32 = 0x0098_0902;
const V4L2_CID_HUE: u32 = 0x0098_0903;
const V4L2_CID_GAIN: u32 = 0x0098_0913;

const STREAM_BUFFERS: u32 = 4;

#[self_referencing]
struct V4l2State {
    device: v4l::Device,
    #[borrows(device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

/// UVC/V4L2 implementation of `Device`.
pub struct V4l2Device {
    config: DeviceConfig,
    state: Option<V4l2State>,
    format: PixelFormat,
    active_width: u32,
    active_height: u32,
    control_ranges: HashMap<u32, (i64, i64)>,
    latched: Option<Vec<u8>>,
}

impl V4l2Device {
    pub fn new(config: DeviceConfig) -> Self {
        Self {
            active_width: config.width,
            active_height: config.height,
            config,
            state: None,
            format: PixelFormat::Rgb24,
            control_ranges: HashMap::new(),
            latched: None,
        }
    }

    fn device_path(&self, id: i32) -> String {
        if self.config.uri.starts_with("/dev/") {
            self.config.uri.clone()
        } else {
            format!("/dev/video{}", id)
        }
    }

    fn control_id(property: DeviceProperty) -> u32 {
        match property {
            DeviceProperty::Brightness => V4L2_CID_BRIGHTNESS,
            DeviceProperty::Gain => V4L2_CID_GAIN,
            DeviceProperty::Hue => V4L2_CID_HUE,
            DeviceProperty::Saturation => V4L2_CID_SATURATION,
        }
    }

    /// Normalized 0..=1 values are scaled into the control range; the
    /// saturation command channel takes raw values.
    fn to_control_value(&self, property: DeviceProperty, value: f64) -> i64 {
        let id = Self::control_id(property);
        match (property, self.control_ranges.get(&id)) {
            (DeviceProperty::Saturation, _) | (_, None) => value.round() as i64,
            (_, Some(&(min, max))) => {
                let span = (max - min) as f64;
                min + (value.clamp(0.0, 1.0) * span).round() as i64
            }
        }
    }
}

impl Device for V4l2Device {
    fn open(&mut self, id: i32) -> Result<()> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        self.release();
        let path = self.device_path(id);
        let device =
            v4l::Device::with_path(&path).with_context(|| format!("open v4l2 device {}", path))?;

        let mut format = device.format().context("read v4l2 format")?;
        format.width = self.config.width;
        format.height = self.config.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");
        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!("V4l2Device: failed to set format on {}: {}", path, err);
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };
        self.format = PixelFormat::from_fourcc(&format.fourcc.repr)
            .ok_or_else(|| anyhow!("unsupported pixel format {}", format.fourcc))?;
        self.active_width = format.width;
        self.active_height = format.height;

        self.control_ranges = match device.query_controls() {
            Ok(controls) => controls
                .into_iter()
                .map(|desc| (desc.id, (desc.minimum, desc.maximum)))
                .collect(),
            Err(err) => {
                log::warn!("V4l2Device: failed to query controls on {}: {}", path, err);
                HashMap::new()
            }
        };

        let state = V4l2StateTryBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, STREAM_BUFFERS)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;
        self.state = Some(state);

        log::info!(
            "V4l2Device: opened {} ({}x{}, {:?})",
            path,
            self.active_width,
            self.active_height,
            self.format
        );
        Ok(())
    }

    fn release(&mut self) {
        if self.state.take().is_some() {
            log::info!("V4l2Device: released {}", self.config.uri);
        }
        self.latched = None;
    }

    fn is_open(&self) -> bool {
        self.state.is_some()
    }

    fn grab(&mut self) -> Result<()> {
        use v4l::io::traits::CaptureStream;

        let state = self.state.as_mut().context("v4l2 device not open")?;
        let latched = state
            .with_mut(|fields| -> std::io::Result<Vec<u8>> {
                let (buf, meta) = fields.stream.next()?;
                let used = (meta.bytesused as usize).min(buf.len());
                Ok(buf[..used].to_vec())
            })
            .context("capture v4l2 frame")?;
        self.latched = Some(latched);
        Ok(())
    }

    fn retrieve(&mut self) -> Result<Frame> {
        let buf = self.latched.take().context("no frame latched")?;
        let bgr = normalize_to_bgr(&buf, self.active_width, self.active_height, self.format)?;
        Frame::new(bgr, self.active_width, self.active_height, 3)
    }

    fn set_property(&mut self, property: DeviceProperty, value: f64) -> Result<()> {
        let raw = self.to_control_value(property, value);
        let state = self.state.as_ref().context("v4l2 device not open")?;
        let control = v4l::control::Control {
            id: Self::control_id(property),
            value: v4l::control::Value::Integer(raw),
        };
        state
            .borrow_device()
            .set_control(control)
            .with_context(|| format!("set v4l2 control {:?}={}", property, raw))
    }

    fn property(&mut self, property: DeviceProperty) -> Result<f64> {
        let state = self.state.as_ref().context("v4l2 device not open")?;
        let control = state
            .borrow_device()
            .control(Self::control_id(property))
            .with_context(|| format!("read v4l2 control {:?}", property))?;
        match control.value {
            v4l::control::Value::Integer(v) => Ok(v as f64),
            v4l::control::Value::Boolean(b) => Ok(if b { 1.0 } else { 0.0 }),
            _ => Err(anyhow!("v4l2 control {:?} is not numeric", property)),
        }
    }
}
