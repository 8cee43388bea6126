//! Synthetic Miniscope sensor.
//!
//! `SyntheticDevice` backs `stub://` URIs. It produces a drifting test pattern
//! with shot noise and honours the full `Device` contract, so the controller
//! can be exercised without hardware. A cloneable `SyntheticFaults` handle
//! injects grab/retrieve/open failures and exposes what the controller did to
//! the device (opens, releases, last property writes).

use anyhow::{anyhow, bail, Result};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::{Device, DeviceProperty};
use crate::frame::Frame;

/// Configuration for a synthetic sensor.
#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// 3 emulates the BGR frames a UVC backend hands out, 1 a mono sensor.
    pub channels: u8,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            name: "stub://miniscope".to_string(),
            width: crate::frame::DROPPED_FRAME_WIDTH,
            height: crate::frame::DROPPED_FRAME_HEIGHT,
            channels: 3,
        }
    }
}

#[derive(Debug, Default)]
struct FaultState {
    grab_fails: AtomicBool,
    open_fails: AtomicBool,
    retrieve_failures: AtomicU32,
    gpio: AtomicU32,
    opens: AtomicU32,
    releases: AtomicU32,
    frames: AtomicU64,
    properties: Mutex<HashMap<DeviceProperty, f64>>,
}

/// Shared fault-injection and observation handle for a `SyntheticDevice`.
#[derive(Clone, Debug, Default)]
pub struct SyntheticFaults {
    inner: Arc<FaultState>,
}

impl SyntheticFaults {
    /// Make every `grab` fail until cleared.
    pub fn fail_grabs(&self, fail: bool) {
        self.inner.grab_fails.store(fail, Ordering::SeqCst);
    }

    /// Make every `open` fail until cleared.
    pub fn fail_opens(&self, fail: bool) {
        self.inner.open_fails.store(fail, Ordering::SeqCst);
    }

    /// Fail the next `count` retrieves.
    pub fn fail_next_retrieves(&self, count: u32) {
        self.inner.retrieve_failures.store(count, Ordering::SeqCst);
    }

    pub fn pending_retrieve_failures(&self) -> u32 {
        self.inner.retrieve_failures.load(Ordering::SeqCst)
    }

    /// GPIO word reported when saturation is read.
    pub fn set_gpio(&self, state: u32) {
        self.inner.gpio.store(state, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> u32 {
        self.inner.opens.load(Ordering::SeqCst)
    }

    pub fn release_count(&self) -> u32 {
        self.inner.releases.load(Ordering::SeqCst)
    }

    /// Frames successfully retrieved so far.
    pub fn frames_delivered(&self) -> u64 {
        self.inner.frames.load(Ordering::SeqCst)
    }

    /// Last value written to `property`, if any.
    pub fn last_property(&self, property: DeviceProperty) -> Option<f64> {
        self.inner.properties.lock().ok()?.get(&property).copied()
    }

    fn take_retrieve_failure(&self) -> bool {
        self.inner
            .retrieve_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Synthetic sensor implementing `Device`.
pub struct SyntheticDevice {
    config: SyntheticConfig,
    faults: SyntheticFaults,
    open: bool,
    latched: bool,
    frame_count: u64,
}

impl SyntheticDevice {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            faults: SyntheticFaults::default(),
            open: false,
            latched: false,
            frame_count: 0,
        }
    }

    /// Handle for injecting faults after the device has been handed off.
    pub fn faults(&self) -> SyntheticFaults {
        self.faults.clone()
    }

    /// Drifting diagonal gradient with a little noise.
    fn generate_synthetic_pixels(&mut self) -> Vec<u8> {
        let w = self.config.width as usize;
        let h = self.config.height as usize;
        let channels = self.config.channels as usize;
        let mut rng = rand::thread_rng();
        let mut pixels = vec![0u8; w * h * channels];
        for y in 0..h {
            for x in 0..w {
                let base = ((x + y) as u64 + self.frame_count) % 200;
                let value = (base as u8).saturating_add(rng.gen_range(0..8));
                let offset = (y * w + x) * channels;
                pixels[offset..offset + channels].fill(value);
            }
        }
        pixels
    }
}

impl Device for SyntheticDevice {
    fn open(&mut self, id: i32) -> Result<()> {
        self.faults.inner.opens.fetch_add(1, Ordering::SeqCst);
        if self.faults.inner.open_fails.load(Ordering::SeqCst) {
            self.open = false;
            bail!("unable to open camera {} ({})", id, self.config.name);
        }
        self.open = true;
        self.latched = false;
        log::info!(
            "SyntheticDevice: opened camera {} ({}, {}x{})",
            id,
            self.config.name,
            self.config.width,
            self.config.height
        );
        Ok(())
    }

    fn release(&mut self) {
        if self.open {
            self.faults.inner.releases.fetch_add(1, Ordering::SeqCst);
        }
        self.open = false;
        self.latched = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn grab(&mut self) -> Result<()> {
        if !self.open {
            bail!("device not open");
        }
        if self.faults.inner.grab_fails.load(Ordering::SeqCst) {
            bail!("synthetic grab failure");
        }
        self.latched = true;
        Ok(())
    }

    fn retrieve(&mut self) -> Result<Frame> {
        if !self.latched {
            bail!("no frame latched");
        }
        self.latched = false;
        if self.faults.take_retrieve_failure() {
            bail!("synthetic decode failure");
        }

        self.frame_count += 1;
        let pixels = self.generate_synthetic_pixels();
        let frame = Frame::new(
            pixels,
            self.config.width,
            self.config.height,
            self.config.channels,
        )?;
        self.faults.inner.frames.fetch_add(1, Ordering::SeqCst);
        Ok(frame)
    }

    fn set_property(&mut self, property: DeviceProperty, value: f64) -> Result<()> {
        if !self.open {
            bail!("device not open");
        }
        self.faults
            .inner
            .properties
            .lock()
            .map_err(|_| anyhow!("synthetic property table poisoned"))?
            .insert(property, value);
        Ok(())
    }

    fn property(&mut self, property: DeviceProperty) -> Result<f64> {
        if !self.open {
            bail!("device not open");
        }
        if property == DeviceProperty::Saturation {
            return Ok(self.faults.inner.gpio.load(Ordering::SeqCst) as f64);
        }
        Ok(self.faults.last_property(property).unwrap_or(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_device() -> SyntheticDevice {
        SyntheticDevice::new(SyntheticConfig {
            name: "stub://test".to_string(),
            width: 8,
            height: 4,
            channels: 3,
        })
    }

    #[test]
    fn synthetic_device_produces_frames() -> Result<()> {
        let mut device = small_device();
        device.open(0)?;
        device.grab()?;
        let frame = device.retrieve()?;
        assert_eq!(frame.width(), 8);
        assert_eq!(frame.height(), 4);
        assert_eq!(frame.channels(), 3);
        assert!(!frame.is_dropped());
        Ok(())
    }

    #[test]
    fn retrieve_requires_grab() -> Result<()> {
        let mut device = small_device();
        device.open(0)?;
        assert!(device.retrieve().is_err());
        Ok(())
    }

    #[test]
    fn injected_retrieve_failures_are_counted_down() -> Result<()> {
        let mut device = small_device();
        let faults = device.faults();
        device.open(0)?;
        faults.fail_next_retrieves(2);

        for _ in 0..2 {
            device.grab()?;
            assert!(device.retrieve().is_err());
        }
        device.grab()?;
        assert!(device.retrieve().is_ok());
        assert_eq!(faults.pending_retrieve_failures(), 0);
        assert_eq!(faults.frames_delivered(), 1);
        Ok(())
    }

    #[test]
    fn open_failure_and_counts() {
        let mut device = small_device();
        let faults = device.faults();
        faults.fail_opens(true);
        assert!(device.open(3).is_err());
        assert!(!device.is_open());
        faults.fail_opens(false);
        assert!(device.open(3).is_ok());
        device.release();
        device.release();
        assert_eq!(faults.open_count(), 2);
        assert_eq!(faults.release_count(), 1);
    }

    #[test]
    fn properties_are_recorded_and_gpio_is_readable() -> Result<()> {
        let mut device = small_device();
        let faults = device.faults();
        assert!(device.set_property(DeviceProperty::Hue, 0.5).is_err());
        device.open(0)?;
        device.set_property(DeviceProperty::Hue, 0.25)?;
        assert_eq!(faults.last_property(DeviceProperty::Hue), Some(0.25));
        faults.set_gpio(0x02);
        assert_eq!(device.property(DeviceProperty::Saturation)?, 2.0);
        Ok(())
    }
}
