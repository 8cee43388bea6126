//! Per-frame pixel processing for the capture loop.
//!
//! Color path: BGR sensor frame -> grayscale reconstruction -> RG Bayer demosaic.
//! Intensity path: grayscale -> extrema -> optional background difference ->
//! linear rescale into the display clamp range.

use anyhow::{anyhow, Result};
use serde::Deserialize;

use crate::frame::Frame;

/// Background correction applied to the intensity display path.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackgroundDiffMethod {
    #[default]
    None,
    Subtraction,
    Division,
}

/// Default weight of the newest frame in the running background.
pub const DEFAULT_BG_ACCUMULATE_ALPHA: f64 = 0.01;

/// Grey level a pixel equal to its background maps to under `Division`.
const DIVISION_UNITY_LEVEL: f32 = 128.0;

/// Convert a frame to single-channel intensity. 1-channel frames are copied.
pub fn to_gray(frame: &Frame) -> Result<Frame> {
    match frame.channels() {
        1 => Ok(frame.clone()),
        3 => {
            let gray = frame
                .pixels()
                .chunks_exact(3)
                .map(|bgr| {
                    let b = bgr[0] as f32;
                    let g = bgr[1] as f32;
                    let r = bgr[2] as f32;
                    clamp_to_u8(0.114 * b + 0.587 * g + 0.299 * r)
                })
                .collect();
            frame.derive(gray, 1)
        }
        other => Err(anyhow!("cannot convert {}-channel frame to gray", other)),
    }
}

/// Demosaic a raw RG Bayer mosaic (R at even row/even column) into BGR.
///
/// Each output channel is the mean of the same-color sites in the 3x3
/// neighbourhood, with edges clamped.
pub fn demosaic_rg(raw: &Frame) -> Result<Frame> {
    if raw.channels() != 1 {
        return Err(anyhow!("demosaic expects a single-channel mosaic"));
    }
    let w = raw.width() as usize;
    let h = raw.height() as usize;
    let px = raw.pixels();
    let mut bgr = vec![0u8; w * h * 3];

    for y in 0..h {
        for x in 0..w {
            let mut sums = [0u32; 3];
            let mut counts = [0u32; 3];
            for dy in -1i64..=1 {
                for dx in -1i64..=1 {
                    let sy = (y as i64 + dy).clamp(0, h as i64 - 1) as usize;
                    let sx = (x as i64 + dx).clamp(0, w as i64 - 1) as usize;
                    let site = bayer_site(sx, sy);
                    sums[site] += px[sy * w + sx] as u32;
                    counts[site] += 1;
                }
            }
            let out = (y * w + x) * 3;
            for c in 0..3 {
                bgr[out + c] = if counts[c] == 0 {
                    0
                } else {
                    (sums[c] / counts[c]) as u8
                };
            }
        }
    }

    raw.derive(bgr, 3)
}

/// BGR channel index of the color filter at (x, y) in an RGGB mosaic.
fn bayer_site(x: usize, y: usize) -> usize {
    match (y % 2, x % 2) {
        (0, 0) => 2,
        (1, 1) => 0,
        _ => 1,
    }
}

/// Minimum and maximum pixel value of a frame.
pub fn min_max(frame: &Frame) -> (f64, f64) {
    let mut min = u8::MAX;
    let mut max = u8::MIN;
    for &p in frame.pixels() {
        min = min.min(p);
        max = max.max(p);
    }
    if frame.pixels().is_empty() {
        return (0.0, 0.0);
    }
    (min as f64, max as f64)
}

/// Linearly map `[min_display, max_display]` onto `[0, 255]`, clipping outside.
pub fn rescale_display(frame: &Frame, min_display: i32, max_display: i32) -> Result<Frame> {
    let span = (max_display - min_display).max(1) as f32;
    let scale = 255.0 / span;
    let offset = min_display as f32;
    let data = frame
        .pixels()
        .iter()
        .map(|&p| clamp_to_u8((p as f32 - offset) * scale))
        .collect();
    frame.derive(data, frame.channels())
}

/// Running background estimate for the intensity display path.
#[derive(Debug)]
pub struct BackgroundModel {
    method: BackgroundDiffMethod,
    alpha: f32,
    accumulator: Vec<f32>,
    geometry: (u32, u32),
}

impl BackgroundModel {
    pub fn new(method: BackgroundDiffMethod, alpha: f64) -> Self {
        Self {
            method,
            alpha: alpha.clamp(f64::EPSILON, 1.0) as f32,
            accumulator: Vec::new(),
            geometry: (0, 0),
        }
    }

    pub fn method(&self) -> BackgroundDiffMethod {
        self.method
    }

    /// Update parameters; switching method discards the accumulated background.
    pub fn configure(&mut self, method: BackgroundDiffMethod, alpha: f64) {
        if method != self.method {
            self.accumulator.clear();
        }
        self.method = method;
        self.alpha = alpha.clamp(f64::EPSILON, 1.0) as f32;
    }

    /// Fold `gray` into the background and return the corrected frame.
    pub fn apply(&mut self, gray: &Frame) -> Result<Frame> {
        if self.method == BackgroundDiffMethod::None {
            return Ok(gray.clone());
        }
        if gray.channels() != 1 {
            return Err(anyhow!("background correction expects a gray frame"));
        }

        let geometry = (gray.width(), gray.height());
        if self.geometry != geometry || self.accumulator.len() != gray.pixels().len() {
            self.geometry = geometry;
            self.accumulator = gray.pixels().iter().map(|&p| p as f32).collect();
        } else {
            let alpha = self.alpha;
            for (acc, &p) in self.accumulator.iter_mut().zip(gray.pixels()) {
                *acc = (1.0 - alpha) * *acc + alpha * p as f32;
            }
        }

        let data = match self.method {
            BackgroundDiffMethod::Subtraction => gray
                .pixels()
                .iter()
                .zip(&self.accumulator)
                .map(|(&p, &bg)| clamp_to_u8(p as f32 - bg))
                .collect(),
            BackgroundDiffMethod::Division => gray
                .pixels()
                .iter()
                .zip(&self.accumulator)
                .map(|(&p, &bg)| clamp_to_u8(p as f32 / bg.max(1.0) * DIVISION_UNITY_LEVEL))
                .collect(),
            BackgroundDiffMethod::None => unreachable!("handled above"),
        };
        gray.derive(data, 1)
    }
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray(data: Vec<u8>, w: u32, h: u32) -> Frame {
        Frame::new(data, w, h, 1).unwrap()
    }

    #[test]
    fn bgr_to_gray_uses_luma_weights() -> Result<()> {
        let frame = Frame::new(vec![0, 0, 255, 255, 255, 255], 2, 1, 3)?;
        let out = to_gray(&frame)?;
        assert_eq!(out.channels(), 1);
        assert_eq!(out.pixels(), &[76, 255]);
        Ok(())
    }

    #[test]
    fn extrema_of_frame() {
        let frame = gray(vec![12, 200, 7, 90], 2, 2);
        assert_eq!(min_max(&frame), (7.0, 200.0));
    }

    #[test]
    fn rescale_maps_display_range_and_clips() -> Result<()> {
        let frame = gray(vec![0, 50, 70, 150, 200], 5, 1);
        let out = rescale_display(&frame, 50, 150)?;
        assert_eq!(out.pixels(), &[0, 0, 51, 255, 255]);
        Ok(())
    }

    #[test]
    fn rescale_tolerates_degenerate_range() -> Result<()> {
        let frame = gray(vec![10, 11], 2, 1);
        let out = rescale_display(&frame, 10, 10)?;
        assert_eq!(out.pixels(), &[0, 255]);
        Ok(())
    }

    #[test]
    fn demosaic_flat_mosaic_yields_flat_color() -> Result<()> {
        // R sites 200, G sites 100, B sites 50.
        let mut data = Vec::new();
        for y in 0..4 {
            for x in 0..4 {
                data.push(match (y % 2, x % 2) {
                    (0, 0) => 200,
                    (1, 1) => 50,
                    _ => 100,
                });
            }
        }
        let out = demosaic_rg(&gray(data, 4, 4))?;
        assert_eq!(out.channels(), 3);
        for bgr in out.pixels().chunks_exact(3) {
            assert_eq!(bgr, &[50, 100, 200]);
        }
        Ok(())
    }

    #[test]
    fn subtraction_background_cancels_static_scene() -> Result<()> {
        let mut model = BackgroundModel::new(BackgroundDiffMethod::Subtraction, 0.5);
        let frame = gray(vec![80; 4], 2, 2);
        let first = model.apply(&frame)?;
        assert_eq!(first.pixels(), &[0, 0, 0, 0]);
        let second = model.apply(&frame)?;
        assert_eq!(second.pixels(), &[0, 0, 0, 0]);
        Ok(())
    }

    #[test]
    fn division_background_maps_unity_to_mid_grey() -> Result<()> {
        let mut model = BackgroundModel::new(BackgroundDiffMethod::Division, 0.1);
        let out = model.apply(&gray(vec![60; 4], 2, 2))?;
        assert_eq!(out.pixels(), &[128; 4]);
        Ok(())
    }

    #[test]
    fn switching_method_resets_background() -> Result<()> {
        let mut model = BackgroundModel::new(BackgroundDiffMethod::Subtraction, 1.0);
        model.apply(&gray(vec![100; 4], 2, 2))?;
        model.configure(BackgroundDiffMethod::Division, 1.0);
        let out = model.apply(&gray(vec![50; 4], 2, 2))?;
        assert_eq!(out.pixels(), &[128; 4]);
        Ok(())
    }
}
