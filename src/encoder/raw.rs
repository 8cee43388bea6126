//! Uncompressed frame stream writer.
//!
//! Frames are appended to `<path>.raw` back to back (BGR or 8-bit gray,
//! row-major) and flushed after every frame. `finalize` writes the
//! `<path>.json` sidecar describing geometry, rate and frame count.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use super::{output_path, EncoderSettings, VideoCodec, VideoContainer, VideoEncoder};
use crate::frame::Frame;

#[derive(Debug, Serialize)]
struct RawStreamInfo {
    width: u32,
    height: u32,
    channels: u8,
    fps: u32,
    frame_count: u64,
    requested_codec: VideoCodec,
    requested_container: VideoContainer,
}

#[derive(Default)]
pub struct RawVideoWriter {
    settings: Option<EncoderSettings>,
    out: Option<BufWriter<File>>,
    frame_count: u64,
}

impl RawVideoWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn stream_path(settings: &EncoderSettings) -> PathBuf {
        output_path(&settings.path, "raw")
    }

    pub fn sidecar_path(settings: &EncoderSettings) -> PathBuf {
        output_path(&settings.path, "json")
    }
}

impl VideoEncoder for RawVideoWriter {
    fn initialize(&mut self, settings: &EncoderSettings) -> Result<()> {
        if self.out.is_some() {
            return Err(anyhow!("raw writer already initialized"));
        }
        let path = Self::stream_path(settings);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create recording directory {}", parent.display()))?;
            }
        }
        let file =
            File::create(&path).with_context(|| format!("create raw video {}", path.display()))?;
        log::info!(
            "RawVideoWriter: recording {}x{} @ {} fps to {}",
            settings.width,
            settings.height,
            settings.fps,
            path.display()
        );
        self.out = Some(BufWriter::new(file));
        self.settings = Some(settings.clone());
        self.frame_count = 0;
        Ok(())
    }

    fn encode_frame(&mut self, frame: &Frame) -> Result<()> {
        let settings = self.settings.as_ref().context("raw writer not initialized")?;
        let channels = if settings.is_color { 3 } else { 1 };
        if frame.width() != settings.width
            || frame.height() != settings.height
            || frame.channels() != channels
        {
            return Err(anyhow!(
                "frame geometry {}x{}x{} does not match recording {}x{}x{}",
                frame.width(),
                frame.height(),
                frame.channels(),
                settings.width,
                settings.height,
                channels
            ));
        }
        let out = self.out.as_mut().context("raw writer already finalized")?;
        out.write_all(frame.pixels()).context("write raw frame")?;
        out.flush().context("flush raw frame")?;
        self.frame_count += 1;
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        let Some(mut out) = self.out.take() else {
            return Ok(());
        };
        out.flush().context("flush raw video")?;
        let Some(settings) = self.settings.as_ref() else {
            return Ok(());
        };
        let info = RawStreamInfo {
            width: settings.width,
            height: settings.height,
            channels: if settings.is_color { 3 } else { 1 },
            fps: settings.fps,
            frame_count: self.frame_count,
            requested_codec: settings.codec,
            requested_container: settings.container,
        };
        let sidecar = Self::sidecar_path(settings);
        let json = serde_json::to_vec_pretty(&info)?;
        std::fs::write(&sidecar, json)
            .with_context(|| format!("write raw video sidecar {}", sidecar.display()))?;
        log::info!(
            "RawVideoWriter: finalized {} frames ({})",
            self.frame_count,
            sidecar.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(dir: &std::path::Path) -> EncoderSettings {
        EncoderSettings {
            path: dir.join("session_scope"),
            width: 2,
            height: 2,
            fps: 20,
            is_color: false,
            codec: VideoCodec::Raw,
            container: VideoContainer::Avi,
            lossless: true,
        }
    }

    #[test]
    fn writes_frames_and_sidecar() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let settings = settings(dir.path());
        let mut writer = RawVideoWriter::new();
        writer.initialize(&settings)?;
        writer.encode_frame(&Frame::new(vec![1, 2, 3, 4], 2, 2, 1)?)?;
        writer.encode_frame(&Frame::new(vec![5, 6, 7, 8], 2, 2, 1)?)?;
        writer.finalize()?;
        writer.finalize()?;

        let bytes = std::fs::read(RawVideoWriter::stream_path(&settings))?;
        assert_eq!(bytes, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        let info: serde_json::Value =
            serde_json::from_slice(&std::fs::read(RawVideoWriter::sidecar_path(&settings))?)?;
        assert_eq!(info["frame_count"], 2);
        assert_eq!(info["requested_codec"], "raw");
        Ok(())
    }

    #[test]
    fn frames_survive_without_finalize() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let settings = settings(dir.path());
        {
            let mut writer = RawVideoWriter::new();
            writer.initialize(&settings)?;
            writer.encode_frame(&Frame::new(vec![9; 4], 2, 2, 1)?)?;
        }
        let bytes = std::fs::read(RawVideoWriter::stream_path(&settings))?;
        assert_eq!(bytes, vec![9; 4]);
        Ok(())
    }

    #[test]
    fn rejects_geometry_mismatch() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut writer = RawVideoWriter::new();
        writer.initialize(&settings(dir.path()))?;
        assert!(writer
            .encode_frame(&Frame::new(vec![0; 12], 2, 2, 3)?)
            .is_err());
        Ok(())
    }
}
