//! Video encoder boundary.
//!
//! The capture loop hands frames to a `VideoEncoder` in presentation order.
//! Writers:
//! - `RawVideoWriter`: uncompressed stream plus JSON sidecar (always built)
//! - `FfmpegVideoWriter`: codec/container output via FFmpeg (feature: encode-ffmpeg)
//!
//! An encoder is initialized once per output file and must be finalized exactly
//! once. Writers append as they go, so a file that is never finalized still
//! holds every frame written before the interruption.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use crate::frame::Frame;

#[cfg(feature = "encode-ffmpeg")]
pub mod ffmpeg;
pub mod raw;

#[cfg(feature = "encode-ffmpeg")]
pub use self::ffmpeg::FfmpegVideoWriter;
pub use raw::RawVideoWriter;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    Av1,
    #[default]
    Ffv1,
    Vp9,
    H265,
    Mpeg4,
    Raw,
}

impl FromStr for VideoCodec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "av1" => Ok(Self::Av1),
            "ffv1" => Ok(Self::Ffv1),
            "vp9" => Ok(Self::Vp9),
            "h265" | "h.265" | "hevc" => Ok(Self::H265),
            "mpeg4" | "mpeg-4" => Ok(Self::Mpeg4),
            "raw" | "none" => Ok(Self::Raw),
            other => Err(anyhow!("unknown video codec '{}'", other)),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoContainer {
    #[default]
    Matroska,
    Avi,
}

impl VideoContainer {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Matroska => "mkv",
            Self::Avi => "avi",
        }
    }
}

impl FromStr for VideoContainer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mkv" | "matroska" => Ok(Self::Matroska),
            "avi" => Ok(Self::Avi),
            other => Err(anyhow!("unknown video container '{}'", other)),
        }
    }
}

/// Everything an encoder needs to open an output file.
#[derive(Clone, Debug, PartialEq)]
pub struct EncoderSettings {
    /// Output path without extension; writers append their own.
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub is_color: bool,
    pub codec: VideoCodec,
    pub container: VideoContainer,
    pub lossless: bool,
}

impl EncoderSettings {
    /// Resolve codec/container/lossless combinations the codecs cannot honour.
    ///
    /// Raw only fits AVI, H.265 is written to Matroska, FFV1 and Raw are always
    /// lossless and MPEG-4 never is.
    pub fn normalized(mut self) -> Self {
        match self.codec {
            VideoCodec::Raw => {
                self.container = VideoContainer::Avi;
                self.lossless = true;
            }
            VideoCodec::Ffv1 => self.lossless = true,
            VideoCodec::Mpeg4 => self.lossless = false,
            VideoCodec::H265 => self.container = VideoContainer::Matroska,
            VideoCodec::Av1 | VideoCodec::Vp9 => {}
        }
        self.fps = self.fps.max(1);
        self
    }
}

/// `path` with `.ext` appended. Any dot already in the caller's file name is
/// kept, so `mouse1.session` becomes `mouse1.session.mkv`.
pub fn output_path(path: &Path, extension: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

/// Sink for recorded frames.
pub trait VideoEncoder: Send {
    fn initialize(&mut self, settings: &EncoderSettings) -> Result<()>;

    /// Append one frame. Frames must match the initialized geometry.
    fn encode_frame(&mut self, frame: &Frame) -> Result<()>;

    /// Flush and close the output. Calling it again is a no-op.
    fn finalize(&mut self) -> Result<()>;
}

/// Creates a fresh encoder for every recorded file.
pub type EncoderFactory = Arc<dyn Fn() -> Box<dyn VideoEncoder> + Send + Sync>;

/// FFmpeg writer when built with `encode-ffmpeg`, raw writer otherwise.
pub fn default_encoder_factory() -> EncoderFactory {
    #[cfg(feature = "encode-ffmpeg")]
    {
        Arc::new(|| Box::new(FfmpegVideoWriter::new()) as Box<dyn VideoEncoder>)
    }
    #[cfg(not(feature = "encode-ffmpeg"))]
    {
        Arc::new(|| Box::new(RawVideoWriter::new()) as Box<dyn VideoEncoder>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(codec: VideoCodec, container: VideoContainer, lossless: bool) -> EncoderSettings {
        EncoderSettings {
            path: PathBuf::from("/tmp/out"),
            width: 4,
            height: 4,
            fps: 0,
            is_color: false,
            codec,
            container,
            lossless,
        }
        .normalized()
    }

    #[test]
    fn raw_codec_forces_avi_and_lossless() {
        let s = settings(VideoCodec::Raw, VideoContainer::Matroska, false);
        assert_eq!(s.container, VideoContainer::Avi);
        assert!(s.lossless);
        assert_eq!(s.fps, 1);
    }

    #[test]
    fn mpeg4_is_never_lossless_and_h265_uses_mkv() {
        assert!(!settings(VideoCodec::Mpeg4, VideoContainer::Avi, true).lossless);
        assert_eq!(
            settings(VideoCodec::H265, VideoContainer::Avi, false).container,
            VideoContainer::Matroska
        );
        assert!(settings(VideoCodec::Vp9, VideoContainer::Avi, true).lossless);
    }

    #[test]
    fn output_path_keeps_dots_in_the_name() {
        assert_eq!(
            output_path(Path::new("/data/mouse1.session"), "mkv"),
            PathBuf::from("/data/mouse1.session.mkv")
        );
        assert_eq!(
            output_path(Path::new("/data/mouse1.session_2"), "raw"),
            PathBuf::from("/data/mouse1.session_2.raw")
        );
    }

    #[test]
    fn codec_and_container_names_parse() -> Result<()> {
        assert_eq!("H.265".parse::<VideoCodec>()?, VideoCodec::H265);
        assert_eq!("None".parse::<VideoCodec>()?, VideoCodec::Raw);
        assert_eq!("MKV".parse::<VideoContainer>()?, VideoContainer::Matroska);
        assert!("webm".parse::<VideoContainer>().is_err());
        Ok(())
    }
}
