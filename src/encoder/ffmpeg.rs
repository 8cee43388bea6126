//! FFmpeg-backed video writer.
//!
//! Frames are converted with swscale into the codec's pixel format, encoded
//! and muxed into `<path>.<mkv|avi>` as they arrive. `finalize` drains the
//! encoder and writes the container trailer.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;
use ffmpeg::util::format::pixel::Pixel;

use super::{output_path, EncoderSettings, VideoCodec, VideoEncoder};
use crate::frame::Frame;

struct FfmpegSession {
    output: ffmpeg::format::context::Output,
    encoder: ffmpeg::encoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    source: ffmpeg::frame::Video,
    converted: ffmpeg::frame::Video,
    stream_index: usize,
    encoder_time_base: ffmpeg::Rational,
    stream_time_base: ffmpeg::Rational,
    next_pts: i64,
}

#[derive(Default)]
pub struct FfmpegVideoWriter {
    session: Option<FfmpegSession>,
    frame_count: u64,
}

impl FfmpegVideoWriter {
    pub fn new() -> Self {
        Self::default()
    }
}

fn codec_id(codec: VideoCodec) -> ffmpeg::codec::Id {
    match codec {
        VideoCodec::Av1 => ffmpeg::codec::Id::AV1,
        VideoCodec::Ffv1 => ffmpeg::codec::Id::FFV1,
        VideoCodec::Vp9 => ffmpeg::codec::Id::VP9,
        VideoCodec::H265 => ffmpeg::codec::Id::HEVC,
        VideoCodec::Mpeg4 => ffmpeg::codec::Id::MPEG4,
        VideoCodec::Raw => ffmpeg::codec::Id::RAWVIDEO,
    }
}

fn encoder_pixel_format(settings: &EncoderSettings) -> Pixel {
    match (settings.codec, settings.is_color) {
        (VideoCodec::Raw, true) => Pixel::BGR24,
        (VideoCodec::Raw, false) => Pixel::GRAY8,
        (VideoCodec::Ffv1, true) => Pixel::BGR0,
        (VideoCodec::Ffv1, false) => Pixel::GRAY8,
        (_, _) if settings.lossless => Pixel::YUV444P,
        _ => Pixel::YUV420P,
    }
}

fn lossless_options(settings: &EncoderSettings) -> ffmpeg::Dictionary<'static> {
    let mut opts = ffmpeg::Dictionary::new();
    if settings.lossless {
        match settings.codec {
            VideoCodec::Vp9 => opts.set("lossless", "1"),
            VideoCodec::H265 => opts.set("x265-params", "lossless=1"),
            VideoCodec::Av1 => opts.set("crf", "0"),
            VideoCodec::Ffv1 | VideoCodec::Raw | VideoCodec::Mpeg4 => {}
        }
    }
    if settings.codec == VideoCodec::Ffv1 {
        opts.set("level", "3");
    }
    opts
}

impl FfmpegSession {
    fn open(settings: &EncoderSettings) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;

        let path = output_path(&settings.path, settings.container.extension());
        let mut output = ffmpeg::format::output(&path)
            .with_context(|| format!("open video output {}", path.display()))?;
        let global_header = output
            .format()
            .flags()
            .contains(ffmpeg::format::Flags::GLOBAL_HEADER);

        let codec = ffmpeg::encoder::find(codec_id(settings.codec))
            .ok_or_else(|| anyhow!("no ffmpeg encoder for {:?}", settings.codec))?;
        let mut stream = output.add_stream(codec).context("add video stream")?;
        let stream_index = stream.index();

        let mut encoder = ffmpeg::codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()
            .context("create video encoder")?;
        let fps = settings.fps as i32;
        let pixel_format = encoder_pixel_format(settings);
        encoder.set_width(settings.width);
        encoder.set_height(settings.height);
        encoder.set_format(pixel_format);
        encoder.set_time_base((1, fps));
        encoder.set_frame_rate(Some((fps, 1)));
        if global_header {
            encoder.set_flags(ffmpeg::codec::Flags::GLOBAL_HEADER);
        }
        let encoder = encoder
            .open_with(lossless_options(settings))
            .with_context(|| format!("open {:?} encoder", settings.codec))?;
        stream.set_parameters(&encoder);
        stream.set_time_base((1, fps));

        output.write_header().context("write container header")?;
        let stream_time_base = output
            .stream(stream_index)
            .map(|s| s.time_base())
            .unwrap_or_else(|| ffmpeg::Rational::new(1, fps));

        let source_format = if settings.is_color {
            Pixel::BGR24
        } else {
            Pixel::GRAY8
        };
        let scaler = ffmpeg::software::scaling::Context::get(
            source_format,
            settings.width,
            settings.height,
            pixel_format,
            settings.width,
            settings.height,
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        log::info!(
            "FfmpegVideoWriter: recording {:?} ({}x{} @ {} fps, lossless={}) to {}",
            settings.codec,
            settings.width,
            settings.height,
            settings.fps,
            settings.lossless,
            path.display()
        );

        Ok(Self {
            output,
            encoder,
            scaler,
            source: ffmpeg::frame::Video::new(source_format, settings.width, settings.height),
            converted: ffmpeg::frame::Video::empty(),
            stream_index,
            encoder_time_base: ffmpeg::Rational::new(1, fps),
            stream_time_base,
            next_pts: 0,
        })
    }

    fn write(&mut self, frame: &Frame) -> Result<()> {
        let row_bytes = frame.width() as usize * frame.channels() as usize;
        let stride = self.source.stride(0);
        let plane = self.source.data_mut(0);
        for (row, pixels) in frame.pixels().chunks_exact(row_bytes).enumerate() {
            let start = row * stride;
            plane
                .get_mut(start..start + row_bytes)
                .context("ffmpeg frame row is out of bounds")?
                .copy_from_slice(pixels);
        }

        self.scaler
            .run(&self.source, &mut self.converted)
            .context("convert frame pixel format")?;
        self.converted.set_pts(Some(self.next_pts));
        self.next_pts += 1;

        self.encoder
            .send_frame(&self.converted)
            .context("send frame to encoder")?;
        self.drain_packets()
    }

    fn drain_packets(&mut self) -> Result<()> {
        let mut packet = ffmpeg::Packet::empty();
        while self.encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(self.stream_index);
            packet.rescale_ts(self.encoder_time_base, self.stream_time_base);
            packet
                .write_interleaved(&mut self.output)
                .context("mux video packet")?;
        }
        Ok(())
    }

    fn finish(mut self) -> Result<()> {
        self.encoder.send_eof().context("flush encoder")?;
        self.drain_packets()?;
        self.output.write_trailer().context("write container trailer")
    }
}

impl VideoEncoder for FfmpegVideoWriter {
    fn initialize(&mut self, settings: &EncoderSettings) -> Result<()> {
        if self.session.is_some() {
            return Err(anyhow!("ffmpeg writer already initialized"));
        }
        self.session = Some(FfmpegSession::open(settings)?);
        self.frame_count = 0;
        Ok(())
    }

    fn encode_frame(&mut self, frame: &Frame) -> Result<()> {
        let session = self
            .session
            .as_mut()
            .context("ffmpeg writer not initialized")?;
        session.write(frame)?;
        self.frame_count += 1;
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        session.finish()?;
        log::info!("FfmpegVideoWriter: finalized {} frames", self.frame_count);
        Ok(())
    }
}
