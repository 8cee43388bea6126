//! Frame types and the display ring.
//!
//! - `Frame`: immutable pixel buffer produced by a device or the processing stage.
//! - `FrameKind`: genuine sensor frame or synthetic dropped-frame placeholder.
//! - `FrameRing`: bounded, lossy FIFO bridging the capture thread and the consumer.
//!
//! The ring never blocks: `push` evicts the oldest frame when full and `pop`
//! returns `None` when nothing is queued.

use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::time::Instant;

/// Number of frames the display ring holds before evicting.
pub const FRAME_RING_CAPACITY: usize = 64;

/// Geometry of the dropped-frame placeholder (native Miniscope sensor size).
pub const DROPPED_FRAME_WIDTH: u32 = 752;
pub const DROPPED_FRAME_HEIGHT: u32 = 480;

/// Placeholder fill, BGR order.
const DROPPED_FRAME_FILL: [u8; 3] = [255, 0, 0];
const DROPPED_FRAME_INK: [u8; 3] = [255, 255, 255];
const DROPPED_FRAME_TEXT: &str = "FRAME DROPPED!";
/// Pixels per glyph dot.
const GLYPH_SCALE: usize = 4;
const GLYPH_COLS: usize = 5;
const GLYPH_ROWS: usize = 7;

/// 5x7 dot patterns, bit 4 is the leftmost column.
fn glyph(c: char) -> [u8; GLYPH_ROWS] {
    match c {
        'A' => [0x0e, 0x11, 0x11, 0x1f, 0x11, 0x11, 0x11],
        'D' => [0x1e, 0x11, 0x11, 0x11, 0x11, 0x11, 0x1e],
        'E' => [0x1f, 0x10, 0x10, 0x1e, 0x10, 0x10, 0x1f],
        'F' => [0x1f, 0x10, 0x10, 0x1e, 0x10, 0x10, 0x10],
        'M' => [0x11, 0x1b, 0x15, 0x15, 0x11, 0x11, 0x11],
        'O' => [0x0e, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0e],
        'P' => [0x1e, 0x11, 0x11, 0x1e, 0x10, 0x10, 0x10],
        'R' => [0x1e, 0x11, 0x11, 0x1e, 0x14, 0x12, 0x11],
        '!' => [0x04, 0x04, 0x04, 0x04, 0x04, 0x00, 0x04],
        _ => [0; GLYPH_ROWS],
    }
}

/// Origin of the centered placeholder caption.
fn caption_origin() -> (usize, usize) {
    let advance = (GLYPH_COLS + 1) * GLYPH_SCALE;
    let text_width = DROPPED_FRAME_TEXT.chars().count() * advance - GLYPH_SCALE;
    let text_height = GLYPH_ROWS * GLYPH_SCALE;
    (
        (DROPPED_FRAME_WIDTH as usize - text_width) / 2,
        (DROPPED_FRAME_HEIGHT as usize - text_height) / 2,
    )
}

/// Draw `DROPPED_FRAME_TEXT` into a BGR buffer of the placeholder size.
fn stamp_caption(data: &mut [u8]) {
    let width = DROPPED_FRAME_WIDTH as usize;
    let (x0, y0) = caption_origin();
    for (i, c) in DROPPED_FRAME_TEXT.chars().enumerate() {
        let left = x0 + i * (GLYPH_COLS + 1) * GLYPH_SCALE;
        for (row, bits) in glyph(c).iter().enumerate() {
            for col in 0..GLYPH_COLS {
                if bits & (0x10 >> col) == 0 {
                    continue;
                }
                for dy in 0..GLYPH_SCALE {
                    let y = y0 + row * GLYPH_SCALE + dy;
                    let x = left + col * GLYPH_SCALE;
                    let start = (y * width + x) * 3;
                    for px in data[start..start + GLYPH_SCALE * 3].chunks_exact_mut(3) {
                        px.copy_from_slice(&DROPPED_FRAME_INK);
                    }
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    /// Pixels decoded from the sensor (possibly processed for display).
    Sensor,
    /// Synthetic stand-in pushed when a capture cycle failed to decode.
    Dropped,
}

/// Immutable 2-D pixel buffer.
///
/// Pixel data is private and only exposed as a shared slice, so a frame cannot
/// change after it has been produced. Channels are interleaved; 3-channel frames
/// are stored in BGR order.
#[derive(Clone, Debug)]
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    channels: u8,
    kind: FrameKind,
    captured_at: Instant,
}

impl Frame {
    /// Wrap pixel bytes, validating that the buffer matches the geometry.
    pub fn new(data: Vec<u8>, width: u32, height: u32, channels: u8) -> Result<Self> {
        if channels != 1 && channels != 3 {
            return Err(anyhow!("unsupported channel count {}", channels));
        }
        let expected = frame_len(width, height, channels)?;
        if data.len() != expected {
            return Err(anyhow!(
                "frame length mismatch: expected {}, got {}",
                expected,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            channels,
            kind: FrameKind::Sensor,
            captured_at: Instant::now(),
        })
    }

    /// Build the "frame dropped" placeholder: blue field, white caption.
    pub fn dropped_placeholder() -> Self {
        let pixels = (DROPPED_FRAME_WIDTH * DROPPED_FRAME_HEIGHT) as usize;
        let mut data = Vec::with_capacity(pixels * 3);
        for _ in 0..pixels {
            data.extend_from_slice(&DROPPED_FRAME_FILL);
        }
        stamp_caption(&mut data);
        Self {
            data,
            width: DROPPED_FRAME_WIDTH,
            height: DROPPED_FRAME_HEIGHT,
            channels: 3,
            kind: FrameKind::Dropped,
            captured_at: Instant::now(),
        }
    }

    /// Derive a processed frame that keeps this frame's capture time.
    pub(crate) fn derive(&self, data: Vec<u8>, channels: u8) -> Result<Self> {
        let mut frame = Self::new(data, self.width, self.height, channels)?;
        frame.captured_at = self.captured_at;
        Ok(frame)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn is_color(&self) -> bool {
        self.channels == 3
    }

    pub fn is_dropped(&self) -> bool {
        self.kind == FrameKind::Dropped
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub(crate) fn byte_len(&self) -> usize {
        self.data.len()
    }
}

fn frame_len(width: u32, height: u32, channels: u8) -> Result<usize> {
    width
        .checked_mul(height)
        .and_then(|v| v.checked_mul(channels as u32))
        .map(|v| v as usize)
        .ok_or_else(|| anyhow!("frame dimensions overflow"))
}

// ----------------------------------------------------------------------------
// FrameRing
// ----------------------------------------------------------------------------

/// Fixed-capacity FIFO of frames; overwrite-oldest on overflow.
///
/// Single producer (capture thread), single consumer (display poller). The
/// controller wraps it in a mutex; `push` and `pop` are the only critical
/// sections and do no frame processing.
pub struct FrameRing {
    buffer: VecDeque<Frame>,
    capacity: usize,
}

impl FrameRing {
    pub fn new() -> Self {
        Self::with_capacity(FRAME_RING_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append at the tail. Returns the evicted head when the ring was full.
    pub fn push(&mut self, frame: Frame) -> Option<Frame> {
        let evicted = if self.buffer.len() >= self.capacity {
            self.buffer.pop_front()
        } else {
            None
        };
        self.buffer.push_back(frame);
        evicted
    }

    /// Remove and return the oldest frame, or `None` if empty.
    pub fn pop(&mut self) -> Option<Frame> {
        self.buffer.pop_front()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Memory usage estimate.
    pub fn memory_bytes(&self) -> usize {
        self.buffer.iter().map(|f| f.byte_len()).sum()
    }
}

impl Default for FrameRing {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn make_test_frame(tag: u8) -> Frame {
        Frame::new(vec![tag; 4 * 2], 4, 2, 1).unwrap()
    }

    #[test]
    fn frame_rejects_length_mismatch() {
        assert!(Frame::new(vec![0u8; 7], 4, 2, 1).is_err());
        assert!(Frame::new(vec![0u8; 24], 4, 2, 3).is_ok());
        assert!(Frame::new(vec![0u8; 16], 4, 2, 2).is_err());
    }

    #[test]
    fn ring_keeps_most_recent_frames_in_order() {
        let mut ring = FrameRing::new();
        for i in 0..(FRAME_RING_CAPACITY + 36) {
            ring.push(make_test_frame(i as u8));
        }
        assert_eq!(ring.len(), FRAME_RING_CAPACITY);

        for expected in 36..(FRAME_RING_CAPACITY + 36) {
            let frame = ring.pop().expect("frame");
            assert_eq!(frame.pixels()[0], expected as u8);
        }
        assert!(ring.pop().is_none());
    }

    #[test]
    fn ring_push_reports_eviction() {
        let mut ring = FrameRing::with_capacity(2);
        assert!(ring.push(make_test_frame(1)).is_none());
        assert!(ring.push(make_test_frame(2)).is_none());
        let evicted = ring.push(make_test_frame(3)).expect("evicted");
        assert_eq!(evicted.pixels()[0], 1);
    }

    #[test]
    fn pop_on_empty_ring_returns_none() {
        let mut ring = FrameRing::new();
        assert!(ring.is_empty());
        assert!(ring.pop().is_none());
    }

    #[test]
    fn dropped_placeholder_is_tagged() {
        let frame = Frame::dropped_placeholder();
        assert!(frame.is_dropped());
        assert!(frame.is_color());
        assert_eq!(frame.width(), DROPPED_FRAME_WIDTH);
        assert_eq!(frame.pixels().len(), (752 * 480 * 3) as usize);
        assert_eq!(&frame.pixels()[..3], &DROPPED_FRAME_FILL);
    }

    #[test]
    fn dropped_placeholder_carries_caption() {
        let frame = Frame::dropped_placeholder();
        let width = DROPPED_FRAME_WIDTH as usize;
        let pixel = |x: usize, y: usize| &frame.pixels()[(y * width + x) * 3..][..3];

        // Top-left dot of the leading 'F'.
        let (x0, y0) = caption_origin();
        assert_eq!(pixel(x0, y0), &DROPPED_FRAME_INK);
        // Gap between 'F' and 'R' stays blue.
        assert_eq!(pixel(x0 + GLYPH_COLS * GLYPH_SCALE, y0), &DROPPED_FRAME_FILL);
        assert_eq!(pixel(width - 1, 0), &DROPPED_FRAME_FILL);

        let ink = frame
            .pixels()
            .chunks_exact(3)
            .filter(|px| *px == DROPPED_FRAME_INK)
            .count();
        assert!(ink > 0);
        assert!(ink < width * DROPPED_FRAME_HEIGHT as usize / 10);
    }

    #[test]
    fn memory_estimate_tracks_contents() {
        let mut ring = FrameRing::new();
        ring.push(make_test_frame(0));
        ring.push(make_test_frame(1));
        assert_eq!(ring.memory_bytes(), 16);
    }
}
