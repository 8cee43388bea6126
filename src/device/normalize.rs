use anyhow::{anyhow, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PixelFormat {
    Rgb24,
    Yuyv,
}

impl PixelFormat {
    pub(crate) fn from_fourcc(fourcc: &[u8; 4]) -> Option<Self> {
        match fourcc {
            b"RGB3" => Some(Self::Rgb24),
            b"YUYV" => Some(Self::Yuyv),
            _ => None,
        }
    }
}

/// Convert a device buffer into interleaved BGR.
pub(crate) fn normalize_to_bgr(
    pixels: &[u8],
    width: u32,
    height: u32,
    format: PixelFormat,
) -> Result<Vec<u8>> {
    let pixel_count = width
        .checked_mul(height)
        .ok_or_else(|| anyhow!("frame dimensions overflow"))? as usize;
    match format {
        PixelFormat::Rgb24 => {
            let expected = pixel_count * 3;
            if pixels.len() < expected {
                return Err(anyhow!(
                    "RGB frame length mismatch: expected {}, got {}",
                    expected,
                    pixels.len()
                ));
            }
            let mut bgr = Vec::with_capacity(expected);
            for rgb in pixels[..expected].chunks_exact(3) {
                bgr.extend_from_slice(&[rgb[2], rgb[1], rgb[0]]);
            }
            Ok(bgr)
        }
        PixelFormat::Yuyv => yuyv_to_bgr(pixels, pixel_count),
    }
}

fn yuyv_to_bgr(pixels: &[u8], pixel_count: usize) -> Result<Vec<u8>> {
    let expected = pixel_count * 2;
    if pixel_count % 2 != 0 || pixels.len() < expected {
        return Err(anyhow!(
            "YUYV frame length mismatch: expected {}, got {}",
            expected,
            pixels.len()
        ));
    }

    let mut bgr = Vec::with_capacity(pixel_count * 3);
    for quad in pixels[..expected].chunks_exact(4) {
        let u = quad[1] as f32 - 128.0;
        let v = quad[3] as f32 - 128.0;
        for y in [quad[0] as f32, quad[2] as f32] {
            let r = y + 1.402_f32 * v;
            let g = y - 0.344_136_f32 * u - 0.714_136_f32 * v;
            let b = y + 1.772_f32 * u;
            bgr.extend_from_slice(&[clamp_to_u8(b), clamp_to_u8(g), clamp_to_u8(r)]);
        }
    }
    Ok(bgr)
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yuyv_neutral_chroma_produces_gray() -> Result<()> {
        let yuyv = vec![100u8, 128, 100, 128];
        let bgr = normalize_to_bgr(&yuyv, 2, 1, PixelFormat::Yuyv)?;
        assert_eq!(bgr, vec![100u8; 6]);
        Ok(())
    }

    #[test]
    fn rgb_is_reordered_to_bgr() -> Result<()> {
        let bgr = normalize_to_bgr(&[1, 2, 3], 1, 1, PixelFormat::Rgb24)?;
        assert_eq!(bgr, vec![3, 2, 1]);
        Ok(())
    }

    #[test]
    fn short_buffer_is_a_decode_error() {
        assert!(normalize_to_bgr(&[0u8; 5], 2, 1, PixelFormat::Rgb24).is_err());
    }
}
