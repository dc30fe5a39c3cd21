//! Raw camera buffers to packed RGB24.
//!
//! YUV conversion uses full-range BT.601 in 8.8 fixed point.

use anyhow::{anyhow, bail, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PixelFormat {
    Rgb24,
    /// Packed 4:2:2, `Y0 U Y1 V` per pixel pair.
    Yuyv,
    /// Planar luma followed by interleaved `U V` at quarter resolution.
    Nv12,
}

impl PixelFormat {
    /// Capture layouts in the order a driver is asked for them.
    pub(crate) const PREFERRED: [PixelFormat; 3] = [Self::Rgb24, Self::Yuyv, Self::Nv12];

    pub(crate) fn from_fourcc(fourcc: &[u8; 4]) -> Option<Self> {
        Self::PREFERRED
            .into_iter()
            .find(|format| format.fourcc() == fourcc)
    }

    pub(crate) fn fourcc(self) -> &'static [u8; 4] {
        match self {
            Self::Rgb24 => b"RGB3",
            Self::Yuyv => b"YUYV",
            Self::Nv12 => b"NV12",
        }
    }

    fn buffer_len(self, width: usize, height: usize) -> Option<usize> {
        let pixels = width.checked_mul(height)?;
        match self {
            Self::Rgb24 => pixels.checked_mul(3),
            Self::Yuyv => pixels.checked_mul(2),
            Self::Nv12 => pixels.checked_add(pixels / 2),
        }
    }

    /// Convert one captured buffer. Trailing driver padding is ignored.
    pub(crate) fn to_rgb(self, raw: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
        let (w, h) = (width as usize, height as usize);
        if w == 0 || h == 0 {
            bail!("{:?} frame has empty dimensions {}x{}", self, width, height);
        }
        match self {
            Self::Yuyv if w % 2 != 0 => bail!("YUYV frame width {} is odd", width),
            Self::Nv12 if w % 2 != 0 || h % 2 != 0 => {
                bail!("NV12 frame {}x{} has odd dimensions", width, height)
            }
            _ => {}
        }
        let needed = self
            .buffer_len(w, h)
            .ok_or_else(|| anyhow!("{}x{} frame size overflows", width, height))?;
        let Some(raw) = raw.get(..needed) else {
            bail!(
                "{:?} buffer holds {} bytes, {}x{} needs {}",
                self,
                raw.len(),
                width,
                height,
                needed
            );
        };

        let mut rgb = Vec::with_capacity(w * h * 3);
        match self {
            Self::Rgb24 => rgb.extend_from_slice(raw),
            Self::Yuyv => {
                for quad in raw.chunks_exact(4) {
                    push_yuv(&mut rgb, quad[0], quad[1], quad[3]);
                    push_yuv(&mut rgb, quad[2], quad[1], quad[3]);
                }
            }
            Self::Nv12 => {
                let (luma, chroma) = raw.split_at(w * h);
                for (row, luma_row) in luma.chunks_exact(w).enumerate() {
                    let chroma_row = &chroma[(row / 2) * w..][..w];
                    for (col, &y) in luma_row.iter().enumerate() {
                        let pair = col & !1;
                        push_yuv(&mut rgb, y, chroma_row[pair], chroma_row[pair + 1]);
                    }
                }
            }
        }
        Ok(rgb)
    }
}

fn push_yuv(out: &mut Vec<u8>, y: u8, u: u8, v: u8) {
    let y = i32::from(y);
    let u = i32::from(u) - 128;
    let v = i32::from(v) - 128;
    let r = y + ((359 * v + 128) >> 8);
    let g = y - ((88 * u + 183 * v + 128) >> 8);
    let b = y + ((454 * u + 128) >> 8);
    out.extend([r, g, b].map(|c| c.clamp(0, 255) as u8));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neutral_chroma_gives_gray() -> Result<()> {
        let nv12 = [vec![128u8; 4], vec![128u8; 2]].concat();
        assert_eq!(PixelFormat::Nv12.to_rgb(&nv12, 2, 2)?, vec![128u8; 12]);
        assert_eq!(PixelFormat::Yuyv.to_rgb(&[77u8, 128, 77, 128], 2, 1)?, vec![77u8; 6]);
        Ok(())
    }

    #[test]
    fn strong_red_chroma_saturates_red() -> Result<()> {
        let rgb = PixelFormat::Yuyv.to_rgb(&[200, 128, 200, 255], 2, 1)?;
        assert_eq!(rgb[0], 255);
        assert!(rgb[1] < 200);
        assert_eq!(rgb[2], 200);
        Ok(())
    }

    #[test]
    fn short_or_odd_buffers_are_rejected() -> Result<()> {
        let pixels = vec![1u8; 10];
        assert_eq!(PixelFormat::Rgb24.to_rgb(&pixels, 1, 3)?, pixels[..9].to_vec());
        assert!(PixelFormat::Rgb24.to_rgb(&pixels, 2, 3).is_err());
        assert!(PixelFormat::Yuyv.to_rgb(&[0u8; 12], 3, 2).is_err());
        assert!(PixelFormat::Nv12.to_rgb(&[0u8; 64], 2, 3).is_err());
        assert!(PixelFormat::Rgb24.to_rgb(&[], 0, 4).is_err());
        Ok(())
    }

    #[test]
    fn fourcc_round_trips_through_preference_list() {
        for format in PixelFormat::PREFERRED {
            assert_eq!(PixelFormat::from_fourcc(format.fourcc()), Some(format));
        }
        assert_eq!(PixelFormat::from_fourcc(b"MJPG"), None);
    }
}
