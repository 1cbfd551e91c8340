//! CPU pixel transforms for shared-memory imports.
//!
//! Shared-memory pixels are copied into an owned buffer in one of two 32-bit
//! byte layouts the device can upload directly. Whether a byte-order
//! transform is needed, and whether the alpha channel must be forced opaque,
//! depends on the source format, the device's BGRA upload support and the
//! host's endianness.

use byteorder::{ByteOrder, LittleEndian};
use tracing::trace;

use wst_buffer_manager::{ShmFormat, ShmView};

use crate::error::ImportError;

/// Byte order of an owned CPU pixel buffer, four bytes per pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadLayout {
    /// Bytes `R, G, B, A`.
    Rgba8,
    /// Bytes `B, G, R, A`; identical to little-endian ARGB8888 in memory.
    Bgra8,
}

impl UploadLayout {
    /// BGRA uploads avoid a swizzle, but only when the device accepts them
    /// and the host stores ARGB8888 words as `B, G, R, A`.
    pub fn choose(device_accepts_bgra: bool) -> Self {
        if device_accepts_bgra && cfg!(target_endian = "little") {
            UploadLayout::Bgra8
        } else {
            UploadLayout::Rgba8
        }
    }
}

/// Owned, tightly packed pixel copy of a client buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuPixels {
    pub width: u32,
    pub height: u32,
    /// Format the client committed.
    pub source_format: ShmFormat,
    pub layout: UploadLayout,
    pub data: Vec<u8>,
}

impl CpuPixels {
    /// Row pitch in bytes.
    pub fn stride(&self) -> u32 {
        self.width * 4
    }

    /// Channels of one pixel as `[r, g, b, a]`, whatever the layout.
    pub fn pixel_rgba(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y * self.stride() + x * 4) as usize;
        let p = self.data.get(offset..offset + 4)?;
        Some(match self.layout {
            UploadLayout::Rgba8 => [p[0], p[1], p[2], p[3]],
            UploadLayout::Bgra8 => [p[2], p[1], p[0], p[3]],
        })
    }
}

/// Decodes one source pixel into `[r, g, b, a]`.
fn decode(format: ShmFormat, px: &[u8]) -> [u8; 4] {
    match format {
        ShmFormat::Argb8888 | ShmFormat::Xrgb8888 => {
            let w = LittleEndian::read_u32(px);
            [(w >> 16) as u8, (w >> 8) as u8, w as u8, (w >> 24) as u8]
        }
        ShmFormat::Bgra8888 | ShmFormat::Bgrx8888 => {
            let w = LittleEndian::read_u32(px);
            [(w >> 8) as u8, (w >> 16) as u8, (w >> 24) as u8, w as u8]
        }
        ShmFormat::Rgb565 => {
            let w = LittleEndian::read_u16(px);
            let r = ((w >> 11) & 0x1f) as u8;
            let g = ((w >> 5) & 0x3f) as u8;
            let b = (w & 0x1f) as u8;
            [(r << 3) | (r >> 2), (g << 2) | (g >> 4), (b << 3) | (b >> 2), 0xff]
        }
        ShmFormat::Argb4444 => {
            let w = LittleEndian::read_u16(px);
            let nibble = |shift: u16| ((w >> shift) & 0xf) as u8 * 17;
            [nibble(8), nibble(4), nibble(0), nibble(12)]
        }
    }
}

/// Copies a shared-memory view into an owned buffer in `layout`.
pub fn convert_shm(view: ShmView<'_>, layout: UploadLayout) -> Result<CpuPixels, ImportError> {
    let info = view.info;
    let bpp = info.format.bytes_per_pixel() as usize;
    if info.width == 0 || info.height == 0 {
        return Err(ImportError::InvalidLayout(format!(
            "empty buffer {}x{}",
            info.width, info.height
        )));
    }
    if info.stride < info.format.min_stride(info.width) {
        return Err(ImportError::InvalidLayout(format!(
            "stride {} below {} for width {}",
            info.stride,
            info.format.min_stride(info.width),
            info.width
        )));
    }
    let stride = info.stride as usize;
    let row_bytes = info.width as usize * bpp;
    let needed = stride * (info.height as usize - 1) + row_bytes;
    if view.data.len() < needed {
        return Err(ImportError::InvalidLayout(format!(
            "buffer holds {} bytes, layout needs {}",
            view.data.len(),
            needed
        )));
    }

    // ARGB8888/XRGB8888 words already sit in memory as B, G, R, A on the
    // layouts that pick Bgra8, so rows copy straight across.
    let byte_swap = !(layout == UploadLayout::Bgra8
        && matches!(info.format, ShmFormat::Argb8888 | ShmFormat::Xrgb8888));
    let fill_alpha = !info.format.has_alpha();
    trace!(
        "shm import {:?} -> {:?}: swap={} fill_alpha={}",
        info.format,
        layout,
        byte_swap,
        fill_alpha
    );

    let mut data = Vec::with_capacity(info.width as usize * info.height as usize * 4);
    for row in view.data.chunks(stride).take(info.height as usize) {
        let row = &row[..row_bytes];
        if byte_swap {
            for px in row.chunks_exact(bpp) {
                let [r, g, b, a] = decode(info.format, px);
                let a = if fill_alpha { 0xff } else { a };
                match layout {
                    UploadLayout::Rgba8 => data.extend_from_slice(&[r, g, b, a]),
                    UploadLayout::Bgra8 => data.extend_from_slice(&[b, g, r, a]),
                }
            }
        } else {
            let start = data.len();
            data.extend_from_slice(row);
            if fill_alpha {
                for px in data[start..].chunks_exact_mut(4) {
                    px[3] = 0xff;
                }
            }
        }
    }

    Ok(CpuPixels {
        width: info.width,
        height: info.height,
        source_format: info.format,
        layout,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use wst_buffer_manager::ShmInfo;

    fn view(format: ShmFormat, width: u32, height: u32, stride: u32, data: &[u8]) -> ShmView<'_> {
        ShmView {
            info: ShmInfo {
                width,
                height,
                stride,
                format,
            },
            data,
        }
    }

    /// 2x2 buffer repeating one 32-bit pixel word.
    fn words32(word: u32) -> Vec<u8> {
        std::iter::repeat(word.to_le_bytes()).take(4).flatten().collect()
    }

    fn words16(word: u16) -> Vec<u8> {
        std::iter::repeat(word.to_le_bytes()).take(4).flatten().collect()
    }

    #[rstest]
    #[case(ShmFormat::Argb8888, words32(0x80FF_8040), [0xFF, 0x80, 0x40, 0x80])]
    #[case(ShmFormat::Xrgb8888, words32(0x00FF_8040), [0xFF, 0x80, 0x40, 0xFF])]
    #[case(ShmFormat::Bgra8888, words32(0x4080_FF80), [0xFF, 0x80, 0x40, 0x80])]
    #[case(ShmFormat::Bgrx8888, words32(0x4080_FF00), [0xFF, 0x80, 0x40, 0xFF])]
    #[case(ShmFormat::Rgb565, words16(0xF800), [0xFF, 0x00, 0x00, 0xFF])]
    #[case(ShmFormat::Argb4444, words16(0x8F84), [0xFF, 0x88, 0x44, 0x88])]
    fn format_coverage(
        #[case] format: ShmFormat,
        #[case] data: Vec<u8>,
        #[case] expected: [u8; 4],
        #[values(UploadLayout::Rgba8, UploadLayout::Bgra8)] layout: UploadLayout,
    ) {
        let stride = format.min_stride(2);
        let pixels = convert_shm(view(format, 2, 2, stride, &data), layout).unwrap();
        assert_eq!(pixels.data.len(), 16);
        for y in 0..2 {
            for x in 0..2 {
                assert_eq!(pixels.pixel_rgba(x, y), Some(expected), "{format:?} {layout:?} ({x},{y})");
            }
        }
    }

    #[test]
    fn bgra_layout_copies_argb_rows_verbatim() {
        let data = words32(0x11_22_33_44);
        let pixels = convert_shm(view(ShmFormat::Argb8888, 2, 2, 8, &data), UploadLayout::Bgra8).unwrap();
        assert_eq!(pixels.data, data);
    }

    #[test]
    fn padded_stride_is_repacked() {
        // 1x2 image with 4 bytes of row padding.
        let mut data = Vec::new();
        data.extend_from_slice(&0xFF00_00FFu32.to_le_bytes());
        data.extend_from_slice(&[0xAA; 4]);
        data.extend_from_slice(&0xFFFF_0000u32.to_le_bytes());
        let pixels = convert_shm(view(ShmFormat::Argb8888, 1, 2, 8, &data), UploadLayout::Rgba8).unwrap();
        assert_eq!(pixels.data, vec![0x00, 0x00, 0xFF, 0xFF, 0xFF, 0x00, 0x00, 0xFF]);
    }

    #[test]
    fn short_stride_and_short_buffer_are_rejected() {
        let data = vec![0u8; 16];
        assert!(matches!(
            convert_shm(view(ShmFormat::Argb8888, 2, 2, 4, &data), UploadLayout::Rgba8),
            Err(ImportError::InvalidLayout(_))
        ));
        assert!(matches!(
            convert_shm(view(ShmFormat::Argb8888, 2, 3, 8, &data), UploadLayout::Rgba8),
            Err(ImportError::InvalidLayout(_))
        ));
    }

    #[test]
    fn layout_choice_respects_device_support() {
        assert_eq!(UploadLayout::choose(false), UploadLayout::Rgba8);
        if cfg!(target_endian = "little") {
            assert_eq!(UploadLayout::choose(true), UploadLayout::Bgra8);
        }
    }
}
