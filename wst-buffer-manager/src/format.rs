//! Pixel formats understood by the render core.

/// The `wl_shm` pixel formats the renderer can copy into a texture.
///
/// Every format is little-endian: the channel listed first occupies the most
/// significant bits of the pixel word, exactly as `wl_shm.format` defines it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShmFormat {
    /// 32-bit `[31:0] A:R:G:B`.
    Argb8888,
    /// 32-bit `[31:0] x:R:G:B`, alpha ignored.
    Xrgb8888,
    /// 32-bit `[31:0] B:G:R:A`.
    Bgra8888,
    /// 32-bit `[31:0] B:G:R:x`, alpha ignored.
    Bgrx8888,
    /// 16-bit `[15:0] R:G:B` 5:6:5.
    Rgb565,
    /// 16-bit `[15:0] A:R:G:B` 4:4:4:4.
    Argb4444,
}

impl ShmFormat {
    /// All formats, in the order they are advertised to clients.
    pub const ALL: [ShmFormat; 6] = [
        ShmFormat::Argb8888,
        ShmFormat::Xrgb8888,
        ShmFormat::Bgra8888,
        ShmFormat::Bgrx8888,
        ShmFormat::Rgb565,
        ShmFormat::Argb4444,
    ];

    /// Maps a raw `wl_shm.format` value.
    ///
    /// `wl_shm` uses `0` and `1` for ARGB8888/XRGB8888 and the DRM fourcc
    /// code for everything else.
    pub fn from_wl_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(ShmFormat::Argb8888),
            1 => Some(ShmFormat::Xrgb8888),
            0x3432_4142 => Some(ShmFormat::Bgra8888),
            0x3432_5842 => Some(ShmFormat::Bgrx8888),
            0x3631_4752 => Some(ShmFormat::Rgb565),
            0x3231_5241 => Some(ShmFormat::Argb4444),
            _ => None,
        }
    }

    /// The raw `wl_shm.format` value.
    pub fn wl_code(self) -> u32 {
        match self {
            ShmFormat::Argb8888 => 0,
            ShmFormat::Xrgb8888 => 1,
            ShmFormat::Bgra8888 => 0x3432_4142,
            ShmFormat::Bgrx8888 => 0x3432_5842,
            ShmFormat::Rgb565 => 0x3631_4752,
            ShmFormat::Argb4444 => 0x3231_5241,
        }
    }

    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            ShmFormat::Argb8888
            | ShmFormat::Xrgb8888
            | ShmFormat::Bgra8888
            | ShmFormat::Bgrx8888 => 4,
            ShmFormat::Rgb565 | ShmFormat::Argb4444 => 2,
        }
    }

    /// Whether the alpha channel carries meaning. X variants and RGB565 are
    /// opaque and get their alpha forced to full on import.
    pub fn has_alpha(self) -> bool {
        matches!(
            self,
            ShmFormat::Argb8888 | ShmFormat::Bgra8888 | ShmFormat::Argb4444
        )
    }

    /// Smallest stride, in bytes, that holds one row of `width` pixels.
    pub fn min_stride(self, width: u32) -> u32 {
        width * self.bytes_per_pixel()
    }
}

/// Texture layout reported by a zero-copy platform buffer
/// (`EGL_TEXTURE_FORMAT` in wayland-egl terms).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformTextureFormat {
    Rgb,
    Rgba,
    /// Two planes: luma, then interleaved chroma (NV12 style).
    YUv,
    /// Three planes: luma, Cb, Cr.
    YUV,
    /// Single plane packed luma with interleaved chroma (YUYV style).
    YXuxv,
}

impl PlatformTextureFormat {
    /// Number of images an import of this layout produces.
    pub fn plane_count(self) -> usize {
        match self {
            PlatformTextureFormat::Rgb
            | PlatformTextureFormat::Rgba
            | PlatformTextureFormat::YXuxv => 1,
            PlatformTextureFormat::YUv => 2,
            PlatformTextureFormat::YUV => 3,
        }
    }
}
