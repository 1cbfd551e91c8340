//! Graphics device abstraction used by the GPU and embedded backends.
//!
//! A [`GraphicsDevice`] owns every texture, image and off-screen target it
//! hands out; callers only hold the opaque handles from
//! [`crate::resources`]. The device draws premultiplied quads with the
//! blend function `(ONE, ONE_MINUS_SRC_ALPHA, ONE, ONE)`.

pub mod soft;

#[cfg(feature = "renderer_gl")]
pub mod gles;
#[cfg(feature = "renderer_gl")]
pub mod shaders;

use bitflags::bitflags;
use drm_fourcc::{DrmFourcc, DrmModifier};
use glam::Vec2;
use wst_buffer_manager::NativeHandle;

use crate::error::DeviceError;
use crate::format::CpuPixels;
use crate::resources::{GpuResource, ImageId, OffscreenId, TextureId};

bitflags! {
    /// What a device can import or upload. Absence of a flag selects a
    /// degraded path at startup; it is never an error.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DeviceCaps: u32 {
        /// Zero-copy import of wayland-egl buffers.
        const ZERO_COPY_IMAGES = 1 << 0;
        /// Multi-plane DMA-BUF import.
        const DMABUF_IMPORT = 1 << 1;
        /// Explicit per-plane layout modifiers on DMA-BUF import.
        const DMABUF_MODIFIERS = 1 << 2;
        /// `samplerExternalOES` sampling of combined YUV images.
        const EXTERNAL_IMAGES = 1 << 3;
        /// BGRA texture uploads.
        const BGRA_UPLOAD = 1 << 4;
        /// Native pixmaps as image sources.
        const NATIVE_PIXMAP_IMAGES = 1 << 5;
    }
}

/// Source of a zero-copy image import.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSource {
    WaylandBuffer(NativeHandle),
    NativePixmap(NativeHandle),
    LinuxDmabuf,
}

/// One `eglCreateImageKHR` call: target, client buffer and attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRequest {
    pub source: ImageSource,
    pub width: u32,
    pub height: u32,
    /// `EGL_NONE` terminated attribute list.
    pub attribs: Vec<isize>,
}

/// Texture target an image is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureKind {
    /// `GL_TEXTURE_2D`, sampled as RGBA.
    Rgba,
    /// `GL_TEXTURE_EXTERNAL_OES`, converted by the driver.
    External,
}

/// How a quad samples its content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawSource {
    Texture(TextureId),
    External(TextureId),
    /// Luma and interleaved chroma on two texture units, combined in the
    /// YUV shader.
    Yuv { y: TextureId, uv: TextureId },
}

/// A textured quad in output pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawQuad {
    /// Top-left, top-right, bottom-left, bottom-right.
    pub corners: [Vec2; 4],
    pub source: DrawSource,
    /// Multiplies every premultiplied channel.
    pub opacity: f32,
}

/// Where a frame is drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTarget {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    /// Clear the target to transparent black before drawing.
    pub clear: bool,
    /// Draw into an off-screen target instead of the bound surface.
    pub offscreen: Option<OffscreenId>,
}

impl FrameTarget {
    pub fn output(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
            clear: true,
            offscreen: None,
        }
    }
}

/// Blends a premultiplied source pixel over `dst` with
/// `(ONE, ONE_MINUS_SRC_ALPHA, ONE, ONE)`: colour is `src + dst*(1-a)` and
/// alpha accumulates `src_a + dst_a`, saturating.
pub fn blend_premultiplied(src: [u8; 4], dst: [u8; 4]) -> [u8; 4] {
    let inv = 255 - src[3] as u32;
    let mut out = [0u8; 4];
    for c in 0..3 {
        let value = src[c] as u32 + (dst[c] as u32 * inv + 127) / 255;
        out[c] = value.min(255) as u8;
    }
    out[3] = (src[3] as u32 + dst[3] as u32).min(255) as u8;
    out
}

/// Operations a backend needs from the graphics context. All calls happen
/// on the thread that owns the context.
pub trait GraphicsDevice {
    fn capabilities(&self) -> DeviceCaps;

    /// DRM formats accepted for DMA-BUF import.
    fn dmabuf_formats(&self) -> Vec<DrmFourcc> {
        Vec::new()
    }

    /// Modifiers accepted for `format`.
    fn dmabuf_modifiers(&self, _format: DrmFourcc) -> Vec<DrmModifier> {
        Vec::new()
    }

    fn create_texture(&mut self, width: u32, height: u32) -> Result<TextureId, DeviceError>;

    /// Uploads a full CPU copy into `texture`, whose size must match.
    fn update_texture(&mut self, texture: TextureId, pixels: &CpuPixels) -> Result<(), DeviceError>;

    fn import_image(&mut self, request: &ImageRequest) -> Result<ImageId, DeviceError>;

    fn texture_from_image(&mut self, image: ImageId, kind: TextureKind) -> Result<TextureId, DeviceError>;

    /// Creates an off-screen target whose colour attachment is readable as
    /// a texture.
    fn create_offscreen(&mut self, width: u32, height: u32) -> Result<(OffscreenId, TextureId), DeviceError>;

    fn begin_frame(&mut self, target: FrameTarget) -> Result<(), DeviceError>;

    fn draw(&mut self, quad: &DrawQuad) -> Result<(), DeviceError>;

    /// Closes the frame, swapping buffers when `present` is set.
    fn end_frame(&mut self, present: bool) -> Result<(), DeviceError>;

    /// Releases one handle. Releasing a handle twice is an error.
    fn release(&mut self, resource: GpuResource) -> Result<(), DeviceError>;

    /// Handles still alive.
    fn live_resources(&self) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blend_opaque_source_replaces_destination() {
        assert_eq!(
            blend_premultiplied([10, 20, 30, 255], [200, 200, 200, 255]),
            [10, 20, 30, 255]
        );
    }

    #[test]
    fn blend_transparent_source_keeps_destination() {
        assert_eq!(blend_premultiplied([0, 0, 0, 0], [9, 8, 7, 6]), [9, 8, 7, 6]);
    }

    #[test]
    fn blend_half_alpha_mixes_colour_and_adds_alpha() {
        let out = blend_premultiplied([64, 0, 0, 128], [0, 0, 254, 255]);
        assert_eq!(out[0], 64);
        assert_eq!(out[2], 127);
        assert_eq!(out[3], 255);
    }
}
