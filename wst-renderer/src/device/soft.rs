//! Software graphics device.
//!
//! Rasterises CPU textures into an RGBA8 premultiplied framebuffer with the
//! same blend rule as the GLES path. Zero-copy images are tracked as handles
//! but carry no pixels, so quads sampling them are recorded and skipped.
//! Used by headless compositors and throughout the test-suite.

use std::collections::HashMap;

use drm_fourcc::{DrmFourcc, DrmModifier};
use tracing::{debug, trace};

use super::{
    blend_premultiplied, DeviceCaps, DrawQuad, DrawSource, FrameTarget, GraphicsDevice, ImageRequest,
};
use crate::device::TextureKind;
use crate::egl_attribs;
use crate::error::DeviceError;
use crate::format::CpuPixels;
use crate::resources::{GpuResource, ImageId, OffscreenId, TextureId};

#[derive(Debug)]
struct SoftTexture {
    width: u32,
    height: u32,
    /// Premultiplied RGBA8; `None` for image-backed textures.
    pixels: Option<Vec<u8>>,
}

#[derive(Debug)]
struct SoftOffscreen {
    texture: TextureId,
}

#[derive(Debug)]
pub struct SoftDevice {
    caps: DeviceCaps,
    width: u32,
    height: u32,
    screen: Vec<u8>,
    next_handle: u32,
    textures: HashMap<TextureId, SoftTexture>,
    images: HashMap<ImageId, ImageRequest>,
    offscreens: HashMap<OffscreenId, SoftOffscreen>,
    frame: Option<FrameTarget>,
    draw_log: Vec<DrawQuad>,
    image_requests: Vec<ImageRequest>,
    rejected_formats: Vec<DrmFourcc>,
    frames_presented: u64,
}

impl SoftDevice {
    /// Everything but external-image sampling, which needs a driver.
    pub fn new(width: u32, height: u32) -> Self {
        Self::with_caps(width, height, DeviceCaps::all() - DeviceCaps::EXTERNAL_IMAGES)
    }

    pub fn with_caps(width: u32, height: u32, caps: DeviceCaps) -> Self {
        debug!("Creating software device {}x{} with {:?}", width, height, caps);
        Self {
            caps,
            width,
            height,
            screen: vec![0; (width * height * 4) as usize],
            next_handle: 1,
            textures: HashMap::new(),
            images: HashMap::new(),
            offscreens: HashMap::new(),
            frame: None,
            draw_log: Vec::new(),
            image_requests: Vec::new(),
            rejected_formats: Vec::new(),
            frames_presented: 0,
        }
    }

    fn next(&mut self) -> u32 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    /// Makes image imports of `format` fail, as a driver lacking it would.
    pub fn reject_image_fourcc(&mut self, format: DrmFourcc) {
        self.rejected_formats.push(format);
    }

    /// Every image import requested so far, including rejected ones.
    pub fn image_requests(&self) -> &[ImageRequest] {
        &self.image_requests
    }

    /// Quads drawn since the last [`SoftDevice::clear_draw_log`].
    pub fn draw_log(&self) -> &[DrawQuad] {
        &self.draw_log
    }

    pub fn clear_draw_log(&mut self) {
        self.draw_log.clear();
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    /// Premultiplied RGBA of one screen pixel.
    pub fn read_pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        read(&self.screen, self.width, self.height, x, y)
    }

    /// Premultiplied RGBA of one texel of a CPU or off-screen texture.
    pub fn read_texture_pixel(&self, texture: TextureId, x: u32, y: u32) -> Option<[u8; 4]> {
        let tex = self.textures.get(&texture)?;
        read(tex.pixels.as_ref()?, tex.width, tex.height, x, y)
    }

    fn texture(&self, id: TextureId) -> Result<&SoftTexture, DeviceError> {
        self.textures
            .get(&id)
            .ok_or(DeviceError::UnknownHandle(GpuResource::Texture(id)))
    }

    fn rasterise(&mut self, quad: &DrawQuad, texture: TextureId, target: FrameTarget) -> Result<(), DeviceError> {
        let [tl, tr, bl, _] = quad.corners;
        if tl.y != tr.y || tl.x != bl.x {
            trace!("Skipping rasterisation of a non axis-aligned quad");
            return Ok(());
        }
        let (span_x, span_y) = (tr.x - tl.x, bl.y - tl.y);
        if span_x == 0.0 || span_y == 0.0 {
            return Ok(());
        }

        let src = self.texture(texture)?;
        let Some(src_pixels) = src.pixels.clone() else {
            return Ok(());
        };
        let (src_w, src_h) = (src.width, src.height);

        let (dst, dst_w, dst_h) = match target.offscreen {
            Some(offscreen) => {
                let tex_id = self
                    .offscreens
                    .get(&offscreen)
                    .ok_or(DeviceError::UnknownHandle(GpuResource::Offscreen(offscreen)))?
                    .texture;
                let tex = self
                    .textures
                    .get_mut(&tex_id)
                    .ok_or(DeviceError::UnknownHandle(GpuResource::Texture(tex_id)))?;
                let (w, h) = (tex.width, tex.height);
                let pixels = tex
                    .pixels
                    .as_mut()
                    .ok_or_else(|| DeviceError::RenderCall("off-screen target has no storage".into()))?;
                (pixels, w, h)
            }
            None => (&mut self.screen, self.width, self.height),
        };

        let x0 = tl.x.min(tr.x).floor().max(0.0) as i64;
        let x1 = tl.x.max(tr.x).ceil() as i64;
        let y0 = tl.y.min(bl.y).floor().max(0.0) as i64;
        let y1 = tl.y.max(bl.y).ceil() as i64;
        let clip_x1 = (target.x as i64 + target.width as i64).min(dst_w as i64);
        let clip_y1 = (target.y as i64 + target.height as i64).min(dst_h as i64);
        let opacity = quad.opacity.clamp(0.0, 1.0);

        for py in y0.max(target.y as i64)..y1.min(clip_y1) {
            let v = ((py as f32 + 0.5) - tl.y) / span_y;
            if !(0.0..1.0).contains(&v) {
                continue;
            }
            let sy = ((v * src_h as f32) as u32).min(src_h - 1);
            for px in x0.max(target.x as i64)..x1.min(clip_x1) {
                let u = ((px as f32 + 0.5) - tl.x) / span_x;
                if !(0.0..1.0).contains(&u) {
                    continue;
                }
                let sx = ((u * src_w as f32) as u32).min(src_w - 1);
                let s = ((sy * src_w + sx) * 4) as usize;
                let texel = [
                    src_pixels[s],
                    src_pixels[s + 1],
                    src_pixels[s + 2],
                    src_pixels[s + 3],
                ];
                let texel = texel.map(|c| (c as f32 * opacity).round() as u8);
                let d = ((py as u32 * dst_w + px as u32) * 4) as usize;
                let out = blend_premultiplied(texel, [dst[d], dst[d + 1], dst[d + 2], dst[d + 3]]);
                dst[d..d + 4].copy_from_slice(&out);
            }
        }
        Ok(())
    }
}

fn read(buffer: &[u8], width: u32, height: u32, x: u32, y: u32) -> Option<[u8; 4]> {
    if x >= width || y >= height {
        return None;
    }
    let i = ((y * width + x) * 4) as usize;
    Some([buffer[i], buffer[i + 1], buffer[i + 2], buffer[i + 3]])
}

fn premultiply([r, g, b, a]: [u8; 4]) -> [u8; 4] {
    let mul = |c: u8| ((c as u32 * a as u32 + 127) / 255) as u8;
    [mul(r), mul(g), mul(b), a]
}

impl GraphicsDevice for SoftDevice {
    fn capabilities(&self) -> DeviceCaps {
        self.caps
    }

    fn dmabuf_formats(&self) -> Vec<DrmFourcc> {
        if !self.caps.contains(DeviceCaps::DMABUF_IMPORT) {
            return Vec::new();
        }
        vec![
            DrmFourcc::Argb8888,
            DrmFourcc::Xrgb8888,
            DrmFourcc::Nv12,
            DrmFourcc::Nv21,
            DrmFourcc::R8,
            DrmFourcc::Gr88,
        ]
        .into_iter()
        .filter(|f| !self.rejected_formats.contains(f))
        .collect()
    }

    fn dmabuf_modifiers(&self, format: DrmFourcc) -> Vec<DrmModifier> {
        if self.caps.contains(DeviceCaps::DMABUF_MODIFIERS) && self.dmabuf_formats().contains(&format) {
            vec![DrmModifier::Linear]
        } else {
            Vec::new()
        }
    }

    fn create_texture(&mut self, width: u32, height: u32) -> Result<TextureId, DeviceError> {
        if width == 0 || height == 0 {
            return Err(DeviceError::Texture(format!("invalid texture size {}x{}", width, height)));
        }
        let id = TextureId::new(self.next());
        self.textures.insert(
            id,
            SoftTexture {
                width,
                height,
                pixels: Some(vec![0; (width * height * 4) as usize]),
            },
        );
        Ok(id)
    }

    fn update_texture(&mut self, texture: TextureId, pixels: &CpuPixels) -> Result<(), DeviceError> {
        let tex = self
            .textures
            .get_mut(&texture)
            .ok_or(DeviceError::UnknownHandle(GpuResource::Texture(texture)))?;
        if tex.width != pixels.width || tex.height != pixels.height {
            return Err(DeviceError::Texture(format!(
                "upload of {}x{} into {}x{} {}",
                pixels.width, pixels.height, tex.width, tex.height, texture
            )));
        }
        let mut data = Vec::with_capacity(pixels.data.len());
        for y in 0..pixels.height {
            for x in 0..pixels.width {
                let rgba = pixels.pixel_rgba(x, y).unwrap_or_default();
                data.extend_from_slice(&premultiply(rgba));
            }
        }
        tex.pixels = Some(data);
        Ok(())
    }

    fn import_image(&mut self, request: &ImageRequest) -> Result<ImageId, DeviceError> {
        self.image_requests.push(request.clone());
        if let Some(fourcc) = egl_attribs::lookup(&request.attribs, egl_attribs::EGL_LINUX_DRM_FOURCC_EXT) {
            if let Some(rejected) = self
                .rejected_formats
                .iter()
                .find(|f| **f as u32 as isize == fourcc)
            {
                return Err(DeviceError::ImageImport(format!("{:?} not importable", rejected)));
            }
        }
        let id = ImageId::new(self.next());
        self.images.insert(id, request.clone());
        Ok(id)
    }

    fn texture_from_image(&mut self, image: ImageId, kind: TextureKind) -> Result<TextureId, DeviceError> {
        if kind == TextureKind::External && !self.caps.contains(DeviceCaps::EXTERNAL_IMAGES) {
            return Err(DeviceError::Texture("external textures unsupported".into()));
        }
        let request = self
            .images
            .get(&image)
            .ok_or(DeviceError::UnknownHandle(GpuResource::Image(image)))?;
        let (width, height) = (request.width, request.height);
        let id = TextureId::new(self.next());
        self.textures.insert(
            id,
            SoftTexture {
                width,
                height,
                pixels: None,
            },
        );
        Ok(id)
    }

    fn create_offscreen(&mut self, width: u32, height: u32) -> Result<(OffscreenId, TextureId), DeviceError> {
        let texture = self.create_texture(width, height)?;
        let id = OffscreenId::new(self.next());
        self.offscreens.insert(id, SoftOffscreen { texture });
        Ok((id, texture))
    }

    fn begin_frame(&mut self, target: FrameTarget) -> Result<(), DeviceError> {
        if self.frame.is_some() {
            return Err(DeviceError::RenderCall("frame already open".into()));
        }
        if target.clear {
            match target.offscreen {
                Some(offscreen) => {
                    let tex_id = self
                        .offscreens
                        .get(&offscreen)
                        .ok_or(DeviceError::UnknownHandle(GpuResource::Offscreen(offscreen)))?
                        .texture;
                    if let Some(pixels) = self.textures.get_mut(&tex_id).and_then(|t| t.pixels.as_mut()) {
                        pixels.fill(0);
                    }
                }
                None => self.screen.fill(0),
            }
        }
        self.frame = Some(target);
        Ok(())
    }

    fn draw(&mut self, quad: &DrawQuad) -> Result<(), DeviceError> {
        let target = self.frame.ok_or(DeviceError::NoFrame)?;
        self.draw_log.push(*quad);
        match quad.source {
            DrawSource::Texture(texture) => self.rasterise(quad, texture, target),
            DrawSource::External(texture) => self.texture(texture).map(|_| ()),
            DrawSource::Yuv { y, uv } => {
                self.texture(y)?;
                self.texture(uv).map(|_| ())
            }
        }
    }

    fn end_frame(&mut self, present: bool) -> Result<(), DeviceError> {
        let target = self.frame.take().ok_or(DeviceError::NoFrame)?;
        if present && target.offscreen.is_none() {
            self.frames_presented += 1;
        }
        Ok(())
    }

    fn release(&mut self, resource: GpuResource) -> Result<(), DeviceError> {
        let found = match resource {
            GpuResource::Texture(id) => self.textures.remove(&id).is_some(),
            GpuResource::Image(id) => self.images.remove(&id).is_some(),
            GpuResource::Offscreen(id) => match self.offscreens.remove(&id) {
                Some(offscreen) => {
                    self.textures.remove(&offscreen.texture);
                    true
                }
                None => false,
            },
            GpuResource::NativeBuffer(_) => false,
        };
        if found {
            trace!("Released {}", resource);
            Ok(())
        } else {
            Err(DeviceError::UnknownHandle(resource))
        }
    }

    fn live_resources(&self) -> usize {
        self.textures.len() + self.images.len() + self.offscreens.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::UploadLayout;
    use crate::math::Rect;
    use wst_buffer_manager::ShmFormat;

    fn solid(width: u32, height: u32, rgba: [u8; 4]) -> CpuPixels {
        CpuPixels {
            width,
            height,
            source_format: ShmFormat::Argb8888,
            layout: UploadLayout::Rgba8,
            data: rgba.iter().copied().cycle().take((width * height * 4) as usize).collect(),
        }
    }

    fn quad(rect: Rect, texture: TextureId, opacity: f32) -> DrawQuad {
        DrawQuad {
            corners: rect.corners(),
            source: DrawSource::Texture(texture),
            opacity,
        }
    }

    #[test]
    fn test_draw_blends_in_order() {
        let mut device = SoftDevice::new(8, 8);
        let red = device.create_texture(2, 2).unwrap();
        device.update_texture(red, &solid(2, 2, [255, 0, 0, 255])).unwrap();
        let blue = device.create_texture(2, 2).unwrap();
        device.update_texture(blue, &solid(2, 2, [0, 0, 255, 255])).unwrap();

        device.begin_frame(FrameTarget::output(8, 8)).unwrap();
        device.draw(&quad(Rect::new(0, 0, 4, 4), red, 1.0)).unwrap();
        device.draw(&quad(Rect::new(2, 2, 4, 4), blue, 0.5)).unwrap();
        device.end_frame(true).unwrap();

        assert_eq!(device.read_pixel(0, 0), Some([255, 0, 0, 255]));
        assert_eq!(device.read_pixel(3, 3), Some([127, 0, 128, 255]));
        assert_eq!(device.read_pixel(5, 5), Some([0, 0, 128, 128]));
        assert_eq!(device.read_pixel(7, 7), Some([0, 0, 0, 0]));
        assert_eq!(device.frames_presented(), 1);
    }

    #[test]
    fn test_offscreen_target_receives_draws() {
        let mut device = SoftDevice::new(4, 4);
        let green = device.create_texture(1, 1).unwrap();
        device.update_texture(green, &solid(1, 1, [0, 255, 0, 255])).unwrap();
        let (offscreen, texture) = device.create_offscreen(4, 4).unwrap();

        let mut target = FrameTarget::output(4, 4);
        target.offscreen = Some(offscreen);
        device.begin_frame(target).unwrap();
        device.draw(&quad(Rect::new(0, 0, 2, 2), green, 1.0)).unwrap();
        device.end_frame(false).unwrap();

        assert_eq!(device.read_texture_pixel(texture, 1, 1), Some([0, 255, 0, 255]));
        assert_eq!(device.read_pixel(1, 1), Some([0, 0, 0, 0]), "The screen is untouched.");
        assert_eq!(device.frames_presented(), 0);

        device.release(GpuResource::Offscreen(offscreen)).unwrap();
        assert_eq!(device.read_texture_pixel(texture, 0, 0), None);
    }

    #[test]
    fn test_release_is_single_shot() {
        let mut device = SoftDevice::new(4, 4);
        let texture = device.create_texture(1, 1).unwrap();
        assert_eq!(device.live_resources(), 1);
        device.release(GpuResource::Texture(texture)).unwrap();
        assert_eq!(
            device.release(GpuResource::Texture(texture)),
            Err(DeviceError::UnknownHandle(GpuResource::Texture(texture)))
        );
        assert_eq!(device.live_resources(), 0);
    }

    #[test]
    fn test_draw_requires_frame() {
        let mut device = SoftDevice::new(4, 4);
        let texture = device.create_texture(1, 1).unwrap();
        assert_eq!(
            device.draw(&quad(Rect::new(0, 0, 1, 1), texture, 1.0)),
            Err(DeviceError::NoFrame)
        );
    }

    #[test]
    fn test_upload_size_mismatch_is_rejected() {
        let mut device = SoftDevice::new(4, 4);
        let texture = device.create_texture(2, 2).unwrap();
        assert!(matches!(
            device.update_texture(texture, &solid(3, 3, [0; 4])),
            Err(DeviceError::Texture(_))
        ));
    }
}
