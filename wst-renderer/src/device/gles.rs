//! OpenGL ES 2 device on top of an EGL display the platform layer created.
//!
//! Images are created with `eglCreateImageKHR` and bound to textures through
//! `glEGLImageTargetTexture2DOES`; both entry points are resolved at
//! construction. The context must be current on the calling thread for
//! every method.

use std::collections::HashMap;
use std::ffi::c_void;
use std::rc::Rc;
use std::sync::Arc;

use drm_fourcc::{DrmFourcc, DrmModifier};
use glam::Mat4;
use glow::HasContext;
use khronos_egl as egl;
use tracing::{debug, info, warn};

use super::shaders::{
    ShaderProgram, ATTRIB_POSITION, ATTRIB_TEXCOORD, EXTERNAL_FRAGMENT_SHADER_SRC,
    RGBA_FRAGMENT_SHADER_SRC, YUV_FRAGMENT_SHADER_SRC,
};
use super::{DeviceCaps, DrawQuad, DrawSource, FrameTarget, GraphicsDevice, ImageRequest, ImageSource, TextureKind};
use crate::egl_attribs::{EGL_LINUX_DMA_BUF_EXT, EGL_NATIVE_PIXMAP_KHR, EGL_WAYLAND_BUFFER_WL};
use crate::error::DeviceError;
use crate::format::{CpuPixels, UploadLayout};
use crate::resources::{GpuResource, ImageId, OffscreenId, TextureId};

pub type Egl = egl::DynamicInstance<egl::EGL1_5>;

const TEXTURE_EXTERNAL_OES: u32 = 0x8D65;
const BGRA_EXT: u32 = 0x80E1;

type ImageTargetTexture2dFn = unsafe extern "system" fn(target: u32, image: *const c_void);
type QueryDmabufFormatsFn =
    unsafe extern "system" fn(display: *mut c_void, max: i32, formats: *mut i32, count: *mut i32) -> u32;
type QueryDmabufModifiersFn = unsafe extern "system" fn(
    display: *mut c_void,
    format: i32,
    max: i32,
    modifiers: *mut u64,
    external_only: *mut u32,
    count: *mut i32,
) -> u32;

struct GlTexture {
    texture: glow::Texture,
    target: u32,
    width: u32,
    height: u32,
}

struct GlOffscreen {
    framebuffer: glow::Framebuffer,
    texture: TextureId,
}

struct Programs {
    rgba: ShaderProgram,
    external: Option<ShaderProgram>,
    yuv: ShaderProgram,
}

pub struct GlesDevice {
    gl: Rc<glow::Context>,
    egl: Arc<Egl>,
    display: egl::Display,
    surface: Option<egl::Surface>,
    caps: DeviceCaps,
    programs: Programs,
    vbo: glow::Buffer,
    image_target_texture: ImageTargetTexture2dFn,
    query_formats: Option<QueryDmabufFormatsFn>,
    query_modifiers: Option<QueryDmabufModifiersFn>,
    next_handle: u32,
    textures: HashMap<TextureId, GlTexture>,
    images: HashMap<ImageId, egl::Image>,
    offscreens: HashMap<OffscreenId, GlOffscreen>,
    frame: Option<FrameTarget>,
    output_height: u32,
}

fn egl_extensions(egl: &Egl, display: egl::Display) -> Vec<String> {
    egl.query_string(Some(display), egl::EXTENSIONS)
        .map(|s| s.to_string_lossy().split(' ').map(str::to_string).collect())
        .unwrap_or_default()
}

impl GlesDevice {
    /// Wraps a current GLES2 context. `surface` is swapped on present; pass
    /// `None` when the embedding host presents.
    pub fn new(
        gl: Rc<glow::Context>,
        egl: Arc<Egl>,
        display: egl::Display,
        surface: Option<egl::Surface>,
        output_height: u32,
    ) -> Result<Self, DeviceError> {
        let egl_ext = egl_extensions(&egl, display);
        let has_egl = |name: &str| egl_ext.iter().any(|e| e == name);
        let gl_ext = gl.supported_extensions();

        let mut caps = DeviceCaps::empty();
        caps.set(DeviceCaps::ZERO_COPY_IMAGES, has_egl("EGL_WL_bind_wayland_display"));
        caps.set(DeviceCaps::DMABUF_IMPORT, has_egl("EGL_EXT_image_dma_buf_import"));
        caps.set(
            DeviceCaps::DMABUF_MODIFIERS,
            has_egl("EGL_EXT_image_dma_buf_import_modifiers"),
        );
        caps.set(DeviceCaps::NATIVE_PIXMAP_IMAGES, has_egl("EGL_KHR_image_pixmap"));
        caps.set(
            DeviceCaps::EXTERNAL_IMAGES,
            gl_ext.contains("GL_OES_EGL_image_external"),
        );
        caps.set(
            DeviceCaps::BGRA_UPLOAD,
            gl_ext.contains("GL_EXT_texture_format_BGRA8888"),
        );

        let image_target_texture = egl
            .get_proc_address("glEGLImageTargetTexture2DOES")
            .map(|f| unsafe { std::mem::transmute::<extern "system" fn(), ImageTargetTexture2dFn>(f) })
            .ok_or_else(|| DeviceError::ImageImport("glEGLImageTargetTexture2DOES unavailable".into()))?;
        let (query_formats, query_modifiers) = if caps.contains(DeviceCaps::DMABUF_MODIFIERS) {
            (
                egl.get_proc_address("eglQueryDmaBufFormatsEXT")
                    .map(|f| unsafe { std::mem::transmute::<extern "system" fn(), QueryDmabufFormatsFn>(f) }),
                egl.get_proc_address("eglQueryDmaBufModifiersEXT")
                    .map(|f| unsafe { std::mem::transmute::<extern "system" fn(), QueryDmabufModifiersFn>(f) }),
            )
        } else {
            (None, None)
        };

        let programs = Programs {
            rgba: ShaderProgram::new(gl.clone(), RGBA_FRAGMENT_SHADER_SRC)?,
            external: if caps.contains(DeviceCaps::EXTERNAL_IMAGES) {
                Some(ShaderProgram::new(gl.clone(), EXTERNAL_FRAGMENT_SHADER_SRC)?)
            } else {
                None
            },
            yuv: ShaderProgram::new(gl.clone(), YUV_FRAGMENT_SHADER_SRC)?,
        };
        let vbo = unsafe { gl.create_buffer() }.map_err(DeviceError::RenderCall)?;

        info!("GLES device ready with {:?}", caps);
        Ok(Self {
            gl,
            egl,
            display,
            surface,
            caps,
            programs,
            vbo,
            image_target_texture,
            query_formats,
            query_modifiers,
            next_handle: 1,
            textures: HashMap::new(),
            images: HashMap::new(),
            offscreens: HashMap::new(),
            frame: None,
            output_height,
        })
    }

    fn next(&mut self) -> u32 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn new_texture(&mut self, target: u32, width: u32, height: u32) -> Result<TextureId, DeviceError> {
        let texture = unsafe { self.gl.create_texture() }.map_err(DeviceError::Texture)?;
        unsafe {
            self.gl.bind_texture(target, Some(texture));
            self.gl.tex_parameter_i32(target, glow::TEXTURE_MIN_FILTER, glow::LINEAR as i32);
            self.gl.tex_parameter_i32(target, glow::TEXTURE_MAG_FILTER, glow::LINEAR as i32);
            self.gl.tex_parameter_i32(target, glow::TEXTURE_WRAP_S, glow::CLAMP_TO_EDGE as i32);
            self.gl.tex_parameter_i32(target, glow::TEXTURE_WRAP_T, glow::CLAMP_TO_EDGE as i32);
        }
        let id = TextureId::new(self.next());
        self.textures.insert(
            id,
            GlTexture {
                texture,
                target,
                width,
                height,
            },
        );
        Ok(id)
    }

    fn gl_texture(&self, id: TextureId) -> Result<&GlTexture, DeviceError> {
        self.textures
            .get(&id)
            .ok_or(DeviceError::UnknownHandle(GpuResource::Texture(id)))
    }

    fn bind_unit(&self, unit: u32, id: TextureId) -> Result<(), DeviceError> {
        let tex = self.gl_texture(id)?;
        unsafe {
            self.gl.active_texture(glow::TEXTURE0 + unit);
            self.gl.bind_texture(tex.target, Some(tex.texture));
        }
        Ok(())
    }

    fn query_dmabuf_formats(&self) -> Vec<DrmFourcc> {
        let Some(query) = self.query_formats else {
            return Vec::new();
        };
        let display = self.display.as_ptr();
        let mut count = 0;
        unsafe {
            if query(display, 0, std::ptr::null_mut(), &mut count) == 0 || count <= 0 {
                return Vec::new();
            }
            let mut raw = vec![0i32; count as usize];
            if query(display, count, raw.as_mut_ptr(), &mut count) == 0 {
                return Vec::new();
            }
            raw.truncate(count.max(0) as usize);
            raw.into_iter()
                .filter_map(|code| DrmFourcc::try_from(code as u32).ok())
                .collect()
        }
    }
}

impl GraphicsDevice for GlesDevice {
    fn capabilities(&self) -> DeviceCaps {
        self.caps
    }

    fn dmabuf_formats(&self) -> Vec<DrmFourcc> {
        if !self.caps.contains(DeviceCaps::DMABUF_IMPORT) {
            return Vec::new();
        }
        let formats = self.query_dmabuf_formats();
        if formats.is_empty() {
            // Without the query extension these are always importable.
            vec![DrmFourcc::Argb8888, DrmFourcc::Xrgb8888]
        } else {
            formats
        }
    }

    fn dmabuf_modifiers(&self, format: DrmFourcc) -> Vec<DrmModifier> {
        let Some(query) = self.query_modifiers else {
            return Vec::new();
        };
        let display = self.display.as_ptr();
        let mut count = 0;
        unsafe {
            let null = std::ptr::null_mut();
            if query(display, format as i32, 0, null, null as *mut u32, &mut count) == 0 || count <= 0 {
                return Vec::new();
            }
            let mut raw = vec![0u64; count as usize];
            let mut external = vec![0u32; count as usize];
            if query(display, format as i32, count, raw.as_mut_ptr(), external.as_mut_ptr(), &mut count) == 0 {
                return Vec::new();
            }
            raw.truncate(count.max(0) as usize);
            raw.into_iter().map(DrmModifier::from).collect()
        }
    }

    fn create_texture(&mut self, width: u32, height: u32) -> Result<TextureId, DeviceError> {
        self.new_texture(glow::TEXTURE_2D, width, height)
    }

    fn update_texture(&mut self, texture: TextureId, pixels: &CpuPixels) -> Result<(), DeviceError> {
        let tex = self.gl_texture(texture)?;
        if tex.width != pixels.width || tex.height != pixels.height {
            return Err(DeviceError::Texture(format!(
                "upload of {}x{} into {}x{} {}",
                pixels.width, pixels.height, tex.width, tex.height, texture
            )));
        }
        let format = match pixels.layout {
            UploadLayout::Rgba8 => glow::RGBA,
            UploadLayout::Bgra8 => BGRA_EXT,
        };
        unsafe {
            self.gl.bind_texture(glow::TEXTURE_2D, Some(tex.texture));
            self.gl.pixel_store_i32(glow::UNPACK_ALIGNMENT, 4);
            self.gl.tex_image_2d(
                glow::TEXTURE_2D,
                0,
                format as i32,
                pixels.width as i32,
                pixels.height as i32,
                0,
                format,
                glow::UNSIGNED_BYTE,
                Some(&pixels.data),
            );
        }
        Ok(())
    }

    fn import_image(&mut self, request: &ImageRequest) -> Result<ImageId, DeviceError> {
        let (target, buffer) = match request.source {
            ImageSource::WaylandBuffer(handle) => (EGL_WAYLAND_BUFFER_WL, handle.0 as *mut c_void),
            ImageSource::NativePixmap(handle) => (EGL_NATIVE_PIXMAP_KHR, handle.0 as *mut c_void),
            ImageSource::LinuxDmabuf => (EGL_LINUX_DMA_BUF_EXT, std::ptr::null_mut()),
        };
        let attribs: Vec<egl::Attrib> = request.attribs.iter().map(|a| *a as egl::Attrib).collect();
        let image = unsafe {
            self.egl.create_image(
                self.display,
                egl::Context::from_ptr(egl::NO_CONTEXT),
                target,
                egl::ClientBuffer::from_ptr(buffer),
                &attribs,
            )
        }
        .map_err(|e| DeviceError::ImageImport(format!("eglCreateImage: {}", e)))?;
        let id = ImageId::new(self.next());
        self.images.insert(id, image);
        debug!("Imported {} ({}x{})", id, request.width, request.height);
        Ok(id)
    }

    fn texture_from_image(&mut self, image: ImageId, kind: TextureKind) -> Result<TextureId, DeviceError> {
        let egl_image = *self
            .images
            .get(&image)
            .ok_or(DeviceError::UnknownHandle(GpuResource::Image(image)))?;
        let target = match kind {
            TextureKind::Rgba => glow::TEXTURE_2D,
            TextureKind::External if self.caps.contains(DeviceCaps::EXTERNAL_IMAGES) => TEXTURE_EXTERNAL_OES,
            TextureKind::External => return Err(DeviceError::Texture("external textures unsupported".into())),
        };
        let id = self.new_texture(target, 0, 0)?;
        unsafe { (self.image_target_texture)(target, egl_image.as_ptr() as *const c_void) };
        Ok(id)
    }

    fn create_offscreen(&mut self, width: u32, height: u32) -> Result<(OffscreenId, TextureId), DeviceError> {
        let texture = self.create_texture(width, height)?;
        let gl_texture = self.gl_texture(texture)?.texture;
        let framebuffer = unsafe {
            self.gl.tex_image_2d(
                glow::TEXTURE_2D,
                0,
                glow::RGBA as i32,
                width as i32,
                height as i32,
                0,
                glow::RGBA,
                glow::UNSIGNED_BYTE,
                None,
            );
            let framebuffer = self.gl.create_framebuffer().map_err(DeviceError::RenderCall)?;
            self.gl.bind_framebuffer(glow::FRAMEBUFFER, Some(framebuffer));
            self.gl.framebuffer_texture_2d(
                glow::FRAMEBUFFER,
                glow::COLOR_ATTACHMENT0,
                glow::TEXTURE_2D,
                Some(gl_texture),
                0,
            );
            let status = self.gl.check_framebuffer_status(glow::FRAMEBUFFER);
            self.gl.bind_framebuffer(glow::FRAMEBUFFER, None);
            if status != glow::FRAMEBUFFER_COMPLETE {
                self.gl.delete_framebuffer(framebuffer);
                self.release(GpuResource::Texture(texture))?;
                return Err(DeviceError::RenderCall(format!(
                    "Framebuffer not complete: status 0x{:x}",
                    status
                )));
            }
            framebuffer
        };
        let id = OffscreenId::new(self.next());
        self.offscreens.insert(id, GlOffscreen { framebuffer, texture });
        Ok((id, texture))
    }

    fn begin_frame(&mut self, target: FrameTarget) -> Result<(), DeviceError> {
        if self.frame.is_some() {
            return Err(DeviceError::RenderCall("frame already open".into()));
        }
        let (framebuffer, viewport_y) = match target.offscreen {
            Some(offscreen) => {
                let fb = self
                    .offscreens
                    .get(&offscreen)
                    .ok_or(DeviceError::UnknownHandle(GpuResource::Offscreen(offscreen)))?
                    .framebuffer;
                (Some(fb), target.y)
            }
            None => (
                None,
                self.output_height as i32 - target.y - target.height as i32,
            ),
        };
        unsafe {
            self.gl.bind_framebuffer(glow::FRAMEBUFFER, framebuffer);
            self.gl
                .viewport(target.x, viewport_y, target.width as i32, target.height as i32);
            if target.clear {
                self.gl.enable(glow::SCISSOR_TEST);
                self.gl
                    .scissor(target.x, viewport_y, target.width as i32, target.height as i32);
                self.gl.clear_color(0.0, 0.0, 0.0, 0.0);
                self.gl.clear(glow::COLOR_BUFFER_BIT);
                self.gl.disable(glow::SCISSOR_TEST);
            }
            self.gl.enable(glow::BLEND);
            self.gl
                .blend_func_separate(glow::ONE, glow::ONE_MINUS_SRC_ALPHA, glow::ONE, glow::ONE);
        }
        self.frame = Some(target);
        Ok(())
    }

    fn draw(&mut self, quad: &DrawQuad) -> Result<(), DeviceError> {
        let target = self.frame.ok_or(DeviceError::NoFrame)?;
        let program = match quad.source {
            DrawSource::Texture(texture) => {
                self.bind_unit(0, texture)?;
                &self.programs.rgba
            }
            DrawSource::External(texture) => {
                self.bind_unit(0, texture)?;
                self.programs
                    .external
                    .as_ref()
                    .ok_or_else(|| DeviceError::RenderCall("no external-image program".into()))?
            }
            DrawSource::Yuv { y, uv } => {
                self.bind_unit(0, y)?;
                self.bind_unit(1, uv)?;
                &self.programs.yuv
            }
        };

        let projection = Mat4::orthographic_rh_gl(
            target.x as f32,
            (target.x + target.width as i32) as f32,
            (target.y + target.height as i32) as f32,
            target.y as f32,
            -1.0,
            1.0,
        );
        let texcoords = [[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [1.0, 1.0]];
        let mut vertices = Vec::with_capacity(16 * 4);
        for (corner, uv) in quad.corners.iter().zip(texcoords) {
            for value in [corner.x, corner.y, uv[0], uv[1]] {
                vertices.extend_from_slice(&value.to_ne_bytes());
            }
        }

        unsafe {
            let gl = &self.gl;
            gl.use_program(Some(program.program));
            gl.uniform_matrix_4_f32_slice(program.matrix.as_ref(), false, &projection.to_cols_array());
            gl.uniform_1_f32(program.alpha.as_ref(), quad.opacity);
            gl.uniform_1_i32(program.tex.as_ref(), 0);
            gl.uniform_1_i32(program.tex_uv.as_ref(), 1);
            gl.bind_buffer(glow::ARRAY_BUFFER, Some(self.vbo));
            gl.buffer_data_u8_slice(glow::ARRAY_BUFFER, &vertices, glow::STREAM_DRAW);
            gl.vertex_attrib_pointer_f32(ATTRIB_POSITION, 2, glow::FLOAT, false, 16, 0);
            gl.vertex_attrib_pointer_f32(ATTRIB_TEXCOORD, 2, glow::FLOAT, false, 16, 8);
            gl.enable_vertex_attrib_array(ATTRIB_POSITION);
            gl.enable_vertex_attrib_array(ATTRIB_TEXCOORD);
            gl.draw_arrays(glow::TRIANGLE_STRIP, 0, 4);
            gl.disable_vertex_attrib_array(ATTRIB_POSITION);
            gl.disable_vertex_attrib_array(ATTRIB_TEXCOORD);
        }
        Ok(())
    }

    fn end_frame(&mut self, present: bool) -> Result<(), DeviceError> {
        let target = self.frame.take().ok_or(DeviceError::NoFrame)?;
        unsafe {
            self.gl.disable(glow::BLEND);
            self.gl.bind_framebuffer(glow::FRAMEBUFFER, None);
        }
        if present && target.offscreen.is_none() {
            if let Some(surface) = self.surface {
                self.egl
                    .swap_buffers(self.display, surface)
                    .map_err(|e| DeviceError::RenderCall(format!("eglSwapBuffers: {}", e)))?;
            }
        }
        Ok(())
    }

    fn release(&mut self, resource: GpuResource) -> Result<(), DeviceError> {
        match resource {
            GpuResource::Texture(id) => {
                let tex = self.textures.remove(&id).ok_or(DeviceError::UnknownHandle(resource))?;
                unsafe { self.gl.delete_texture(tex.texture) };
            }
            GpuResource::Image(id) => {
                let image = self.images.remove(&id).ok_or(DeviceError::UnknownHandle(resource))?;
                if let Err(e) = self.egl.destroy_image(self.display, image) {
                    warn!("eglDestroyImage failed for {}: {}", id, e);
                }
            }
            GpuResource::Offscreen(id) => {
                let offscreen = self.offscreens.remove(&id).ok_or(DeviceError::UnknownHandle(resource))?;
                unsafe { self.gl.delete_framebuffer(offscreen.framebuffer) };
                if let Some(tex) = self.textures.remove(&offscreen.texture) {
                    unsafe { self.gl.delete_texture(tex.texture) };
                }
            }
            GpuResource::NativeBuffer(_) => return Err(DeviceError::UnknownHandle(resource)),
        }
        Ok(())
    }

    fn live_resources(&self) -> usize {
        self.textures.len() + self.images.len() + self.offscreens.len()
    }
}

impl Drop for GlesDevice {
    fn drop(&mut self) {
        let handles: Vec<GpuResource> = self
            .offscreens
            .keys()
            .map(|id| GpuResource::Offscreen(*id))
            .chain(self.textures.keys().map(|id| GpuResource::Texture(*id)))
            .chain(self.images.keys().map(|id| GpuResource::Image(*id)))
            .collect();
        for handle in handles {
            // Offscreen release may already have taken its texture.
            let _ = self.release(handle);
        }
        unsafe { self.gl.delete_buffer(self.vbo) };
    }
}
