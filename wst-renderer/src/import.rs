//! Buffer import state machine.
//!
//! Every commit is classified against the buffer families in a fixed order
//! (shared memory, platform window buffer, legacy shared buffer, DMA-BUF) and
//! turned into a [`BufferState`]. The new representation is built first; only
//! once it exists does the previous one move to the [`DeadResourceQueue`], so
//! a failed import leaves the surface showing its old content.

use drm_fourcc::DrmFourcc;
use tracing::{debug, warn};
use wst_buffer_manager::{
    BufferSources, DmabufAttributes, PlatformTextureFormat, ResourceId, ShmView, SourceError,
};

use crate::device::{
    DeviceCaps, DrawSource, GraphicsDevice, ImageRequest, ImageSource, TextureKind,
};
use crate::egl_attribs;
use crate::error::{CommitError, ImportError};
use crate::format::{convert_shm, CpuPixels, UploadLayout};
use crate::resources::{DeadResourceQueue, GpuResource, ImageId, TextureId};
use crate::ring::NativeRing;
use crate::surface::RenderSurface;

/// CPU copy waiting for (or already holding) a texture.
#[derive(Debug)]
pub struct CpuContent {
    pub pixels: CpuPixels,
    /// Needs uploading before the next draw.
    pub dirty: bool,
    pub texture: Option<TextureId>,
}

/// How the textures of an image import are sampled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sampling {
    Rgba,
    External,
    /// Luma in the first texture, chroma in the second.
    Yuv,
}

/// Zero-copy images and the textures bound to them.
#[derive(Debug)]
pub struct ImageContent {
    pub width: u32,
    pub height: u32,
    pub images: Vec<ImageId>,
    pub textures: Vec<TextureId>,
    pub sampling: Sampling,
}

/// Displayable representation of a surface's content.
#[derive(Debug, Default)]
pub enum BufferState {
    #[default]
    Empty,
    Cpu(CpuContent),
    Images(ImageContent),
    /// Overlay plane buffers.
    Native(NativeRing),
}

impl BufferState {
    /// Size of the content, if there is any.
    pub fn size(&self) -> Option<(u32, u32)> {
        match self {
            BufferState::Empty => None,
            BufferState::Cpu(cpu) => Some((cpu.pixels.width, cpu.pixels.height)),
            BufferState::Images(images) => Some((images.width, images.height)),
            BufferState::Native(ring) => ring
                .pending()
                .or_else(|| ring.pushed())
                .or_else(|| ring.front())
                .map(|slot| (slot.width, slot.height)),
        }
    }

    /// How a draw samples this content. `None` for content that cannot be
    /// drawn by a graphics device (yet).
    pub fn draw_source(&self) -> Option<DrawSource> {
        match self {
            BufferState::Cpu(CpuContent {
                texture: Some(texture),
                ..
            }) => Some(DrawSource::Texture(*texture)),
            BufferState::Images(images) => match (images.sampling, images.textures.as_slice()) {
                (Sampling::Rgba, [texture, ..]) => Some(DrawSource::Texture(*texture)),
                (Sampling::External, [texture, ..]) => Some(DrawSource::External(*texture)),
                (Sampling::Yuv, [y, uv, ..]) => Some(DrawSource::Yuv { y: *y, uv: *uv }),
                _ => None,
            },
            _ => None,
        }
    }

    /// Schedules every handle of this representation for release.
    pub fn release_into(self, dead: &mut DeadResourceQueue) {
        match self {
            BufferState::Empty => {}
            BufferState::Cpu(cpu) => dead.extend(cpu.texture.map(GpuResource::Texture)),
            BufferState::Images(images) => {
                dead.extend(images.textures.into_iter().map(GpuResource::Texture));
                dead.extend(images.images.into_iter().map(GpuResource::Image));
            }
            BufferState::Native(mut ring) => {
                dead.extend(ring.drain_all().into_iter().map(GpuResource::NativeBuffer));
            }
        }
    }
}

/// How two-plane YUV DMA-BUFs are imported. Chosen once per backend from
/// the device capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanarImportPath {
    /// One image over both planes, sampled through an external texture.
    ExternalImage,
    /// Luma as `R8`, chroma as `GR88`, combined in the YUV shader.
    PerPlane,
}

impl PlanarImportPath {
    pub fn for_caps(caps: DeviceCaps) -> Self {
        if caps.contains(DeviceCaps::EXTERNAL_IMAGES) {
            PlanarImportPath::ExternalImage
        } else {
            PlanarImportPath::PerPlane
        }
    }
}

/// Buffer family a resource belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferFamily {
    Shm,
    Platform,
    Shared,
    Dmabuf,
}

/// First family whose adapter claims `resource`.
pub fn classify(sources: &BufferSources, resource: ResourceId) -> Option<BufferFamily> {
    if sources.shm.as_ref().is_some_and(|s| s.is_shm(resource)) {
        Some(BufferFamily::Shm)
    } else if sources
        .platform
        .as_ref()
        .is_some_and(|s| s.is_platform_buffer(resource))
    {
        Some(BufferFamily::Platform)
    } else if sources
        .shared
        .as_ref()
        .is_some_and(|s| s.is_shared_buffer(resource))
    {
        Some(BufferFamily::Shared)
    } else if sources.dmabuf.as_ref().is_some_and(|s| s.is_dmabuf(resource)) {
        Some(BufferFamily::Dmabuf)
    } else {
        None
    }
}

/// Copies a CPU-accessible buffer through `access`, which brackets the
/// memory with begin/end access.
pub fn read_cpu_pixels(
    layout: UploadLayout,
    access: impl FnOnce(&mut dyn FnMut(ShmView<'_>)) -> Result<(), SourceError>,
) -> Result<CpuPixels, ImportError> {
    let mut converted = None;
    access(&mut |view| converted = Some(convert_shm(view, layout)))?;
    converted.unwrap_or_else(|| Err(ImportError::InvalidLayout("buffer contents were not accessible".into())))
}

fn is_yuv(format: DrmFourcc) -> bool {
    matches!(
        format,
        DrmFourcc::Nv12
            | DrmFourcc::Nv21
            | DrmFourcc::Nv16
            | DrmFourcc::Nv61
            | DrmFourcc::Yuv420
            | DrmFourcc::Yvu420
            | DrmFourcc::Yuyv
            | DrmFourcc::Yvyu
            | DrmFourcc::Uyvy
            | DrmFourcc::Vyuy
    )
}

/// Handles created so far by one import; released if the import fails
/// halfway.
#[derive(Default)]
struct Partial {
    images: Vec<ImageId>,
    textures: Vec<TextureId>,
}

impl Partial {
    fn abandon(self, dead: &mut DeadResourceQueue) {
        dead.extend(self.textures.into_iter().map(GpuResource::Texture));
        dead.extend(self.images.into_iter().map(GpuResource::Image));
    }
}

/// Everything one commit needs from its backend.
pub struct Importer<'a, D: GraphicsDevice + ?Sized> {
    pub device: &'a mut D,
    pub sources: &'a BufferSources,
    pub layout: UploadLayout,
    pub planar: PlanarImportPath,
    pub dead: &'a mut DeadResourceQueue,
}

impl<'a, D: GraphicsDevice + ?Sized> Importer<'a, D> {
    /// Applies a commit to `surface`. `None` clears the content.
    pub fn commit(&mut self, surface: &mut RenderSurface, resource: Option<ResourceId>) -> Result<(), CommitError> {
        let Some(resource) = resource else {
            std::mem::take(&mut surface.buffer).release_into(self.dead);
            surface.last_resource = None;
            return Ok(());
        };

        let family = classify(self.sources, resource).ok_or(CommitError::Unsupported(resource))?;
        let mut state = self
            .import(family, resource)
            .map_err(|source| CommitError::Import { resource, source })?;

        let previous = std::mem::take(&mut surface.buffer);
        let previous = reuse_cpu_texture(&mut state, previous);
        previous.release_into(self.dead);

        if let Some((width, height)) = state.size() {
            surface.apply_buffer_size(width, height);
        }
        debug!("{} now holds {} as {:?}", surface.id(), resource, family);
        surface.buffer = state;
        surface.last_resource = Some(resource);
        Ok(())
    }

    /// Builds the representation of `resource` without touching any
    /// surface.
    pub fn import(&mut self, family: BufferFamily, resource: ResourceId) -> Result<BufferState, ImportError> {
        match family {
            BufferFamily::Shm => self.import_shm(resource),
            BufferFamily::Platform => self.import_platform(resource),
            BufferFamily::Shared => self.import_shared(resource),
            BufferFamily::Dmabuf => self.import_dmabuf(resource),
        }
    }

    fn caps(&self) -> DeviceCaps {
        self.device.capabilities()
    }

    fn import_shm(&mut self, resource: ResourceId) -> Result<BufferState, ImportError> {
        let sources = self.sources;
        let shm = sources
            .shm
            .as_ref()
            .ok_or(ImportError::MissingCapability("shared-memory adapter"))?;
        let pixels = read_cpu_pixels(self.layout, |f| shm.with_contents(resource, f))?;
        Ok(cpu_state(pixels))
    }

    fn import_platform(&mut self, resource: ResourceId) -> Result<BufferState, ImportError> {
        if !self.caps().contains(DeviceCaps::ZERO_COPY_IMAGES) {
            return Err(ImportError::MissingCapability("zero-copy platform images"));
        }
        let sources = self.sources;
        let source = sources
            .platform
            .as_ref()
            .ok_or(ImportError::MissingCapability("platform buffer adapter"))?;
        let info = source.platform_info(resource)?;
        let sampling = match info.texture_format {
            PlatformTextureFormat::Rgb | PlatformTextureFormat::Rgba => Sampling::Rgba,
            PlatformTextureFormat::YUv => Sampling::Yuv,
            other => {
                return Err(ImportError::UnsupportedFormat(format!(
                    "platform texture format {:?}",
                    other
                )))
            }
        };

        let mut partial = Partial::default();
        for plane in 0..info.texture_format.plane_count() {
            let request = ImageRequest {
                source: ImageSource::WaylandBuffer(info.native),
                width: info.width,
                height: info.height,
                attribs: egl_attribs::wayland_plane_image(plane),
            };
            if let Err(e) = self.push_image(&mut partial, &request, TextureKind::Rgba) {
                partial.abandon(self.dead);
                return Err(e);
            }
        }
        Ok(images_state(info.width, info.height, partial, sampling))
    }

    fn import_shared(&mut self, resource: ResourceId) -> Result<BufferState, ImportError> {
        let sources = self.sources;
        let source = sources
            .shared
            .as_ref()
            .ok_or(ImportError::MissingCapability("shared buffer adapter"))?;
        let info = source.shared_info(resource)?;

        if self.caps().contains(DeviceCaps::NATIVE_PIXMAP_IMAGES) {
            let request = ImageRequest {
                source: ImageSource::NativePixmap(info.pixmap),
                width: info.width,
                height: info.height,
                attribs: egl_attribs::native_pixmap_image(),
            };
            let mut partial = Partial::default();
            match self.push_image(&mut partial, &request, TextureKind::Rgba) {
                Ok(()) => return Ok(images_state(info.width, info.height, partial, Sampling::Rgba)),
                Err(e) => {
                    partial.abandon(self.dead);
                    warn!("Native pixmap import of {} failed, reading back: {}", resource, e);
                }
            }
        }

        let pixels = read_cpu_pixels(self.layout, |f| source.read_back(resource, f))?;
        Ok(cpu_state(pixels))
    }

    fn import_dmabuf(&mut self, resource: ResourceId) -> Result<BufferState, ImportError> {
        let caps = self.caps();
        if !caps.contains(DeviceCaps::DMABUF_IMPORT) {
            return Err(ImportError::MissingCapability("dma-buf import"));
        }
        let sources = self.sources;
        let source = sources
            .dmabuf
            .as_ref()
            .ok_or(ImportError::MissingCapability("dma-buf adapter"))?;
        let attrs = source.dmabuf_attributes(resource)?;
        let with_modifiers = caps.contains(DeviceCaps::DMABUF_MODIFIERS);
        if attrs.has_modifiers() && !with_modifiers {
            return Err(ImportError::MissingCapability("dma-buf modifiers"));
        }

        if attrs.is_semi_planar_yuv() {
            if self.planar == PlanarImportPath::ExternalImage {
                match self.import_dmabuf_combined(&attrs, TextureKind::External, with_modifiers) {
                    Ok(state) => return Ok(state),
                    Err(e) => warn!(
                        "Combined import of {} failed, importing planes separately: {}",
                        resource, e
                    ),
                }
            }
            return self.import_dmabuf_per_plane(&attrs, with_modifiers);
        }

        let kind = if attrs.planes().len() > 1 || is_yuv(attrs.format) {
            if !caps.contains(DeviceCaps::EXTERNAL_IMAGES) {
                return Err(ImportError::UnsupportedFormat(format!(
                    "{:?} needs external images",
                    attrs.format
                )));
            }
            TextureKind::External
        } else {
            TextureKind::Rgba
        };
        self.import_dmabuf_combined(&attrs, kind, with_modifiers)
    }

    fn import_dmabuf_combined(
        &mut self,
        attrs: &DmabufAttributes,
        kind: TextureKind,
        with_modifiers: bool,
    ) -> Result<BufferState, ImportError> {
        let request = ImageRequest {
            source: ImageSource::LinuxDmabuf,
            width: attrs.width,
            height: attrs.height,
            attribs: egl_attribs::dmabuf_image(attrs, with_modifiers),
        };
        let mut partial = Partial::default();
        if let Err(e) = self.push_image(&mut partial, &request, kind) {
            partial.abandon(self.dead);
            return Err(e);
        }
        let sampling = match kind {
            TextureKind::Rgba => Sampling::Rgba,
            TextureKind::External => Sampling::External,
        };
        Ok(images_state(attrs.width, attrs.height, partial, sampling))
    }

    fn import_dmabuf_per_plane(
        &mut self,
        attrs: &DmabufAttributes,
        with_modifiers: bool,
    ) -> Result<BufferState, ImportError> {
        let chroma_width = attrs.width.div_ceil(2);
        let chroma_height = attrs.height.div_ceil(2);
        let planes = [
            (DrmFourcc::R8, attrs.width, attrs.height),
            (DrmFourcc::Gr88, chroma_width, chroma_height),
        ];

        let mut partial = Partial::default();
        for (plane, (format, width, height)) in attrs.planes().iter().zip(planes) {
            let request = ImageRequest {
                source: ImageSource::LinuxDmabuf,
                width,
                height,
                attribs: egl_attribs::dmabuf_plane_image(plane, format, width, height, with_modifiers),
            };
            if let Err(e) = self.push_image(&mut partial, &request, TextureKind::Rgba) {
                partial.abandon(self.dead);
                return Err(e);
            }
        }
        Ok(images_state(attrs.width, attrs.height, partial, Sampling::Yuv))
    }

    fn push_image(&mut self, partial: &mut Partial, request: &ImageRequest, kind: TextureKind) -> Result<(), ImportError> {
        let image = self.device.import_image(request)?;
        partial.images.push(image);
        let texture = self.device.texture_from_image(image, kind)?;
        partial.textures.push(texture);
        Ok(())
    }
}

fn cpu_state(pixels: CpuPixels) -> BufferState {
    BufferState::Cpu(CpuContent {
        pixels,
        dirty: true,
        texture: None,
    })
}

fn images_state(width: u32, height: u32, partial: Partial, sampling: Sampling) -> BufferState {
    BufferState::Images(ImageContent {
        width,
        height,
        images: partial.images,
        textures: partial.textures,
        sampling,
    })
}

/// Moves a same-sized texture from the previous CPU content into the new
/// one, so re-committing a shared-memory buffer does not churn textures.
fn reuse_cpu_texture(state: &mut BufferState, mut previous: BufferState) -> BufferState {
    if let (BufferState::Cpu(new), BufferState::Cpu(old)) = (&mut *state, &mut previous) {
        if old.pixels.width == new.pixels.width && old.pixels.height == new.pixels.height {
            new.texture = old.texture.take();
        }
    }
    previous
}
