//! Buffer source adapter contracts.
//!
//! Each buffer family is reached through its own adapter. The renderer never
//! inspects a client resource directly: it asks each adapter in turn whether
//! the resource belongs to it and, on a match, extracts the layout it needs.

use std::fmt;
use std::os::fd::RawFd;
use std::sync::Arc;

use drm_fourcc::{DrmFourcc, DrmModifier};
use thiserror::Error;

use crate::format::{PlatformTextureFormat, ShmFormat};

/// Opaque handle to a client buffer resource (a `wl_buffer` on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(u64);

impl ResourceId {
    /// Wraps the protocol layer's raw identifier.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer#{}", self.0)
    }
}

/// Pointer-sized platform handle (native pixmap, native window buffer,
/// vendor surface). Never dereferenced by the render core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeHandle(pub usize);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("{0} is not known to this buffer source")]
    UnknownResource(ResourceId),

    #[error("{0} belongs to a different buffer family")]
    WrongFamily(ResourceId),

    #[error("DMA-BUF must carry between 1 and 4 planes, got {0}")]
    InvalidPlaneCount(usize),

    #[error("Invalid buffer dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("Stride {stride} too small for width {width} in {format:?}")]
    InvalidStride {
        stride: u32,
        width: u32,
        format: ShmFormat,
    },

    #[error("Buffer access failed: {0}")]
    AccessFailed(String),
}

/// Layout of a shared-memory buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShmInfo {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: ShmFormat,
}

/// Borrowed view over CPU-visible pixels, valid only inside an access
/// bracket.
#[derive(Debug, Clone, Copy)]
pub struct ShmView<'a> {
    pub info: ShmInfo,
    pub data: &'a [u8],
}

/// CPU shared-memory buffers (`wl_shm`).
pub trait ShmSource {
    fn is_shm(&self, resource: ResourceId) -> bool;

    fn shm_info(&self, resource: ResourceId) -> Result<ShmInfo, SourceError>;

    /// Runs `f` between begin-access and end-access on the buffer memory.
    /// End-access happens even when `f` bails out early.
    fn with_contents(
        &self,
        resource: ResourceId,
        f: &mut dyn FnMut(ShmView<'_>),
    ) -> Result<(), SourceError>;
}

/// Description of a zero-copy platform window buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformBufferInfo {
    pub width: u32,
    pub height: u32,
    pub texture_format: PlatformTextureFormat,
    /// Handle passed to the EGL import as the client buffer.
    pub native: NativeHandle,
}

/// Zero-copy platform window buffers (wayland-egl).
pub trait PlatformBufferSource {
    fn is_platform_buffer(&self, resource: ResourceId) -> bool;

    fn platform_info(&self, resource: ResourceId) -> Result<PlatformBufferInfo, SourceError>;
}

/// Description of a legacy shared buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedBufferInfo {
    pub width: u32,
    pub height: u32,
    pub format: DrmFourcc,
    /// Native pixmap wrapping the buffer memory, imported as an EGL image on
    /// platforms that support it.
    pub pixmap: NativeHandle,
}

/// Buffers created through the legacy shared-buffer protocol.
pub trait SharedBufferSource {
    fn is_shared_buffer(&self, resource: ResourceId) -> bool;

    fn shared_info(&self, resource: ResourceId) -> Result<SharedBufferInfo, SourceError>;

    /// CPU read-back used where native pixmaps cannot be imported.
    fn read_back(
        &self,
        resource: ResourceId,
        f: &mut dyn FnMut(ShmView<'_>),
    ) -> Result<(), SourceError>;
}

/// One plane of a DMA-BUF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmabufPlane {
    pub fd: RawFd,
    pub offset: u32,
    pub stride: u32,
    /// `DrmModifier::Invalid` when the client did not supply one.
    pub modifier: DrmModifier,
}

/// Layout of an imported DMA-BUF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmabufAttributes {
    pub width: u32,
    pub height: u32,
    pub format: DrmFourcc,
    planes: Vec<DmabufPlane>,
}

impl DmabufAttributes {
    pub const MAX_PLANES: usize = 4;

    pub fn new(
        width: u32,
        height: u32,
        format: DrmFourcc,
        planes: Vec<DmabufPlane>,
    ) -> Result<Self, SourceError> {
        if planes.is_empty() || planes.len() > Self::MAX_PLANES {
            return Err(SourceError::InvalidPlaneCount(planes.len()));
        }
        if width == 0 || height == 0 {
            return Err(SourceError::InvalidDimensions { width, height });
        }
        Ok(Self {
            width,
            height,
            format,
            planes,
        })
    }

    pub fn planes(&self) -> &[DmabufPlane] {
        &self.planes
    }

    /// Whether any plane carries an explicit layout modifier.
    pub fn has_modifiers(&self) -> bool {
        self.planes
            .iter()
            .any(|plane| plane.modifier != DrmModifier::Invalid)
    }

    /// Two-plane luma/chroma layouts that can be split across two
    /// single-plane images.
    pub fn is_semi_planar_yuv(&self) -> bool {
        self.planes.len() == 2 && matches!(self.format, DrmFourcc::Nv12 | DrmFourcc::Nv21)
    }
}

/// Linux DMA-BUF buffers (`zwp_linux_dmabuf_v1`).
pub trait DmabufSource {
    fn is_dmabuf(&self, resource: ResourceId) -> bool;

    fn dmabuf_attributes(&self, resource: ResourceId) -> Result<DmabufAttributes, SourceError>;
}

/// The set of adapters available to a backend. An absent adapter means the
/// compositor does not expose that buffer family.
#[derive(Clone, Default)]
pub struct BufferSources {
    pub shm: Option<Arc<dyn ShmSource>>,
    pub platform: Option<Arc<dyn PlatformBufferSource>>,
    pub shared: Option<Arc<dyn SharedBufferSource>>,
    pub dmabuf: Option<Arc<dyn DmabufSource>>,
}

impl BufferSources {
    /// Uses a single object for every family, as [`crate::BufferManager`]
    /// allows.
    pub fn from_all<T>(source: Arc<T>) -> Self
    where
        T: ShmSource + PlatformBufferSource + SharedBufferSource + DmabufSource + 'static,
    {
        Self {
            shm: Some(source.clone()),
            platform: Some(source.clone()),
            shared: Some(source.clone()),
            dmabuf: Some(source),
        }
    }
}

impl fmt::Debug for BufferSources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferSources")
            .field("shm", &self.shm.is_some())
            .field("platform", &self.platform.is_some())
            .field("shared", &self.shared.is_some())
            .field("dmabuf", &self.dmabuf.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plane(fd: RawFd) -> DmabufPlane {
        DmabufPlane {
            fd,
            offset: 0,
            stride: 256,
            modifier: DrmModifier::Invalid,
        }
    }

    #[test]
    fn dmabuf_plane_count_is_validated() {
        let none = DmabufAttributes::new(64, 64, DrmFourcc::Argb8888, Vec::new());
        assert_eq!(none, Err(SourceError::InvalidPlaneCount(0)));

        let five = DmabufAttributes::new(64, 64, DrmFourcc::Argb8888, (0..5).map(plane).collect());
        assert_eq!(five, Err(SourceError::InvalidPlaneCount(5)));

        let ok = DmabufAttributes::new(64, 64, DrmFourcc::Argb8888, vec![plane(3)]).unwrap();
        assert_eq!(ok.planes().len(), 1);
        assert!(!ok.has_modifiers());
    }

    #[test]
    fn semi_planar_detection() {
        let nv12 = DmabufAttributes::new(64, 64, DrmFourcc::Nv12, vec![plane(3), plane(4)]).unwrap();
        assert!(nv12.is_semi_planar_yuv());

        let rgb = DmabufAttributes::new(64, 64, DrmFourcc::Xrgb8888, vec![plane(3)]).unwrap();
        assert!(!rgb.is_semi_planar_yuv());
    }
}
