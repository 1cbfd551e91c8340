//! # Westeros Buffer Manager
//!
//! This crate describes the buffers a Westeros compositor hands to its render
//! core. Buffers are not owned here: the protocol extensions that create them
//! (`wl_shm`, wayland-egl, the legacy shared-buffer protocol and
//! `zwp_linux_dmabuf_v1`) are external. What this crate provides is the
//! uniform probe/extract contract the renderer consumes:
//!
//! - [`source`]: one adapter trait per buffer family, each answering
//!   "is this resource one of mine?" and exposing format, dimensions and
//!   per-plane layout.
//! - [`format`]: the `wl_shm` pixel formats the renderer knows how to copy,
//!   and the texture layouts reported for platform buffers.
//! - [`buffer`]: [`BufferManager`], an in-memory registry implementing every
//!   adapter. Headless compositors and the test-suite use it in place of a
//!   live protocol layer.

pub mod buffer;
pub mod format;
pub mod source;

// Re-export key types for convenience.
pub use buffer::{BufferContents, BufferDetails, BufferManager};
pub use format::{PlatformTextureFormat, ShmFormat};
pub use source::{
    BufferSources, DmabufAttributes, DmabufPlane, DmabufSource, NativeHandle,
    PlatformBufferInfo, PlatformBufferSource, ResourceId, SharedBufferInfo,
    SharedBufferSource, ShmInfo, ShmSource, ShmView, SourceError,
};

pub use drm_fourcc::{DrmFourcc, DrmModifier};
