//! # Westeros Render Core
//!
//! This crate turns committed client buffers into a composited, z-ordered
//! scene. A compositor talks to one [`RenderBackend`] chosen by name from the
//! [`BackendRegistry`]; every backend shares the same surface semantics:
//!
//! - [`surface`]: the z-ordered surface list and per-surface geometry,
//!   opacity and visibility.
//! - [`import`]: classification of each commit against the buffer families of
//!   `wst-buffer-manager` and conversion into a displayable
//!   [`import::BufferState`]. Invalidated handles go through the
//!   [`resources::DeadResourceQueue`] and are released at the start of the
//!   next frame.
//! - [`device`]: the graphics device the GPU path draws on. A software device
//!   is always available; the OpenGL ES 2.0 + EGL device is behind the
//!   `renderer_gl` feature.
//! - [`backend`]: the GPU, hardware-overlay and embedded backends. The
//!   embedded backend can hand its surfaces to an overlay backend on the
//!   fast path and report the holes its host must punch.
//! - [`master`]: one embedded backend shared by several hosts.
//! - [`config`], [`logging`] and [`fps`]: configuration from TOML and the
//!   environment, a minimal `tracing` subscriber, and frame-rate reports.

pub mod backend;
pub mod config;
pub mod contract;
pub mod device;
pub mod egl_attribs;
pub mod error;
pub mod format;
pub mod fps;
pub mod import;
pub mod logging;
pub mod master;
pub mod math;
pub mod registry;
pub mod resources;
pub mod ring;
pub mod surface;

// Re-export key types for convenience.
pub use backend::embedded::{ComposeResult, EmbeddedBackend, Mode};
pub use backend::gpu::GpuBackend;
pub use backend::overlay::{OverlayBackend, OverlayFlavor};
pub use backend::planes::{ColorMatrix, LayerConfig, PlaneController, VirtualPlanes};
pub use config::RendererConfig;
pub use contract::{DelegateScene, FormatQuery, FrameParams, RenderBackend, RenderHints};
pub use device::soft::SoftDevice;
pub use device::{DeviceCaps, GraphicsDevice};
pub use error::{
    CommitError, ConfigError, DeviceError, ImportError, InitError, PlaneError, RendererError, RendererResult,
};
pub use master::{MasterSlot, VirtualEmbedded};
pub use math::Rect;
pub use registry::{BackendFactory, BackendInit, BackendRegistry};
pub use surface::{RenderSurface, SurfaceId, SurfaceList};
