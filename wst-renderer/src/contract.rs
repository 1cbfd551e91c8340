//! The renderer plugin contract.
//!
//! A compositor core talks to exactly one [`RenderBackend`] through this
//! trait. Optional capabilities are reached through accessor methods that
//! return `None` when the backend lacks them; absence is never an error.

use bitflags::bitflags;
use drm_fourcc::{DrmFourcc, DrmModifier};
use glam::Mat4;
use wst_buffer_manager::ResourceId;

use crate::error::{CommitError, RendererResult};
use crate::math::Rect;
use crate::surface::SurfaceId;

bitflags! {
    /// Per-frame hints from the host.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RenderHints: u32 {
        /// The output is not rotated; backends may skip transform work.
        const NO_ROTATION = 1 << 0;
        /// Report the regions hardware planes must show through.
        const HOLE_PUNCH = 1 << 1;
        /// The host is animating the scene.
        const ANIMATING = 1 << 2;
        /// Compose into an intermediate off-screen target.
        const FBO_TARGET = 1 << 3;
        /// Apply the frame matrix to surface geometry.
        const APPLY_TRANSFORM = 1 << 4;
        /// Hand presentation to the fast-path delegate.
        const FAST_PATH = 1 << 5;
        /// Leave the target's existing contents in place.
        const NO_CLEAR = 1 << 6;
    }
}

/// Per-frame parameters supplied by the host.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameParams {
    pub output_width: u32,
    pub output_height: u32,
    /// Maps surface coordinates to output pixels.
    pub matrix: Mat4,
    /// Multiplies every surface's opacity.
    pub alpha: f32,
    pub hints: RenderHints,
}

impl FrameParams {
    pub fn new(output_width: u32, output_height: u32) -> Self {
        Self {
            output_width,
            output_height,
            matrix: Mat4::IDENTITY,
            alpha: 1.0,
            hints: RenderHints::empty(),
        }
    }

    pub fn with_matrix(mut self, matrix: Mat4) -> Self {
        self.matrix = matrix;
        self
    }

    pub fn with_alpha(mut self, alpha: f32) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_hints(mut self, hints: RenderHints) -> Self {
        self.hints = hints;
        self
    }
}

/// Scene update on behalf of an embedding backend.
pub trait DelegateScene {
    /// Presents the delegate's surfaces. With [`RenderHints::HOLE_PUNCH`]
    /// the destination rectangle of each visible surface, under
    /// `frame.matrix`, is appended to `rects`. Returns whether the caller
    /// must punch holes for them.
    fn delegate_update_scene(&mut self, frame: &FrameParams, rects: &mut Vec<Rect>) -> RendererResult<bool>;
}

/// DMA-BUF format negotiation.
pub trait FormatQuery {
    fn dmabuf_formats(&self) -> Vec<DrmFourcc>;

    fn dmabuf_modifiers(&self, format: DrmFourcc) -> Vec<DrmModifier>;
}

/// One renderer implementation.
///
/// Every method runs on the thread that owns the backend's graphics context.
/// Setters on an unknown surface return [`crate::RendererError::UnknownSurface`];
/// getters return `None`.
pub trait RenderBackend {
    /// Registry name of the backend.
    fn name(&self) -> &str;

    fn output_size(&self) -> (u32, u32);

    /// Releases every surface, drains deferred resources and unbinds the
    /// display. Later calls fail with `Terminated`; terminating twice is a
    /// no-op.
    fn terminate(&mut self);

    fn is_terminated(&self) -> bool;

    /// Draws or presents one frame. May block on GPU or plane
    /// synchronisation.
    fn update_scene(&mut self, frame: &FrameParams) -> RendererResult<()>;

    fn surface_create(&mut self) -> RendererResult<SurfaceId>;

    fn surface_destroy(&mut self, surface: SurfaceId) -> RendererResult<()>;

    /// Applies a committed buffer. `None` clears the content. A failed commit
    /// leaves the surface's previous content in place.
    fn surface_commit(&mut self, surface: SurfaceId, resource: Option<ResourceId>) -> Result<(), CommitError>;

    fn set_visible(&mut self, surface: SurfaceId, visible: bool) -> RendererResult<()>;

    fn visible(&self, surface: SurfaceId) -> Option<bool>;

    fn set_geometry(&mut self, surface: SurfaceId, rect: Rect) -> RendererResult<()>;

    fn geometry(&self, surface: SurfaceId) -> Option<Rect>;

    fn set_opacity(&mut self, surface: SurfaceId, opacity: f32) -> RendererResult<()>;

    fn opacity(&self, surface: SurfaceId) -> Option<f32>;

    fn set_zorder(&mut self, surface: SurfaceId, zorder: f32) -> RendererResult<()>;

    fn zorder(&self, surface: SurfaceId) -> Option<f32>;

    /// Surfaces in draw order, bottom first.
    fn surfaces(&self) -> Vec<SurfaceId>;

    fn delegation(&mut self) -> Option<&mut dyn DelegateScene> {
        None
    }

    fn format_query(&self) -> Option<&dyn FormatQuery> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_params_builder() {
        let frame = FrameParams::new(1920, 1080)
            .with_alpha(0.5)
            .with_hints(RenderHints::FAST_PATH | RenderHints::HOLE_PUNCH);
        assert_eq!(frame.matrix, Mat4::IDENTITY);
        assert_eq!(frame.alpha, 0.5);
        assert!(frame.hints.contains(RenderHints::HOLE_PUNCH));
        assert!(!frame.hints.contains(RenderHints::FBO_TARGET));
    }
}
