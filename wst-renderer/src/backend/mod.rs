//! Backend implementations of [`crate::RenderBackend`].
//!
//! - [`gpu`]: composites on a [`crate::device::GraphicsDevice`].
//! - [`overlay`]: one hardware layer per surface through a
//!   [`planes::PlaneController`], in a colour-matrix and a per-element-alpha
//!   flavour.
//! - [`embedded`]: GPU compositing into a host-owned target, with optional
//!   fast-path delegation to another backend.

/// Property setters and getters of a backend that keeps its surfaces in a
/// local `surfaces: SurfaceList` field.
macro_rules! local_surface_properties {
    () => {
        fn set_visible(&mut self, surface: $crate::surface::SurfaceId, visible: bool) -> $crate::error::RendererResult<()> {
            $crate::backend::surface_or_err(&mut self.surfaces, surface)?.set_visible(visible);
            Ok(())
        }

        fn visible(&self, surface: $crate::surface::SurfaceId) -> Option<bool> {
            self.surfaces.get(surface).map(|s| s.visible())
        }

        fn set_geometry(&mut self, surface: $crate::surface::SurfaceId, rect: $crate::math::Rect) -> $crate::error::RendererResult<()> {
            $crate::backend::surface_or_err(&mut self.surfaces, surface)?.set_geometry(rect);
            Ok(())
        }

        fn geometry(&self, surface: $crate::surface::SurfaceId) -> Option<$crate::math::Rect> {
            self.surfaces.get(surface).map(|s| s.geometry())
        }

        fn set_opacity(&mut self, surface: $crate::surface::SurfaceId, opacity: f32) -> $crate::error::RendererResult<()> {
            $crate::backend::surface_or_err(&mut self.surfaces, surface)?.set_opacity(opacity);
            Ok(())
        }

        fn opacity(&self, surface: $crate::surface::SurfaceId) -> Option<f32> {
            self.surfaces.get(surface).map(|s| s.opacity())
        }

        fn set_zorder(&mut self, surface: $crate::surface::SurfaceId, zorder: f32) -> $crate::error::RendererResult<()> {
            if self.surfaces.set_zorder(surface, zorder) {
                Ok(())
            } else {
                Err($crate::error::RendererError::UnknownSurface(surface))
            }
        }

        fn zorder(&self, surface: $crate::surface::SurfaceId) -> Option<f32> {
            self.surfaces.get(surface).map(|s| s.zorder())
        }

        fn surfaces(&self) -> Vec<$crate::surface::SurfaceId> {
            self.surfaces.ids()
        }
    };
}

pub mod embedded;
pub mod gpu;
pub mod overlay;
pub mod planes;

use glam::Mat4;

use crate::error::{RendererError, RendererResult};
use crate::import::BufferState;
use crate::math::Rect;
use crate::surface::{RenderSurface, SurfaceId, SurfaceList};

pub(crate) fn ensure_live(terminated: bool) -> RendererResult<()> {
    if terminated {
        Err(RendererError::Terminated)
    } else {
        Ok(())
    }
}

pub(crate) fn surface_or_err(surfaces: &mut SurfaceList, id: SurfaceId) -> RendererResult<&mut RenderSurface> {
    surfaces.get_mut(id).ok_or(RendererError::UnknownSurface(id))
}

/// Whether a hardware plane would show anything for `surface`.
pub(crate) fn shows_content(surface: &RenderSurface) -> bool {
    surface.visible() && !surface.geometry().is_empty() && !matches!(surface.buffer(), BufferState::Empty)
}

/// Destination rectangles, under `matrix`, of every surface a plane shows.
pub(crate) fn hole_punch_rects(surfaces: &SurfaceList, matrix: &Mat4) -> Vec<Rect> {
    surfaces
        .iter()
        .filter(|s| shows_content(s))
        .map(|s| s.geometry().transformed(matrix))
        .collect()
}
