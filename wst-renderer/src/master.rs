//! Shared master embedded backend.
//!
//! Several embedding hosts in one process can share a single backend. The
//! first one to attach creates the master; later ones reuse it as long as it
//! is alive. Each host sees only the surfaces it created, and the master is
//! torn down when the last host detaches.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use glam::Mat4;
use tracing::{debug, info, warn};
use wst_buffer_manager::ResourceId;

use crate::backend::embedded::{ComposeResult, EmbeddedBackend};
use crate::contract::{FrameParams, RenderBackend, RenderHints};
use crate::device::GraphicsDevice;
use crate::error::{CommitError, InitError, RendererError, RendererResult};
use crate::math::Rect;
use crate::surface::SurfaceId;

/// Weak holder of the shared master, passed explicitly to whoever attaches.
#[derive(Debug)]
pub struct MasterSlot<B> {
    master: Weak<RefCell<B>>,
}

impl<B> Default for MasterSlot<B> {
    fn default() -> Self {
        Self { master: Weak::new() }
    }
}

impl<B> MasterSlot<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_live(&self) -> bool {
        self.master.strong_count() > 0
    }

    /// Returns the live master, or creates one with `create`.
    pub fn acquire<F>(&mut self, create: F) -> Result<Rc<RefCell<B>>, InitError>
    where
        F: FnOnce() -> Result<B, InitError>,
    {
        if let Some(master) = self.master.upgrade() {
            return Ok(master);
        }
        let master = Rc::new(RefCell::new(create()?));
        self.master = Rc::downgrade(&master);
        info!("Created shared master backend");
        Ok(master)
    }
}

/// One host's view of the shared master.
pub struct VirtualEmbedded<B: RenderBackend> {
    master: Rc<RefCell<B>>,
    name: String,
    surfaces: Vec<SurfaceId>,
    terminated: bool,
}

impl<B: RenderBackend> VirtualEmbedded<B> {
    pub fn attach<F>(slot: &mut MasterSlot<B>, create: F) -> Result<Self, InitError>
    where
        F: FnOnce() -> Result<B, InitError>,
    {
        let master = slot.acquire(create)?;
        let name = master.borrow().name().to_string();
        debug!("Attached to {} ({} handles)", name, Rc::strong_count(&master));
        Ok(Self {
            master,
            name,
            surfaces: Vec::new(),
            terminated: false,
        })
    }

    pub fn master(&self) -> &Rc<RefCell<B>> {
        &self.master
    }

    pub fn owns(&self, surface: SurfaceId) -> bool {
        self.surfaces.contains(&surface)
    }

    fn live(&self) -> RendererResult<()> {
        if self.is_terminated() {
            Err(RendererError::Terminated)
        } else {
            Ok(())
        }
    }

    fn owned(&self, surface: SurfaceId) -> RendererResult<()> {
        if self.owns(surface) {
            Ok(())
        } else {
            Err(RendererError::UnknownSurface(surface))
        }
    }
}

impl<D: GraphicsDevice> VirtualEmbedded<EmbeddedBackend<D>> {
    pub fn compose_embedded(
        &mut self,
        target: Rect,
        matrix: Mat4,
        alpha: f32,
        hints: RenderHints,
    ) -> RendererResult<ComposeResult> {
        self.live()?;
        self.master.borrow_mut().compose_embedded(target, matrix, alpha, hints)
    }
}

impl<B: RenderBackend> RenderBackend for VirtualEmbedded<B> {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_size(&self) -> (u32, u32) {
        self.master.borrow().output_size()
    }

    /// Destroys this host's surfaces. The master lives on for other hosts.
    fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        let mut master = self.master.borrow_mut();
        for surface in self.surfaces.drain(..) {
            if let Err(e) = master.surface_destroy(surface) {
                warn!("Failed to destroy {} on the master: {}", surface, e);
            }
        }
        self.terminated = true;
    }

    fn is_terminated(&self) -> bool {
        self.terminated || self.master.borrow().is_terminated()
    }

    fn update_scene(&mut self, frame: &FrameParams) -> RendererResult<()> {
        self.live()?;
        self.master.borrow_mut().update_scene(frame)
    }

    fn surface_create(&mut self) -> RendererResult<SurfaceId> {
        self.live()?;
        let surface = self.master.borrow_mut().surface_create()?;
        self.surfaces.push(surface);
        Ok(surface)
    }

    fn surface_destroy(&mut self, surface: SurfaceId) -> RendererResult<()> {
        self.owned(surface)?;
        self.surfaces.retain(|s| *s != surface);
        self.master.borrow_mut().surface_destroy(surface)
    }

    fn surface_commit(&mut self, surface: SurfaceId, resource: Option<ResourceId>) -> Result<(), CommitError> {
        if !self.owns(surface) {
            return Err(CommitError::UnknownSurface(surface));
        }
        self.master.borrow_mut().surface_commit(surface, resource)
    }

    fn set_visible(&mut self, surface: SurfaceId, visible: bool) -> RendererResult<()> {
        self.owned(surface)?;
        self.master.borrow_mut().set_visible(surface, visible)
    }

    fn visible(&self, surface: SurfaceId) -> Option<bool> {
        self.owns(surface).then(|| self.master.borrow().visible(surface))?
    }

    fn set_geometry(&mut self, surface: SurfaceId, rect: Rect) -> RendererResult<()> {
        self.owned(surface)?;
        self.master.borrow_mut().set_geometry(surface, rect)
    }

    fn geometry(&self, surface: SurfaceId) -> Option<Rect> {
        self.owns(surface).then(|| self.master.borrow().geometry(surface))?
    }

    fn set_opacity(&mut self, surface: SurfaceId, opacity: f32) -> RendererResult<()> {
        self.owned(surface)?;
        self.master.borrow_mut().set_opacity(surface, opacity)
    }

    fn opacity(&self, surface: SurfaceId) -> Option<f32> {
        self.owns(surface).then(|| self.master.borrow().opacity(surface))?
    }

    fn set_zorder(&mut self, surface: SurfaceId, zorder: f32) -> RendererResult<()> {
        self.owned(surface)?;
        self.master.borrow_mut().set_zorder(surface, zorder)
    }

    fn zorder(&self, surface: SurfaceId) -> Option<f32> {
        self.owns(surface).then(|| self.master.borrow().zorder(surface))?
    }

    /// This host's surfaces, in the master's draw order.
    fn surfaces(&self) -> Vec<SurfaceId> {
        self.master
            .borrow()
            .surfaces()
            .into_iter()
            .filter(|s| self.owns(*s))
            .collect()
    }
}

impl<B: RenderBackend> Drop for VirtualEmbedded<B> {
    fn drop(&mut self) {
        self.terminate();
        if Rc::strong_count(&self.master) == 1 {
            info!("Last handle to {} detached, terminating", self.name);
            self.master.borrow_mut().terminate();
        }
    }
}
