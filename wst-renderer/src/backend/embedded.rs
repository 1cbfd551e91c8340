//! Embedded composition with fast-path delegation.
//!
//! The embedded backend composes into a target owned by a host application.
//! When the host asks for the fast path and a delegate backend is configured,
//! every surface is handed to the delegate (typically an overlay backend) and
//! the host only receives the rectangles it must punch through its own
//! scene. Surfaces keep their local ids in both modes; the delegate
//! counterpart is an implementation detail.
//!
//! Entering the fast path is all-or-nothing. If the delegate cannot take
//! over every surface, including its current content, the counterparts made
//! so far are destroyed and the frame is composed directly.

use glam::Mat4;
use tracing::{debug, info, warn};
use wst_buffer_manager::ResourceId;

use super::ensure_live;
use super::gpu::GpuBackend;
use crate::contract::{FormatQuery, FrameParams, RenderBackend, RenderHints};
use crate::device::{FrameTarget, GraphicsDevice};
use crate::error::{CommitError, InitError, RendererError, RendererResult};
use crate::math::Rect;
use crate::registry::BackendInit;
use crate::resources::{GpuResource, OffscreenId, TextureId};
use crate::surface::{RenderSurface, SurfaceId};

/// Outcome of one [`EmbeddedBackend::compose_embedded`] call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComposeResult {
    /// The host must make `rects` transparent so planes show through.
    pub needs_hole_punch: bool,
    pub rects: Vec<Rect>,
    /// Texture holding the composition when drawn off-screen.
    pub offscreen: Option<TextureId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Direct,
    Delegated,
}

#[derive(Debug, Clone, Copy)]
struct Offscreen {
    id: OffscreenId,
    texture: TextureId,
    width: u32,
    height: u32,
}

pub struct EmbeddedBackend<D: GraphicsDevice> {
    gpu: GpuBackend<D>,
    delegate: Option<Box<dyn RenderBackend>>,
    mode: Mode,
    offscreen: Option<Offscreen>,
    last_compose: ComposeResult,
}

impl<D: GraphicsDevice> EmbeddedBackend<D> {
    /// A delegate, when given, must support delegated scene updates.
    pub fn new(
        name: impl Into<String>,
        device: D,
        init: &BackendInit,
        mut delegate: Option<Box<dyn RenderBackend>>,
    ) -> Result<Self, InitError> {
        if let Some(backend) = delegate.as_mut() {
            if backend.delegation().is_none() {
                return Err(InitError::MissingDelegateHook(backend.name().to_string()));
            }
        }
        let gpu = GpuBackend::new(name, device, init)?;
        if let Some(backend) = &delegate {
            info!("{}: fast path delegates to {}", gpu.name(), backend.name());
        }
        Ok(Self {
            gpu,
            delegate,
            mode: Mode::Direct,
            offscreen: None,
            last_compose: ComposeResult::default(),
        })
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn gpu(&self) -> &GpuBackend<D> {
        &self.gpu
    }

    pub fn delegate(&self) -> Option<&dyn RenderBackend> {
        self.delegate.as_deref()
    }

    /// Result of the most recent composition.
    pub fn last_compose(&self) -> &ComposeResult {
        &self.last_compose
    }

    /// Delegate counterpart of a local surface, if currently delegated.
    pub fn counterpart(&self, surface: SurfaceId) -> Option<SurfaceId> {
        self.gpu.surface_list().get(surface).and_then(|s| s.delegate())
    }

    fn counterpart_or_err(&self, surface: SurfaceId) -> RendererResult<Option<SurfaceId>> {
        self.gpu
            .surface_list()
            .get(surface)
            .map(|s| s.delegate())
            .ok_or(RendererError::UnknownSurface(surface))
    }

    /// Forwarding target for `surface`: the delegate and its counterpart, or
    /// `None` when the surface is handled locally.
    fn forward(&mut self, surface: SurfaceId) -> RendererResult<Option<(&mut Box<dyn RenderBackend>, SurfaceId)>> {
        let counterpart = self.counterpart_or_err(surface)?;
        Ok(match (counterpart, self.delegate.as_mut()) {
            (Some(counterpart), Some(delegate)) => Some((delegate, counterpart)),
            _ => None,
        })
    }

    fn sync_mode(&mut self, hints: RenderHints) -> RendererResult<()> {
        let wanted = if hints.contains(RenderHints::FAST_PATH) && self.delegate.is_some() {
            Mode::Delegated
        } else {
            Mode::Direct
        };
        match (self.mode, wanted) {
            (Mode::Direct, Mode::Delegated) => {
                if let Err(e) = self.enter_delegated() {
                    warn!("{}: fast path refused, composing directly: {}", self.gpu.name(), e);
                }
                Ok(())
            }
            (Mode::Delegated, Mode::Direct) => self.leave_delegated(),
            _ => Ok(()),
        }
    }

    /// Replays every surface on the delegate, then drops the local content.
    /// Nothing changes locally unless every surface was taken over.
    fn enter_delegated(&mut self) -> RendererResult<()> {
        let Some(delegate) = self.delegate.as_deref_mut() else {
            return Ok(());
        };
        let mut handed = Vec::new();
        for surface in self.gpu.surface_list().iter() {
            match hand_over(delegate, surface) {
                Ok(counterpart) => handed.push((surface.id(), counterpart)),
                Err(e) => {
                    for (_, counterpart) in handed {
                        discard_counterpart(delegate, counterpart);
                    }
                    return Err(e);
                }
            }
        }

        for (id, counterpart) in handed {
            self.gpu.flush_content(id);
            if let Some(surface) = self.gpu.surface_list_mut().get_mut(id) {
                surface.delegate = Some(counterpart);
            }
        }
        self.mode = Mode::Delegated;
        info!("{}: entered fast path ({} surfaces)", self.gpu.name(), self.gpu.surface_list().len());
        Ok(())
    }

    /// Reads state back from the delegate and re-imports content locally.
    fn leave_delegated(&mut self) -> RendererResult<()> {
        for id in self.gpu.surface_list().ids() {
            let Some(counterpart) = self
                .gpu
                .surface_list_mut()
                .get_mut(id)
                .and_then(|s| s.delegate.take())
            else {
                continue;
            };
            let Some(delegate) = self.delegate.as_deref_mut() else {
                continue;
            };
            let geometry = delegate.geometry(counterpart);
            let opacity = delegate.opacity(counterpart);
            let zorder = delegate.zorder(counterpart);
            let visible = delegate.visible(counterpart);
            if let Err(e) = delegate.surface_destroy(counterpart) {
                warn!("Failed to destroy delegate surface {}: {}", counterpart, e);
            }

            let surfaces = self.gpu.surface_list_mut();
            let Some(surface) = surfaces.get_mut(id) else {
                continue;
            };
            if let Some(geometry) = geometry {
                surface.restore_geometry(geometry);
            }
            if let Some(opacity) = opacity {
                surface.set_opacity(opacity);
            }
            if let Some(visible) = visible {
                surface.set_visible(visible);
            }
            let last_resource = surface.last_resource();
            if let Some(zorder) = zorder {
                surfaces.set_zorder(id, zorder);
            }
            if let Some(resource) = last_resource {
                // Failure is already logged; the surface stays empty.
                let _ = self.gpu.import_commit(id, Some(resource));
            }
        }
        self.mode = Mode::Direct;
        info!("{}: left fast path", self.gpu.name());
        Ok(())
    }

    fn ensure_offscreen(&mut self, width: u32, height: u32) -> RendererResult<Offscreen> {
        if let Some(offscreen) = self.offscreen.filter(|o| (o.width, o.height) == (width, height)) {
            return Ok(offscreen);
        }
        if let Some(old) = self.offscreen.take() {
            self.gpu.defer_release(GpuResource::Offscreen(old.id));
        }
        let (id, texture) = self.gpu.device_mut().create_offscreen(width, height)?;
        debug!("Created {} ({}x{}) for embedded composition", id, width, height);
        let offscreen = Offscreen {
            id,
            texture,
            width,
            height,
        };
        self.offscreen = Some(offscreen);
        Ok(offscreen)
    }

    /// Composes into the host's bound target at `target`, or, with
    /// [`RenderHints::FBO_TARGET`], into an off-screen target whose texture
    /// is handed back. With [`RenderHints::FAST_PATH`] and a delegate, the
    /// delegate presents instead and hole-punch rectangles are returned.
    pub fn compose_embedded(
        &mut self,
        target: Rect,
        matrix: Mat4,
        alpha: f32,
        hints: RenderHints,
    ) -> RendererResult<ComposeResult> {
        ensure_live(self.gpu.is_terminated())?;
        let width = target.width.max(0) as u32;
        let height = target.height.max(0) as u32;
        let frame = FrameParams::new(width, height)
            .with_matrix(matrix)
            .with_alpha(alpha)
            .with_hints(hints);
        self.sync_mode(hints)?;

        let result = match self.mode {
            Mode::Delegated => self.delegated_update(&frame)?,
            Mode::Direct => {
                self.gpu.release_dead();
                let clear = !hints.contains(RenderHints::NO_CLEAR);
                if hints.contains(RenderHints::FBO_TARGET) {
                    let offscreen = self.ensure_offscreen(width, height)?;
                    let frame_target = FrameTarget {
                        x: 0,
                        y: 0,
                        width,
                        height,
                        clear,
                        offscreen: Some(offscreen.id),
                    };
                    self.gpu.draw_frame(&frame, frame_target, false)?;
                    ComposeResult {
                        offscreen: Some(offscreen.texture),
                        ..ComposeResult::default()
                    }
                } else {
                    let frame_target = FrameTarget {
                        x: target.x,
                        y: target.y,
                        width,
                        height,
                        clear,
                        offscreen: None,
                    };
                    self.gpu.draw_frame(&frame, frame_target, false)?;
                    ComposeResult::default()
                }
            }
        };
        self.last_compose = result.clone();
        Ok(result)
    }

    fn delegated_update(&mut self, frame: &FrameParams) -> RendererResult<ComposeResult> {
        // Local handles freed by the switch still need releasing.
        self.gpu.release_dead();
        let name = self.gpu.name().to_string();
        let scene = self
            .delegate
            .as_deref_mut()
            .and_then(|d| d.delegation())
            .ok_or(InitError::MissingDelegateHook(name))?;
        let mut rects = Vec::new();
        let needs_hole_punch = scene.delegate_update_scene(frame, &mut rects)?;
        Ok(ComposeResult {
            needs_hole_punch,
            rects,
            offscreen: None,
        })
    }
}

/// Creates the delegate counterpart of `surface` with its properties and
/// current content. On failure the counterpart is gone again.
fn hand_over(delegate: &mut dyn RenderBackend, surface: &RenderSurface) -> RendererResult<SurfaceId> {
    let counterpart = delegate.surface_create()?;
    let replayed = replay(delegate, counterpart, surface);
    if let Err(e) = replayed {
        discard_counterpart(delegate, counterpart);
        return Err(e);
    }
    Ok(counterpart)
}

fn replay(delegate: &mut dyn RenderBackend, counterpart: SurfaceId, surface: &RenderSurface) -> RendererResult<()> {
    if surface.size_override() {
        delegate.set_geometry(counterpart, surface.geometry())?;
    }
    delegate.set_opacity(counterpart, surface.opacity())?;
    delegate.set_zorder(counterpart, surface.zorder())?;
    delegate.set_visible(counterpart, surface.visible())?;
    if let Some(resource) = surface.last_resource() {
        delegate.surface_commit(counterpart, Some(resource))?;
    }
    Ok(())
}

fn discard_counterpart(delegate: &mut dyn RenderBackend, counterpart: SurfaceId) {
    if let Err(e) = delegate.surface_destroy(counterpart) {
        warn!("Failed to destroy delegate surface {}: {}", counterpart, e);
    }
}

impl<D: GraphicsDevice> RenderBackend for EmbeddedBackend<D> {
    fn name(&self) -> &str {
        self.gpu.name()
    }

    fn output_size(&self) -> (u32, u32) {
        self.gpu.output_size()
    }

    fn terminate(&mut self) {
        if self.gpu.is_terminated() {
            return;
        }
        if let Some(delegate) = self.delegate.as_deref_mut() {
            delegate.terminate();
        }
        if let Some(offscreen) = self.offscreen.take() {
            self.gpu.defer_release(GpuResource::Offscreen(offscreen.id));
        }
        self.mode = Mode::Direct;
        self.gpu.terminate();
    }

    fn is_terminated(&self) -> bool {
        self.gpu.is_terminated()
    }

    fn update_scene(&mut self, frame: &FrameParams) -> RendererResult<()> {
        ensure_live(self.gpu.is_terminated())?;
        self.sync_mode(frame.hints)?;
        match self.mode {
            Mode::Delegated => {
                self.last_compose = self.delegated_update(frame)?;
                Ok(())
            }
            Mode::Direct => self.gpu.update_scene(frame),
        }
    }

    fn surface_create(&mut self) -> RendererResult<SurfaceId> {
        let id = self.gpu.surface_create()?;
        if self.mode == Mode::Delegated {
            if let Some(delegate) = self.delegate.as_deref_mut() {
                let counterpart = match delegate.surface_create() {
                    Ok(counterpart) => counterpart,
                    Err(e) => {
                        self.gpu.surface_destroy(id)?;
                        return Err(e);
                    }
                };
                if let Some(surface) = self.gpu.surface_list_mut().get_mut(id) {
                    surface.delegate = Some(counterpart);
                }
            }
        }
        Ok(id)
    }

    fn surface_destroy(&mut self, surface: SurfaceId) -> RendererResult<()> {
        if let Some((delegate, counterpart)) = self.forward(surface)? {
            delegate.surface_destroy(counterpart)?;
        }
        self.gpu.surface_destroy(surface)
    }

    fn surface_commit(&mut self, surface: SurfaceId, resource: Option<ResourceId>) -> Result<(), CommitError> {
        let forward = self.forward(surface).map_err(|_| CommitError::UnknownSurface(surface))?;
        let Some((delegate, counterpart)) = forward else {
            return self.gpu.import_commit(surface, resource);
        };
        delegate
            .surface_commit(counterpart, resource)
            .map_err(|e| CommitError::Delegate(Box::new(e)))?;
        if let Some(local) = self.gpu.surface_list_mut().get_mut(surface) {
            local.last_resource = resource;
        }
        Ok(())
    }

    fn set_visible(&mut self, surface: SurfaceId, visible: bool) -> RendererResult<()> {
        match self.forward(surface)? {
            Some((delegate, counterpart)) => delegate.set_visible(counterpart, visible),
            None => self.gpu.set_visible(surface, visible),
        }
    }

    fn visible(&self, surface: SurfaceId) -> Option<bool> {
        match (self.counterpart(surface), self.delegate.as_deref()) {
            (Some(counterpart), Some(delegate)) => delegate.visible(counterpart),
            _ => self.gpu.visible(surface),
        }
    }

    fn set_geometry(&mut self, surface: SurfaceId, rect: Rect) -> RendererResult<()> {
        match self.forward(surface)? {
            Some((delegate, counterpart)) => {
                delegate.set_geometry(counterpart, rect)?;
                // Explicit geometry survives the trip back.
                if let Some(local) = self.gpu.surface_list_mut().get_mut(surface) {
                    local.mark_size_override();
                }
                Ok(())
            }
            None => self.gpu.set_geometry(surface, rect),
        }
    }

    fn geometry(&self, surface: SurfaceId) -> Option<Rect> {
        match (self.counterpart(surface), self.delegate.as_deref()) {
            (Some(counterpart), Some(delegate)) => delegate.geometry(counterpart),
            _ => self.gpu.geometry(surface),
        }
    }

    fn set_opacity(&mut self, surface: SurfaceId, opacity: f32) -> RendererResult<()> {
        match self.forward(surface)? {
            Some((delegate, counterpart)) => delegate.set_opacity(counterpart, opacity),
            None => self.gpu.set_opacity(surface, opacity),
        }
    }

    fn opacity(&self, surface: SurfaceId) -> Option<f32> {
        match (self.counterpart(surface), self.delegate.as_deref()) {
            (Some(counterpart), Some(delegate)) => delegate.opacity(counterpart),
            _ => self.gpu.opacity(surface),
        }
    }

    fn set_zorder(&mut self, surface: SurfaceId, zorder: f32) -> RendererResult<()> {
        match self.forward(surface)? {
            Some((delegate, counterpart)) => delegate.set_zorder(counterpart, zorder),
            None => self.gpu.set_zorder(surface, zorder),
        }
    }

    fn zorder(&self, surface: SurfaceId) -> Option<f32> {
        match (self.counterpart(surface), self.delegate.as_deref()) {
            (Some(counterpart), Some(delegate)) => delegate.zorder(counterpart),
            _ => self.gpu.zorder(surface),
        }
    }

    fn surfaces(&self) -> Vec<SurfaceId> {
        self.gpu.surfaces()
    }

    fn format_query(&self) -> Option<&dyn FormatQuery> {
        self.gpu.format_query()
    }
}

impl<D: GraphicsDevice> Drop for EmbeddedBackend<D> {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::overlay::{OverlayBackend, OverlayFlavor};
    use crate::backend::planes::VirtualPlanes;
    use crate::device::soft::SoftDevice;
    use glam::Vec3;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use wst_buffer_manager::{BufferManager, BufferSources, ShmFormat};

    struct Fixture {
        manager: Arc<BufferManager>,
        embedded: EmbeddedBackend<SoftDevice>,
    }

    fn fixture(with_delegate: bool) -> Fixture {
        fixture_on(with_delegate.then(VirtualPlanes::new))
    }

    fn fixture_on(planes: Option<VirtualPlanes>) -> Fixture {
        let manager = Arc::new(BufferManager::new());
        let init = BackendInit::new(32, 32, BufferSources::from_all(manager.clone()));
        let delegate: Option<Box<dyn RenderBackend>> = planes.map(|planes| {
            Box::new(OverlayBackend::new("overlay-colormatrix", OverlayFlavor::ColorMatrix, planes, &init).unwrap())
                as Box<dyn RenderBackend>
        });
        let embedded = EmbeddedBackend::new("embedded", SoftDevice::new(32, 32), &init, delegate).unwrap();
        Fixture { manager, embedded }
    }

    impl Fixture {
        fn shm(&self, size: u32, argb: u32) -> ResourceId {
            self.manager
                .register_shm(
                    size,
                    size,
                    size * 4,
                    ShmFormat::Argb8888,
                    argb.to_le_bytes().repeat((size * size) as usize),
                )
                .unwrap()
        }
    }

    fn scale2() -> Mat4 {
        Mat4::from_scale(Vec3::new(2.0, 2.0, 1.0))
    }

    #[test]
    fn test_direct_compose_draws_into_target_rect() {
        let mut fx = fixture(false);
        let id = fx.embedded.surface_create().unwrap();
        let buffer = fx.shm(4, 0xFF00_00FF);
        fx.embedded.surface_commit(id, Some(buffer)).unwrap();
        fx.embedded.set_geometry(id, Rect::new(8, 8, 4, 4)).unwrap();

        let result = fx
            .embedded
            .compose_embedded(Rect::new(0, 0, 32, 32), Mat4::IDENTITY, 1.0, RenderHints::empty())
            .unwrap();
        assert_eq!(result, ComposeResult::default());
        assert_eq!(fx.embedded.gpu().device().read_pixel(9, 9), Some([0, 0, 255, 255]));
        assert_eq!(fx.embedded.gpu().device().frames_presented(), 0, "The host presents.");
    }

    #[test]
    fn test_fbo_target_hands_back_texture() {
        let mut fx = fixture(false);
        let id = fx.embedded.surface_create().unwrap();
        fx.embedded.surface_commit(id, Some(fx.shm(4, 0xFFFF_0000))).unwrap();

        let result = fx
            .embedded
            .compose_embedded(Rect::new(0, 0, 16, 16), Mat4::IDENTITY, 1.0, RenderHints::FBO_TARGET)
            .unwrap();
        let texture = result.offscreen.expect("off-screen texture");
        let device = fx.embedded.gpu().device();
        assert_eq!(device.read_texture_pixel(texture, 1, 1), Some([255, 0, 0, 255]));
        assert_eq!(device.read_pixel(1, 1), Some([0, 0, 0, 0]));

        // A new size replaces the target; the old one is released next frame.
        let resized = fx
            .embedded
            .compose_embedded(Rect::new(0, 0, 8, 8), Mat4::IDENTITY, 1.0, RenderHints::FBO_TARGET)
            .unwrap();
        assert_ne!(resized.offscreen, Some(texture));
        assert_eq!(fx.embedded.gpu().dead_queue().len(), 1);
    }

    #[test]
    fn test_fast_path_returns_hole_punch_rects() {
        let mut fx = fixture(true);
        let id = fx.embedded.surface_create().unwrap();
        fx.embedded.surface_commit(id, Some(fx.shm(4, 0xFFFF_FFFF))).unwrap();
        fx.embedded.set_geometry(id, Rect::new(10, 10, 100, 100)).unwrap();

        let result = fx
            .embedded
            .compose_embedded(
                Rect::new(0, 0, 32, 32),
                scale2(),
                1.0,
                RenderHints::FAST_PATH | RenderHints::HOLE_PUNCH,
            )
            .unwrap();
        assert!(result.needs_hole_punch);
        assert_eq!(result.rects, vec![Rect::new(20, 20, 200, 200)]);
        assert_eq!(fx.embedded.mode(), Mode::Delegated);
        assert_eq!(fx.embedded.last_compose(), &result);
        assert!(fx.embedded.gpu().device().draw_log().is_empty());
    }

    #[test]
    fn test_delegation_round_trip_restores_state() {
        let mut fx = fixture(true);
        let id = fx.embedded.surface_create().unwrap();
        let buffer = fx.shm(4, 0xFFFF_FFFF);
        fx.embedded.surface_commit(id, Some(buffer)).unwrap();
        fx.embedded.set_geometry(id, Rect::new(1, 2, 3, 4)).unwrap();
        fx.embedded.set_opacity(id, 0.25).unwrap();
        fx.embedded.set_zorder(id, 0.75).unwrap();

        fx.embedded
            .update_scene(&FrameParams::new(32, 32).with_hints(RenderHints::FAST_PATH))
            .unwrap();
        let counterpart = fx.embedded.counterpart(id).expect("delegated");
        assert_eq!(fx.embedded.delegate().unwrap().geometry(counterpart), Some(Rect::new(1, 2, 3, 4)));

        // Mutations while delegated go to the counterpart.
        fx.embedded.set_geometry(id, Rect::new(5, 6, 7, 8)).unwrap();
        fx.embedded.set_opacity(id, 0.5).unwrap();
        fx.embedded.set_zorder(id, 0.1).unwrap();
        assert_eq!(fx.embedded.geometry(id), Some(Rect::new(5, 6, 7, 8)));

        fx.embedded.update_scene(&FrameParams::new(32, 32)).unwrap();
        assert_eq!(fx.embedded.mode(), Mode::Direct);
        assert_eq!(fx.embedded.counterpart(id), None);
        assert!(fx.embedded.delegate().unwrap().surfaces().is_empty());
        assert_eq!(fx.embedded.geometry(id), Some(Rect::new(5, 6, 7, 8)));
        assert_eq!(fx.embedded.opacity(id), Some(0.5));
        assert_eq!(fx.embedded.zorder(id), Some(0.1));
        let local = fx.embedded.gpu().surface_list().get(id).unwrap();
        assert!(local.size_override());
        assert_eq!(local.last_resource(), Some(buffer));
        assert!(!matches!(local.buffer(), crate::import::BufferState::Empty));
    }

    #[test]
    fn test_delegated_commit_is_remembered_locally() {
        let mut fx = fixture(true);
        let id = fx.embedded.surface_create().unwrap();
        fx.embedded
            .update_scene(&FrameParams::new(32, 32).with_hints(RenderHints::FAST_PATH))
            .unwrap();
        let buffer = fx.shm(4, 0xFFFF_FFFF);
        fx.embedded.surface_commit(id, Some(buffer)).unwrap();
        let local = fx.embedded.gpu().surface_list().get(id).unwrap();
        assert_eq!(local.last_resource(), Some(buffer));
        assert!(matches!(local.buffer(), crate::import::BufferState::Empty));

        // Surfaces created while delegated get a counterpart straight away.
        let late = fx.embedded.surface_create().unwrap();
        assert!(fx.embedded.counterpart(late).is_some());
        fx.embedded.surface_destroy(late).unwrap();
        assert_eq!(fx.embedded.delegate().unwrap().surfaces().len(), 1);
    }

    #[test]
    fn test_delegate_out_of_layers_keeps_surfaces_local() {
        let mut fx = fixture_on(Some(VirtualPlanes::with_layer_limit(1)));
        let first = fx.embedded.surface_create().unwrap();
        let second = fx.embedded.surface_create().unwrap();
        fx.embedded.surface_commit(first, Some(fx.shm(4, 0xFFFF_0000))).unwrap();
        fx.embedded.surface_commit(second, Some(fx.shm(4, 0xFF00_FF00))).unwrap();
        fx.embedded.set_geometry(second, Rect::new(8, 8, 4, 4)).unwrap();

        let result = fx
            .embedded
            .compose_embedded(
                Rect::new(0, 0, 32, 32),
                Mat4::IDENTITY,
                1.0,
                RenderHints::FAST_PATH | RenderHints::HOLE_PUNCH,
            )
            .unwrap();
        assert_eq!(result, ComposeResult::default());
        assert_eq!(fx.embedded.mode(), Mode::Direct);
        assert_eq!(fx.embedded.counterpart(first), None);
        assert_eq!(fx.embedded.counterpart(second), None);
        assert!(fx.embedded.delegate().unwrap().surfaces().is_empty());

        // Both surfaces were drawn locally and keep taking local updates.
        assert_eq!(fx.embedded.gpu().device().draw_log().len(), 2);
        assert_eq!(fx.embedded.gpu().device().read_pixel(1, 1), Some([255, 0, 0, 255]));
        assert_eq!(fx.embedded.gpu().device().read_pixel(9, 9), Some([0, 255, 0, 255]));
        fx.embedded.set_opacity(first, 0.3).unwrap();
        assert_eq!(fx.embedded.gpu().opacity(first), Some(0.3));
        let local = fx.embedded.gpu().surface_list().get(first).unwrap();
        assert!(!matches!(local.buffer(), crate::import::BufferState::Empty));
    }

    #[test]
    fn test_failed_late_counterpart_drops_the_surface() {
        let mut fx = fixture_on(Some(VirtualPlanes::with_layer_limit(1)));
        let first = fx.embedded.surface_create().unwrap();
        fx.embedded
            .update_scene(&FrameParams::new(32, 32).with_hints(RenderHints::FAST_PATH))
            .unwrap();
        assert_eq!(fx.embedded.mode(), Mode::Delegated);

        assert!(fx.embedded.surface_create().is_err());
        assert_eq!(fx.embedded.surfaces(), vec![first]);
    }

    #[test]
    fn test_fast_path_without_delegate_stays_direct() {
        let mut fx = fixture(false);
        let id = fx.embedded.surface_create().unwrap();
        fx.embedded.surface_commit(id, Some(fx.shm(4, 0xFFFF_FFFF))).unwrap();
        let result = fx
            .embedded
            .compose_embedded(Rect::new(0, 0, 32, 32), Mat4::IDENTITY, 1.0, RenderHints::FAST_PATH)
            .unwrap();
        assert!(!result.needs_hole_punch);
        assert_eq!(fx.embedded.mode(), Mode::Direct);
        assert_eq!(fx.embedded.gpu().device().draw_log().len(), 1);
    }

    #[test]
    fn test_gpu_only_delegate_is_rejected() {
        let init = BackendInit::new(8, 8, BufferSources::default());
        let gpu = GpuBackend::new("soft", SoftDevice::new(8, 8), &init).unwrap();
        let result = EmbeddedBackend::new("embedded", SoftDevice::new(8, 8), &init, Some(Box::new(gpu) as Box<dyn RenderBackend>));
        assert!(matches!(result, Err(InitError::MissingDelegateHook(name)) if name == "soft"));
    }
}
