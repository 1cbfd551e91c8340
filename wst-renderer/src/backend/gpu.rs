//! GPU compositing backend.
//!
//! Each frame drains the deferred-release queue, uploads dirty CPU content,
//! then draws every drawable surface back to front as one textured quad
//! whose corners are the surface geometry under the frame matrix.

use drm_fourcc::{DrmFourcc, DrmModifier};
use tracing::{debug, info, warn};
use wst_buffer_manager::{BufferSources, NativeHandle, ResourceId};

use super::ensure_live;
use crate::contract::{FormatQuery, FrameParams, RenderBackend, RenderHints};
use crate::device::{DeviceCaps, DrawQuad, FrameTarget, GraphicsDevice};
use crate::error::{CommitError, DeviceError, InitError, RendererError, RendererResult};
use crate::fps::FpsCounter;
use crate::format::UploadLayout;
use crate::import::{BufferState, Importer, PlanarImportPath};
use crate::math::transform_corners;
use crate::registry::BackendInit;
use crate::resources::{DeadResourceQueue, GpuResource};
use crate::surface::{SurfaceId, SurfaceList};

pub struct GpuBackend<D: GraphicsDevice> {
    name: String,
    device: D,
    sources: BufferSources,
    surfaces: SurfaceList,
    dead: DeadResourceQueue,
    output: (u32, u32),
    display: Option<NativeHandle>,
    planar: PlanarImportPath,
    layout: UploadLayout,
    fps: FpsCounter,
    terminated: bool,
}

impl<D: GraphicsDevice> GpuBackend<D> {
    /// Creates a GPU backend compositing on `device`.
    ///
    /// The planar import path and the CPU upload layout are chosen once,
    /// from the device capabilities.
    ///
    /// # Arguments
    /// * `name`: Name reported by [`RenderBackend::name`] and used in logs.
    /// * `device`: Graphics device whose context is current on this thread.
    /// * `init`: Output size, display, buffer adapters and configuration.
    ///
    /// # Errors
    /// `InitError::InvalidOutput` for a zero-sized output.
    pub fn new(name: impl Into<String>, device: D, init: &BackendInit) -> Result<Self, InitError> {
        init.validate_output()?;
        let name = name.into();
        let caps = device.capabilities();
        let planar = PlanarImportPath::for_caps(caps);
        let layout = UploadLayout::choose(caps.contains(DeviceCaps::BGRA_UPLOAD));
        info!(
            "Initialised {} backend {}x{} (caps {:?}, planar {:?}, upload {:?})",
            name, init.output_width, init.output_height, caps, planar, layout
        );
        Ok(Self {
            name,
            device,
            sources: init.sources.clone(),
            surfaces: SurfaceList::new(),
            dead: DeadResourceQueue::new(),
            output: (init.output_width, init.output_height),
            display: init.display,
            planar,
            layout,
            fps: FpsCounter::new("gl", init.config.gl_fps),
            terminated: false,
        })
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn dead_queue(&self) -> &DeadResourceQueue {
        &self.dead
    }

    pub fn planar_path(&self) -> PlanarImportPath {
        self.planar
    }

    pub fn upload_layout(&self) -> UploadLayout {
        self.layout
    }

    /// Display bound at construction, until terminated.
    pub fn display(&self) -> Option<NativeHandle> {
        self.display
    }

    pub fn surface_list(&self) -> &SurfaceList {
        &self.surfaces
    }

    pub(crate) fn surface_list_mut(&mut self) -> &mut SurfaceList {
        &mut self.surfaces
    }

    /// Schedules a handle for release at the start of the next frame.
    pub(crate) fn defer_release(&mut self, resource: GpuResource) {
        self.dead.push(resource);
    }

    /// Drops a surface's content into the deferred-release queue, keeping
    /// its remembered resource.
    pub(crate) fn flush_content(&mut self, id: SurfaceId) {
        if let Some(surface) = self.surfaces.get_mut(id) {
            std::mem::take(&mut surface.buffer).release_into(&mut self.dead);
        }
    }

    pub(crate) fn release_dead(&mut self) {
        let device = &mut self.device;
        self.dead.drain(|resource| {
            if let Err(e) = device.release(resource) {
                warn!("Failed to release {}: {}", resource, e);
            }
        });
    }

    /// Runs the import state machine for one commit.
    pub(crate) fn import_commit(&mut self, id: SurfaceId, resource: Option<ResourceId>) -> Result<(), CommitError> {
        let surface = self.surfaces.get_mut(id).ok_or(CommitError::UnknownSurface(id))?;
        let result = Importer {
            device: &mut self.device,
            sources: &self.sources,
            layout: self.layout,
            planar: self.planar,
            dead: &mut self.dead,
        }
        .commit(surface, resource);
        if let Err(e) = &result {
            warn!("Commit to {} failed: {}", id, e);
        }
        result
    }

    fn upload_dirty(&mut self) -> Result<(), DeviceError> {
        for surface in self.surfaces.iter_mut() {
            let BufferState::Cpu(cpu) = &mut surface.buffer else {
                continue;
            };
            if !cpu.dirty {
                continue;
            }
            let texture = match cpu.texture {
                Some(texture) => texture,
                None => {
                    let texture = self.device.create_texture(cpu.pixels.width, cpu.pixels.height)?;
                    cpu.texture = Some(texture);
                    texture
                }
            };
            self.device.update_texture(texture, &cpu.pixels)?;
            cpu.dirty = false;
        }
        Ok(())
    }

    /// Draws one frame into `target`. The deferred-release queue is drained
    /// before anything is allocated for this frame.
    pub fn render(&mut self, frame: &FrameParams, target: FrameTarget, present: bool) -> RendererResult<()> {
        ensure_live(self.terminated)?;
        self.release_dead();
        self.draw_frame(frame, target, present)
    }

    /// [`GpuBackend::render`] for callers that drained the queue themselves.
    pub(crate) fn draw_frame(&mut self, frame: &FrameParams, target: FrameTarget, present: bool) -> RendererResult<()> {
        ensure_live(self.terminated)?;
        self.upload_dirty()?;

        self.device.begin_frame(target)?;
        let mut drawn = 0;
        for surface in self.surfaces.iter().filter(|s| s.is_drawable()) {
            let opacity = surface.opacity() * frame.alpha;
            if opacity <= 0.0 {
                continue;
            }
            let Some(source) = surface.buffer().draw_source() else {
                continue;
            };
            let quad = DrawQuad {
                corners: transform_corners(surface.geometry().corners(), &frame.matrix),
                source,
                opacity,
            };
            if let Err(e) = self.device.draw(&quad) {
                // Keep the frame balanced before reporting.
                let _ = self.device.end_frame(false);
                return Err(e.into());
            }
            drawn += 1;
        }
        self.device.end_frame(present)?;
        debug!("{}: drew {} surfaces", self.name, drawn);
        if present {
            self.fps.tick();
        }
        Ok(())
    }
}

impl<D: GraphicsDevice> RenderBackend for GpuBackend<D> {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_size(&self) -> (u32, u32) {
        self.output
    }

    fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        for surface in self.surfaces.drain() {
            surface.buffer.release_into(&mut self.dead);
        }
        self.release_dead();
        if let Some(bound) = self.display.take() {
            debug!("{}: unbinding display {:?}", self.name, bound);
        }
        self.terminated = true;
        info!("{} backend terminated", self.name);
    }

    fn is_terminated(&self) -> bool {
        self.terminated
    }

    fn update_scene(&mut self, frame: &FrameParams) -> RendererResult<()> {
        let mut target = FrameTarget::output(frame.output_width, frame.output_height);
        target.clear = !frame.hints.contains(RenderHints::NO_CLEAR);
        self.render(frame, target, true)
    }

    fn surface_create(&mut self) -> RendererResult<SurfaceId> {
        ensure_live(self.terminated)?;
        Ok(self.surfaces.create())
    }

    fn surface_destroy(&mut self, surface: SurfaceId) -> RendererResult<()> {
        let removed = self
            .surfaces
            .remove(surface)
            .ok_or(RendererError::UnknownSurface(surface))?;
        removed.buffer.release_into(&mut self.dead);
        Ok(())
    }

    fn surface_commit(&mut self, surface: SurfaceId, resource: Option<ResourceId>) -> Result<(), CommitError> {
        self.import_commit(surface, resource)
    }

    local_surface_properties!();

    fn format_query(&self) -> Option<&dyn FormatQuery> {
        if self.device.capabilities().contains(DeviceCaps::DMABUF_IMPORT) {
            Some(self)
        } else {
            None
        }
    }
}

impl<D: GraphicsDevice> FormatQuery for GpuBackend<D> {
    fn dmabuf_formats(&self) -> Vec<DrmFourcc> {
        self.device.dmabuf_formats()
    }

    fn dmabuf_modifiers(&self, format: DrmFourcc) -> Vec<DrmModifier> {
        self.device.dmabuf_modifiers(format)
    }
}

impl<D: GraphicsDevice> Drop for GpuBackend<D> {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::soft::SoftDevice;
    use std::sync::Arc;
    use wst_buffer_manager::{BufferManager, ShmFormat};

    fn backend() -> (GpuBackend<SoftDevice>, Arc<BufferManager>) {
        let manager = Arc::new(BufferManager::new());
        let init = BackendInit::new(16, 16, BufferSources::from_all(manager.clone()));
        (GpuBackend::new("soft", SoftDevice::new(16, 16), &init).unwrap(), manager)
    }

    fn solid(manager: &BufferManager, size: u32, argb: u32) -> ResourceId {
        let data = argb.to_le_bytes().repeat((size * size) as usize);
        manager
            .register_shm(size, size, size * 4, ShmFormat::Argb8888, data)
            .unwrap()
    }

    #[test]
    fn test_frame_draws_surfaces_in_zorder() {
        let (mut gpu, manager) = backend();
        let top = gpu.surface_create().unwrap();
        let bottom = gpu.surface_create().unwrap();
        gpu.set_zorder(top, 0.9).unwrap();
        gpu.surface_commit(top, Some(solid(&manager, 4, 0xFF00_FF00))).unwrap();
        gpu.surface_commit(bottom, Some(solid(&manager, 8, 0xFFFF_0000))).unwrap();

        gpu.update_scene(&FrameParams::new(16, 16)).unwrap();
        assert_eq!(gpu.device().read_pixel(1, 1), Some([0, 255, 0, 255]));
        assert_eq!(gpu.device().read_pixel(6, 6), Some([255, 0, 0, 255]));
        assert_eq!(gpu.device().frames_presented(), 1);
    }

    #[test]
    fn test_invisible_and_transparent_surfaces_are_skipped() {
        let (mut gpu, manager) = backend();
        let hidden = gpu.surface_create().unwrap();
        let faded = gpu.surface_create().unwrap();
        gpu.surface_commit(hidden, Some(solid(&manager, 4, 0xFFFF_FFFF))).unwrap();
        gpu.surface_commit(faded, Some(solid(&manager, 4, 0xFFFF_FFFF))).unwrap();
        gpu.set_visible(hidden, false).unwrap();
        gpu.set_opacity(faded, 0.0).unwrap();

        gpu.update_scene(&FrameParams::new(16, 16)).unwrap();
        assert!(gpu.device().draw_log().is_empty());
    }

    #[test]
    fn test_frame_alpha_scales_opacity() {
        let (mut gpu, manager) = backend();
        let id = gpu.surface_create().unwrap();
        gpu.surface_commit(id, Some(solid(&manager, 2, 0xFFFF_FFFF))).unwrap();
        gpu.set_opacity(id, 0.5).unwrap();
        gpu.update_scene(&FrameParams::new(16, 16).with_alpha(0.5)).unwrap();
        assert_eq!(gpu.device().draw_log()[0].opacity, 0.25);
    }

    #[test]
    fn test_destroy_releases_on_next_frame() {
        let (mut gpu, manager) = backend();
        let id = gpu.surface_create().unwrap();
        gpu.surface_commit(id, Some(solid(&manager, 4, 0xFFFF_FFFF))).unwrap();
        gpu.update_scene(&FrameParams::new(16, 16)).unwrap();
        assert_eq!(gpu.device().live_resources(), 1);

        gpu.surface_destroy(id).unwrap();
        assert_eq!(gpu.dead_queue().len(), 1);
        assert_eq!(gpu.device().live_resources(), 1, "Release waits for the next frame.");
        gpu.update_scene(&FrameParams::new(16, 16)).unwrap();
        assert_eq!(gpu.device().live_resources(), 0);
        assert!(matches!(
            gpu.surface_destroy(id),
            Err(RendererError::UnknownSurface(_))
        ));
    }

    #[test]
    fn test_terminate_releases_everything() {
        let (mut gpu, manager) = backend();
        for _ in 0..3 {
            let id = gpu.surface_create().unwrap();
            gpu.surface_commit(id, Some(solid(&manager, 4, 0xFFFF_FFFF))).unwrap();
        }
        gpu.update_scene(&FrameParams::new(16, 16)).unwrap();
        gpu.terminate();
        assert!(gpu.is_terminated());
        assert_eq!(gpu.device().live_resources(), 0);
        assert!(gpu.surfaces().is_empty());
        assert!(matches!(gpu.surface_create(), Err(RendererError::Terminated)));
        gpu.terminate();
    }

    #[test]
    fn test_format_query_follows_capability() {
        let (gpu, _) = backend();
        let query = gpu.format_query().expect("soft device imports dma-bufs");
        assert!(query.dmabuf_formats().contains(&DrmFourcc::Nv12));

        let init = BackendInit::new(4, 4, BufferSources::default());
        let plain = GpuBackend::new("soft", SoftDevice::with_caps(4, 4, DeviceCaps::BGRA_UPLOAD), &init).unwrap();
        assert!(plain.format_query().is_none());
    }
}
