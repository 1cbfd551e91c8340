//! Hardware overlay backends.
//!
//! Each surface owns one hardware layer and a ring of native buffers. CPU
//! content is copied into controller-allocated buffers; platform buffers,
//! legacy shared buffers and DMA-BUFs are wrapped without copying. Two
//! flavours exist: one blends through a per-layer colour matrix and paces
//! buffer recycling on displayed feedback, the other uses per-element alpha
//! and treats a commit as displayed.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, info, warn};
use wst_buffer_manager::{BufferSources, DmabufAttributes, NativeHandle, ResourceId};

use super::planes::{alpha_coefficient, layer_index, ColorMatrix, LayerConfig, PlaneController};
use super::{ensure_live, hole_punch_rects, shows_content};
use crate::contract::{DelegateScene, FrameParams, RenderBackend, RenderHints};
use crate::error::{CommitError, ImportError, InitError, PlaneError, RendererError, RendererResult};
use crate::fps::FpsCounter;
use crate::format::{CpuPixels, UploadLayout};
use crate::import::{classify, read_cpu_pixels, BufferFamily, BufferState};
use crate::math::Rect;
use crate::registry::BackendInit;
use crate::resources::{DeadResourceQueue, GpuResource, LayerId};
use crate::ring::{NativeRing, NativeSlot};
use crate::surface::{RenderSurface, SurfaceId, SurfaceList};

/// How a layer's opacity reaches the display controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayFlavor {
    /// Colour matrix per layer; buffer reuse waits for displayed feedback.
    ColorMatrix,
    /// Plain per-element alpha; a commit counts as displayed.
    ElementAlpha,
}

/// Content produced by a commit before it lands in a ring slot.
enum Staged {
    Pixels(CpuPixels),
    Native {
        handle: NativeHandle,
        width: u32,
        height: u32,
    },
    Dmabuf(DmabufAttributes),
}

impl Staged {
    fn size(&self) -> (u32, u32) {
        match self {
            Staged::Pixels(pixels) => (pixels.width, pixels.height),
            Staged::Native { width, height, .. } => (*width, *height),
            Staged::Dmabuf(attributes) => (attributes.width, attributes.height),
        }
    }
}

/// Controller access for writing one surface's ring.
struct SlotWriter<'a, P: PlaneController> {
    planes: &'a mut P,
    dead: &'a mut DeadResourceQueue,
    layer: LayerId,
    protected: bool,
    timeout: Duration,
}

impl<P: PlaneController> SlotWriter<'_, P> {
    /// Waits for the pushed slot to reach the screen, then promotes it. A
    /// timeout is logged and the slot promoted anyway so the ring cannot
    /// stall.
    fn settle_push(&mut self, ring: &mut NativeRing) -> Result<(), PlaneError> {
        if ring.pushed().is_none() {
            return Ok(());
        }
        if !self.planes.wait_displayed(self.layer, self.timeout)? {
            warn!(
                "No displayed feedback for {} within {:?}, recycling anyway",
                self.layer, self.timeout
            );
        }
        self.promote(ring);
        Ok(())
    }

    fn promote(&mut self, ring: &mut NativeRing) {
        if let Some(freed) = ring.mark_displayed() {
            self.dead.push(GpuResource::NativeBuffer(freed.buffer));
        }
    }

    fn write(&mut self, ring: &mut NativeRing, staged: Staged) -> Result<(), PlaneError> {
        let index = match ring.acquire_back() {
            Some(index) => index,
            None => {
                self.settle_push(ring)?;
                ring.acquire_back()
                    .ok_or_else(|| PlaneError::Hardware(format!("no free buffer for {}", self.layer)))?
            }
        };
        let (width, height) = staged.size();
        let slot = match staged {
            Staged::Pixels(pixels) => {
                let reusable = ring
                    .slot(index)
                    .filter(|s| !s.wrapped && (s.width, s.height) == (width, height));
                let buffer = match reusable {
                    Some(slot) => slot.buffer,
                    None => self.planes.allocate_buffer(width, height, self.protected)?,
                };
                if let Err(e) = self.planes.write_buffer(buffer, &pixels) {
                    if reusable.is_none() {
                        self.dead.push(GpuResource::NativeBuffer(buffer));
                    }
                    return Err(e);
                }
                NativeSlot {
                    buffer,
                    width,
                    height,
                    wrapped: false,
                }
            }
            Staged::Native { handle, .. } => NativeSlot {
                buffer: self.planes.wrap_native(handle, width, height)?,
                width,
                height,
                wrapped: true,
            },
            Staged::Dmabuf(attributes) => NativeSlot {
                buffer: self.planes.import_dmabuf(&attributes)?,
                width,
                height,
                wrapped: true,
            },
        };
        if let Some(old) = ring.replace(index, slot) {
            if old.buffer != slot.buffer {
                self.dead.push(GpuResource::NativeBuffer(old.buffer));
            }
        }
        ring.queue(index);
        Ok(())
    }
}

pub struct OverlayBackend<P: PlaneController> {
    name: String,
    flavor: OverlayFlavor,
    planes: P,
    sources: BufferSources,
    surfaces: SurfaceList,
    layers: HashMap<SurfaceId, LayerId>,
    dead: DeadResourceQueue,
    output: (u32, u32),
    display: Option<NativeHandle>,
    protected: bool,
    ring_depth: usize,
    displayed_timeout: Duration,
    fps: FpsCounter,
    terminated: bool,
}

impl<P: PlaneController> OverlayBackend<P> {
    /// Creates an overlay backend driving `planes`.
    ///
    /// With `secure_video` configured, the colour-matrix flavour allocates
    /// protected plane buffers; the element-alpha flavour never does.
    ///
    /// # Arguments
    /// * `name`: Name reported by [`RenderBackend::name`] and used in logs.
    /// * `flavor`: How layer opacity reaches the display controller.
    /// * `planes`: Display-controller access. One layer is created per surface.
    /// * `init`: Output size, display, buffer adapters and configuration,
    ///   including ring depth and the displayed-feedback timeout.
    ///
    /// # Errors
    /// `InitError::InvalidOutput` for a zero-sized output.
    pub fn new(name: impl Into<String>, flavor: OverlayFlavor, planes: P, init: &BackendInit) -> Result<Self, InitError> {
        init.validate_output()?;
        let name = name.into();
        let config = &init.config;
        // Only the colour-matrix controller can scan out protected memory.
        let protected = config.secure_video && flavor == OverlayFlavor::ColorMatrix;
        info!(
            "Initialised {} backend {}x{} ({:?}, {} buffers per layer, protected={})",
            name, init.output_width, init.output_height, flavor, config.overlay_buffers, protected
        );
        Ok(Self {
            name,
            flavor,
            planes,
            sources: init.sources.clone(),
            surfaces: SurfaceList::new(),
            layers: HashMap::new(),
            dead: DeadResourceQueue::new(),
            output: (init.output_width, init.output_height),
            display: init.display,
            protected,
            ring_depth: config.overlay_buffers,
            displayed_timeout: config.displayed_timeout(),
            fps: FpsCounter::new("overlay", config.overlay_fps),
            terminated: false,
        })
    }

    pub fn flavor(&self) -> OverlayFlavor {
        self.flavor
    }

    pub fn planes(&self) -> &P {
        &self.planes
    }

    pub fn planes_mut(&mut self) -> &mut P {
        &mut self.planes
    }

    pub fn layer_of(&self, surface: SurfaceId) -> Option<LayerId> {
        self.layers.get(&surface).copied()
    }

    pub fn dead_queue(&self) -> &DeadResourceQueue {
        &self.dead
    }

    pub fn display(&self) -> Option<NativeHandle> {
        self.display
    }

    fn release_dead(&mut self) {
        let planes = &mut self.planes;
        self.dead.drain(|resource| {
            let result = match resource {
                GpuResource::NativeBuffer(buffer) => planes.release_buffer(buffer),
                other => Err(PlaneError::Hardware(format!("{} is not a plane resource", other))),
            };
            if let Err(e) = result {
                warn!("Failed to release {}: {}", resource, e);
            }
        });
    }

    fn stage(&self, family: BufferFamily, resource: ResourceId) -> Result<Staged, ImportError> {
        match family {
            BufferFamily::Shm => {
                let shm = self
                    .sources
                    .shm
                    .as_ref()
                    .ok_or(ImportError::MissingCapability("shared-memory adapter"))?;
                // Plane buffers are always filled in BGRA order.
                let pixels = read_cpu_pixels(UploadLayout::choose(true), |f| shm.with_contents(resource, f))?;
                Ok(Staged::Pixels(pixels))
            }
            BufferFamily::Platform => {
                let source = self
                    .sources
                    .platform
                    .as_ref()
                    .ok_or(ImportError::MissingCapability("platform buffer adapter"))?;
                let info = source.platform_info(resource)?;
                Ok(Staged::Native {
                    handle: info.native,
                    width: info.width,
                    height: info.height,
                })
            }
            BufferFamily::Shared => {
                let source = self
                    .sources
                    .shared
                    .as_ref()
                    .ok_or(ImportError::MissingCapability("shared buffer adapter"))?;
                let info = source.shared_info(resource)?;
                Ok(Staged::Native {
                    handle: info.pixmap,
                    width: info.width,
                    height: info.height,
                })
            }
            BufferFamily::Dmabuf => {
                let source = self
                    .sources
                    .dmabuf
                    .as_ref()
                    .ok_or(ImportError::MissingCapability("dma-buf adapter"))?;
                Ok(Staged::Dmabuf(source.dmabuf_attributes(resource)?))
            }
        }
    }

    fn layer_config(&self, surface: &RenderSurface, frame: &FrameParams) -> LayerConfig {
        let opacity = surface.opacity() * frame.alpha;
        let (alpha, color_matrix) = match self.flavor {
            OverlayFlavor::ColorMatrix => (u8::MAX, Some(ColorMatrix::for_opacity(opacity))),
            OverlayFlavor::ElementAlpha => (alpha_coefficient(opacity), None),
        };
        LayerConfig {
            dest: surface.geometry().transformed(&frame.matrix),
            layer_index: layer_index(surface.zorder()),
            visible: shows_content(surface) && opacity > 0.0,
            alpha,
            color_matrix,
        }
    }

    fn present_frame(&mut self, frame: &FrameParams) -> Result<(), PlaneError> {
        let mut presented = 0;
        for surface in self.surfaces.iter() {
            let Some(&layer) = self.layers.get(&surface.id()) else {
                continue;
            };
            let config = self.layer_config(surface, frame);
            self.planes.configure_layer(layer, &config)?;
        }

        for surface in self.surfaces.iter_mut() {
            let Some(&layer) = self.layers.get(&surface.id()) else {
                continue;
            };
            let BufferState::Native(ring) = &mut surface.buffer else {
                continue;
            };
            if ring.pending().is_none() {
                continue;
            }
            let mut writer = SlotWriter {
                planes: &mut self.planes,
                dead: &mut self.dead,
                layer,
                protected: self.protected,
                timeout: self.displayed_timeout,
            };
            writer.settle_push(ring)?;
            if let Some(slot) = ring.take_pending_for_push() {
                self.planes.present(layer, slot.buffer)?;
                presented += 1;
            }
        }

        self.planes.commit()?;

        for surface in self.surfaces.iter_mut() {
            let Some(&layer) = self.layers.get(&surface.id()) else {
                continue;
            };
            let BufferState::Native(ring) = &mut surface.buffer else {
                continue;
            };
            if ring.pushed().is_none() {
                continue;
            }
            let displayed = match self.flavor {
                OverlayFlavor::ElementAlpha => true,
                OverlayFlavor::ColorMatrix => self.planes.wait_displayed(layer, Duration::ZERO)?,
            };
            if displayed {
                if let Some(freed) = ring.mark_displayed() {
                    self.dead.push(GpuResource::NativeBuffer(freed.buffer));
                }
            }
        }
        debug!("{}: presented {} layers", self.name, presented);
        Ok(())
    }
}

impl<P: PlaneController> RenderBackend for OverlayBackend<P> {
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
            if let Some(layer) = self.layers.remove(&surface.id()) {
                if let Err(e) = self.planes.destroy_layer(layer) {
                    warn!("Failed to destroy {}: {}", layer, e);
                }
            }
            surface.buffer.release_into(&mut self.dead);
        }
        self.release_dead();
        self.display = None;
        self.terminated = true;
        info!("{} backend terminated", self.name);
    }

    fn is_terminated(&self) -> bool {
        self.terminated
    }

    fn update_scene(&mut self, frame: &FrameParams) -> RendererResult<()> {
        ensure_live(self.terminated)?;
        self.release_dead();
        self.present_frame(frame)?;
        self.fps.tick();
        Ok(())
    }

    fn surface_create(&mut self) -> RendererResult<SurfaceId> {
        ensure_live(self.terminated)?;
        let layer = self.planes.create_layer()?;
        let id = self.surfaces.create();
        self.layers.insert(id, layer);
        debug!("{} placed on {}", id, layer);
        Ok(id)
    }

    fn surface_destroy(&mut self, surface: SurfaceId) -> RendererResult<()> {
        let removed = self
            .surfaces
            .remove(surface)
            .ok_or(RendererError::UnknownSurface(surface))?;
        removed.buffer.release_into(&mut self.dead);
        if let Some(layer) = self.layers.remove(&surface) {
            self.planes.destroy_layer(layer)?;
        }
        Ok(())
    }

    fn surface_commit(&mut self, surface: SurfaceId, resource: Option<ResourceId>) -> Result<(), CommitError> {
        let layer = self
            .layers
            .get(&surface)
            .copied()
            .ok_or(CommitError::UnknownSurface(surface))?;
        let Some(resource) = resource else {
            let target = self
                .surfaces
                .get_mut(surface)
                .ok_or(CommitError::UnknownSurface(surface))?;
            std::mem::take(&mut target.buffer).release_into(&mut self.dead);
            target.last_resource = None;
            return Ok(());
        };

        let family = classify(&self.sources, resource).ok_or(CommitError::Unsupported(resource))?;
        let staged = self
            .stage(family, resource)
            .map_err(|source| CommitError::Import { resource, source })?;
        let (width, height) = staged.size();

        let target = self
            .surfaces
            .get_mut(surface)
            .ok_or(CommitError::UnknownSurface(surface))?;
        let mut ring = match std::mem::take(&mut target.buffer) {
            BufferState::Native(ring) => ring,
            other => {
                other.release_into(&mut self.dead);
                NativeRing::new(self.ring_depth)
            }
        };
        let result = SlotWriter {
            planes: &mut self.planes,
            dead: &mut self.dead,
            layer,
            protected: self.protected,
            timeout: self.displayed_timeout,
        }
        .write(&mut ring, staged);
        target.buffer = if ring.buffers().next().is_some() {
            BufferState::Native(ring)
        } else {
            BufferState::Empty
        };
        if let Err(e) = result {
            warn!("Commit of {} to {} failed: {}", resource, surface, e);
            return Err(CommitError::Import {
                resource,
                source: e.into(),
            });
        }

        target.apply_buffer_size(width, height);
        target.last_resource = Some(resource);
        debug!("{} queued {} on {} as {:?}", surface, resource, layer, family);
        Ok(())
    }

    local_surface_properties!();

    fn delegation(&mut self) -> Option<&mut dyn DelegateScene> {
        Some(self)
    }
}

impl<P: PlaneController> DelegateScene for OverlayBackend<P> {
    fn delegate_update_scene(&mut self, frame: &FrameParams, rects: &mut Vec<Rect>) -> RendererResult<bool> {
        self.update_scene(frame)?;
        if !frame.hints.contains(RenderHints::HOLE_PUNCH) {
            return Ok(false);
        }
        rects.extend(hole_punch_rects(&self.surfaces, &frame.matrix));
        Ok(true)
    }
}

impl<P: PlaneController> Drop for OverlayBackend<P> {
    fn drop(&mut self) {
        self.terminate();
    }
}
