//! Hardware overlay plane controller.
//!
//! The overlay backends place every surface on its own hardware layer. Layers
//! are positioned and blended by the display controller; content reaches them
//! as native buffers, either allocated by the controller (and filled from
//! CPU copies) or wrapping client memory directly.

use std::collections::HashMap;
use std::time::Duration;

use drm_fourcc::DrmFourcc;
use tracing::{debug, trace};
use wst_buffer_manager::{DmabufAttributes, NativeHandle};

use crate::error::PlaneError;
use crate::format::CpuPixels;
use crate::math::Rect;
use crate::resources::{LayerId, NativeBufferId};

/// Full scale of a colour-matrix coefficient.
pub const COLOR_MATRIX_ONE: i32 = 255;

/// 4×4 row-major colour matrix applied by the display controller, with
/// coefficients in 1/255 units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorMatrix(pub [[i32; 4]; 4]);

impl ColorMatrix {
    /// Identity on colour with the alpha row scaled to `opacity`.
    pub fn for_opacity(opacity: f32) -> Self {
        let mut m = [[0; 4]; 4];
        for (i, row) in m.iter_mut().enumerate().take(3) {
            row[i] = COLOR_MATRIX_ONE;
        }
        m[3][3] = alpha_coefficient(opacity) as i32;
        ColorMatrix(m)
    }

    pub fn alpha(&self) -> i32 {
        self.0[3][3]
    }
}

/// `round(opacity × 255)`.
pub fn alpha_coefficient(opacity: f32) -> u8 {
    (opacity.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// `round(zorder × 100)`.
pub fn layer_index(zorder: f32) -> u32 {
    (zorder.clamp(0.0, 1.0) * 100.0).round() as u32
}

/// Placement and blending of one hardware layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerConfig {
    /// Destination on the output.
    pub dest: Rect,
    /// Stacking position; higher is on top.
    pub layer_index: u32,
    pub visible: bool,
    /// Per-element alpha, used when the controller has no colour matrix.
    pub alpha: u8,
    pub color_matrix: Option<ColorMatrix>,
}

/// Display-controller side of the overlay backends.
pub trait PlaneController {
    fn create_layer(&mut self) -> Result<LayerId, PlaneError>;

    fn destroy_layer(&mut self, layer: LayerId) -> Result<(), PlaneError>;

    /// Allocates a controller-owned buffer. `protected` requests memory the
    /// CPU cannot read back (secure video).
    fn allocate_buffer(&mut self, width: u32, height: u32, protected: bool) -> Result<NativeBufferId, PlaneError>;

    /// Copies CPU pixels into an allocated buffer of the same size.
    fn write_buffer(&mut self, buffer: NativeBufferId, pixels: &CpuPixels) -> Result<(), PlaneError>;

    /// Wraps client memory without copying.
    fn wrap_native(&mut self, handle: NativeHandle, width: u32, height: u32) -> Result<NativeBufferId, PlaneError>;

    /// Wraps the planes of a DMA-BUF for direct scan-out. Fails when the
    /// controller cannot scan out `attributes.format`.
    fn import_dmabuf(&mut self, attributes: &DmabufAttributes) -> Result<NativeBufferId, PlaneError>;

    fn release_buffer(&mut self, buffer: NativeBufferId) -> Result<(), PlaneError>;

    fn configure_layer(&mut self, layer: LayerId, config: &LayerConfig) -> Result<(), PlaneError>;

    /// Queues `buffer` for display on `layer` at the next commit.
    fn present(&mut self, layer: LayerId, buffer: NativeBufferId) -> Result<(), PlaneError>;

    /// Applies every queued configuration and presentation atomically.
    fn commit(&mut self) -> Result<(), PlaneError>;

    /// Waits up to `timeout` for the buffer last presented on `layer` to be
    /// on screen. Returns `false` on timeout.
    fn wait_displayed(&mut self, layer: LayerId, timeout: Duration) -> Result<bool, PlaneError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualBuffer {
    pub width: u32,
    pub height: u32,
    pub protected: bool,
    pub wrapped: Option<NativeHandle>,
    /// Format of a wrapped DMA-BUF.
    pub dmabuf: Option<DrmFourcc>,
    /// Copy of the last write, RGBA8. Protected buffers keep none.
    pub pixels: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct VirtualLayer {
    config: Option<LayerConfig>,
    queued: Option<NativeBufferId>,
    presented: Option<NativeBufferId>,
    displayed: Option<NativeBufferId>,
}

/// DMA-BUF formats [`VirtualPlanes`] scans out unless told otherwise.
pub const DEFAULT_SCANOUT_FORMATS: [DrmFourcc; 3] = [DrmFourcc::Argb8888, DrmFourcc::Xrgb8888, DrmFourcc::Nv12];

/// In-memory plane controller. A commit makes presented buffers visible
/// immediately unless feedback is held back, which stands in for a
/// display that has not scanned out yet.
#[derive(Debug)]
pub struct VirtualPlanes {
    next_handle: u32,
    layers: HashMap<LayerId, VirtualLayer>,
    buffers: HashMap<NativeBufferId, VirtualBuffer>,
    max_layers: Option<usize>,
    scanout_formats: Vec<DrmFourcc>,
    hold_feedback: bool,
    commits: u64,
    waits: u64,
}

impl Default for VirtualPlanes {
    fn default() -> Self {
        Self {
            next_handle: 0,
            layers: HashMap::new(),
            buffers: HashMap::new(),
            max_layers: None,
            scanout_formats: DEFAULT_SCANOUT_FORMATS.to_vec(),
            hold_feedback: false,
            commits: 0,
            waits: 0,
        }
    }
}

impl VirtualPlanes {
    pub fn new() -> Self {
        Self::default()
    }

    /// A controller with only `max_layers` hardware layers.
    pub fn with_layer_limit(max_layers: usize) -> Self {
        Self {
            max_layers: Some(max_layers),
            ..Self::default()
        }
    }

    /// Replaces the DMA-BUF formats accepted by [`PlaneController::import_dmabuf`].
    pub fn with_scanout_formats(mut self, formats: &[DrmFourcc]) -> Self {
        self.scanout_formats = formats.to_vec();
        self
    }

    fn next(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }

    /// While held, commits do not turn presented buffers into displayed ones.
    pub fn hold_feedback(&mut self, hold: bool) {
        self.hold_feedback = hold;
        if !hold {
            self.flip();
        }
    }

    fn flip(&mut self) {
        for layer in self.layers.values_mut() {
            if let Some(buffer) = layer.presented.take() {
                layer.displayed = Some(buffer);
            }
        }
    }

    fn layer_mut(&mut self, layer: LayerId) -> Result<&mut VirtualLayer, PlaneError> {
        self.layers.get_mut(&layer).ok_or(PlaneError::UnknownLayer(layer))
    }

    pub fn layer_config(&self, layer: LayerId) -> Option<LayerConfig> {
        self.layers.get(&layer).and_then(|l| l.config)
    }

    pub fn displayed_buffer(&self, layer: LayerId) -> Option<NativeBufferId> {
        self.layers.get(&layer).and_then(|l| l.displayed)
    }

    pub fn buffer(&self, buffer: NativeBufferId) -> Option<&VirtualBuffer> {
        self.buffers.get(&buffer)
    }

    pub fn layers(&self) -> Vec<LayerId> {
        let mut layers: Vec<LayerId> = self.layers.keys().copied().collect();
        layers.sort();
        layers
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn commits(&self) -> u64 {
        self.commits
    }

    /// Number of feedback waits that had to give up.
    pub fn timed_out_waits(&self) -> u64 {
        self.waits
    }
}

impl PlaneController for VirtualPlanes {
    fn create_layer(&mut self) -> Result<LayerId, PlaneError> {
        if self.max_layers.is_some_and(|max| self.layers.len() >= max) {
            return Err(PlaneError::Hardware(format!("all {} layers in use", self.layers.len())));
        }
        let layer = LayerId::new(self.next());
        self.layers.insert(layer, VirtualLayer::default());
        debug!("Created {}", layer);
        Ok(layer)
    }

    fn destroy_layer(&mut self, layer: LayerId) -> Result<(), PlaneError> {
        self.layers
            .remove(&layer)
            .map(|_| ())
            .ok_or(PlaneError::UnknownLayer(layer))
    }

    fn allocate_buffer(&mut self, width: u32, height: u32, protected: bool) -> Result<NativeBufferId, PlaneError> {
        if width == 0 || height == 0 {
            return Err(PlaneError::Allocation(format!("invalid size {}x{}", width, height)));
        }
        let buffer = NativeBufferId::new(self.next());
        self.buffers.insert(
            buffer,
            VirtualBuffer {
                width,
                height,
                protected,
                wrapped: None,
                dmabuf: None,
                pixels: None,
            },
        );
        trace!("Allocated {} {}x{} protected={}", buffer, width, height, protected);
        Ok(buffer)
    }

    fn write_buffer(&mut self, buffer: NativeBufferId, pixels: &CpuPixels) -> Result<(), PlaneError> {
        let target = self
            .buffers
            .get_mut(&buffer)
            .ok_or(PlaneError::UnknownBuffer(buffer))?;
        if target.wrapped.is_some() || target.dmabuf.is_some() {
            return Err(PlaneError::Hardware(format!("{} wraps client memory", buffer)));
        }
        if (target.width, target.height) != (pixels.width, pixels.height) {
            return Err(PlaneError::Hardware(format!(
                "write of {}x{} into {}x{} {}",
                pixels.width, pixels.height, target.width, target.height, buffer
            )));
        }
        if !target.protected {
            let mut rgba = Vec::with_capacity((pixels.width * pixels.height * 4) as usize);
            for y in 0..pixels.height {
                for x in 0..pixels.width {
                    rgba.extend_from_slice(&pixels.pixel_rgba(x, y).unwrap_or_default());
                }
            }
            target.pixels = Some(rgba);
        }
        Ok(())
    }

    fn wrap_native(&mut self, handle: NativeHandle, width: u32, height: u32) -> Result<NativeBufferId, PlaneError> {
        let buffer = NativeBufferId::new(self.next());
        self.buffers.insert(
            buffer,
            VirtualBuffer {
                width,
                height,
                protected: false,
                wrapped: Some(handle),
                dmabuf: None,
                pixels: None,
            },
        );
        Ok(buffer)
    }

    fn import_dmabuf(&mut self, attributes: &DmabufAttributes) -> Result<NativeBufferId, PlaneError> {
        if !self.scanout_formats.contains(&attributes.format) {
            return Err(PlaneError::Hardware(format!(
                "{:?} cannot be scanned out",
                attributes.format
            )));
        }
        let buffer = NativeBufferId::new(self.next());
        self.buffers.insert(
            buffer,
            VirtualBuffer {
                width: attributes.width,
                height: attributes.height,
                protected: false,
                wrapped: None,
                dmabuf: Some(attributes.format),
                pixels: None,
            },
        );
        trace!(
            "Wrapped {:?} dma-buf ({} planes) as {}",
            attributes.format,
            attributes.planes().len(),
            buffer
        );
        Ok(buffer)
    }

    fn release_buffer(&mut self, buffer: NativeBufferId) -> Result<(), PlaneError> {
        self.buffers
            .remove(&buffer)
            .map(|_| trace!("Released {}", buffer))
            .ok_or(PlaneError::UnknownBuffer(buffer))
    }

    fn configure_layer(&mut self, layer: LayerId, config: &LayerConfig) -> Result<(), PlaneError> {
        self.layer_mut(layer)?.config = Some(*config);
        Ok(())
    }

    fn present(&mut self, layer: LayerId, buffer: NativeBufferId) -> Result<(), PlaneError> {
        if !self.buffers.contains_key(&buffer) {
            return Err(PlaneError::UnknownBuffer(buffer));
        }
        self.layer_mut(layer)?.queued = Some(buffer);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), PlaneError> {
        for layer in self.layers.values_mut() {
            if let Some(buffer) = layer.queued.take() {
                layer.presented = Some(buffer);
            }
        }
        if !self.hold_feedback {
            self.flip();
        }
        self.commits += 1;
        Ok(())
    }

    fn wait_displayed(&mut self, layer: LayerId, _timeout: Duration) -> Result<bool, PlaneError> {
        let state = self.layer_mut(layer)?;
        let done = state.presented.is_none() && state.queued.is_none();
        if !done {
            self.waits += 1;
        }
        Ok(done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1.0, 255)]
    #[case(0.5, 128)]
    #[case(0.0, 0)]
    #[case(1.5, 255)]
    fn test_alpha_coefficient_rounds(#[case] opacity: f32, #[case] expected: u8) {
        assert_eq!(alpha_coefficient(opacity), expected);
        assert_eq!(ColorMatrix::for_opacity(opacity).alpha(), expected as i32);
    }

    #[rstest]
    #[case(0.5, 50)]
    #[case(0.333, 33)]
    #[case(0.999, 100)]
    fn test_layer_index_rounds(#[case] zorder: f32, #[case] expected: u32) {
        assert_eq!(layer_index(zorder), expected);
    }

    #[test]
    fn test_color_matrix_is_scaled_identity() {
        let m = ColorMatrix::for_opacity(1.0).0;
        assert_eq!(m[0], [255, 0, 0, 0]);
        assert_eq!(m[1], [0, 255, 0, 0]);
        assert_eq!(m[2], [0, 0, 255, 0]);
    }

    #[test]
    fn test_feedback_follows_commit() {
        let mut planes = VirtualPlanes::new();
        let layer = planes.create_layer().unwrap();
        let buffer = planes.allocate_buffer(4, 4, false).unwrap();
        planes.present(layer, buffer).unwrap();
        assert!(!planes.wait_displayed(layer, Duration::ZERO).unwrap());

        planes.hold_feedback(true);
        planes.commit().unwrap();
        assert_eq!(planes.displayed_buffer(layer), None);
        assert!(!planes.wait_displayed(layer, Duration::ZERO).unwrap());

        planes.hold_feedback(false);
        assert_eq!(planes.displayed_buffer(layer), Some(buffer));
        assert!(planes.wait_displayed(layer, Duration::ZERO).unwrap());
        assert_eq!(planes.timed_out_waits(), 2);
    }

    #[test]
    fn test_wrapped_buffers_reject_writes() {
        let mut planes = VirtualPlanes::new();
        let buffer = planes.wrap_native(NativeHandle(0x40), 2, 2).unwrap();
        let pixels = CpuPixels {
            width: 2,
            height: 2,
            source_format: wst_buffer_manager::ShmFormat::Argb8888,
            layout: crate::format::UploadLayout::Rgba8,
            data: vec![0; 16],
        };
        assert!(matches!(planes.write_buffer(buffer, &pixels), Err(PlaneError::Hardware(_))));
        planes.release_buffer(buffer).unwrap();
        assert_eq!(
            planes.release_buffer(buffer),
            Err(PlaneError::UnknownBuffer(buffer))
        );
    }

    #[test]
    fn test_layer_limit() {
        let mut planes = VirtualPlanes::with_layer_limit(1);
        let layer = planes.create_layer().unwrap();
        assert!(matches!(planes.create_layer(), Err(PlaneError::Hardware(_))));
        planes.destroy_layer(layer).unwrap();
        assert!(planes.create_layer().is_ok());
    }

    #[test]
    fn test_dmabuf_scanout_follows_format_list() {
        let plane = wst_buffer_manager::DmabufPlane {
            fd: 9,
            offset: 0,
            stride: 32,
            modifier: wst_buffer_manager::DrmModifier::Invalid,
        };
        let argb = DmabufAttributes::new(8, 8, DrmFourcc::Argb8888, vec![plane]).unwrap();
        let mut planes = VirtualPlanes::new();
        let buffer = planes.import_dmabuf(&argb).unwrap();
        assert_eq!(planes.buffer(buffer).unwrap().dmabuf, Some(DrmFourcc::Argb8888));

        let mut yuv_only = VirtualPlanes::new().with_scanout_formats(&[DrmFourcc::Nv12]);
        assert!(matches!(yuv_only.import_dmabuf(&argb), Err(PlaneError::Hardware(_))));
        assert_eq!(yuv_only.live_buffers(), 0);
    }
}
