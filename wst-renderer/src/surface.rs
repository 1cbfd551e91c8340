//! Render surfaces and the z-ordered sequence that owns them.
//!
//! The [`SurfaceList`] is the compositing engine shared by every backend: it
//! keeps surfaces sorted by non-decreasing z-order, with surfaces of equal
//! z-order kept in the order they arrived. Geometry, opacity and visibility
//! bookkeeping live here too so all backends agree on them.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use wst_buffer_manager::ResourceId;

use crate::import::BufferState;
use crate::math::Rect;

/// Z-order a surface receives on creation.
pub const DEFAULT_ZORDER: f32 = 0.5;

/// Opacity a surface receives on creation.
pub const DEFAULT_OPACITY: f32 = 1.0;

/// Clamps to `[0, 1]`; NaN falls back to `default`.
fn unit_or(value: f32, default: f32) -> f32 {
    if value.is_nan() {
        default
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Represents a unique identifier for a render surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(u64);

impl SurfaceId {
    /// Creates a new, unique `SurfaceId`. Identifiers are unique across every
    /// backend in the process, so a delegate's surface ids never collide with
    /// its owner's.
    pub fn new_unique() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        SurfaceId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "surface#{}", self.0)
    }
}

/// One client's visible content.
#[derive(Debug)]
pub struct RenderSurface {
    id: SurfaceId,
    x: i32,
    y: i32,
    width: i32,
    height: i32,
    /// Set once the host assigns geometry explicitly; committed buffers no
    /// longer resize the surface after that.
    size_override: bool,
    opacity: f32,
    zorder: f32,
    visible: bool,
    pub(crate) buffer: BufferState,
    /// Counterpart surface in the fast-path delegate, if delegating.
    pub(crate) delegate: Option<SurfaceId>,
    /// Resource of the most recent non-null commit.
    pub(crate) last_resource: Option<ResourceId>,
}

impl RenderSurface {
    pub fn new() -> Self {
        Self {
            id: SurfaceId::new_unique(),
            x: 0,
            y: 0,
            width: 0,
            height: 0,
            size_override: false,
            opacity: DEFAULT_OPACITY,
            zorder: DEFAULT_ZORDER,
            visible: true,
            buffer: BufferState::Empty,
            delegate: None,
            last_resource: None,
        }
    }

    pub fn id(&self) -> SurfaceId {
        self.id
    }

    pub fn geometry(&self) -> Rect {
        Rect::new(self.x, self.y, self.width, self.height)
    }

    /// Explicit geometry from the host. Disables implicit sizing.
    pub fn set_geometry(&mut self, rect: Rect) {
        self.restore_geometry(rect);
        self.size_override = true;
    }

    /// Puts back geometry read from elsewhere (a delegate) without touching
    /// the override flag.
    pub(crate) fn restore_geometry(&mut self, rect: Rect) {
        self.x = rect.x;
        self.y = rect.y;
        self.width = rect.width;
        self.height = rect.height;
    }

    pub fn size_override(&self) -> bool {
        self.size_override
    }

    pub(crate) fn mark_size_override(&mut self) {
        self.size_override = true;
    }

    /// Size tracking on commit: follows the buffer unless overridden.
    pub(crate) fn apply_buffer_size(&mut self, width: u32, height: u32) {
        if !self.size_override {
            self.width = width as i32;
            self.height = height as i32;
        }
    }

    pub fn opacity(&self) -> f32 {
        self.opacity
    }

    pub fn set_opacity(&mut self, opacity: f32) {
        self.opacity = unit_or(opacity, DEFAULT_OPACITY);
    }

    pub fn zorder(&self) -> f32 {
        self.zorder
    }

    pub fn visible(&self) -> bool {
        self.visible
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    pub fn buffer(&self) -> &BufferState {
        &self.buffer
    }

    pub fn delegate(&self) -> Option<SurfaceId> {
        self.delegate
    }

    pub fn last_resource(&self) -> Option<ResourceId> {
        self.last_resource
    }

    /// Whether the surface contributes anything to a frame.
    pub fn is_drawable(&self) -> bool {
        self.visible
            && self.opacity > 0.0
            && !self.geometry().is_empty()
            && !matches!(self.buffer, BufferState::Empty)
    }
}

impl Default for RenderSurface {
    fn default() -> Self {
        Self::new()
    }
}

/// Z-ordered sequence of render surfaces.
#[derive(Debug, Default)]
pub struct SurfaceList {
    surfaces: Vec<RenderSurface>,
}

impl SurfaceList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts before the first surface whose z-order strictly exceeds the
    /// new surface's, or appends when there is none.
    pub fn insert(&mut self, surface: RenderSurface) -> SurfaceId {
        let id = surface.id;
        let index = self
            .surfaces
            .iter()
            .position(|s| s.zorder > surface.zorder)
            .unwrap_or(self.surfaces.len());
        self.surfaces.insert(index, surface);
        id
    }

    /// Creates a default surface and inserts it.
    pub fn create(&mut self) -> SurfaceId {
        self.insert(RenderSurface::new())
    }

    pub fn remove(&mut self, id: SurfaceId) -> Option<RenderSurface> {
        let index = self.index_of(id)?;
        Some(self.surfaces.remove(index))
    }

    /// Changes a surface's z-order: remove, then reinsert behind every
    /// surface whose z-order is not greater than the new value.
    pub fn set_zorder(&mut self, id: SurfaceId, zorder: f32) -> bool {
        let Some(mut surface) = self.remove(id) else {
            return false;
        };
        surface.zorder = unit_or(zorder, DEFAULT_ZORDER);
        self.insert(surface);
        true
    }

    pub fn get(&self, id: SurfaceId) -> Option<&RenderSurface> {
        self.surfaces.iter().find(|s| s.id == id)
    }

    pub fn get_mut(&mut self, id: SurfaceId) -> Option<&mut RenderSurface> {
        self.surfaces.iter_mut().find(|s| s.id == id)
    }

    pub fn contains(&self, id: SurfaceId) -> bool {
        self.index_of(id).is_some()
    }

    fn index_of(&self, id: SurfaceId) -> Option<usize> {
        self.surfaces.iter().position(|s| s.id == id)
    }

    /// Back-to-front iteration (lowest z-order first).
    pub fn iter(&self) -> impl Iterator<Item = &RenderSurface> {
        self.surfaces.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut RenderSurface> {
        self.surfaces.iter_mut()
    }

    /// Surface ids in draw order.
    pub fn ids(&self) -> Vec<SurfaceId> {
        self.surfaces.iter().map(|s| s.id).collect()
    }

    pub fn len(&self) -> usize {
        self.surfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.surfaces.is_empty()
    }

    /// Removes every surface, in draw order.
    pub fn drain(&mut self) -> Vec<RenderSurface> {
        std::mem::take(&mut self.surfaces)
    }

    /// True when z-orders are non-decreasing front to back.
    pub fn is_sorted(&self) -> bool {
        self.surfaces.windows(2).all(|w| w[0].zorder <= w[1].zorder)
    }

    pub fn set_geometry(&mut self, id: SurfaceId, rect: Rect) -> bool {
        self.get_mut(id).map(|s| s.set_geometry(rect)).is_some()
    }

    pub fn set_opacity(&mut self, id: SurfaceId, opacity: f32) -> bool {
        self.get_mut(id).map(|s| s.set_opacity(opacity)).is_some()
    }

    pub fn set_visible(&mut self, id: SurfaceId, visible: bool) -> bool {
        self.get_mut(id).map(|s| s.set_visible(visible)).is_some()
    }
}
