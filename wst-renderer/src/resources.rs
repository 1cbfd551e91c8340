//! GPU and platform handles, and the queue that defers their destruction.
//!
//! Destroying a texture or image outside the window where the graphics
//! context is current is undefined on several drivers. Every handle a commit
//! or a surface destroy invalidates is therefore parked in the backend's
//! [`DeadResourceQueue`] and released at the start of the next scene update,
//! before that frame allocates anything new.

use std::fmt;

use tracing::debug;

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u32);

        impl $name {
            pub fn new(raw: u32) -> Self {
                Self(raw)
            }

            pub fn raw(self) -> u32 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

handle_type!(
    /// Texture owned by a graphics device.
    TextureId,
    "texture"
);
handle_type!(
    /// Zero-copy image (an `EGLImage` on the GLES device).
    ImageId,
    "image"
);
handle_type!(
    /// Off-screen render target.
    OffscreenId,
    "offscreen"
);
handle_type!(
    /// Buffer allocated or wrapped by an overlay plane controller.
    NativeBufferId,
    "native"
);
handle_type!(
    /// Hardware overlay layer.
    LayerId,
    "layer"
);

/// A handle with exactly one release path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuResource {
    Texture(TextureId),
    Image(ImageId),
    Offscreen(OffscreenId),
    NativeBuffer(NativeBufferId),
}

impl fmt::Display for GpuResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuResource::Texture(id) => id.fmt(f),
            GpuResource::Image(id) => id.fmt(f),
            GpuResource::Offscreen(id) => id.fmt(f),
            GpuResource::NativeBuffer(id) => id.fmt(f),
        }
    }
}

/// Handles scheduled for deletion at the next safe point in the frame.
#[derive(Debug, Default)]
pub struct DeadResourceQueue {
    pending: Vec<GpuResource>,
}

impl DeadResourceQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, resource: GpuResource) {
        debug!("Scheduling {} for release", resource);
        self.pending.push(resource);
    }

    pub fn extend<I: IntoIterator<Item = GpuResource>>(&mut self, resources: I) {
        for resource in resources {
            self.push(resource);
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, resource: GpuResource) -> bool {
        self.pending.contains(&resource)
    }

    /// Hands every queued handle to `release`, in scheduling order, and
    /// returns how many were released. Each handle leaves the queue before
    /// `release` sees it, so none can be released twice.
    pub fn drain<F: FnMut(GpuResource)>(&mut self, mut release: F) -> usize {
        let count = self.pending.len();
        for resource in self.pending.drain(..) {
            release(resource);
        }
        if count > 0 {
            debug!("Released {} deferred resources", count);
        }
        count
    }
}
