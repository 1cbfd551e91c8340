//! In-memory buffer registry.
//!
//! [`BufferManager`] stands in for the protocol extensions when there is no
//! live Wayland client: buffers are registered with their contents and layout,
//! receive a unique [`ResourceId`], and are then visible through every source
//! adapter trait.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use drm_fourcc::DrmFourcc;
use tracing::{debug, trace};

use crate::format::ShmFormat;
use crate::source::{
    DmabufAttributes, DmabufSource, NativeHandle, PlatformBufferInfo, PlatformBufferSource,
    ResourceId, SharedBufferInfo, SharedBufferSource, ShmInfo, ShmSource, ShmView, SourceError,
};

fn next_resource_id() -> ResourceId {
    static NEXT_ID: AtomicU64 = AtomicU64::new(1);
    ResourceId::new(NEXT_ID.fetch_add(1, Ordering::Relaxed))
}

/// What a registered buffer is made of.
#[derive(Debug, Clone)]
pub enum BufferContents {
    Shm { info: ShmInfo, data: Vec<u8> },
    Platform(PlatformBufferInfo),
    Shared {
        info: SharedBufferInfo,
        /// CPU copy served by [`SharedBufferSource::read_back`], laid out as
        /// ARGB8888 with the given stride.
        pixels: Vec<u8>,
        stride: u32,
    },
    Dmabuf(DmabufAttributes),
}

/// A registered buffer.
#[derive(Debug, Clone)]
pub struct BufferDetails {
    pub id: ResourceId,
    pub contents: BufferContents,
}

/// Registry of client buffers, shared between the code producing buffers and
/// the renderer reading them.
#[derive(Debug, Default)]
pub struct BufferManager {
    buffers: Mutex<HashMap<ResourceId, BufferDetails>>,
    /// Number of begin-access brackets currently open.
    open_accesses: AtomicUsize,
}

impl BufferManager {
    /// Creates a new, empty `BufferManager`.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ResourceId, BufferDetails>> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, contents: BufferContents) -> ResourceId {
        let id = next_resource_id();
        debug!("Registered {} ({})", id, family_name(&contents));
        self.lock().insert(id, BufferDetails { id, contents });
        id
    }

    /// Registers a shared-memory buffer.
    ///
    /// # Errors
    /// The stride must hold a full row and `data` must cover
    /// `stride * height` bytes.
    pub fn register_shm(
        &self,
        width: u32,
        height: u32,
        stride: u32,
        format: ShmFormat,
        data: Vec<u8>,
    ) -> Result<ResourceId, SourceError> {
        let info = ShmInfo {
            width,
            height,
            stride,
            format,
        };
        validate_cpu_layout(&info, data.len())?;
        Ok(self.insert(BufferContents::Shm { info, data }))
    }

    /// Replaces the pixels of a registered shared-memory buffer, as a client
    /// drawing into the same `wl_buffer` again would.
    pub fn write_shm(&self, id: ResourceId, new_data: &[u8]) -> Result<(), SourceError> {
        let mut buffers = self.lock();
        let details = buffers
            .get_mut(&id)
            .ok_or(SourceError::UnknownResource(id))?;
        match &mut details.contents {
            BufferContents::Shm { info, data } => {
                validate_cpu_layout(info, new_data.len())?;
                data.clear();
                data.extend_from_slice(new_data);
                Ok(())
            }
            _ => Err(SourceError::WrongFamily(id)),
        }
    }

    pub fn register_platform(&self, info: PlatformBufferInfo) -> Result<ResourceId, SourceError> {
        if info.width == 0 || info.height == 0 {
            return Err(SourceError::InvalidDimensions {
                width: info.width,
                height: info.height,
            });
        }
        Ok(self.insert(BufferContents::Platform(info)))
    }

    /// Registers a legacy shared buffer backed by `pixmap`, with an ARGB8888
    /// CPU copy for read-back.
    pub fn register_shared(
        &self,
        width: u32,
        height: u32,
        pixmap: NativeHandle,
        stride: u32,
        pixels: Vec<u8>,
    ) -> Result<ResourceId, SourceError> {
        let cpu = ShmInfo {
            width,
            height,
            stride,
            format: ShmFormat::Argb8888,
        };
        validate_cpu_layout(&cpu, pixels.len())?;
        let info = SharedBufferInfo {
            width,
            height,
            format: DrmFourcc::Argb8888,
            pixmap,
        };
        Ok(self.insert(BufferContents::Shared {
            info,
            pixels,
            stride,
        }))
    }

    pub fn register_dmabuf(&self, attributes: DmabufAttributes) -> ResourceId {
        self.insert(BufferContents::Dmabuf(attributes))
    }

    /// Returns a snapshot of a registered buffer.
    pub fn get_buffer_details(&self, id: ResourceId) -> Option<BufferDetails> {
        self.lock().get(&id).cloned()
    }

    /// Forgets a buffer, as when the client destroys its `wl_buffer`.
    pub fn release_buffer(&self, id: ResourceId) -> Option<BufferDetails> {
        let removed = self.lock().remove(&id);
        if removed.is_some() {
            debug!("Released {}", id);
        }
        removed
    }

    /// Access brackets currently open. Zero whenever no renderer call is in
    /// flight.
    pub fn open_accesses(&self) -> usize {
        self.open_accesses.load(Ordering::SeqCst)
    }

    fn family_matches(&self, id: ResourceId, pred: fn(&BufferContents) -> bool) -> bool {
        self.lock()
            .get(&id)
            .map(|details| pred(&details.contents))
            .unwrap_or(false)
    }

    fn bracketed(&self, info: ShmInfo, data: &[u8], f: &mut dyn FnMut(ShmView<'_>)) {
        self.open_accesses.fetch_add(1, Ordering::SeqCst);
        trace!("begin access {}x{} {:?}", info.width, info.height, info.format);
        f(ShmView { info, data });
        trace!("end access");
        self.open_accesses.fetch_sub(1, Ordering::SeqCst);
    }
}

fn family_name(contents: &BufferContents) -> &'static str {
    match contents {
        BufferContents::Shm { .. } => "shm",
        BufferContents::Platform(_) => "platform",
        BufferContents::Shared { .. } => "shared",
        BufferContents::Dmabuf(_) => "dmabuf",
    }
}

fn validate_cpu_layout(info: &ShmInfo, len: usize) -> Result<(), SourceError> {
    if info.width == 0 || info.height == 0 {
        return Err(SourceError::InvalidDimensions {
            width: info.width,
            height: info.height,
        });
    }
    if info.stride < info.format.min_stride(info.width) {
        return Err(SourceError::InvalidStride {
            stride: info.stride,
            width: info.width,
            format: info.format,
        });
    }
    let needed = info.stride as usize * info.height as usize;
    if len < needed {
        return Err(SourceError::AccessFailed(format!(
            "buffer holds {len} bytes, layout needs {needed}"
        )));
    }
    Ok(())
}

impl ShmSource for BufferManager {
    fn is_shm(&self, resource: ResourceId) -> bool {
        self.family_matches(resource, |c| matches!(c, BufferContents::Shm { .. }))
    }

    fn shm_info(&self, resource: ResourceId) -> Result<ShmInfo, SourceError> {
        match self.lock().get(&resource).map(|d| &d.contents) {
            Some(BufferContents::Shm { info, .. }) => Ok(*info),
            Some(_) => Err(SourceError::WrongFamily(resource)),
            None => Err(SourceError::UnknownResource(resource)),
        }
    }

    fn with_contents(
        &self,
        resource: ResourceId,
        f: &mut dyn FnMut(ShmView<'_>),
    ) -> Result<(), SourceError> {
        let buffers = self.lock();
        match buffers.get(&resource).map(|d| &d.contents) {
            Some(BufferContents::Shm { info, data }) => {
                self.bracketed(*info, data, f);
                Ok(())
            }
            Some(_) => Err(SourceError::WrongFamily(resource)),
            None => Err(SourceError::UnknownResource(resource)),
        }
    }
}

impl PlatformBufferSource for BufferManager {
    fn is_platform_buffer(&self, resource: ResourceId) -> bool {
        self.family_matches(resource, |c| matches!(c, BufferContents::Platform(_)))
    }

    fn platform_info(&self, resource: ResourceId) -> Result<PlatformBufferInfo, SourceError> {
        match self.lock().get(&resource).map(|d| &d.contents) {
            Some(BufferContents::Platform(info)) => Ok(*info),
            Some(_) => Err(SourceError::WrongFamily(resource)),
            None => Err(SourceError::UnknownResource(resource)),
        }
    }
}

impl SharedBufferSource for BufferManager {
    fn is_shared_buffer(&self, resource: ResourceId) -> bool {
        self.family_matches(resource, |c| matches!(c, BufferContents::Shared { .. }))
    }

    fn shared_info(&self, resource: ResourceId) -> Result<SharedBufferInfo, SourceError> {
        match self.lock().get(&resource).map(|d| &d.contents) {
            Some(BufferContents::Shared { info, .. }) => Ok(*info),
            Some(_) => Err(SourceError::WrongFamily(resource)),
            None => Err(SourceError::UnknownResource(resource)),
        }
    }

    fn read_back(
        &self,
        resource: ResourceId,
        f: &mut dyn FnMut(ShmView<'_>),
    ) -> Result<(), SourceError> {
        let buffers = self.lock();
        match buffers.get(&resource).map(|d| &d.contents) {
            Some(BufferContents::Shared {
                info,
                pixels,
                stride,
            }) => {
                let cpu = ShmInfo {
                    width: info.width,
                    height: info.height,
                    stride: *stride,
                    format: ShmFormat::Argb8888,
                };
                self.bracketed(cpu, pixels, f);
                Ok(())
            }
            Some(_) => Err(SourceError::WrongFamily(resource)),
            None => Err(SourceError::UnknownResource(resource)),
        }
    }
}

impl DmabufSource for BufferManager {
    fn is_dmabuf(&self, resource: ResourceId) -> bool {
        self.family_matches(resource, |c| matches!(c, BufferContents::Dmabuf(_)))
    }

    fn dmabuf_attributes(&self, resource: ResourceId) -> Result<DmabufAttributes, SourceError> {
        match self.lock().get(&resource).map(|d| &d.contents) {
            Some(BufferContents::Dmabuf(attributes)) => Ok(attributes.clone()),
            Some(_) => Err(SourceError::WrongFamily(resource)),
            None => Err(SourceError::UnknownResource(resource)),
        }
    }
}
