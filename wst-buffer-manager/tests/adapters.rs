//! The adapter contract as seen by a consumer holding only `BufferSources`.

use std::sync::Arc;
use std::thread;

use pretty_assertions::assert_eq;
use rstest::rstest;
use wst_buffer_manager::{
    BufferManager, BufferSources, DmabufAttributes, DmabufPlane, DmabufSource, DrmFourcc, DrmModifier, NativeHandle,
    PlatformBufferInfo, PlatformTextureFormat, ResourceId, ShmFormat, ShmInfo, ShmSource, SourceError,
};

/// An SHM-only source, standing in for a compositor that exposes nothing
/// else.
struct OneBuffer {
    id: ResourceId,
    pixels: Vec<u8>,
}

impl ShmSource for OneBuffer {
    fn is_shm(&self, resource: ResourceId) -> bool {
        resource == self.id
    }

    fn shm_info(&self, resource: ResourceId) -> Result<ShmInfo, SourceError> {
        if resource != self.id {
            return Err(SourceError::UnknownResource(resource));
        }
        Ok(ShmInfo {
            width: 1,
            height: 1,
            stride: 4,
            format: ShmFormat::Xrgb8888,
        })
    }

    fn with_contents(
        &self,
        resource: ResourceId,
        f: &mut dyn FnMut(wst_buffer_manager::ShmView<'_>),
    ) -> Result<(), SourceError> {
        let info = self.shm_info(resource)?;
        f(wst_buffer_manager::ShmView {
            info,
            data: &self.pixels,
        });
        Ok(())
    }
}

fn family_of(sources: &BufferSources, resource: ResourceId) -> Option<&'static str> {
    if sources.shm.as_ref().is_some_and(|s| s.is_shm(resource)) {
        return Some("shm");
    }
    if sources.platform.as_ref().is_some_and(|s| s.is_platform_buffer(resource)) {
        return Some("platform");
    }
    if sources.shared.as_ref().is_some_and(|s| s.is_shared_buffer(resource)) {
        return Some("shared");
    }
    if sources.dmabuf.as_ref().is_some_and(|s| s.is_dmabuf(resource)) {
        return Some("dmabuf");
    }
    None
}

fn plane(fd: i32, stride: u32) -> DmabufPlane {
    DmabufPlane {
        fd,
        offset: 0,
        stride,
        modifier: DrmModifier::Invalid,
    }
}

#[test]
fn every_family_is_probed_through_one_manager() {
    let manager = Arc::new(BufferManager::new());
    let shm = manager
        .register_shm(2, 2, 8, ShmFormat::Argb8888, vec![0; 16])
        .unwrap();
    let platform = manager
        .register_platform(PlatformBufferInfo {
            width: 8,
            height: 8,
            texture_format: PlatformTextureFormat::YUv,
            native: NativeHandle(0x40),
        })
        .unwrap();
    let shared = manager
        .register_shared(2, 2, NativeHandle(0x80), 8, vec![0; 16])
        .unwrap();
    let dmabuf = manager.register_dmabuf(DmabufAttributes::new(4, 4, DrmFourcc::Xrgb8888, vec![plane(5, 16)]).unwrap());

    let sources = BufferSources::from_all(manager.clone());
    assert_eq!(family_of(&sources, shm), Some("shm"));
    assert_eq!(family_of(&sources, platform), Some("platform"));
    assert_eq!(family_of(&sources, shared), Some("shared"));
    assert_eq!(family_of(&sources, dmabuf), Some("dmabuf"));
    assert_eq!(family_of(&sources, ResourceId::new(u64::MAX)), None);
}

#[test]
fn absent_adapters_never_match() {
    let manager = Arc::new(BufferManager::new());
    let dmabuf = manager.register_dmabuf(DmabufAttributes::new(4, 4, DrmFourcc::Xrgb8888, vec![plane(5, 16)]).unwrap());
    let sources = BufferSources {
        shm: Some(manager.clone()),
        ..BufferSources::default()
    };
    assert_eq!(family_of(&sources, dmabuf), None);
    assert_eq!(
        format!("{sources:?}"),
        "BufferSources { shm: true, platform: false, shared: false, dmabuf: false }"
    );
}

#[test]
fn custom_adapter_plugs_in() {
    let id = ResourceId::new(42);
    let sources = BufferSources {
        shm: Some(Arc::new(OneBuffer {
            id,
            pixels: vec![1, 2, 3, 4],
        })),
        ..BufferSources::default()
    };
    assert_eq!(family_of(&sources, id), Some("shm"));

    let mut copied = Vec::new();
    sources
        .shm
        .as_ref()
        .unwrap()
        .with_contents(id, &mut |view| copied.extend_from_slice(view.data))
        .unwrap();
    assert_eq!(copied, vec![1, 2, 3, 4]);
}

#[test]
fn shared_buffers_read_back_as_argb() {
    let manager = BufferManager::new();
    let id = manager
        .register_shared(1, 2, NativeHandle(0x10), 4, vec![9, 8, 7, 6, 5, 4, 3, 2])
        .unwrap();
    let info = wst_buffer_manager::SharedBufferSource::shared_info(&manager, id).unwrap();
    assert_eq!((info.width, info.height, info.format), (1, 2, DrmFourcc::Argb8888));

    let mut format = None;
    wst_buffer_manager::SharedBufferSource::read_back(&manager, id, &mut |view| {
        format = Some(view.info.format);
        assert_eq!(view.data.len(), 8);
    })
    .unwrap();
    assert_eq!(format, Some(ShmFormat::Argb8888));
    assert_eq!(manager.open_accesses(), 0);
}

#[test]
fn rewriting_shm_contents_is_visible_to_readers() {
    let manager = BufferManager::new();
    let id = manager
        .register_shm(1, 1, 4, ShmFormat::Xrgb8888, vec![0; 4])
        .unwrap();
    manager.write_shm(id, &[1, 2, 3, 4]).unwrap();

    let mut seen = Vec::new();
    manager
        .with_contents(id, &mut |view| seen.extend_from_slice(view.data))
        .unwrap();
    assert_eq!(seen, vec![1, 2, 3, 4]);

    assert!(matches!(manager.write_shm(id, &[0; 2]), Err(SourceError::AccessFailed(_))));
}

#[rstest]
#[case(ShmFormat::Argb8888, 4, 16, true)]
#[case(ShmFormat::Argb8888, 4, 15, false)]
#[case(ShmFormat::Rgb565, 4, 8, true)]
#[case(ShmFormat::Argb4444, 4, 7, false)]
fn stride_must_hold_a_row(
    #[case] format: ShmFormat,
    #[case] width: u32,
    #[case] stride: u32,
    #[case] accepted: bool,
) {
    let manager = BufferManager::new();
    let data = vec![0; (stride * 2) as usize];
    assert_eq!(manager.register_shm(width, 2, stride, format, data).is_ok(), accepted);
}

#[test]
fn semi_planar_dmabuf_keeps_plane_layout() {
    let manager = BufferManager::new();
    let attributes = DmabufAttributes::new(
        64,
        32,
        DrmFourcc::Nv12,
        vec![
            plane(3, 64),
            DmabufPlane {
                fd: 3,
                offset: 64 * 32,
                stride: 64,
                modifier: DrmModifier::Linear,
            },
        ],
    )
    .unwrap();
    let id = manager.register_dmabuf(attributes);
    let read = manager.dmabuf_attributes(id).unwrap();
    assert!(read.is_semi_planar_yuv());
    assert!(read.has_modifiers());
    assert_eq!(read.planes()[1].offset, 2048);
}

#[test]
fn registration_is_thread_safe() {
    let manager = Arc::new(BufferManager::new());
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let manager = manager.clone();
            thread::spawn(move || {
                (0..16)
                    .map(|_| manager.register_shm(1, 1, 4, ShmFormat::Argb8888, vec![0; 4]).unwrap())
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    let mut ids: Vec<ResourceId> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 64);
    assert!(ids.iter().all(|id| manager.is_shm(*id)));
}
