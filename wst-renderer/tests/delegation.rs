//! Fast-path delegation from the embedded backend to an overlay backend.

use std::sync::Arc;

use glam::{Mat4, Vec3};
use pretty_assertions::assert_eq;
use rstest::rstest;
use wst_buffer_manager::{
    BufferManager, BufferSources, DmabufAttributes, DmabufPlane, DrmFourcc, DrmModifier, ResourceId, ShmFormat,
};
use wst_renderer::import::BufferState;
use wst_renderer::registry::{OVERLAY_COLOR_MATRIX, OVERLAY_ELEMENT};
use wst_renderer::{
    BackendInit, BackendRegistry, EmbeddedBackend, FrameParams, Mode, Rect, RenderBackend, RenderHints,
    RendererConfig, SoftDevice,
};

fn embedded_with(fast_render: &str) -> (EmbeddedBackend<SoftDevice>, Arc<BufferManager>) {
    let manager = Arc::new(BufferManager::new());
    let config = RendererConfig {
        fast_render: Some(fast_render.to_string()),
        ..RendererConfig::default()
    };
    let init = BackendInit::new(64, 64, BufferSources::from_all(manager.clone())).with_config(config);
    let embedded = BackendRegistry::with_defaults().create_embedded(&init).unwrap();
    (embedded, manager)
}

fn shm(manager: &BufferManager, width: u32, height: u32) -> ResourceId {
    manager
        .register_shm(width, height, width * 4, ShmFormat::Xrgb8888, vec![0x7F; (width * height * 4) as usize])
        .unwrap()
}

fn dmabuf(manager: &BufferManager, format: DrmFourcc, width: u32, height: u32) -> ResourceId {
    let plane = |offset| DmabufPlane {
        fd: 11,
        offset,
        stride: width * 4,
        modifier: DrmModifier::Invalid,
    };
    let planes = match format {
        DrmFourcc::Nv12 | DrmFourcc::Nv21 => vec![plane(0), plane(width * 4 * height)],
        _ => vec![plane(0)],
    };
    manager.register_dmabuf(DmabufAttributes::new(width, height, format, planes).unwrap())
}

fn locally_empty(embedded: &EmbeddedBackend<SoftDevice>, id: wst_renderer::SurfaceId) -> bool {
    matches!(embedded.gpu().surface_list().get(id).unwrap().buffer(), BufferState::Empty)
}

fn scale(factor: f32) -> Mat4 {
    Mat4::from_scale(Vec3::new(factor, factor, 1.0))
}

#[rstest]
#[case(OVERLAY_COLOR_MATRIX)]
#[case(OVERLAY_ELEMENT)]
fn hole_punch_rect_is_scaled_geometry(#[case] fast_render: &str) {
    let (mut embedded, manager) = embedded_with(fast_render);
    let id = embedded.surface_create().unwrap();
    embedded.surface_commit(id, Some(shm(&manager, 8, 8))).unwrap();
    embedded.set_geometry(id, Rect::new(10, 10, 100, 100)).unwrap();

    let result = embedded
        .compose_embedded(
            Rect::new(0, 0, 64, 64),
            scale(2.0),
            1.0,
            RenderHints::FAST_PATH | RenderHints::HOLE_PUNCH,
        )
        .unwrap();
    assert!(result.needs_hole_punch);
    assert_eq!(result.rects, vec![Rect::new(20, 20, 200, 200)]);
    assert_eq!(result.offscreen, None);
}

#[test]
fn fast_path_without_hole_punch_reports_nothing() {
    let (mut embedded, manager) = embedded_with(OVERLAY_COLOR_MATRIX);
    let id = embedded.surface_create().unwrap();
    embedded.surface_commit(id, Some(shm(&manager, 8, 8))).unwrap();
    let result = embedded
        .compose_embedded(Rect::new(0, 0, 64, 64), Mat4::IDENTITY, 1.0, RenderHints::FAST_PATH)
        .unwrap();
    assert!(!result.needs_hole_punch);
    assert!(result.rects.is_empty());
}

#[test]
fn delegation_round_trip_keeps_properties() {
    let (mut embedded, manager) = embedded_with(OVERLAY_COLOR_MATRIX);
    let below = embedded.surface_create().unwrap();
    let above = embedded.surface_create().unwrap();
    let buffer = shm(&manager, 16, 16);
    embedded.surface_commit(below, Some(buffer)).unwrap();
    embedded.surface_commit(above, Some(shm(&manager, 4, 4))).unwrap();
    embedded.set_geometry(below, Rect::new(3, 4, 30, 40)).unwrap();
    embedded.set_opacity(below, 0.4).unwrap();
    embedded.set_zorder(below, 0.2).unwrap();
    embedded.set_zorder(above, 0.9).unwrap();
    embedded.set_visible(above, false).unwrap();

    let fast = FrameParams::new(64, 64).with_hints(RenderHints::FAST_PATH);
    embedded.update_scene(&fast).unwrap();
    assert_eq!(embedded.mode(), Mode::Delegated);
    assert_eq!(embedded.delegate().unwrap().surfaces().len(), 2);

    embedded.update_scene(&FrameParams::new(64, 64)).unwrap();
    assert_eq!(embedded.mode(), Mode::Direct);
    assert_eq!(embedded.geometry(below), Some(Rect::new(3, 4, 30, 40)));
    assert_eq!(embedded.opacity(below), Some(0.4));
    assert_eq!(embedded.zorder(below), Some(0.2));
    assert_eq!(embedded.visible(above), Some(false));
    // Implicit size survives too.
    assert_eq!(embedded.geometry(above), Some(Rect::new(0, 0, 4, 4)));
    assert_eq!(embedded.surfaces(), vec![below, above]);
    assert!(embedded.delegate().unwrap().surfaces().is_empty());
}

#[test]
fn commits_while_delegated_resize_after_return() {
    let (mut embedded, manager) = embedded_with(OVERLAY_ELEMENT);
    let id = embedded.surface_create().unwrap();
    embedded.surface_commit(id, Some(shm(&manager, 4, 4))).unwrap();

    let fast = FrameParams::new(64, 64).with_hints(RenderHints::FAST_PATH);
    embedded.update_scene(&fast).unwrap();
    embedded.surface_commit(id, Some(shm(&manager, 12, 6))).unwrap();
    assert_eq!(embedded.geometry(id), Some(Rect::new(0, 0, 12, 6)));

    embedded.update_scene(&FrameParams::new(64, 64)).unwrap();
    assert_eq!(embedded.geometry(id), Some(Rect::new(0, 0, 12, 6)));
    assert_eq!(embedded.gpu().device().draw_log().len(), 1);
}

#[test]
fn terminate_tears_down_delegate() {
    let (mut embedded, manager) = embedded_with(OVERLAY_COLOR_MATRIX);
    let id = embedded.surface_create().unwrap();
    embedded.surface_commit(id, Some(shm(&manager, 4, 4))).unwrap();
    embedded
        .update_scene(&FrameParams::new(64, 64).with_hints(RenderHints::FAST_PATH))
        .unwrap();

    embedded.terminate();
    assert!(embedded.is_terminated());
    assert!(embedded.delegate().unwrap().is_terminated());
    assert!(embedded.surfaces().is_empty());
    assert!(embedded.update_scene(&FrameParams::new(64, 64)).is_err());
}

#[test]
fn dmabuf_surface_is_punched_through_while_delegated() {
    let (mut embedded, manager) = embedded_with(OVERLAY_COLOR_MATRIX);
    let id = embedded.surface_create().unwrap();
    let buffer = dmabuf(&manager, DrmFourcc::Argb8888, 100, 100);
    embedded.surface_commit(id, Some(buffer)).unwrap();
    embedded.set_geometry(id, Rect::new(10, 10, 100, 100)).unwrap();

    let result = embedded
        .compose_embedded(
            Rect::new(0, 0, 64, 64),
            scale(2.0),
            1.0,
            RenderHints::FAST_PATH | RenderHints::HOLE_PUNCH,
        )
        .unwrap();
    assert_eq!(embedded.mode(), Mode::Delegated);
    assert!(result.needs_hole_punch);
    assert_eq!(result.rects, vec![Rect::new(20, 20, 200, 200)]);
    assert!(locally_empty(&embedded, id));

    // Back on the direct path the DMA-BUF is imported locally again.
    embedded.update_scene(&FrameParams::new(64, 64)).unwrap();
    assert_eq!(embedded.mode(), Mode::Direct);
    assert!(!locally_empty(&embedded, id));
    assert_eq!(embedded.geometry(id), Some(Rect::new(10, 10, 100, 100)));
    assert_eq!(embedded.gpu().surface_list().get(id).unwrap().last_resource(), Some(buffer));
    assert_eq!(embedded.gpu().device().draw_log().len(), 1);
}

#[test]
fn content_the_delegate_cannot_show_keeps_the_scene_local() {
    let (mut embedded, manager) = embedded_with(OVERLAY_ELEMENT);
    let plain = embedded.surface_create().unwrap();
    let video = embedded.surface_create().unwrap();
    embedded.surface_commit(plain, Some(shm(&manager, 8, 8))).unwrap();
    // Importable on the GPU, but not a scan-out format of the planes.
    embedded
        .surface_commit(video, Some(dmabuf(&manager, DrmFourcc::Nv21, 16, 16)))
        .unwrap();

    let result = embedded
        .compose_embedded(
            Rect::new(0, 0, 64, 64),
            Mat4::IDENTITY,
            1.0,
            RenderHints::FAST_PATH | RenderHints::HOLE_PUNCH,
        )
        .unwrap();
    assert_eq!(embedded.mode(), Mode::Direct);
    assert!(!result.needs_hole_punch);
    assert!(result.rects.is_empty());
    assert!(embedded.delegate().unwrap().surfaces().is_empty());
    assert_eq!(embedded.counterpart(plain), None);
    assert!(!locally_empty(&embedded, plain));
    assert!(!locally_empty(&embedded, video));
    assert_eq!(embedded.gpu().device().draw_log().len(), 2);

    // Once the unsupported content is gone the fast path engages.
    embedded.surface_commit(video, None).unwrap();
    embedded
        .update_scene(&FrameParams::new(64, 64).with_hints(RenderHints::FAST_PATH))
        .unwrap();
    assert_eq!(embedded.mode(), Mode::Delegated);
    assert_eq!(embedded.delegate().unwrap().surfaces().len(), 2);
}
