//! Attribute lists for `eglCreateImageKHR`.
//!
//! The lists are plain `EGLAttrib` vectors terminated by `EGL_NONE`, built
//! without touching EGL so both the GLES device and the software device can
//! consume them.

use drm_fourcc::{DrmFourcc, DrmModifier};
use wst_buffer_manager::{DmabufAttributes, DmabufPlane};

pub const EGL_NONE: isize = 0x3038;
pub const EGL_WIDTH: isize = 0x3057;
pub const EGL_HEIGHT: isize = 0x3056;
pub const EGL_NATIVE_PIXMAP_KHR: u32 = 0x30B0;
pub const EGL_IMAGE_PRESERVED_KHR: isize = 0x30D2;
pub const EGL_TRUE: isize = 1;

pub const EGL_WAYLAND_BUFFER_WL: u32 = 0x31D5;
pub const EGL_WAYLAND_PLANE_WL: isize = 0x31D6;

pub const EGL_LINUX_DMA_BUF_EXT: u32 = 0x3270;
pub const EGL_LINUX_DRM_FOURCC_EXT: isize = 0x3271;

/// `(fd, offset, pitch, modifier_lo, modifier_hi)` attribute names per plane.
const PLANE_ATTRIBS: [[isize; 5]; 4] = [
    [0x3272, 0x3273, 0x3274, 0x3443, 0x3444],
    [0x3275, 0x3276, 0x3277, 0x3445, 0x3446],
    [0x3278, 0x3279, 0x327A, 0x3447, 0x3448],
    [0x3440, 0x3441, 0x3442, 0x3449, 0x344A],
];

/// Attribute list builder.
#[derive(Debug, Default, Clone)]
pub struct AttribList {
    attribs: Vec<isize>,
}

impl AttribList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: isize, value: isize) -> &mut Self {
        self.attribs.push(name);
        self.attribs.push(value);
        self
    }

    /// Looks up the value stored for `name`.
    pub fn get(&self, name: isize) -> Option<isize> {
        self.attribs
            .chunks_exact(2)
            .find(|pair| pair[0] == name)
            .map(|pair| pair[1])
    }

    /// Terminates the list with `EGL_NONE`.
    pub fn finish(mut self) -> Vec<isize> {
        self.attribs.push(EGL_NONE);
        self.attribs
    }
}

/// Reads `name` out of a finished list.
pub fn lookup(attribs: &[isize], name: isize) -> Option<isize> {
    attribs
        .chunks_exact(2)
        .take_while(|pair| pair[0] != EGL_NONE)
        .find(|pair| pair[0] == name)
        .map(|pair| pair[1])
}

fn push_plane(list: &mut AttribList, index: usize, plane: &DmabufPlane, with_modifier: bool) {
    let names = PLANE_ATTRIBS[index];
    list.push(names[0], plane.fd as isize)
        .push(names[1], plane.offset as isize)
        .push(names[2], plane.stride as isize);
    if with_modifier && plane.modifier != DrmModifier::Invalid {
        let modifier = u64::from(plane.modifier);
        list.push(names[3], (modifier & 0xFFFF_FFFF) as isize)
            .push(names[4], (modifier >> 32) as isize);
    }
}

/// Full multi-plane import of a DMA-BUF. Modifier attributes are only
/// emitted for planes whose modifier is known, and only when the driver
/// accepts them.
pub fn dmabuf_image(attrs: &DmabufAttributes, with_modifiers: bool) -> Vec<isize> {
    let mut list = AttribList::new();
    list.push(EGL_WIDTH, attrs.width as isize)
        .push(EGL_HEIGHT, attrs.height as isize)
        .push(EGL_LINUX_DRM_FOURCC_EXT, attrs.format as u32 as isize);
    for (index, plane) in attrs.planes().iter().enumerate() {
        push_plane(&mut list, index, plane, with_modifiers);
    }
    list.finish()
}

/// Single-plane import of one plane of a semi-planar YUV buffer, as `R8`
/// for luma or `GR88` for the interleaved chroma.
pub fn dmabuf_plane_image(
    plane: &DmabufPlane,
    format: DrmFourcc,
    width: u32,
    height: u32,
    with_modifiers: bool,
) -> Vec<isize> {
    let mut list = AttribList::new();
    list.push(EGL_WIDTH, width as isize)
        .push(EGL_HEIGHT, height as isize)
        .push(EGL_LINUX_DRM_FOURCC_EXT, format as u32 as isize);
    push_plane(&mut list, 0, plane, with_modifiers);
    list.finish()
}

/// Import of plane `plane` of a wayland-egl buffer.
pub fn wayland_plane_image(plane: usize) -> Vec<isize> {
    let mut list = AttribList::new();
    list.push(EGL_WAYLAND_PLANE_WL, plane as isize)
        .push(EGL_IMAGE_PRESERVED_KHR, EGL_TRUE);
    list.finish()
}

/// Import of a native pixmap.
pub fn native_pixmap_image() -> Vec<isize> {
    let mut list = AttribList::new();
    list.push(EGL_IMAGE_PRESERVED_KHR, EGL_TRUE);
    list.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn plane(fd: i32, modifier: DrmModifier) -> DmabufPlane {
        DmabufPlane {
            fd,
            offset: 16,
            stride: 256,
            modifier,
        }
    }

    #[test]
    fn dmabuf_list_without_modifiers() {
        let attrs = DmabufAttributes::new(64, 32, DrmFourcc::Argb8888, vec![plane(5, DrmModifier::Invalid)]).unwrap();
        let list = dmabuf_image(&attrs, true);
        assert_eq!(
            list,
            vec![
                EGL_WIDTH, 64,
                EGL_HEIGHT, 32,
                EGL_LINUX_DRM_FOURCC_EXT, DrmFourcc::Argb8888 as u32 as isize,
                0x3272, 5,
                0x3273, 16,
                0x3274, 256,
                EGL_NONE,
            ]
        );
    }

    #[test]
    fn dmabuf_list_splits_modifier_per_plane() {
        let modifier = DrmModifier::from(0x0100_0000_0000_0002u64);
        let attrs = DmabufAttributes::new(
            64,
            64,
            DrmFourcc::Nv12,
            vec![plane(3, modifier), plane(4, modifier)],
        )
        .unwrap();
        let list = dmabuf_image(&attrs, true);
        assert_eq!(lookup(&list, 0x3443), Some(2));
        assert_eq!(lookup(&list, 0x3444), Some(0x0100_0000));
        assert_eq!(lookup(&list, 0x3275), Some(4));
        assert_eq!(lookup(&list, 0x3446), Some(0x0100_0000));

        let stripped = dmabuf_image(&attrs, false);
        assert_eq!(lookup(&stripped, 0x3443), None);
        assert_eq!(stripped.last(), Some(&EGL_NONE));
    }

    #[test]
    fn fourth_plane_uses_extended_names() {
        let planes = (0..4).map(|fd| plane(fd, DrmModifier::Linear)).collect();
        let attrs = DmabufAttributes::new(8, 8, DrmFourcc::Yuv420, planes).unwrap();
        let list = dmabuf_image(&attrs, true);
        assert_eq!(lookup(&list, 0x3440), Some(3));
        assert_eq!(lookup(&list, 0x3449), Some(0));
        assert_eq!(lookup(&list, 0x344A), Some(0));
    }

    #[test]
    fn wayland_plane_list() {
        let list = wayland_plane_image(1);
        assert_eq!(lookup(&list, EGL_WAYLAND_PLANE_WL), Some(1));
        assert_eq!(lookup(&list, EGL_IMAGE_PRESERVED_KHR), Some(EGL_TRUE));
    }
}
