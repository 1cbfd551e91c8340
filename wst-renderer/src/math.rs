//! Rectangles and the transforms applied to them.

use glam::{Mat4, Vec2, Vec3};

/// Integer rectangle in output or surface coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    /// Corners in triangle-strip order: top-left, top-right, bottom-left,
    /// bottom-right.
    pub fn corners(&self) -> [Vec2; 4] {
        let x0 = self.x as f32;
        let y0 = self.y as f32;
        let x1 = (self.x + self.width) as f32;
        let y1 = (self.y + self.height) as f32;
        [
            Vec2::new(x0, y0),
            Vec2::new(x1, y0),
            Vec2::new(x0, y1),
            Vec2::new(x1, y1),
        ]
    }

    /// Axis-aligned bounds of this rectangle after `matrix`, rounded to the
    /// nearest pixel.
    pub fn transformed(&self, matrix: &Mat4) -> Rect {
        let corners = transform_corners(self.corners(), matrix);
        bounding_rect(&corners)
    }
}

/// Applies `matrix` to each corner (z = 0, w = 1).
pub fn transform_corners(corners: [Vec2; 4], matrix: &Mat4) -> [Vec2; 4] {
    corners.map(|c| matrix.transform_point3(Vec3::new(c.x, c.y, 0.0)).truncate())
}

/// Integer bounding box of a set of points.
pub fn bounding_rect(points: &[Vec2]) -> Rect {
    let (mut min, mut max) = (Vec2::splat(f32::MAX), Vec2::splat(f32::MIN));
    for p in points {
        min = min.min(*p);
        max = max.max(*p);
    }
    if points.is_empty() {
        return Rect::default();
    }
    let x0 = min.x.round() as i32;
    let y0 = min.y.round() as i32;
    let x1 = max.x.round() as i32;
    let y1 = max.y.round() as i32;
    Rect::new(x0, y0, x1 - x0, y1 - y0)
}

/// Maps pixel coordinates `(0,0)-(width,height)` onto clip space with the
/// y axis pointing down, as surfaces are laid out.
pub fn pixel_projection(width: u32, height: u32) -> Mat4 {
    Mat4::orthographic_rh_gl(0.0, width as f32, height as f32, 0.0, -1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_transform_doubles_rect() {
        let rect = Rect::new(10, 10, 100, 100);
        let matrix = Mat4::from_scale(Vec3::new(2.0, 2.0, 1.0));
        assert_eq!(rect.transformed(&matrix), Rect::new(20, 20, 200, 200));
    }

    #[test]
    fn translation_and_identity() {
        let rect = Rect::new(5, 6, 7, 8);
        assert_eq!(rect.transformed(&Mat4::IDENTITY), rect);
        let shifted = rect.transformed(&Mat4::from_translation(Vec3::new(10.0, -6.0, 0.0)));
        assert_eq!(shifted, Rect::new(15, 0, 7, 8));
    }

    #[test]
    fn mirrored_transform_is_normalised() {
        let rect = Rect::new(0, 0, 10, 20);
        let flip = Mat4::from_scale(Vec3::new(-1.0, 1.0, 1.0));
        assert_eq!(rect.transformed(&flip), Rect::new(-10, 0, 10, 20));
    }

    #[test]
    fn projection_maps_corners_to_clip_space() {
        let proj = pixel_projection(100, 50);
        let tl = proj.transform_point3(Vec3::new(0.0, 0.0, 0.0));
        let br = proj.transform_point3(Vec3::new(100.0, 50.0, 0.0));
        assert!((tl.x + 1.0).abs() < 1e-5 && (tl.y - 1.0).abs() < 1e-5);
        assert!((br.x - 1.0).abs() < 1e-5 && (br.y + 1.0).abs() < 1e-5);
    }
}
