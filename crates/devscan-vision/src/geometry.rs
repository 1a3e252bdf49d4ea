use serde::{Deserialize, Serialize};

/// Axis-aligned box in image-pixel space. `x1 < x2`, `y1 < y2` for a
/// well-formed box; degenerate boxes are tolerated and behave as zero-area.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn centroid(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// Symmetric expansion by `ratio` of own width/height, clamped to the
    /// image bounds. Gives crops some context around the object.
    pub fn padded(&self, ratio: f32, max_w: f32, max_h: f32) -> Self {
        let dx = self.width() * ratio;
        let dy = self.height() * ratio;
        Self {
            x1: (self.x1 - dx).clamp(0.0, max_w),
            y1: (self.y1 - dy).clamp(0.0, max_h),
            x2: (self.x2 + dx).clamp(0.0, max_w),
            y2: (self.y2 + dy).clamp(0.0, max_h),
        }
    }

    pub fn scaled(&self, sx: f32, sy: f32) -> Self {
        Self {
            x1: self.x1 * sx,
            y1: self.y1 * sy,
            x2: self.x2 * sx,
            y2: self.y2 * sy,
        }
    }
}

/// Intersection-over-union in [0, 1]. Returns 0 for disjoint or degenerate
/// boxes rather than dividing by zero.
pub fn iou(a: &BBox, b: &BBox) -> f32 {
    let ix = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let iy = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let inter = ix * iy;
    let union = a.area() + b.area() - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// Fraction of `inner`'s area that lies inside `outer`. Catches nested boxes
/// whose IoU stays low because of a large size mismatch.
pub fn containment(outer: &BBox, inner: &BBox) -> f32 {
    let inner_area = inner.area();
    if inner_area <= 0.0 {
        return 0.0;
    }
    let ix = (outer.x2.min(inner.x2) - outer.x1.max(inner.x1)).max(0.0);
    let iy = (outer.y2.min(inner.y2) - outer.y1.max(inner.y1)).max(0.0);
    (ix * iy) / inner_area
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bx(x1: f32, y1: f32, x2: f32, y2: f32) -> BBox {
        BBox::new(x1, y1, x2, y2)
    }

    #[test]
    fn iou_identity_and_symmetry() {
        let a = bx(0.0, 0.0, 10.0, 10.0);
        let b = bx(5.0, 5.0, 15.0, 15.0);
        assert_eq!(iou(&a, &a), 1.0);
        assert_eq!(iou(&a, &b), iou(&b, &a));
        let v = iou(&a, &b);
        assert!(v > 0.0 && v < 1.0);
    }

    #[test]
    fn iou_disjoint_is_zero() {
        let a = bx(0.0, 0.0, 10.0, 10.0);
        let b = bx(20.0, 20.0, 30.0, 30.0);
        assert_eq!(iou(&a, &b), 0.0);
    }

    #[test]
    fn iou_degenerate_is_zero() {
        let a = bx(5.0, 5.0, 5.0, 5.0);
        let b = bx(0.0, 0.0, 10.0, 10.0);
        assert_eq!(iou(&a, &b), 0.0);
        assert_eq!(iou(&a, &a), 0.0);
        // inverted coordinates behave as zero-area, not as a panic
        let inv = bx(10.0, 10.0, 0.0, 0.0);
        assert_eq!(iou(&inv, &b), 0.0);
    }

    #[test]
    fn containment_of_nested_box() {
        let desk = bx(0.0, 0.0, 100.0, 100.0);
        let laptop = bx(10.0, 10.0, 30.0, 30.0);
        // fully nested: low IoU, full containment
        assert!(iou(&desk, &laptop) < 0.1);
        assert_eq!(containment(&desk, &laptop), 1.0);
        // half overlap
        let half = bx(90.0, 0.0, 110.0, 100.0);
        assert!((containment(&desk, &half) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn padded_clamps_to_image_bounds() {
        let b = bx(5.0, 5.0, 15.0, 15.0);
        let p = b.padded(0.5, 18.0, 18.0);
        assert_eq!(p.x1, 0.0);
        assert_eq!(p.y1, 0.0);
        assert_eq!(p.x2, 18.0);
        assert_eq!(p.y2, 18.0);
    }

    #[test]
    fn scale_and_centroid() {
        let b = bx(2.0, 4.0, 6.0, 8.0);
        assert_eq!(b.centroid(), (4.0, 6.0));
        let s = b.scaled(2.0, 0.5);
        assert_eq!(s, bx(4.0, 2.0, 12.0, 4.0));
        assert_eq!(b.area(), 16.0);
    }
}
