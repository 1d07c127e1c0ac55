/// Normalized bounding box in corner format. Coordinates lie in [0, 1]
/// after clamping, with `y1 <= y2` and `x1 <= x2`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BBox {
    pub y1: f32,
    pub x1: f32,
    pub y2: f32,
    pub x2: f32,
}

impl BBox {
    pub fn new(y1: f32, x1: f32, y2: f32, x2: f32) -> Self {
        Self { y1, x1, y2, x2 }
    }

    /// Convert center format (cy, cx, h, w) to corner format, clamping every
    /// coordinate to [0, 1].
    pub fn from_center(cy: f32, cx: f32, h: f32, w: f32) -> Self {
        Self {
            y1: cy - h / 2.0,
            x1: cx - w / 2.0,
            y2: cy + h / 2.0,
            x2: cx + w / 2.0,
        }
        .clamp_unit()
    }

    /// Clamp every coordinate to [0, 1].
    pub fn clamp_unit(self) -> Self {
        Self {
            y1: self.y1.clamp(0.0, 1.0),
            x1: self.x1.clamp(0.0, 1.0),
            y2: self.y2.clamp(0.0, 1.0),
            x2: self.x2.clamp(0.0, 1.0),
        }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).abs()
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).abs()
    }

    /// Corner-format area, `(y2 - y1) * (x2 - x1)`.
    pub fn area(&self) -> f32 {
        (self.y2 - self.y1) * (self.x2 - self.x1)
    }

    /// Lower edge of the box; the ground-contact line for measurement.
    pub fn bottom(&self) -> f32 {
        self.y1.max(self.y2)
    }
}

/// One decoded, filtered detection: transient, pre-measurement.
#[derive(Clone, Debug)]
pub struct RawDetection {
    pub bbox: BBox,
    pub class_idx: usize,
    pub confidence: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn center_conversion_clamps_to_unit() {
        let bbox = BBox::from_center(0.1, 0.95, 0.4, 0.3);
        assert_eq!(bbox.y1, 0.0);
        assert!(bbox.x2 <= 1.0);
        assert!(bbox.y1 <= bbox.y2 && bbox.x1 <= bbox.x2);
    }

    #[test]
    fn area_matches_corner_product() {
        let bbox = BBox::new(0.2, 0.1, 0.6, 0.5);
        assert!((bbox.area() - 0.16).abs() < 1e-6);
        assert!((bbox.bottom() - 0.6).abs() < 1e-6);
    }
}
