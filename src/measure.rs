//! Monocular measurement of detected road damage.
//!
//! Width and depth are derived from the detection's bounding box, the source
//! frame, and a per-camera calibration profile using a pinhole/ground-plane
//! model. No learned model is involved; every output is clamped and the
//! computation never fails (a malformed ROI yields neutral edge metrics and
//! baseline-only estimates).
//!
//! The blending and depth constants are empirically chosen heuristics kept
//! verbatim from the field-tuned deployment; they live in `MeasureTuning`
//! rather than being re-derived.

use crate::detect::result::BBox;
use crate::frame::Frame;

/// Static per-camera calibration, loaded once and shared read-only.
#[derive(Clone, Copy, Debug)]
pub struct CalibrationProfile {
    /// Focal length in pixel units.
    pub focal_length_px: f32,
    /// Physical pixel pitch in millimeters.
    pub pixel_size_mm: f32,
    /// Camera mount height above the road surface, in centimeters.
    pub mount_height_cm: f32,
}

/// Tunable measurement constants. Defaults match the deployed heuristics.
#[derive(Clone, Copy, Debug)]
pub struct MeasureTuning {
    /// Pixel offsets from image center below this are treated as undefined
    /// distance; the mount height is returned directly.
    pub dead_zone_px: f32,
    pub distance_min_cm: f32,
    pub distance_max_cm: f32,
    /// Columns/rows count toward an edge span when their edge-intensity sum
    /// exceeds this fraction of the profile maximum.
    pub span_threshold_frac: f32,
    /// Sobel gradient magnitude above which a pixel is an edge.
    pub edge_magnitude_threshold: f32,
    /// ROIs smaller than this on either side yield neutral edge metrics.
    pub min_roi_px: u32,
    pub blend_base: f32,
    pub blend_gain: f32,
    pub blend_max: f32,
    /// Edge strength is mean normalized edge intensity times this, capped at 1.
    pub strength_gain: f32,
    /// Normalized bbox area below this uses the deep branch of the area
    /// heuristic.
    pub area_split: f32,
    pub deep_scale: f32,
    pub shallow_scale: f32,
    /// Grayscale intensity variance is normalized by this before use.
    pub variance_norm: f32,
    pub variance_depth_max: f32,
    pub depth_nudge_max: f32,
    pub depth_min_cm: f32,
    pub depth_max_cm: f32,
}

impl Default for MeasureTuning {
    fn default() -> Self {
        Self {
            dead_zone_px: 10.0,
            distance_min_cm: 50.0,
            distance_max_cm: 500.0,
            span_threshold_frac: 0.2,
            edge_magnitude_threshold: 100.0,
            min_roi_px: 5,
            blend_base: 0.4,
            blend_gain: 0.4,
            blend_max: 0.8,
            strength_gain: 2.0,
            area_split: 0.5,
            deep_scale: 15.0,
            shallow_scale: 3.0,
            variance_norm: 10_000.0,
            variance_depth_max: 10.0,
            depth_nudge_max: 3.0,
            depth_min_cm: 0.5,
            depth_max_cm: 20.0,
        }
    }
}

/// Physical measurement of one detection, rounded to one decimal place.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Measurement {
    pub width_cm: f32,
    pub depth_cm: f32,
}

/// Edge metrics computed over a bounding-box ROI.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct EdgeMetrics {
    /// Count of columns whose edge-intensity sum clears the span threshold.
    pub width_px: u32,
    /// Count of rows whose edge-intensity sum clears the span threshold.
    pub height_px: u32,
    /// Mean normalized edge intensity, scaled and capped to [0, 1].
    pub strength: f32,
}

pub struct MeasurementEngine {
    calibration: CalibrationProfile,
    tuning: MeasureTuning,
}

impl MeasurementEngine {
    pub fn new(calibration: CalibrationProfile) -> Self {
        Self {
            calibration,
            tuning: MeasureTuning::default(),
        }
    }

    pub fn with_tuning(mut self, tuning: MeasureTuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn calibration(&self) -> &CalibrationProfile {
        &self.calibration
    }

    /// Ground-plane distance to the bbox's lower edge, in centimeters,
    /// clamped to the configured range. Not persisted; a helper for width.
    pub fn distance_cm(&self, bbox_bottom_y: f32, image_height: u32) -> f32 {
        let bottom_px = bbox_bottom_y * image_height as f32;
        let center_y = image_height as f32 / 2.0;
        let offset_px = (bottom_px - center_y).abs();

        if offset_px < self.tuning.dead_zone_px {
            // Too close to the vertical center for the ground-plane model.
            return self.calibration.mount_height_cm;
        }

        let distance = self.calibration.mount_height_cm * self.calibration.focal_length_px
            / offset_px;
        distance.clamp(self.tuning.distance_min_cm, self.tuning.distance_max_cm)
    }

    /// Baseline width estimate from the bbox alone, rounded to one decimal.
    pub fn estimate_width(&self, bbox: &BBox, image_width: u32, image_height: u32) -> f32 {
        let distance = self.distance_cm(bbox.bottom(), image_height);
        let pixel_width = bbox.width() * image_width as f32;
        round1(pixel_width * distance / self.calibration.focal_length_px)
    }

    /// Depth estimate from bbox area plus optional intensity variance,
    /// clamped to the configured range and rounded to one decimal.
    pub fn estimate_depth(&self, bbox: &BBox, variance: Option<f32>) -> f32 {
        let area = bbox.width() * bbox.height();
        let area_depth = if area < self.tuning.area_split {
            self.tuning.deep_scale * (1.0 - area)
        } else {
            self.tuning.shallow_scale * (1.0 - area)
        };

        let depth = match variance {
            Some(variance) => {
                let variance_depth = (variance * self.tuning.variance_depth_max)
                    .min(self.tuning.variance_depth_max);
                (area_depth + variance_depth) / 2.0
            }
            None => area_depth,
        };

        round1(depth.clamp(self.tuning.depth_min_cm, self.tuning.depth_max_cm))
    }

    /// Grayscale intensity variance inside the bbox, normalized to [0, 1].
    /// An empty crop yields 0.0.
    pub fn intensity_variance(&self, frame: &Frame, bbox: &BBox) -> f32 {
        let Some(roi) = RoiRect::from_bbox(bbox, frame.width, frame.height) else {
            return 0.0;
        };

        let mut sum = 0.0f64;
        let mut sum_sq = 0.0f64;
        let count = (roi.w as u64 * roi.h as u64) as f64;
        for y in roi.y0..roi.y0 + roi.h {
            for x in roi.x0..roi.x0 + roi.w {
                let value = frame.gray(x, y) as f64;
                sum += value;
                sum_sq += value * value;
            }
        }
        let mean = sum / count;
        let variance = (sum_sq / count - mean * mean).max(0.0) as f32;

        (variance / self.tuning.variance_norm).min(1.0)
    }

    /// Edge metrics inside the bbox ROI: grayscale, 3x3 box blur, Sobel
    /// gradient magnitude thresholded into a binary edge map, then
    /// column/row profiles. Degenerate ROIs yield all-zero metrics.
    pub fn edge_metrics(&self, frame: &Frame, bbox: &BBox) -> EdgeMetrics {
        let min = self.tuning.min_roi_px;
        let Some(roi) = RoiRect::from_bbox(bbox, frame.width, frame.height) else {
            return EdgeMetrics::default();
        };
        if roi.w < min || roi.h < min {
            return EdgeMetrics::default();
        }

        let w = roi.w as usize;
        let h = roi.h as usize;

        let mut gray = vec![0.0f32; w * h];
        for y in 0..h {
            for x in 0..w {
                gray[y * w + x] = frame.gray(roi.x0 + x as u32, roi.y0 + y as u32);
            }
        }

        let blurred = box_blur_3x3(&gray, w, h);

        // Binary edge map from thresholded Sobel magnitude, 0 or 255.
        let mut edges = vec![0u8; w * h];
        for y in 1..h - 1 {
            for x in 1..w - 1 {
                let gx = -blurred[(y - 1) * w + x - 1] + blurred[(y - 1) * w + x + 1]
                    - 2.0 * blurred[y * w + x - 1]
                    + 2.0 * blurred[y * w + x + 1]
                    - blurred[(y + 1) * w + x - 1]
                    + blurred[(y + 1) * w + x + 1];
                let gy = -blurred[(y - 1) * w + x - 1]
                    - 2.0 * blurred[(y - 1) * w + x]
                    - blurred[(y - 1) * w + x + 1]
                    + blurred[(y + 1) * w + x - 1]
                    + 2.0 * blurred[(y + 1) * w + x]
                    + blurred[(y + 1) * w + x + 1];
                if (gx * gx + gy * gy).sqrt() > self.tuning.edge_magnitude_threshold {
                    edges[y * w + x] = 255;
                }
            }
        }

        let mut column_profile = vec![0u32; w];
        let mut row_profile = vec![0u32; h];
        let mut total = 0u64;
        for y in 0..h {
            for x in 0..w {
                let value = edges[y * w + x] as u32;
                column_profile[x] += value;
                row_profile[y] += value;
                total += value as u64;
            }
        }

        let column_max = column_profile.iter().copied().max().unwrap_or(0);
        let row_max = row_profile.iter().copied().max().unwrap_or(0);
        if column_max == 0 || row_max == 0 {
            return EdgeMetrics::default();
        }

        let column_threshold = self.tuning.span_threshold_frac * column_max as f32;
        let row_threshold = self.tuning.span_threshold_frac * row_max as f32;
        let width_px = column_profile
            .iter()
            .filter(|&&sum| sum as f32 > column_threshold)
            .count() as u32;
        let height_px = row_profile
            .iter()
            .filter(|&&sum| sum as f32 > row_threshold)
            .count() as u32;

        let mean = total as f32 / (w * h) as f32;
        let strength = ((mean / 255.0) * self.tuning.strength_gain).min(1.0);

        EdgeMetrics {
            width_px,
            height_px,
            strength,
        }
    }

    /// Measure both width and depth of one detection, with edge-based
    /// refinement. Deterministic; never fails.
    pub fn measure(&self, frame: &Frame, bbox: &BBox) -> Measurement {
        let baseline_width = self.estimate_width(bbox, frame.width, frame.height);

        let edges = self.edge_metrics(frame, bbox);
        let width_cm = if edges.width_px > 0 {
            let distance = self.distance_cm(bbox.bottom(), frame.height);
            let edge_width =
                edges.width_px as f32 * distance / self.calibration.focal_length_px;
            let blend = (self.tuning.blend_base + self.tuning.blend_gain * edges.strength)
                .min(self.tuning.blend_max);
            round1(blend * edge_width + (1.0 - blend) * baseline_width)
        } else {
            baseline_width
        };

        let variance = self.intensity_variance(frame, bbox);
        let mut depth_cm = self.estimate_depth(bbox, Some(variance));

        // Vertical edge presence nudges depth upward (more relief, deeper).
        if edges.height_px > 0 {
            let nudge = (self.tuning.depth_nudge_max * edges.strength)
                .min(self.tuning.depth_nudge_max);
            depth_cm = round1((depth_cm + nudge).min(self.tuning.depth_max_cm));
        }

        Measurement { width_cm, depth_cm }
    }
}

/// Pixel-space ROI clamped to the frame. `None` when the crop is empty.
#[derive(Clone, Copy, Debug)]
struct RoiRect {
    x0: u32,
    y0: u32,
    w: u32,
    h: u32,
}

impl RoiRect {
    fn from_bbox(bbox: &BBox, image_width: u32, image_height: u32) -> Option<Self> {
        let clamp_px = |norm: f32, max: u32| -> u32 {
            ((norm * max as f32) as i64).clamp(0, max.saturating_sub(1) as i64) as u32
        };
        let x0 = clamp_px(bbox.x1.min(bbox.x2), image_width);
        let x1 = clamp_px(bbox.x1.max(bbox.x2), image_width);
        let y0 = clamp_px(bbox.y1.min(bbox.y2), image_height);
        let y1 = clamp_px(bbox.y1.max(bbox.y2), image_height);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(Self {
            x0,
            y0,
            w: x1 - x0,
            h: y1 - y0,
        })
    }
}

fn box_blur_3x3(gray: &[f32], w: usize, h: usize) -> Vec<f32> {
    let mut out = gray.to_vec();
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let mut sum = 0.0;
            for dy in 0..3 {
                for dx in 0..3 {
                    sum += gray[(y + dy - 1) * w + (x + dx - 1)];
                }
            }
            out[y * w + x] = sum / 9.0;
        }
    }
    out
}

fn round1(value: f32) -> f32 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> MeasurementEngine {
        MeasurementEngine::new(CalibrationProfile {
            focal_length_px: 800.0,
            pixel_size_mm: 0.00375,
            mount_height_cm: 150.0,
        })
    }

    fn flat_frame(width: u32, height: u32, value: u8) -> Frame {
        Frame::new("cam0", width, height, vec![value; (width * height * 3) as usize])
    }

    /// A frame with a dark rectangular "pothole" on a light background,
    /// giving the edge pass something real to find.
    fn pothole_frame(width: u32, height: u32) -> Frame {
        let mut data = vec![200u8; (width * height * 3) as usize];
        for y in (height / 2)..(height * 3 / 4) {
            for x in (width / 4)..(width / 2) {
                let idx = ((y * width + x) * 3) as usize;
                data[idx] = 20;
                data[idx + 1] = 20;
                data[idx + 2] = 20;
            }
        }
        Frame::new("cam0", width, height, data)
    }

    #[test]
    fn distance_clamps_at_far_range() {
        // focal 800, mount 150, bottom y 0.9 on a 480px frame:
        // offset = |432 - 240| = 192, distance = 150*800/192 = 625 -> 500.
        let engine = engine();
        assert_eq!(engine.distance_cm(0.9, 480), 500.0);
    }

    #[test]
    fn distance_dead_zone_returns_mount_height() {
        let engine = engine();
        // bottom y 0.51 on 480px -> offset 4.8px, inside the 10px dead zone
        assert_eq!(engine.distance_cm(0.51, 480), 150.0);
    }

    #[test]
    fn distance_clamps_at_near_range() {
        let engine = engine();
        // bottom at the frame edge: offset 240px -> 500cm raw, still in range;
        // a taller offset forces the near clamp
        let raw = engine.distance_cm(1.0, 5000);
        assert!(raw >= 50.0);
    }

    #[test]
    fn width_scales_with_bbox_and_distance() {
        let engine = engine();
        let bbox = BBox::new(0.5, 0.4, 0.9, 0.6);
        // distance = 500 (clamped), pixel width = 0.2*640 = 128
        // width = 128 * 500 / 800 = 80.0
        assert_eq!(engine.estimate_width(&bbox, 640, 480), 80.0);
    }

    #[test]
    fn depth_area_heuristic_is_piecewise() {
        let engine = engine();
        let small = BBox::new(0.4, 0.4, 0.5, 0.5); // area 0.01
        let large = BBox::new(0.1, 0.1, 0.9, 0.9); // area 0.64
        let shallow = engine.estimate_depth(&large, None);
        let deep = engine.estimate_depth(&small, None);
        assert!(deep > shallow);
        assert!((deep - 14.9).abs() < 1e-3); // 15 * (1 - 0.01), rounded
        assert!((shallow - 1.1).abs() < 1e-3); // 3 * (1 - 0.64), rounded
    }

    #[test]
    fn depth_stays_in_clamped_range() {
        let engine = engine();
        for (y1, x1, y2, x2) in [
            (0.0, 0.0, 1.0, 1.0),
            (0.3, 0.3, 0.31, 0.31),
            (0.2, 0.1, 0.9, 0.95),
        ] {
            let bbox = BBox::new(y1, x1, y2, x2);
            for variance in [None, Some(0.0), Some(0.5), Some(1.0)] {
                let depth = engine.estimate_depth(&bbox, variance);
                assert!((0.5..=20.0).contains(&depth), "depth {} out of range", depth);
            }
        }
    }

    #[test]
    fn flat_roi_has_no_edges_and_zero_variance() {
        let engine = engine();
        let frame = flat_frame(64, 64, 128);
        let bbox = BBox::new(0.25, 0.25, 0.75, 0.75);
        assert_eq!(engine.edge_metrics(&frame, &bbox), EdgeMetrics::default());
        assert_eq!(engine.intensity_variance(&frame, &bbox), 0.0);
    }

    #[test]
    fn empty_roi_is_neutral_not_an_error() {
        let engine = engine();
        let frame = flat_frame(64, 64, 128);
        let degenerate = BBox::new(0.5, 0.5, 0.5, 0.5);
        assert_eq!(engine.edge_metrics(&frame, &degenerate), EdgeMetrics::default());
        assert_eq!(engine.intensity_variance(&frame, &degenerate), 0.0);
        let m = engine.measure(&frame, &degenerate);
        assert!(m.width_cm >= 0.0);
        assert!((0.5..=20.0).contains(&m.depth_cm));
    }

    #[test]
    fn contrasting_roi_produces_edge_spans() {
        let engine = engine();
        let frame = pothole_frame(128, 128);
        let bbox = BBox::new(0.45, 0.2, 0.8, 0.55);
        let edges = engine.edge_metrics(&frame, &bbox);
        assert!(edges.width_px > 0);
        assert!(edges.height_px > 0);
        assert!(edges.strength > 0.0 && edges.strength <= 1.0);
        assert!(engine.intensity_variance(&frame, &bbox) > 0.0);
    }

    #[test]
    fn measure_outputs_are_rounded_and_clamped() {
        let engine = engine();
        let frame = pothole_frame(128, 128);
        for bbox in [
            BBox::new(0.45, 0.2, 0.8, 0.55),
            BBox::new(0.6, 0.1, 0.95, 0.9),
            BBox::new(0.3, 0.48, 0.9, 0.52),
        ] {
            let m = engine.measure(&frame, &bbox);
            assert!(m.width_cm >= 0.0);
            assert!((0.5..=20.0).contains(&m.depth_cm));
            // one decimal place
            assert!((m.width_cm * 10.0 - (m.width_cm * 10.0).round()).abs() < 1e-3);
            assert!((m.depth_cm * 10.0 - (m.depth_cm * 10.0).round()).abs() < 1e-3);
        }
    }
}
