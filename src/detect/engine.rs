//! Detection engine: preprocess, tensor decode, filtering, NMS, and the
//! consumer thread that ties them to a frame channel.
//!
//! The engine owns its inference backend for the lifetime of its thread;
//! the backend is released when the loop exits, on every exit path. Model
//! load failure or a missing backend is fatal to this engine only - it
//! enters `Failed` and stops producing detections while the rest of the
//! application continues.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::detect::backend::{InferenceBackend, Tensor};
use crate::detect::result::{BBox, RawDetection};
use crate::frame::{Frame, FrameReceiver};
use crate::{join_with_timeout, STOP_TIMEOUT};

/// How long the consumer blocks on the frame channel before re-checking its
/// stop flag.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Engine lifecycle. `Failed` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Loading,
    Running,
    Stopped,
    Failed,
}

/// Decode and suppression thresholds.
#[derive(Clone, Copy, Debug)]
pub struct DetectorConfig {
    pub conf_threshold: f32,
    pub nms_threshold: f32,
    /// Boxes whose center sits above this normalized y are rejected; road
    /// damage cannot appear in the image's top fifth.
    pub min_center_y: f32,
    /// Normalized area bounds rejecting noise-sized and implausibly large
    /// boxes.
    pub min_area: f32,
    pub max_area: f32,
}

impl DetectorConfig {
    pub fn new(conf_threshold: f32, nms_threshold: f32) -> Self {
        Self {
            conf_threshold,
            nms_threshold,
            ..Self::default()
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            conf_threshold: 0.5,
            nms_threshold: 0.45,
            min_center_y: 0.20,
            min_area: 0.02,
            max_area: 0.80,
        }
    }
}

/// One frame's worth of decoded detections, with the source frame for
/// downstream measurement.
#[derive(Debug)]
pub struct DetectionBatch {
    pub frame: Frame,
    pub detections: Vec<RawDetection>,
}

/// Resize to model input (nearest neighbor), BGR -> RGB, scale to [0,1]
/// float, leading batch dimension. Output is NHWC `[1, height, width, 3]`.
pub fn preprocess(frame: &Frame, height: u32, width: u32) -> Tensor {
    let mut data = Vec::with_capacity((height * width * 3) as usize);
    for oy in 0..height {
        let sy = (oy as u64 * frame.height as u64 / height as u64) as u32;
        for ox in 0..width {
            let sx = (ox as u64 * frame.width as u64 / width as u64) as u32;
            let (b, g, r) = frame.bgr(sx, sy);
            data.push(r as f32 / 255.0);
            data.push(g as f32 / 255.0);
            data.push(b as f32 / 255.0);
        }
    }
    // Shape is valid by construction.
    Tensor::new(vec![1, height as usize, width as usize, 3], data)
        .unwrap_or_else(|_| unreachable!("preprocess emits a consistent shape"))
}

/// Decode raw model tensors into filtered corner-format detections.
///
/// Per anchor: arg-max class and probability; then, in order, reject low
/// confidence, reject center_y above the road band, reject out-of-range
/// area; convert center to corner format and clamp to [0, 1].
pub fn decode_detections(
    boxes: &Tensor,
    scores: &Tensor,
    config: &DetectorConfig,
) -> Result<Vec<RawDetection>> {
    if boxes.last_dim() != 4 {
        return Err(anyhow!(
            "box tensor inner dimension is {}, expected 4",
            boxes.last_dim()
        ));
    }
    if scores.rows() != boxes.rows() {
        return Err(anyhow!(
            "anchor count mismatch: {} boxes vs {} score rows",
            boxes.rows(),
            scores.rows()
        ));
    }
    if scores.last_dim() == 0 {
        return Err(anyhow!("score tensor has no classes"));
    }

    let mut out = Vec::new();
    for anchor in 0..boxes.rows() {
        let probs = scores.row(anchor);
        let (class_idx, confidence) = argmax(probs);

        if confidence < config.conf_threshold {
            continue;
        }

        let [cy, cx, h, w] = match boxes.row(anchor) {
            [cy, cx, h, w] => [*cy, *cx, *h, *w],
            _ => continue,
        };

        if cy < config.min_center_y {
            continue;
        }

        let area = h * w;
        if area < config.min_area || area > config.max_area {
            continue;
        }

        out.push(RawDetection {
            bbox: BBox::from_center(cy, cx, h, w),
            class_idx,
            confidence,
        });
    }
    Ok(out)
}

fn argmax(values: &[f32]) -> (usize, f32) {
    let mut best_idx = 0;
    let mut best = f32::NEG_INFINITY;
    for (idx, &value) in values.iter().enumerate() {
        if value > best {
            best = value;
            best_idx = idx;
        }
    }
    (best_idx, best)
}

/// Intersection-over-Union of two corner-format boxes.
pub fn iou(a: &BBox, b: &BBox) -> f32 {
    let yy1 = a.y1.max(b.y1);
    let xx1 = a.x1.max(b.x1);
    let yy2 = a.y2.min(b.y2);
    let xx2 = a.x2.min(b.x2);

    let inter = (yy2 - yy1).max(0.0) * (xx2 - xx1).max(0.0);
    let union = a.area() + b.area() - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// Greedy non-maximum suppression.
///
/// Boxes are sorted by confidence descending with a stable sort, so equal
/// scores keep decode (anchor) order; nothing downstream relies on that tie
/// order. The highest-scoring remaining box is kept and every remaining box
/// overlapping it beyond `nms_threshold` IoU is discarded, until none
/// remain.
pub fn non_max_suppression(
    mut detections: Vec<RawDetection>,
    nms_threshold: f32,
) -> Vec<RawDetection> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut kept: Vec<RawDetection> = Vec::new();
    let mut remaining = detections;
    while let Some(best) = remaining.first().cloned() {
        remaining.remove(0);
        remaining.retain(|candidate| iou(&best.bbox, &candidate.bbox) <= nms_threshold);
        kept.push(best);
    }
    kept
}

/// Detection engine handle. The worker thread is spawned by `spawn` and
/// owns the backend; the handle exposes state and cooperative stop.
pub struct DetectionEngine {
    state: Arc<Mutex<EngineState>>,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl DetectionEngine {
    /// Spawn the consumer thread. The backend is loaded inside the thread
    /// (Idle -> Loading -> Running); load failure leaves the engine `Failed`
    /// without affecting anything else.
    pub fn spawn(
        load_backend: impl FnOnce() -> Result<Box<dyn InferenceBackend>> + Send + 'static,
        config: DetectorConfig,
        frames: FrameReceiver,
        sink: mpsc::Sender<DetectionBatch>,
    ) -> Self {
        let state = Arc::new(Mutex::new(EngineState::Idle));
        let stop = Arc::new(AtomicBool::new(false));

        let thread_state = state.clone();
        let thread_stop = stop.clone();
        let join = std::thread::Builder::new()
            .name("detection-engine".into())
            .spawn(move || {
                run_loop(load_backend, config, frames, sink, thread_state, thread_stop);
            })
            .ok();
        if join.is_none() {
            log::error!("detection engine: failed to spawn thread");
            set_state(&state, EngineState::Failed);
        }

        Self { state, stop, join }
    }

    pub fn state(&self) -> EngineState {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Request termination and wait up to the bounded stop timeout.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.join.take() {
            join_with_timeout(handle, STOP_TIMEOUT, "detection engine");
        }
    }
}

fn run_loop(
    load_backend: impl FnOnce() -> Result<Box<dyn InferenceBackend>>,
    config: DetectorConfig,
    frames: FrameReceiver,
    sink: mpsc::Sender<DetectionBatch>,
    state: Arc<Mutex<EngineState>>,
    stop: Arc<AtomicBool>,
) {
    set_state(&state, EngineState::Loading);
    let mut backend = match load_backend() {
        Ok(backend) => backend,
        Err(e) => {
            log::error!("detection engine: model load failed: {}", e);
            set_state(&state, EngineState::Failed);
            return;
        }
    };
    let (input_height, input_width) = backend.input_shape();
    log::info!(
        "detection engine running (backend '{}', input {}x{})",
        backend.name(),
        input_width,
        input_height
    );
    set_state(&state, EngineState::Running);

    let mut inference_count = 0u64;
    while !stop.load(Ordering::Relaxed) {
        let Some(frame) = frames.poll(POLL_TIMEOUT) else {
            continue;
        };

        let input = preprocess(&frame, input_height, input_width);
        let outputs = match backend.invoke(&input) {
            Ok(outputs) => outputs,
            Err(e) => {
                log::warn!("detection engine: inference failed: {}", e);
                continue;
            }
        };
        if outputs.len() < 2 {
            log::warn!(
                "detection engine: expected box and score tensors, got {} outputs",
                outputs.len()
            );
            continue;
        }

        let detections = match decode_detections(&outputs[0], &outputs[1], &config) {
            Ok(detections) => non_max_suppression(detections, config.nms_threshold),
            Err(e) => {
                log::warn!("detection engine: decode failed: {}", e);
                continue;
            }
        };

        inference_count += 1;
        if inference_count % 30 == 0 {
            log::debug!("detection engine: {} frames inferred", inference_count);
        }

        if sink.send(DetectionBatch { frame, detections }).is_err() {
            log::info!("detection engine: sink closed, stopping");
            break;
        }
    }

    // Backend (and its model interpreter) released here, on every path.
    drop(backend);
    set_state(&state, EngineState::Stopped);
}

fn set_state(state: &Arc<Mutex<EngineState>>, next: EngineState) {
    let mut guard = state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    // Failed is terminal.
    if *guard != EngineState::Failed {
        *guard = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::backends::StubSsdBackend;
    use crate::frame::frame_channel;

    fn det(bbox: BBox, confidence: f32) -> RawDetection {
        RawDetection {
            bbox,
            class_idx: 0,
            confidence,
        }
    }

    fn tensors(anchors: Vec<([f32; 4], Vec<f32>)>) -> (Tensor, Tensor) {
        let classes = anchors[0].1.len();
        let boxes: Vec<f32> = anchors.iter().flat_map(|(b, _)| b.iter().copied()).collect();
        let scores: Vec<f32> = anchors.iter().flat_map(|(_, s)| s.iter().copied()).collect();
        (
            Tensor::new(vec![1, anchors.len(), 4], boxes).unwrap(),
            Tensor::new(vec![1, anchors.len(), classes], scores).unwrap(),
        )
    }

    #[test]
    fn preprocess_shapes_and_scales() {
        let mut data = vec![0u8; 8 * 8 * 3];
        // top-left pixel pure blue in BGR
        data[0] = 255;
        let frame = Frame::new("cam0", 8, 8, data);
        let tensor = preprocess(&frame, 4, 4);
        assert_eq!(tensor.shape(), &[1, 4, 4, 3]);
        // BGR -> RGB: blue lands in channel 2
        assert_eq!(tensor.data()[0], 0.0);
        assert_eq!(tensor.data()[2], 1.0);
        assert!(tensor.data().iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn decode_applies_filters_in_order() {
        let (boxes, scores) = tensors(vec![
            // kept: confident, low in frame, plausible area
            ([0.6, 0.5, 0.3, 0.3], vec![0.1, 0.1, 0.9, 0.1]),
            // rejected: below confidence threshold
            ([0.6, 0.5, 0.3, 0.3], vec![0.2, 0.1, 0.3, 0.1]),
            // rejected: center in the top fifth
            ([0.1, 0.5, 0.3, 0.3], vec![0.9, 0.0, 0.0, 0.0]),
            // rejected: noise-sized area
            ([0.6, 0.5, 0.05, 0.05], vec![0.0, 0.9, 0.0, 0.0]),
            // rejected: implausibly large area
            ([0.6, 0.5, 0.95, 0.95], vec![0.0, 0.9, 0.0, 0.0]),
        ]);
        let decoded = decode_detections(&boxes, &scores, &DetectorConfig::default()).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].class_idx, 2);
        assert!((decoded[0].confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn decoded_boxes_are_clamped_corners() {
        let (boxes, scores) = tensors(vec![([0.9, 0.9, 0.5, 0.5], vec![0.9, 0.0, 0.0, 0.0])]);
        let decoded = decode_detections(&boxes, &scores, &DetectorConfig::default()).unwrap();
        let bbox = decoded[0].bbox;
        for coord in [bbox.y1, bbox.x1, bbox.y2, bbox.x2] {
            assert!((0.0..=1.0).contains(&coord));
        }
        assert!(bbox.y1 <= bbox.y2 && bbox.x1 <= bbox.x2);
    }

    #[test]
    fn decode_rejects_mismatched_tensors() {
        let boxes = Tensor::new(vec![2, 4], vec![0.0; 8]).unwrap();
        let scores = Tensor::new(vec![3, 4], vec![0.0; 12]).unwrap();
        assert!(decode_detections(&boxes, &scores, &DetectorConfig::default()).is_err());
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = BBox::new(0.0, 0.0, 0.2, 0.2);
        let b = BBox::new(0.5, 0.5, 0.9, 0.9);
        assert_eq!(iou(&a, &b), 0.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn nms_keeps_highest_of_overlapping_pair() {
        // IoU ~0.9, scores 0.9/0.6, threshold 0.45: only the 0.9 box survives.
        let strong = det(BBox::new(0.5, 0.35, 0.8, 0.65), 0.9);
        let weak = det(BBox::new(0.51, 0.36, 0.81, 0.66), 0.6);
        assert!(iou(&strong.bbox, &weak.bbox) > 0.8);

        let kept = non_max_suppression(vec![weak, strong], 0.45);
        assert_eq!(kept.len(), 1);
        assert!((kept[0].confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn nms_kept_boxes_respect_pairwise_iou_bound() {
        let detections = vec![
            det(BBox::new(0.3, 0.1, 0.5, 0.3), 0.95),
            det(BBox::new(0.31, 0.11, 0.51, 0.31), 0.7),
            det(BBox::new(0.6, 0.6, 0.9, 0.9), 0.8),
            det(BBox::new(0.61, 0.62, 0.91, 0.92), 0.75),
            det(BBox::new(0.3, 0.6, 0.45, 0.8), 0.5),
        ];
        let threshold = 0.45;
        let kept = non_max_suppression(detections.clone(), threshold);

        for (i, a) in kept.iter().enumerate() {
            for b in kept.iter().skip(i + 1) {
                assert!(iou(&a.bbox, &b.bbox) <= threshold);
            }
        }
        // Every discarded box overlapped some higher-scoring kept box.
        for original in &detections {
            let discarded = !kept
                .iter()
                .any(|k| (k.confidence - original.confidence).abs() < 1e-9);
            if discarded {
                assert!(kept
                    .iter()
                    .any(|k| k.confidence >= original.confidence
                        && iou(&k.bbox, &original.bbox) > threshold));
            }
        }
    }

    #[test]
    fn engine_runs_stub_pipeline_end_to_end() {
        let (tx, rx) = frame_channel(4);
        let (sink, batches) = mpsc::channel();
        let mut engine = DetectionEngine::spawn(
            || Ok(Box::new(StubSsdBackend::new()) as Box<dyn InferenceBackend>),
            DetectorConfig::default(),
            rx,
            sink,
        );

        tx.offer(Frame::new("cam0", 64, 64, vec![128; 64 * 64 * 3]));

        let batch = batches
            .recv_timeout(Duration::from_secs(5))
            .expect("detection batch");
        assert_eq!(batch.frame.camera_id, "cam0");
        // Stub emits one strong box plus NMS/filter fodder; exactly one survives.
        assert_eq!(batch.detections.len(), 1);
        assert_eq!(batch.detections[0].class_idx, 2);

        engine.stop();
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[test]
    fn load_failure_is_fatal_to_engine_only() {
        let (_tx, rx) = frame_channel(2);
        let (sink, _batches) = mpsc::channel();
        let mut engine = DetectionEngine::spawn(
            || Err(anyhow!("no interpreter available")),
            DetectorConfig::default(),
            rx,
            sink,
        );

        // The engine settles in Failed; stopping it stays Failed.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while engine.state() != EngineState::Failed && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(engine.state(), EngineState::Failed);
        engine.stop();
        assert_eq!(engine.state(), EngineState::Failed);
    }
}
