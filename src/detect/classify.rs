//! Advisory frame-level classification for the secondary camera.
//!
//! Two mutually exclusive modes, selected once at startup:
//! - Dedicated: a classifier model emitting one probability vector
//! - Fallback: the primary detector's per-anchor class tensor, aggregated
//!   by taking each class's maximum over anchors
//!
//! Results are advisory and never persisted. Consumers must check the
//! freshness window and the confidence gate before combining a result with
//! a detection.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::class_label;
use crate::detect::backend::{InferenceBackend, Tensor};
use crate::detect::engine::{preprocess, EngineState};
use crate::frame::FrameReceiver;
use crate::{join_with_timeout, STOP_TIMEOUT};

/// How long a classification result stays eligible for display or
/// combination with a detection.
pub const FRESHNESS_WINDOW: Duration = Duration::from_secs(3);

const POLL_TIMEOUT: Duration = Duration::from_millis(200);

/// Run mode, fixed at startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClassifierMode {
    /// Dedicated classifier model: single probability vector.
    Dedicated,
    /// No dedicated classifier: reuse the primary detector and aggregate
    /// its per-anchor class scores.
    Fallback,
}

/// One advisory classification. Transient; never persisted.
#[derive(Clone, Debug)]
pub struct ClassificationResult {
    pub label: String,
    pub class_idx: usize,
    pub confidence: f32,
    pub produced_at: Instant,
}

impl ClassificationResult {
    /// Still inside the freshness window?
    pub fn is_fresh(&self) -> bool {
        self.produced_at.elapsed() < FRESHNESS_WINDOW
    }

    pub fn meets_gate(&self, min_confidence: f32) -> bool {
        self.confidence >= min_confidence
    }

    /// Eligible for display/combination: fresh and above the gate.
    pub fn is_usable(&self, min_confidence: f32) -> bool {
        self.is_fresh() && self.meets_gate(min_confidence)
    }
}

/// Latest-result slot shared with consumers. Holding only the most recent
/// result is deliberate; staleness is handled by the freshness window.
pub type SharedClassification = Arc<Mutex<Option<ClassificationResult>>>;

pub fn shared_classification() -> SharedClassification {
    Arc::new(Mutex::new(None))
}

/// Arg-max over a single probability vector (dedicated mode).
pub fn argmax_probs(probs: &Tensor) -> Result<(usize, f32)> {
    if probs.data().is_empty() {
        return Err(anyhow!("classifier produced an empty probability vector"));
    }
    let mut best_idx = 0;
    let mut best = f32::NEG_INFINITY;
    for (idx, &value) in probs.data().iter().enumerate() {
        if value > best {
            best = value;
            best_idx = idx;
        }
    }
    Ok((best_idx, best))
}

/// Fallback aggregation over an SSD class tensor `[..., anchors, classes]`:
/// per class take the maximum probability across anchors, then arg-max over
/// classes.
pub fn aggregate_anchor_scores(scores: &Tensor) -> Result<(usize, f32)> {
    let classes = scores.last_dim();
    if classes == 0 || scores.rows() == 0 {
        return Err(anyhow!("class tensor is empty"));
    }
    let mut per_class = vec![f32::NEG_INFINITY; classes];
    for anchor in 0..scores.rows() {
        for (class_idx, &value) in scores.row(anchor).iter().enumerate() {
            if value > per_class[class_idx] {
                per_class[class_idx] = value;
            }
        }
    }
    let mut best_idx = 0;
    let mut best = f32::NEG_INFINITY;
    for (idx, &value) in per_class.iter().enumerate() {
        if value > best {
            best = value;
            best_idx = idx;
        }
    }
    Ok((best_idx, best))
}

/// Classification engine handle, mirroring the detection engine's
/// lifecycle and stop discipline.
pub struct ClassificationEngine {
    state: Arc<Mutex<EngineState>>,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ClassificationEngine {
    /// Spawn the consumer thread. Frames whose camera id differs from
    /// `camera_id` are ignored.
    pub fn spawn(
        load_backend: impl FnOnce() -> Result<Box<dyn InferenceBackend>> + Send + 'static,
        mode: ClassifierMode,
        camera_id: String,
        frames: FrameReceiver,
        slot: SharedClassification,
    ) -> Self {
        let state = Arc::new(Mutex::new(EngineState::Idle));
        let stop = Arc::new(AtomicBool::new(false));

        let thread_state = state.clone();
        let thread_stop = stop.clone();
        let join = std::thread::Builder::new()
            .name("classification-engine".into())
            .spawn(move || {
                run_loop(
                    load_backend,
                    mode,
                    camera_id,
                    frames,
                    slot,
                    thread_state,
                    thread_stop,
                );
            })
            .ok();
        if join.is_none() {
            log::error!("classification engine: failed to spawn thread");
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

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.join.take() {
            join_with_timeout(handle, STOP_TIMEOUT, "classification engine");
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_loop(
    load_backend: impl FnOnce() -> Result<Box<dyn InferenceBackend>>,
    mode: ClassifierMode,
    camera_id: String,
    frames: FrameReceiver,
    slot: SharedClassification,
    state: Arc<Mutex<EngineState>>,
    stop: Arc<AtomicBool>,
) {
    set_state(&state, EngineState::Loading);
    let mut backend = match load_backend() {
        Ok(backend) => backend,
        Err(e) => {
            log::error!("classification engine: model load failed: {}", e);
            set_state(&state, EngineState::Failed);
            return;
        }
    };
    let (input_height, input_width) = backend.input_shape();
    log::info!(
        "classification engine running ({:?} mode, backend '{}')",
        mode,
        backend.name()
    );
    set_state(&state, EngineState::Running);

    while !stop.load(Ordering::Relaxed) {
        let Some(frame) = frames.poll(POLL_TIMEOUT) else {
            continue;
        };
        if frame.camera_id != camera_id {
            continue;
        }

        let input = preprocess(&frame, input_height, input_width);
        let outputs = match backend.invoke(&input) {
            Ok(outputs) => outputs,
            Err(e) => {
                log::warn!("classification engine: inference failed: {}", e);
                continue;
            }
        };

        let classified = match mode {
            ClassifierMode::Dedicated => outputs
                .first()
                .ok_or_else(|| anyhow!("classifier produced no outputs"))
                .and_then(argmax_probs),
            ClassifierMode::Fallback => outputs
                .get(1)
                .ok_or_else(|| anyhow!("detector produced no class tensor"))
                .and_then(aggregate_anchor_scores),
        };
        let (class_idx, confidence) = match classified {
            Ok(result) => result,
            Err(e) => {
                log::warn!("classification engine: {}", e);
                continue;
            }
        };

        let result = ClassificationResult {
            label: class_label(class_idx),
            class_idx,
            confidence,
            produced_at: Instant::now(),
        };
        let mut guard = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Some(result);
    }

    drop(backend);
    set_state(&state, EngineState::Stopped);
}

fn set_state(state: &Arc<Mutex<EngineState>>, next: EngineState) {
    let mut guard = state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if *guard != EngineState::Failed {
        *guard = next;
    }
}
