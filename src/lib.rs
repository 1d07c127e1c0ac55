//! roadwatch - road damage detection pipeline
//!
//! Two camera workers feed bounded frame channels. Camera A's frames go to a
//! detection engine that decodes an SSD-style model's output tensors into
//! damage detections; camera B's frames go to a classification engine that
//! produces an advisory frame-level label. Detections are measured (physical
//! width/depth from monocular ground-plane geometry), appended to a local
//! sqlite log, and synchronized at-least-once to a remote store.
//!
//! # Module Structure
//!
//! - `frame`: owned BGR frames and the bounded drop-on-full handoff channel
//! - `ingest`: camera sources and capture worker threads
//! - `detect`: inference backends, detection decode/NMS, classification
//! - `measure`: monocular width/depth measurement
//! - `storage`: append-only local detection log
//! - `sync`: remote store contract and retrying sync client
//! - `config`: file + environment configuration

use std::time::Duration;

pub mod config;
pub mod detect;
pub mod frame;
pub mod ingest;
pub mod measure;
pub mod storage;
pub mod sync;

pub use config::RoadwatchConfig;
pub use detect::classify::{ClassificationEngine, ClassificationResult, SharedClassification};
pub use detect::engine::{DetectionBatch, DetectionEngine, DetectorConfig, EngineState};
pub use detect::result::{BBox, RawDetection};
pub use frame::{frame_channel, Frame, FrameReceiver, FrameSender};
pub use ingest::camera::{CameraBackend, CameraConfig, CameraWorker};
pub use measure::{CalibrationProfile, MeasureTuning, Measurement, MeasurementEngine};
pub use storage::{ClassStats, DetectionRecord, DetectionStore, NewDetection};
pub use sync::{run_sync, HttpRemoteStore, RemoteSettings, RemoteStore, SyncClient};

/// Road damage classes, indexed by the model's class index.
pub const ROAD_DAMAGE_CLASSES: [&str; 4] = ["amblas", "bergelombang", "berlubang", "retak_buaya"];

/// Human-readable label for a class index. Unknown indices render as the
/// decimal index so a model/label-table mismatch stays visible in the log.
pub fn class_label(class_idx: usize) -> String {
    ROAD_DAMAGE_CLASSES
        .get(class_idx)
        .map(|label| label.to_string())
        .unwrap_or_else(|| class_idx.to_string())
}

/// Bounded wait applied to every cooperative thread shutdown.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Join a worker thread, waiting at most `timeout`.
///
/// A timeout is a logged anomaly, never a hang: the handle is dropped and
/// the thread left detached.
pub(crate) fn join_with_timeout(
    handle: std::thread::JoinHandle<()>,
    timeout: Duration,
    name: &str,
) {
    let deadline = std::time::Instant::now() + timeout;
    while !handle.is_finished() {
        if std::time::Instant::now() >= deadline {
            log::warn!(
                "{}: thread did not stop within {:?}, detaching",
                name,
                timeout
            );
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    if handle.join().is_err() {
        log::error!("{}: thread panicked", name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_labels_cover_known_indices() {
        assert_eq!(class_label(0), "amblas");
        assert_eq!(class_label(2), "berlubang");
        assert_eq!(class_label(3), "retak_buaya");
    }

    #[test]
    fn unknown_class_renders_as_index() {
        assert_eq!(class_label(17), "17");
    }
}
