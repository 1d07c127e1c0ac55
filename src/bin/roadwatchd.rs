//! roadwatchd - road damage detection daemon
//!
//! 1. Captures frames from two cameras into bounded channels
//! 2. Runs SSD detection on camera A and advisory classification on camera B
//! 3. Measures physical width/depth for each detection
//! 4. Appends detections to the local sqlite log
//! 5. Periodically syncs unsynced rows to the remote store

use anyhow::{anyhow, Result};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use roadwatch::detect::classify::{shared_classification, ClassifierMode};
use roadwatch::detect::{
    resolve_backend, InferenceCapability, CLASSIFIER_INPUT_SIZE, DETECTOR_INPUT_SIZE,
};
use roadwatch::{
    class_label, frame_channel, run_sync, CameraConfig, CameraWorker, ClassificationEngine,
    DetectionBatch, DetectionEngine, DetectionStore, DetectorConfig, HttpRemoteStore,
    MeasurementEngine, NewDetection, RoadwatchConfig, SyncClient,
};

const BATCH_RECV_TIMEOUT: Duration = Duration::from_millis(200);
const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = RoadwatchConfig::load()?;
    check_model_paths(&cfg)?;

    let store = DetectionStore::open(&cfg.db_path)?;
    log::info!(
        "roadwatchd {} running. writing to {}",
        env!("CARGO_PKG_VERSION"),
        cfg.db_path
    );

    let sync_client = match cfg.remote.clone() {
        Some(remote) => {
            log::info!("remote sync target: {}/{}", remote.url, remote.table);
            Some(SyncClient::new(HttpRemoteStore::new(remote)))
        }
        None => {
            log::warn!("no remote configured; detections stay local only");
            None
        }
    };

    let running = Arc::new(AtomicBool::new(true));
    let ctrlc_flag = running.clone();
    ctrlc::set_handler(move || {
        log::info!("shutdown requested");
        ctrlc_flag.store(false, Ordering::Relaxed);
    })?;

    // Camera A feeds detection; camera B feeds classification. The
    // detection channel is deeper because decode+NMS outlasts a frame-level
    // classifier pass.
    let (cam0_tx, cam0_rx) = frame_channel(4);
    let (cam1_tx, cam1_rx) = frame_channel(2);

    let mut cam0 = CameraWorker::spawn(
        CameraConfig {
            camera_id: "cam0".to_string(),
            device: cfg.cameras.cam0_device.clone(),
            width: cfg.cameras.width,
            height: cfg.cameras.height,
            fps: cfg.cameras.fps,
        },
        cam0_tx,
    );
    let mut cam1 = CameraWorker::spawn(
        CameraConfig {
            camera_id: "cam1".to_string(),
            device: cfg.cameras.cam1_device.clone(),
            width: cfg.cameras.width,
            height: cfg.cameras.height,
            fps: cfg.cameras.fps,
        },
        cam1_tx,
    );

    let (batch_tx, batch_rx) = mpsc::channel::<DetectionBatch>();
    let detector_path = cfg.model.detector_path.clone();
    let mut detection = DetectionEngine::spawn(
        move || {
            resolve_backend(
                &detector_path,
                InferenceCapability::SsdDetection,
                DETECTOR_INPUT_SIZE,
                DETECTOR_INPUT_SIZE,
            )
        },
        DetectorConfig::new(cfg.model.conf_threshold, cfg.model.nms_threshold),
        cam0_rx,
        batch_tx,
    );

    let (classifier_ref, classifier_mode, classifier_capability, classifier_input) =
        match cfg.model.classifier_path.clone() {
            Some(path) => (
                path,
                ClassifierMode::Dedicated,
                InferenceCapability::Classification,
                CLASSIFIER_INPUT_SIZE,
            ),
            None => (
                cfg.model.detector_path.clone(),
                ClassifierMode::Fallback,
                InferenceCapability::SsdDetection,
                DETECTOR_INPUT_SIZE,
            ),
        };
    log::info!("classification mode: {:?}", classifier_mode);
    let classification_slot = shared_classification();
    let mut classification = ClassificationEngine::spawn(
        move || {
            resolve_backend(
                &classifier_ref,
                classifier_capability,
                classifier_input,
                classifier_input,
            )
        },
        classifier_mode,
        "cam1".to_string(),
        cam1_rx,
        classification_slot.clone(),
    );

    let measurement = MeasurementEngine::new(cfg.cam0_calibration);

    let mut last_sync = Instant::now();
    let mut last_health_log = Instant::now();
    let mut detection_count = 0u64;
    let mut detector_down = false;

    while running.load(Ordering::Relaxed) {
        if detector_down {
            // Detection is gone but classification, the log, and sync keep
            // running until shutdown.
            std::thread::sleep(BATCH_RECV_TIMEOUT);
        } else {
            match batch_rx.recv_timeout(BATCH_RECV_TIMEOUT) {
                Ok(batch) => {
                    detection_count += persist_batch(
                        &store,
                        &measurement,
                        &batch,
                        &classification_slot,
                        cfg.model.classifier_conf_threshold,
                    );
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    log::error!(
                        "detection engine stopped producing (state {:?}); continuing without detections",
                        detection.state()
                    );
                    detector_down = true;
                }
            }
        }

        if let Some(client) = &sync_client {
            if last_sync.elapsed() >= cfg.sync_interval {
                match store.unsynced_count() {
                    Ok(0) => {}
                    Ok(_) => match run_sync(&store, client) {
                        Ok(count) => log::info!("sync pass uploaded {} row(s)", count),
                        Err(e) => log::warn!("sync pass failed: {}", e),
                    },
                    Err(e) => log::warn!("unsynced count failed: {}", e),
                }
                last_sync = Instant::now();
            }
        }

        if last_health_log.elapsed() >= HEALTH_LOG_INTERVAL {
            log::info!(
                "health: cam0 captured={} failed={}, cam1 captured={} failed={}, \
                 detection={:?}, classification={:?}, detections={}",
                cam0.captured(),
                cam0.is_failed(),
                cam1.captured(),
                cam1.is_failed(),
                detection.state(),
                classification.state(),
                detection_count
            );
            last_health_log = Instant::now();
        }
    }

    log::info!("stopping pipeline");
    cam0.stop();
    cam1.stop();
    detection.stop();
    classification.stop();

    if let Some(client) = &sync_client {
        match run_sync(&store, client) {
            Ok(count) if count > 0 => log::info!("final sync uploaded {} row(s)", count),
            Ok(_) => {}
            Err(e) => log::warn!("final sync failed: {}", e),
        }
    }
    store.close();
    log::info!("roadwatchd stopped");
    Ok(())
}

/// Reject missing model files before spawning anything. `stub://` refs need
/// no file.
fn check_model_paths(cfg: &RoadwatchConfig) -> Result<()> {
    if !cfg.model.detector_path.starts_with("stub://")
        && !Path::new(&cfg.model.detector_path).is_file()
    {
        return Err(anyhow!(
            "detector model not found: {}",
            cfg.model.detector_path
        ));
    }
    if let Some(path) = &cfg.model.classifier_path {
        if !path.starts_with("stub://") && !Path::new(path).is_file() {
            return Err(anyhow!("classifier model not found: {}", path));
        }
    }
    Ok(())
}

/// Measure and persist one batch of detections. Per-row failures are
/// logged and skipped; one bad row never drops the rest of the batch.
fn persist_batch(
    store: &DetectionStore,
    measurement: &MeasurementEngine,
    batch: &DetectionBatch,
    classification_slot: &roadwatch::SharedClassification,
    classifier_gate: f32,
) -> u64 {
    let advisory = {
        let guard = classification_slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard
            .as_ref()
            .filter(|result| result.is_usable(classifier_gate))
            .map(|result| format!("{} ({:.2})", result.label, result.confidence))
    };

    let mut persisted = 0u64;
    for detection in &batch.detections {
        let measured = measurement.measure(&batch.frame, &detection.bbox);
        let row = NewDetection {
            camera_id: batch.frame.camera_id.clone(),
            road_class: class_label(detection.class_idx),
            confidence: detection.confidence as f64,
            width_cm: Some(measured.width_cm as f64),
            depth_cm: Some(measured.depth_cm as f64),
            bbox_x1: detection.bbox.x1 as f64,
            bbox_y1: detection.bbox.y1 as f64,
            bbox_x2: detection.bbox.x2 as f64,
            bbox_y2: detection.bbox.y2 as f64,
            ..NewDetection::default()
        };
        match store.insert(&row) {
            Ok(id) => {
                persisted += 1;
                match &advisory {
                    Some(context) => log::info!(
                        "detection #{}: {} conf={:.2} width={:.1}cm depth={:.1}cm (frame class: {})",
                        id,
                        row.road_class,
                        row.confidence,
                        measured.width_cm,
                        measured.depth_cm,
                        context
                    ),
                    None => log::info!(
                        "detection #{}: {} conf={:.2} width={:.1}cm depth={:.1}cm",
                        id,
                        row.road_class,
                        row.confidence,
                        measured.width_cm,
                        measured.depth_cm
                    ),
                }
            }
            Err(e) => log::error!("failed to persist detection: {}", e),
        }
    }
    persisted
}
