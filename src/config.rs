use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::measure::CalibrationProfile;
use crate::sync::RemoteSettings;

const DEFAULT_DB_PATH: &str = "roadwatch.db";
const DEFAULT_CAM0_DEVICE: &str = "stub://cam0";
const DEFAULT_CAM1_DEVICE: &str = "stub://cam1";
const DEFAULT_CAM_WIDTH: u32 = 640;
const DEFAULT_CAM_HEIGHT: u32 = 480;
const DEFAULT_CAM_FPS: u32 = 30;
const DEFAULT_DETECTOR_MODEL: &str = "stub://ssd";
const DEFAULT_CONF_THRESHOLD: f32 = 0.5;
const DEFAULT_NMS_THRESHOLD: f32 = 0.45;
const DEFAULT_CLASSIFIER_CONF_THRESHOLD: f32 = 0.6;
const DEFAULT_FOCAL_LENGTH_PX: f32 = 800.0;
const DEFAULT_PIXEL_SIZE_MM: f32 = 0.00375;
const DEFAULT_MOUNT_HEIGHT_CM: f32 = 150.0;
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 60;
const DEFAULT_REMOTE_TABLE: &str = "detections";

#[derive(Debug, Deserialize, Default)]
struct RoadwatchConfigFile {
    db_path: Option<String>,
    cameras: Option<CamerasConfigFile>,
    model: Option<ModelConfigFile>,
    calibration: Option<CalibrationConfigFile>,
    remote: Option<RemoteConfigFile>,
    sync: Option<SyncConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CamerasConfigFile {
    cam0: Option<String>,
    cam1: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct ModelConfigFile {
    detector_path: Option<String>,
    classifier_path: Option<String>,
    conf_threshold: Option<f32>,
    nms_threshold: Option<f32>,
    classifier_conf_threshold: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct CalibrationConfigFile {
    cam0: Option<CalibrationEntryFile>,
    cam1: Option<CalibrationEntryFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CalibrationEntryFile {
    focal_length_px: Option<f32>,
    pixel_size_mm: Option<f32>,
    mount_height_cm: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct RemoteConfigFile {
    url: Option<String>,
    api_key: Option<String>,
    table: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct SyncConfigFile {
    interval_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RoadwatchConfig {
    pub db_path: String,
    pub cameras: CameraSettings,
    pub model: ModelSettings,
    pub cam0_calibration: CalibrationProfile,
    pub cam1_calibration: CalibrationProfile,
    /// Remote store settings; `None` disables sync entirely.
    pub remote: Option<RemoteSettings>,
    pub sync_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub cam0_device: String,
    pub cam1_device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub detector_path: String,
    /// Dedicated classifier model. `None` selects the fallback
    /// aggregate-over-anchors classification mode.
    pub classifier_path: Option<String>,
    pub conf_threshold: f32,
    pub nms_threshold: f32,
    pub classifier_conf_threshold: f32,
}

impl RoadwatchConfig {
    /// Load configuration: optional JSON file named by `ROADWATCH_CONFIG`,
    /// then environment overrides, then validation.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("ROADWATCH_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RoadwatchConfigFile) -> Self {
        let db_path = file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let cameras = CameraSettings {
            cam0_device: file
                .cameras
                .as_ref()
                .and_then(|cameras| cameras.cam0.clone())
                .unwrap_or_else(|| DEFAULT_CAM0_DEVICE.to_string()),
            cam1_device: file
                .cameras
                .as_ref()
                .and_then(|cameras| cameras.cam1.clone())
                .unwrap_or_else(|| DEFAULT_CAM1_DEVICE.to_string()),
            width: file
                .cameras
                .as_ref()
                .and_then(|cameras| cameras.width)
                .unwrap_or(DEFAULT_CAM_WIDTH),
            height: file
                .cameras
                .as_ref()
                .and_then(|cameras| cameras.height)
                .unwrap_or(DEFAULT_CAM_HEIGHT),
            fps: file
                .cameras
                .and_then(|cameras| cameras.fps)
                .unwrap_or(DEFAULT_CAM_FPS),
        };
        let model = ModelSettings {
            detector_path: file
                .model
                .as_ref()
                .and_then(|model| model.detector_path.clone())
                .unwrap_or_else(|| DEFAULT_DETECTOR_MODEL.to_string()),
            classifier_path: file
                .model
                .as_ref()
                .and_then(|model| model.classifier_path.clone()),
            conf_threshold: file
                .model
                .as_ref()
                .and_then(|model| model.conf_threshold)
                .unwrap_or(DEFAULT_CONF_THRESHOLD),
            nms_threshold: file
                .model
                .as_ref()
                .and_then(|model| model.nms_threshold)
                .unwrap_or(DEFAULT_NMS_THRESHOLD),
            classifier_conf_threshold: file
                .model
                .and_then(|model| model.classifier_conf_threshold)
                .unwrap_or(DEFAULT_CLASSIFIER_CONF_THRESHOLD),
        };
        let cam0_calibration = calibration_from_file(
            file.calibration
                .as_ref()
                .and_then(|calibration| calibration.cam0.as_ref()),
        );
        let cam1_calibration = calibration_from_file(
            file.calibration
                .as_ref()
                .and_then(|calibration| calibration.cam1.as_ref()),
        );
        let remote = file.remote.and_then(|remote| {
            let url = remote.url?;
            let api_key = remote.api_key?;
            Some(RemoteSettings {
                url,
                api_key,
                table: remote
                    .table
                    .unwrap_or_else(|| DEFAULT_REMOTE_TABLE.to_string()),
            })
        });
        let sync_interval = Duration::from_secs(
            file.sync
                .and_then(|sync| sync.interval_secs)
                .unwrap_or(DEFAULT_SYNC_INTERVAL_SECS),
        );
        Self {
            db_path,
            cameras,
            model,
            cam0_calibration,
            cam1_calibration,
            remote,
            sync_interval,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("ROADWATCH_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(device) = std::env::var("ROADWATCH_CAM0") {
            if !device.trim().is_empty() {
                self.cameras.cam0_device = device;
            }
        }
        if let Ok(device) = std::env::var("ROADWATCH_CAM1") {
            if !device.trim().is_empty() {
                self.cameras.cam1_device = device;
            }
        }
        if let Ok(path) = std::env::var("ROADWATCH_MODEL") {
            if !path.trim().is_empty() {
                self.model.detector_path = path;
            }
        }
        if let Ok(path) = std::env::var("ROADWATCH_CLASSIFIER_MODEL") {
            if !path.trim().is_empty() {
                self.model.classifier_path = Some(path);
            }
        }
        if let Ok(value) = std::env::var("ROADWATCH_CONF_THRESHOLD") {
            self.model.conf_threshold = parse_f32("ROADWATCH_CONF_THRESHOLD", &value)?;
        }
        if let Ok(value) = std::env::var("ROADWATCH_NMS_THRESHOLD") {
            self.model.nms_threshold = parse_f32("ROADWATCH_NMS_THRESHOLD", &value)?;
        }
        if let Ok(url) = std::env::var("ROADWATCH_REMOTE_URL") {
            if !url.trim().is_empty() {
                let api_key = std::env::var("ROADWATCH_REMOTE_KEY").unwrap_or_default();
                let table = std::env::var("ROADWATCH_REMOTE_TABLE")
                    .ok()
                    .filter(|table| !table.trim().is_empty())
                    .or_else(|| self.remote.as_ref().map(|remote| remote.table.clone()))
                    .unwrap_or_else(|| DEFAULT_REMOTE_TABLE.to_string());
                self.remote = Some(RemoteSettings {
                    url,
                    api_key,
                    table,
                });
            }
        }
        if let Ok(value) = std::env::var("ROADWATCH_SYNC_INTERVAL_SECS") {
            let seconds: u64 = value.parse().map_err(|_| {
                anyhow!("ROADWATCH_SYNC_INTERVAL_SECS must be an integer number of seconds")
            })?;
            self.sync_interval = Duration::from_secs(seconds);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.cameras.width == 0 || self.cameras.height == 0 {
            return Err(anyhow!("camera dimensions must be non-zero"));
        }
        if !(0.0..=1.0).contains(&self.model.conf_threshold) {
            return Err(anyhow!("conf_threshold must lie in [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.model.nms_threshold) {
            return Err(anyhow!("nms_threshold must lie in [0, 1]"));
        }
        if self.sync_interval.as_secs() == 0 {
            return Err(anyhow!("sync interval must be greater than zero"));
        }
        for (camera, calibration) in [
            ("cam0", &self.cam0_calibration),
            ("cam1", &self.cam1_calibration),
        ] {
            if calibration.focal_length_px <= 0.0 || calibration.mount_height_cm <= 0.0 {
                return Err(anyhow!(
                    "{} calibration requires positive focal length and mount height",
                    camera
                ));
            }
        }
        if let Some(remote) = &self.remote {
            if remote.api_key.trim().is_empty() {
                return Err(anyhow!(
                    "remote sync configured without an api key (set ROADWATCH_REMOTE_KEY)"
                ));
            }
            let parsed = url::Url::parse(&remote.url)
                .map_err(|e| anyhow!("invalid remote url {}: {}", remote.url, e))?;
            if parsed.scheme() != "http" && parsed.scheme() != "https" {
                return Err(anyhow!("remote url must use http or https"));
            }
        }
        Ok(())
    }
}

fn calibration_from_file(entry: Option<&CalibrationEntryFile>) -> CalibrationProfile {
    CalibrationProfile {
        focal_length_px: entry
            .and_then(|entry| entry.focal_length_px)
            .unwrap_or(DEFAULT_FOCAL_LENGTH_PX),
        pixel_size_mm: entry
            .and_then(|entry| entry.pixel_size_mm)
            .unwrap_or(DEFAULT_PIXEL_SIZE_MM),
        mount_height_cm: entry
            .and_then(|entry| entry.mount_height_cm)
            .unwrap_or(DEFAULT_MOUNT_HEIGHT_CM),
    }
}

fn read_config_file(path: &Path) -> Result<RoadwatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn parse_f32(name: &str, value: &str) -> Result<f32> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow!("{} must be a number", name))
}
