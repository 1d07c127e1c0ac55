//! Camera workers and the synthetic capture backend.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::frame::{Frame, FrameSender};
use crate::{join_with_timeout, STOP_TIMEOUT};

/// Backoff after a failed read before trying the device again.
const READ_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Configuration for one capture worker.
#[derive(Clone, Debug)]
pub struct CameraConfig {
    /// Stable id stamped on every frame ("cam0", "cam1").
    pub camera_id: String,
    /// Device ref: `stub://<name>` or a V4L2 node path.
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            camera_id: "cam0".to_string(),
            device: "stub://cam0".to_string(),
            width: 640,
            height: 480,
            fps: 30,
        }
    }
}

/// A capture source. Opening happens in `open_backend`; release happens on
/// drop.
pub trait CameraBackend: Send {
    /// Block until the next frame is available and return it owned.
    fn read_frame(&mut self) -> Result<Frame>;
}

/// Open the backend named by the config's device ref.
pub fn open_backend(config: &CameraConfig) -> Result<Box<dyn CameraBackend>> {
    if config.device.starts_with("stub://") {
        log::info!(
            "camera {}: opened {} (synthetic)",
            config.camera_id,
            config.device
        );
        return Ok(Box::new(StubCamera::new(config.clone())));
    }

    #[cfg(feature = "ingest-v4l2")]
    {
        let backend = crate::ingest::v4l2::DeviceCamera::open(config.clone())?;
        Ok(Box::new(backend))
    }

    #[cfg(not(feature = "ingest-v4l2"))]
    {
        Err(anyhow!(
            "camera {}: no backend for {} (build with ingest-v4l2, or use a stub:// ref)",
            config.camera_id,
            config.device
        ))
    }
}

/// One capture thread. Owns its backend; hands frames to the channel with
/// `offer`, so a slow consumer costs dropped frames rather than capture lag.
pub struct CameraWorker {
    camera_id: String,
    stop: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    captured: Arc<AtomicU64>,
    join: Option<JoinHandle<()>>,
}

impl CameraWorker {
    /// Spawn the capture thread. The device is opened on the thread itself;
    /// an open failure marks this worker failed and leaves everything else
    /// running.
    pub fn spawn(config: CameraConfig, sender: FrameSender) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let failed = Arc::new(AtomicBool::new(false));
        let captured = Arc::new(AtomicU64::new(0));
        let camera_id = config.camera_id.clone();

        let thread_stop = stop.clone();
        let thread_failed = failed.clone();
        let thread_captured = captured.clone();
        let join = std::thread::Builder::new()
            .name(format!("camera-{}", config.camera_id))
            .spawn(move || {
                capture_loop(config, sender, thread_stop, thread_failed, thread_captured);
            })
            .ok();
        if join.is_none() {
            log::error!("camera {}: failed to spawn capture thread", camera_id);
            failed.store(true, Ordering::Relaxed);
        }

        Self {
            camera_id,
            stop,
            failed,
            captured,
            join,
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    /// True once the worker has given up (open failure or spawn failure).
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }

    /// Frames captured from the device so far.
    pub fn captured(&self) -> u64 {
        self.captured.load(Ordering::Relaxed)
    }

    /// Signal the thread to stop and wait for it, bounded.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.join.take() {
            join_with_timeout(
                handle,
                STOP_TIMEOUT,
                &format!("camera {}", self.camera_id),
            );
        }
    }
}

fn capture_loop(
    config: CameraConfig,
    sender: FrameSender,
    stop: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    captured: Arc<AtomicU64>,
) {
    let mut backend = match open_backend(&config) {
        Ok(backend) => backend,
        Err(e) => {
            log::error!("camera {}: open failed: {}", config.camera_id, e);
            failed.store(true, Ordering::Relaxed);
            return;
        }
    };

    while !stop.load(Ordering::Relaxed) {
        match backend.read_frame() {
            Ok(frame) => {
                captured.fetch_add(1, Ordering::Relaxed);
                if !sender.offer(frame) {
                    log::debug!("camera {}: consumer busy, frame dropped", config.camera_id);
                }
            }
            Err(e) => {
                log::warn!("camera {}: read failed: {}", config.camera_id, e);
                std::thread::sleep(READ_RETRY_DELAY);
            }
        }
    }

    drop(backend);
    log::info!("camera {}: capture stopped", config.camera_id);
}

/// Synthetic camera for `stub://` refs. Generates a moving gradient with a
/// dark patch low in the frame, paced at the configured rate.
pub struct StubCamera {
    config: CameraConfig,
    frame_count: u64,
    last_frame_at: Option<Instant>,
}

impl StubCamera {
    pub fn new(config: CameraConfig) -> Self {
        Self {
            config,
            frame_count: 0,
            last_frame_at: None,
        }
    }

    fn frame_interval(&self) -> Duration {
        let fps = self.config.fps.max(1);
        Duration::from_micros(1_000_000 / fps as u64)
    }

    fn generate_pixels(&self) -> Vec<u8> {
        let width = self.config.width as usize;
        let height = self.config.height as usize;
        let mut data = vec![0u8; width * height * 3];

        // Road-gray background with per-frame drift.
        for (i, px) in data.iter_mut().enumerate() {
            *px = (120 + ((i as u64 + self.frame_count * 7) % 40)) as u8;
        }

        // Dark rectangular patch in the lower middle, giving the edge
        // analysis in the measurement stage something to find.
        let y0 = height * 3 / 5;
        let y1 = (height * 4 / 5).min(height);
        let x0 = width * 2 / 5;
        let x1 = (width * 3 / 5).min(width);
        for y in y0..y1 {
            for x in x0..x1 {
                let idx = (y * width + x) * 3;
                data[idx] = 30;
                data[idx + 1] = 30;
                data[idx + 2] = 30;
            }
        }

        data
    }
}

impl CameraBackend for StubCamera {
    fn read_frame(&mut self) -> Result<Frame> {
        // Pace to the configured rate.
        if let Some(last) = self.last_frame_at {
            let interval = self.frame_interval();
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        self.last_frame_at = Some(Instant::now());
        self.frame_count += 1;

        Ok(Frame::new(
            self.config.camera_id.clone(),
            self.config.width,
            self.config.height,
            self.generate_pixels(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::frame_channel;

    fn stub_config(camera_id: &str) -> CameraConfig {
        CameraConfig {
            camera_id: camera_id.to_string(),
            device: format!("stub://{}", camera_id),
            width: 64,
            height: 48,
            fps: 120,
        }
    }

    #[test]
    fn stub_camera_produces_tagged_frames() {
        let mut camera = StubCamera::new(stub_config("cam0"));
        let frame = camera.read_frame().unwrap();
        assert_eq!(frame.camera_id, "cam0");
        assert_eq!(frame.width, 64);
        assert_eq!(frame.height, 48);
        assert_eq!(frame.data.len(), 64 * 48 * 3);
    }

    #[test]
    fn stub_camera_patch_is_darker_than_background() {
        let mut camera = StubCamera::new(stub_config("cam0"));
        let frame = camera.read_frame().unwrap();
        // Patch center vs top-left background.
        let (b, _, _) = frame.bgr(32, 33);
        let (bg, _, _) = frame.bgr(2, 2);
        assert!(b < bg);
    }

    #[test]
    fn worker_delivers_frames_into_channel() {
        let (tx, rx) = frame_channel(4);
        let mut worker = CameraWorker::spawn(stub_config("cam0"), tx);

        let frame = rx.poll(Duration::from_secs(2)).expect("frame from worker");
        assert_eq!(frame.camera_id, "cam0");
        assert!(!worker.is_failed());
        assert!(worker.captured() >= 1);

        worker.stop();
    }

    #[test]
    fn open_failure_marks_worker_failed() {
        let (tx, _rx) = frame_channel(2);
        let config = CameraConfig {
            device: "/dev/does-not-exist".to_string(),
            ..stub_config("cam1")
        };
        let mut worker = CameraWorker::spawn(config, tx);

        let deadline = Instant::now() + Duration::from_secs(2);
        while !worker.is_failed() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(worker.is_failed());
        worker.stop();
    }

    #[test]
    fn stop_is_bounded() {
        let (tx, _rx) = frame_channel(2);
        let mut worker = CameraWorker::spawn(stub_config("cam0"), tx);
        std::thread::sleep(Duration::from_millis(50));

        let start = Instant::now();
        worker.stop();
        assert!(start.elapsed() < STOP_TIMEOUT + Duration::from_millis(500));
    }
}
