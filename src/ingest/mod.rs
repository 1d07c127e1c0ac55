//! Camera capture.
//!
//! Each camera runs on its own worker thread, pushing owned frames into a
//! bounded channel. Capture failures are isolated per camera: a device that
//! fails to open or read never takes the other camera or the engines down
//! with it.
//!
//! Device refs:
//! - `stub://<name>` selects the synthetic source (tests, bring-up)
//! - anything else is a V4L2 device node, available with `ingest-v4l2`

pub mod camera;
#[cfg(feature = "ingest-v4l2")]
pub(crate) mod v4l2;

pub use camera::{CameraBackend, CameraConfig, CameraWorker};
