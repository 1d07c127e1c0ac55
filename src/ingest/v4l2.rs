#![cfg(feature = "ingest-v4l2")]

//! V4L2 capture backend for real device nodes.
//!
//! Negotiates BGR3 at the configured resolution; if the driver refuses, the
//! driver's active format is used instead and frames carry whatever
//! dimensions the device settled on.

use anyhow::{Context, Result};
use ouroboros::self_referencing;

use super::camera::{CameraBackend, CameraConfig};
use crate::frame::Frame;

#[self_referencing]
struct CaptureState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

pub struct DeviceCamera {
    config: CameraConfig,
    state: CaptureState,
    active_width: u32,
    active_height: u32,
}

impl DeviceCamera {
    pub fn open(config: CameraConfig) -> Result<Self> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let device = v4l::Device::with_path(&config.device)
            .with_context(|| format!("open v4l2 device {}", config.device))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = config.width;
        format.height = config.height;
        format.fourcc = v4l::FourCC::new(b"BGR3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "camera {}: failed to set format on {}: {}",
                    config.camera_id,
                    config.device,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };

        if config.fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(config.fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!(
                    "camera {}: failed to set fps on {}: {}",
                    config.camera_id,
                    config.device,
                    err
                );
            }
        }

        let active_width = format.width;
        let active_height = format.height;

        let state = CaptureStateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;

        log::info!(
            "camera {}: opened {} ({}x{})",
            config.camera_id,
            config.device,
            active_width,
            active_height
        );

        Ok(Self {
            config,
            state,
            active_width,
            active_height,
        })
    }
}

impl CameraBackend for DeviceCamera {
    fn read_frame(&mut self) -> Result<Frame> {
        use v4l::io::traits::CaptureStream;

        let (buf, _meta) = self
            .state
            .with_mut(|fields| fields.stream.next())
            .context("capture v4l2 frame")?;

        let expected = (self.active_width as usize) * (self.active_height as usize) * 3;
        if buf.len() < expected {
            anyhow::bail!(
                "camera {}: short v4l2 buffer ({} bytes, expected {})",
                self.config.camera_id,
                buf.len(),
                expected
            );
        }

        Ok(Frame::new(
            self.config.camera_id.clone(),
            self.active_width,
            self.active_height,
            buf[..expected].to_vec(),
        ))
    }
}
