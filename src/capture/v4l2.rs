//! V4L2 camera source with memory-mapped buffers

use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::cancel::CancelToken;
use super::convert::to_displayable;
use super::frame::{Frame, PixelFormat};
use super::source::{FrameSource, ReadDeadline, POLL_SLICE};
use crate::error::{ConnectError, ReadError};
use crate::{SourceConfig, SourceOrigin};

/// Local camera by device index
#[derive(Debug, Default)]
pub struct V4l2Source {
    path: Option<String>,
}

/// Streaming session on an opened device
pub struct V4l2Session {
    // Declared before `_device` so buffers are unmapped first
    stream: MmapStream<'static>,
    _device: Box<Device>,
    width: u32,
    height: u32,
    stride: u32,
    format: PixelFormat,
    read_timeout: Duration,
    sequence: u64,
}

impl V4l2Source {
    pub fn new() -> Self {
        Self::default()
    }
}

pub fn device_path(index: u32) -> String {
    format!("/dev/video{}", index)
}

pub fn fourcc_for(format: PixelFormat) -> FourCC {
    match format {
        PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
        PixelFormat::Yuyv4 => FourCC::new(b"YUYV"),
        PixelFormat::Rgb24 => FourCC::new(b"RGB3"),
        PixelFormat::Bgr24 => FourCC::new(b"BGR3"),
        PixelFormat::Gray8 => FourCC::new(b"GREY"),
        PixelFormat::Nv12 => FourCC::new(b"NV12"),
    }
}

impl FrameSource for V4l2Source {
    type Handle = V4l2Session;

    fn describe(&self) -> String {
        format!("v4l2:{}", self.path.as_deref().unwrap_or("<unopened>"))
    }

    #[instrument(skip_all, fields(origin = ?config.origin))]
    fn open(
        &mut self,
        config: &SourceConfig,
        cancel: &CancelToken,
    ) -> Result<V4l2Session, ConnectError> {
        let SourceOrigin::Device(index) = config.origin else {
            return Err(ConnectError::InvalidConfig(
                "v4l2 source needs a device index".into(),
            ));
        };
        let path = device_path(index);
        self.path = Some(path.clone());
        if cancel.is_cancelled() {
            return Err(ConnectError::Cancelled);
        }

        let unreachable = |e: std::io::Error| ConnectError::Unreachable(format!("{}: {}", path, e));
        let device = Device::with_path(&path).map_err(unreachable)?;

        let caps = device.query_caps().map_err(unreachable)?;
        info!("Device: {} ({})", caps.card, caps.driver);
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(ConnectError::InvalidConfig(format!(
                "{} doesn't support video capture",
                path
            )));
        }

        let requested = fourcc_for(config.format);
        let mut fmt = device.format().map_err(unreachable)?;
        fmt.width = config.width;
        fmt.height = config.height;
        fmt.fourcc = requested;
        let fmt = device.set_format(&fmt).map_err(unreachable)?;
        if fmt.fourcc != requested {
            return Err(ConnectError::InvalidConfig(format!(
                "{} negotiated {} instead of {}",
                path, fmt.fourcc, requested
            )));
        }
        if fmt.width != config.width || fmt.height != config.height {
            warn!(
                "Requested {}x{}, device delivers {}x{}",
                config.width, config.height, fmt.width, fmt.height
            );
        }
        if let Err(e) = device.set_params(&Parameters::with_fps(config.fps)) {
            warn!("Could not set {} fps: {}", config.fps, e);
        }

        let device = Box::new(device);
        let mut stream = MmapStream::with_buffers(&device, Type::VideoCapture, config.buffer_count)
            .map_err(unreachable)?;
        stream.set_timeout(POLL_SLICE);
        info!(
            "Capture stream started with {} buffers",
            config.buffer_count
        );

        Ok(V4l2Session {
            stream,
            _device: device,
            width: fmt.width,
            height: fmt.height,
            stride: fmt.stride,
            format: config.format,
            read_timeout: config.read_timeout(),
            sequence: 0,
        })
    }

    fn read_frame(
        &mut self,
        session: &mut V4l2Session,
        cancel: &CancelToken,
    ) -> Result<Frame, ReadError> {
        let deadline = ReadDeadline::new(session.read_timeout);
        loop {
            deadline.check(cancel)?;

            let (data, meta) = match session.stream.next() {
                Ok((buf, meta)) => {
                    let used = (meta.bytesused as usize).min(buf.len());
                    (Bytes::copy_from_slice(&buf[..used]), *meta)
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                Err(e) => return Err(ReadError::DeviceLost(e.to_string())),
            };

            let raw = Frame::with_stride(
                data,
                session.width,
                session.height,
                session.stride,
                session.format,
            )
            .with_device_timestamp(
                Duration::from_secs(meta.timestamp.sec.max(0) as u64)
                    + Duration::from_micros(meta.timestamp.usec.max(0) as u64),
            );

            // Webcams commonly emit a few corrupt MJPEG buffers after stream-on
            match to_displayable(&raw) {
                Ok(frame) => {
                    session.sequence += 1;
                    return Ok(frame.with_sequence(session.sequence));
                }
                Err(e) => {
                    debug!("Dropping buffer {}: {}", meta.sequence, e);
                    metrics::counter!("v4l2_corrupt_buffers_total").increment(1);
                }
            }
        }
    }

    fn close(&mut self, session: V4l2Session) {
        info!(
            "Releasing {} after {} frames",
            self.describe(),
            session.sequence
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_origin_is_rejected() {
        let config = SourceConfig {
            origin: SourceOrigin::Url("http://127.0.0.1/stream".into()),
            ..SourceConfig::default()
        };
        assert!(matches!(
            V4l2Source::new().open(&config, &CancelToken::never()),
            Err(ConnectError::InvalidConfig(_))
        ));
    }
}
