pub mod cancel;
pub mod convert;
pub mod frame;
pub mod mjpeg;
pub mod mock;
pub mod source;
pub mod v4l2;

#[cfg(feature = "gstreamer-pipeline")]
pub mod gst_capture;

pub use cancel::{CancelToken, Canceller};
pub use frame::Frame;
pub use frame::PixelFormat;
pub use mjpeg::HttpMjpegSource;
pub use mock::TestPatternSource;
pub use source::FrameSource;
pub use v4l2::V4l2Source;

#[cfg(feature = "gstreamer-pipeline")]
pub use gst_capture::GstSource;

use crate::error::{ConnectError, ReadError};
use crate::{SourceConfig, SourceOrigin};

/// Source chosen from the configured origin
#[derive(Debug)]
pub enum AnySource {
    V4l2(V4l2Source),
    Http(HttpMjpegSource),
    #[cfg(feature = "gstreamer-pipeline")]
    Gst(GstSource),
    TestPattern(TestPatternSource),
}

pub enum AnyHandle {
    V4l2(v4l2::V4l2Session),
    Http(mjpeg::MjpegSession),
    #[cfg(feature = "gstreamer-pipeline")]
    Gst(gst_capture::GstSession),
    TestPattern(mock::TestPatternSession),
}

impl AnySource {
    /// http(s) URLs use the native MJPEG reader; other schemes need GStreamer
    pub fn for_config(config: &SourceConfig) -> Result<Self, ConnectError> {
        match &config.origin {
            SourceOrigin::Device(_) => Ok(AnySource::V4l2(V4l2Source::new())),
            SourceOrigin::TestPattern => Ok(AnySource::TestPattern(TestPatternSource::new())),
            SourceOrigin::Url(url) if url.starts_with("http://") || url.starts_with("https://") => {
                Ok(AnySource::Http(HttpMjpegSource::new()))
            }
            #[cfg(feature = "gstreamer-pipeline")]
            SourceOrigin::Url(_) => Ok(AnySource::Gst(GstSource::new())),
            #[cfg(not(feature = "gstreamer-pipeline"))]
            SourceOrigin::Url(url) => Err(ConnectError::InvalidConfig(format!(
                "'{}' needs the gstreamer-pipeline feature",
                url
            ))),
        }
    }
}

fn mismatched() -> ReadError {
    ReadError::DeviceLost("handle belongs to another source".into())
}

impl FrameSource for AnySource {
    type Handle = AnyHandle;

    fn describe(&self) -> String {
        match self {
            AnySource::V4l2(s) => s.describe(),
            AnySource::Http(s) => s.describe(),
            #[cfg(feature = "gstreamer-pipeline")]
            AnySource::Gst(s) => s.describe(),
            AnySource::TestPattern(s) => s.describe(),
        }
    }

    fn open(&mut self, config: &SourceConfig, cancel: &CancelToken) -> Result<AnyHandle, ConnectError> {
        match self {
            AnySource::V4l2(s) => s.open(config, cancel).map(AnyHandle::V4l2),
            AnySource::Http(s) => s.open(config, cancel).map(AnyHandle::Http),
            #[cfg(feature = "gstreamer-pipeline")]
            AnySource::Gst(s) => s.open(config, cancel).map(AnyHandle::Gst),
            AnySource::TestPattern(s) => s.open(config, cancel).map(AnyHandle::TestPattern),
        }
    }

    fn read_frame(&mut self, handle: &mut AnyHandle, cancel: &CancelToken) -> Result<Frame, ReadError> {
        match (self, handle) {
            (AnySource::V4l2(s), AnyHandle::V4l2(h)) => s.read_frame(h, cancel),
            (AnySource::Http(s), AnyHandle::Http(h)) => s.read_frame(h, cancel),
            #[cfg(feature = "gstreamer-pipeline")]
            (AnySource::Gst(s), AnyHandle::Gst(h)) => s.read_frame(h, cancel),
            (AnySource::TestPattern(s), AnyHandle::TestPattern(h)) => s.read_frame(h, cancel),
            _ => Err(mismatched()),
        }
    }

    fn close(&mut self, handle: AnyHandle) {
        match (self, handle) {
            (AnySource::V4l2(s), AnyHandle::V4l2(h)) => s.close(h),
            (AnySource::Http(s), AnyHandle::Http(h)) => s.close(h),
            #[cfg(feature = "gstreamer-pipeline")]
            (AnySource::Gst(s), AnyHandle::Gst(h)) => s.close(h),
            (AnySource::TestPattern(s), AnyHandle::TestPattern(h)) => s.close(h),
            (_, h) => drop(h),
        }
    }
}
